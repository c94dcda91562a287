use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    impl Debug;
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illigal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
    start_bit, _: 7;
}

impl R1Response {
    /// Card is initialized and accepts commands.
    pub const READY_STATE: Self = Self(0x00);
    /// Card is still running its initialization process.
    pub const IN_IDLE_STATE: Self = Self(0x01);

    /// Wraps a byte received from the card.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw response byte.
    pub fn byte(&self) -> u8 {
        self.0
    }

    /// R1 always starts with a cleared bit.
    pub fn is_valid(&self) -> bool {
        !self.start_bit()
    }
}

/// R3 and R7 payload following the R1 byte.
pub type R3OcrPayload = [u8; 4];

bitfield! {
    /// Operating Conditions Register, carried by R3.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Ocr(u32);
    impl Debug;
    pub voltage_2v7_2v8, _: 15;
    pub voltage_2v8_2v9, _: 16;
    pub voltage_2v9_3v0, _: 17;
    pub voltage_3v0_3v1, _: 18;
    pub voltage_3v1_3v2, _: 19;
    pub voltage_3v2_3v3, _: 20;
    pub voltage_3v3_3v4, _: 21;
    pub voltage_3v4_3v5, _: 22;
    pub voltage_3v5_3v6, _: 23;
    pub card_capacity_status, _: 30;
    pub power_up_complete, _: 31;
}

impl Ocr {
    /// Reassembles the register from the bytes following R1.
    pub fn from_payload(payload: R3OcrPayload) -> Self {
        Self(u32::from_be_bytes(payload))
    }

    /// Raw register value.
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Echo of the CMD8 argument, carried by R7.
pub fn if_cond_echo(payload: R3OcrPayload) -> u32 {
    u32::from_be_bytes(payload)
}
