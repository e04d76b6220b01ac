/// Timing and behavior knobs for [`SdCard`](crate::SdCard).
/// The defaults follow the limits in the SD physical layer specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Clock used until the card is identified. Must be between 100 kHz and 400 kHz.
    pub init_frequency_hz: u32,
    /// Upper bound for the clock after initialization, on top of what the card and the bus support
    pub max_frequency_hz: u32,
    /// Bound for waiting until the card stops signalling busy, and for R1b commands
    pub command_timeout_ms: u32,
    /// Bound for waiting for the start block token of a read
    pub read_token_timeout_ms: u32,
    /// Bound for the whole ACMD41 / CMD1 negotiation
    pub op_cond_timeout_ms: u32,
    /// How many times CMD0 is tried before deciding there is no card
    pub go_idle_attempts: u32,
    /// How many filler bytes are clocked while looking for the first response byte
    pub response_attempts: u32,
    /// The card always sends a CRC16 after data blocks. By default it is read and ignored.
    pub verify_read_crc: bool,
    /// Send ACMD23 before multi block writes so the card can erase ahead of time
    pub pre_erase: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            init_frequency_hz: 400_000,
            max_frequency_hz: 25_000_000,
            command_timeout_ms: 1000,
            read_token_timeout_ms: 100,
            op_cond_timeout_ms: 500,
            go_idle_attempts: 200,
            response_attempts: 10,
            verify_read_crc: false,
            pre_erase: false,
        }
    }
}
