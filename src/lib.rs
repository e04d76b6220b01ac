#![cfg_attr(not(test), no_std)]
#[macro_use]
mod fmt;

mod block_io;
mod card;
mod clock;
mod command;
mod config;
mod disk;
#[cfg(feature = "esp32c3")]
mod esp;
mod init;
mod registers;
mod shared_spi_bus;
mod structs;
mod transport;

pub use card::*;
pub use clock::*;
pub use command::{Command, Response, ResponseType, acmd, cmd, format_command};
pub use config::*;
pub use disk::*;
#[cfg(feature = "esp32c3")]
pub use esp::*;
pub use registers::*;
pub use shared_spi_bus::*;
pub use structs::*;
pub use transport::*;

/// Some errors, such as the SpiBus and CsPin error, can happen from any operation.
/// Other errors are specific to identification or to block transfers.
#[derive(Debug)]
pub enum Error<BusError, CsError> {
    /// Error doing SPI transactions
    /// If this error happens, the CS pin might still be set low
    SpiBus(BusError),
    /// Error setting the level of the CS pin
    /// If this happens, the CS pin might still be set low
    CsPin(CsError),
    /// The card never answered CMD0 with the idle state
    NoCard,
    /// The card didn't answer in time, or stayed busy for too long
    Timeout,
    /// The card was still holding MISO low when a command had to be sent
    BusBusy,
    /// The R1 of a command had flags set that it should not have
    ResponseError(R1),
    /// A data block started with this byte instead of the start block token
    ReadFailed(u8),
    /// The card rejected a data block with this data response token
    WriteFailed(u8),
    /// The CSD says the card is write protected. Nothing was sent to the card.
    WriteProtected,
    /// Command 8 - the card's check pattern does not match the check pattern we sent to the card
    CheckPatternMismatch(u8),
    /// Command 8 - the SD Card does not support 3.3V
    VoltageNotSupported,
    /// The CRC16 after a data block doesn't match its contents
    InvalidChecksum,
    /// The CSD can't be decoded
    InvalidCsd(InvalidCsd),
    /// Block transfers need a successfully initialized card
    NotInitialized,
    /// The requested blocks go past the end of the card
    OutOfRange,
    /// The buffer is smaller than the requested blocks
    BufferSize,
    /// The SPI bus could not be set to this frequency (Hz)
    FrequencyRejected(u32),
}

/// Coarse classification of [`Error`], without the bus error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    NoCard,
    Timeout,
    ResponseError,
    ReadFailed,
    WriteFailed,
    WriteProtected,
    /// SPI bus, CS pin or clock configuration failure
    Transport,
    /// The request itself was invalid
    Usage,
}

impl<BusError, CsError> Error<BusError, CsError> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SpiBus(_) | Self::CsPin(_) | Self::FrequencyRejected(_) => ErrorKind::Transport,
            Self::NoCard => ErrorKind::NoCard,
            Self::Timeout => ErrorKind::Timeout,
            Self::BusBusy
            | Self::ResponseError(_)
            | Self::CheckPatternMismatch(_)
            | Self::VoltageNotSupported
            | Self::InvalidCsd(_) => ErrorKind::ResponseError,
            Self::ReadFailed(_) | Self::InvalidChecksum => ErrorKind::ReadFailed,
            Self::WriteFailed(_) => ErrorKind::WriteFailed,
            Self::WriteProtected => ErrorKind::WriteProtected,
            Self::NotInitialized | Self::OutOfRange | Self::BufferSize => ErrorKind::Usage,
        }
    }
}

impl<BusError, CsError> From<FrequencyRejected> for Error<BusError, CsError> {
    fn from(FrequencyRejected(hz): FrequencyRejected) -> Self {
        Self::FrequencyRejected(hz)
    }
}
