use crc::{CRC_7_MMC, CRC_16_XMODEM, Crc};
use embedded_hal::digital::OutputPin;

use crate::{
    CommandByte0, CommandByte5, Config, Deadline, Error, FILLER_BYTE, R1, SpiTransport,
    START_BLOCK_TOKEN, STOP_TRANSMISSION_TOKEN,
    clock::Clock,
    structs::DataResponseToken,
};

pub(crate) const CRC7: Crc<u8> = Crc::<u8>::new(&CRC_7_MMC);
pub(crate) const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Command indexes used by this driver
pub mod cmd {
    pub const GO_IDLE_STATE: u8 = 0;
    pub const SEND_OP_COND: u8 = 1;
    pub const SEND_IF_COND: u8 = 8;
    pub const SEND_CSD: u8 = 9;
    pub const SEND_CID: u8 = 10;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SEND_STATUS: u8 = 13;
    pub const SET_BLOCKLEN: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    pub const WRITE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    pub const APP_CMD: u8 = 55;
    pub const READ_OCR: u8 = 58;
}

/// Application command indexes. These must be preceded by [`cmd::APP_CMD`].
pub mod acmd {
    pub const SET_WR_BLK_ERASE_COUNT: u8 = 23;
    pub const SD_SEND_OP_COND: u8 = 41;
    pub const SEND_SCR: u8 = 51;
}

pub fn format_command(command_index: u8, argument: u32) -> [u8; 6] {
    let mut command: [u8; 6] = Default::default();
    command[0] = {
        let mut byte = CommandByte0(Default::default());
        byte.set_start_bit(false);
        byte.set_transmission_bit(true);
        byte.set_command_index(command_index);
        byte.0
    };
    command[1..5].copy_from_slice(&argument.to_be_bytes());
    command[5] = {
        let mut byte = CommandByte5(Default::default());
        byte.set_crc7(CRC7.checksum(&command[..5]));
        byte.set_end_bit(true);
        byte.0
    };

    command
}

/// How many bytes the card answers with, and whether it signals busy afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResponseType {
    R1,
    /// R1 followed by a busy signal (`0x00` bytes) until the card is done
    R1b,
    /// R1 followed by a status byte
    R2,
    /// R1 followed by the OCR
    R3,
    /// R1 followed by the echo of the interface condition
    R7,
}

impl ResponseType {
    pub fn byte_count(&self) -> usize {
        match self {
            Self::R1 | Self::R1b => 1,
            Self::R2 => 2,
            Self::R3 | Self::R7 => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Command {
    pub index: u8,
    pub argument: u32,
    pub response_type: ResponseType,
}

impl Command {
    pub const fn new(index: u8, argument: u32, response_type: ResponseType) -> Self {
        Self {
            index,
            argument,
            response_type,
        }
    }

    pub const fn r1(index: u8, argument: u32) -> Self {
        Self::new(index, argument, ResponseType::R1)
    }

    pub fn frame(&self) -> [u8; 6] {
        format_command(self.index, self.argument)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Response {
    bytes: [u8; 5],
    len: usize,
}

impl Response {
    pub fn r1(&self) -> R1 {
        R1::from_bits_retain(self.bytes[0])
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The 4 bytes after R1 of an R3 or R7 response, which are sent MSB first
    pub fn trailing_u32(&self) -> u32 {
        u32::from_be_bytes([self.bytes[1], self.bytes[2], self.bytes[3], self.bytes[4]])
    }
}

pub(crate) type LinkError<S, Cs> =
    Error<<S as embedded_hal::spi::ErrorType>::Error, <Cs as embedded_hal::digital::ErrorType>::Error>;

/// Everything needed to talk to the card for the duration of one operation.
/// The bus is locked for as long as this exists.
pub(crate) struct Link<'a, S, Cs, C> {
    pub(crate) spi: &'a mut S,
    cs: &'a mut Cs,
    pub(crate) clock: &'a C,
    pub(crate) config: &'a Config,
}

impl<'a, S: SpiTransport, Cs: OutputPin, C: Clock> Link<'a, S, Cs, C> {
    pub(crate) fn new(spi: &'a mut S, cs: &'a mut Cs, clock: &'a C, config: &'a Config) -> Self {
        Self {
            spi,
            cs,
            clock,
            config,
        }
    }

    pub(crate) fn select(&mut self) -> Result<(), LinkError<S, Cs>> {
        self.cs.set_low().map_err(Error::CsPin)
    }

    /// Releases CS and clocks one more byte so the card lets go of MISO
    pub(crate) fn deselect(&mut self) -> Result<(), LinkError<S, Cs>> {
        self.cs.set_high().map_err(Error::CsPin)?;
        self.spi.write(&[FILLER_BYTE]).map_err(Error::SpiBus)
    }

    /// Runs `f` with the card selected. CS is released even if `f` fails.
    pub(crate) fn transaction<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, LinkError<S, Cs>>,
    ) -> Result<R, LinkError<S, Cs>> {
        self.select()?;
        let result = f(self);
        self.deselect()?;
        result
    }

    pub(crate) fn exchange_byte(&mut self, byte: u8) -> Result<u8, LinkError<S, Cs>> {
        let mut buffer = [byte];
        self.spi
            .transfer_in_place(&mut buffer)
            .map_err(Error::SpiBus)?;
        Ok(buffer[0])
    }

    /// Fills `buffer` with what the card sends while we send `0xFF`
    pub(crate) fn receive(&mut self, buffer: &mut [u8]) -> Result<(), LinkError<S, Cs>> {
        buffer.fill(FILLER_BYTE);
        self.spi.transfer_in_place(buffer).map_err(Error::SpiBus)
    }

    pub(crate) fn send(&mut self, buffer: &[u8]) -> Result<(), LinkError<S, Cs>> {
        self.spi.write(buffer).map_err(Error::SpiBus)
    }

    /// Waits until the card stops holding MISO low
    pub(crate) fn wait_ready(&mut self, timeout_ms: u32) -> Result<(), LinkError<S, Cs>> {
        let deadline = Deadline::after(self.clock, timeout_ms);
        loop {
            if self.exchange_byte(FILLER_BYTE)? == FILLER_BYTE {
                return Ok(());
            }
            if deadline.is_expired(self.clock) {
                return Err(Error::Timeout);
            }
        }
    }

    /// Sends a command frame and collects the typed response.
    /// The card must already be selected.
    pub(crate) fn send_command(
        &mut self,
        command: &Command,
        timeout_ms: u32,
    ) -> Result<Response, LinkError<S, Cs>> {
        // The card doesn't drive MISO before it is in SPI mode, and during a multi block read it is busy sending data
        if command.index != cmd::GO_IDLE_STATE && command.index != cmd::STOP_TRANSMISSION {
            self.wait_ready(timeout_ms).map_err(|error| match error {
                Error::Timeout => Error::BusBusy,
                error => error,
            })?;
        }
        trace!(
            "CMD{} argument 0x{:08X}",
            command.index,
            command.argument
        );
        self.send(&command.frame())?;
        if command.index == cmd::STOP_TRANSMISSION {
            // Stuff byte
            self.exchange_byte(FILLER_BYTE)?;
        }

        let mut response = Response::default();
        response.bytes[0] = self.receive_r1()?;
        response.len = command.response_type.byte_count();
        match command.response_type {
            ResponseType::R1 => {}
            ResponseType::R1b => self.wait_ready(timeout_ms)?,
            ResponseType::R2 | ResponseType::R3 | ResponseType::R7 => {
                let len = response.len;
                self.receive(&mut response.bytes[1..len])?;
            }
        }
        trace!("CMD{} response: {:02X}", command.index, response.bytes());
        Ok(response)
    }

    /// Looks for the first byte with bit 7 clear
    fn receive_r1(&mut self) -> Result<u8, LinkError<S, Cs>> {
        for _ in 0..self.config.response_attempts {
            let byte = self.exchange_byte(FILLER_BYTE)?;
            if !R1::from_bits_retain(byte).contains(R1::BIT_7) {
                return Ok(byte);
            }
        }
        Err(Error::Timeout)
    }

    /// Sends CMD55 followed by `command`.
    /// Fails with [`Error::ResponseError`] if the card rejects CMD55, which is what MMC cards do.
    pub(crate) fn send_app_command(
        &mut self,
        command: &Command,
        timeout_ms: u32,
    ) -> Result<Response, LinkError<S, Cs>> {
        let r1 = self
            .send_command(&Command::r1(cmd::APP_CMD, 0), timeout_ms)?
            .r1();
        if !r1.is_ok_or_idle() {
            return Err(Error::ResponseError(r1));
        }
        self.send_command(command, timeout_ms)
    }

    /// Sends a command that must be answered with an R1 without any flags set
    pub(crate) fn expect_ready(&mut self, command: &Command) -> Result<Response, LinkError<S, Cs>> {
        let response = self.send_command(command, self.config.command_timeout_ms)?;
        if !response.r1().is_empty() {
            warn!(
                "CMD{} rejected: 0b{:08b}",
                command.index,
                response.r1().bits()
            );
            return Err(Error::ResponseError(response.r1()));
        }
        Ok(response)
    }

    /// Receives one data block: start block token, `buffer.len()` bytes and a CRC16
    pub(crate) fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), LinkError<S, Cs>> {
        let deadline = Deadline::after(self.clock, self.config.read_token_timeout_ms);
        let token = loop {
            let byte = self.exchange_byte(FILLER_BYTE)?;
            if byte != FILLER_BYTE {
                break byte;
            }
            if deadline.is_expired(self.clock) {
                return Err(Error::Timeout);
            }
        };
        if token != START_BLOCK_TOKEN {
            error!(
                "expected start block token, but got 0x{:02X} instead",
                token
            );
            return Err(Error::ReadFailed(token));
        }
        self.receive(buffer)?;

        // These two bytes are always sent, but the card only computes them if CRC checking was turned on with CMD59
        let mut crc = [FILLER_BYTE; 2];
        self.receive(&mut crc)?;
        if self.config.verify_read_crc && u16::from_be_bytes(crc) != CRC16.checksum(buffer) {
            return Err(Error::InvalidChecksum);
        }
        Ok(())
    }

    /// Sends one data block behind `token` and checks the data response token.
    /// The stop transmission token is sent on its own.
    pub(crate) fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), LinkError<S, Cs>> {
        self.wait_ready(self.config.command_timeout_ms)?;
        self.send(&[token])?;
        if token == STOP_TRANSMISSION_TOKEN {
            return Ok(());
        }
        self.send(buffer)?;
        self.send(&CRC16.checksum(buffer).to_be_bytes())?;

        let response = self.exchange_byte(FILLER_BYTE)?;
        if !DataResponseToken(response).is_accepted() {
            error!("data response token: 0x{:02X}", response);
            return Err(Error::WriteFailed(response));
        }
        Ok(())
    }
}
