use embedded_hal::digital::OutputPin;

use crate::{
    BLOCK_SIZE, Card, CardFlags, CardKind, Cid, Command, Command8Argument, CommandA41Argument, Csd, Error,
    FILLER_BYTE, Ocr, R1, R7Byte3, ResponseType, Scr, SpiTransport,
    VoltageAccepted,
    clock::{Clock, Deadline, delay_ms},
    command::{Link, LinkError, acmd, cmd},
};

/// Any value works, this is the one recommended by the SD specification
const CHECK_PATTERN: u8 = 0xAA;
/// At least 74 clock cycles with CS high put the card in native mode, ready to accept CMD0
const POWER_UP_CLOCK_BYTES: usize = 10;

/// What CMD8 told us about the card
enum InterfaceCondition {
    /// SD version 1.x or MMC, which don't know CMD8
    Legacy,
    /// SD version 2.0 or later
    V2,
}

impl<S: SpiTransport, Cs: OutputPin, C: Clock> Link<'_, S, Cs, C> {
    /// Brings the card from power-on to the transfer state and reads its registers.
    /// Every command is sent in its own transaction, like the card expects during identification.
    pub(crate) fn identify(&mut self) -> Result<Card, LinkError<S, Cs>> {
        self.power_up()?;
        self.go_idle()?;

        let mut card = Card::default();
        match self.interface_condition()? {
            InterfaceCondition::V2 => {
                self.wait_op_cond(&Command::r1(
                    acmd::SD_SEND_OP_COND,
                    CommandA41Argument::HCS.bits(),
                ))?;
                card.ocr = self.read_ocr()?;
                if card.ocr.contains(Ocr::CARD_CAPACITY_STATUS) {
                    card.kind = CardKind::SdV2HighCapacity;
                    card.flags |= CardFlags::HIGH_CAPACITY;
                } else {
                    card.kind = CardKind::SdV2;
                }
            }
            InterfaceCondition::Legacy => {
                card.kind = self.legacy_op_cond()?;
                // Optional for these cards
                card.ocr = match self.read_ocr() {
                    Ok(ocr) => ocr,
                    Err(Error::ResponseError(_) | Error::Timeout) => Ocr::empty(),
                    Err(error) => return Err(error),
                };
            }
        }
        debug!("card type: {}, OCR: 0x{:08X}", card.kind, card.ocr.bits());

        // High capacity cards always use 512 byte blocks
        if !card.flags.contains(CardFlags::HIGH_CAPACITY) {
            self.transaction(|link| {
                link.expect_ready(&Command::r1(cmd::SET_BLOCKLEN, BLOCK_SIZE))
                    .map(|_| ())
            })?;
        }

        let mut raw_csd = [0; 16];
        self.read_register(&Command::r1(cmd::SEND_CSD, 0), false, &mut raw_csd)?;
        let csd = if card.kind == CardKind::Mmc {
            Csd::decode_mmc(&raw_csd)
        } else {
            Csd::decode(&raw_csd).map_err(Error::InvalidCsd)?
        };

        let mut raw_cid = [0; 16];
        self.read_register(&Command::r1(cmd::SEND_CID, 0), false, &mut raw_cid)?;
        card.cid = Some(Cid::decode(&raw_cid));

        if card.kind != CardKind::Mmc {
            let mut raw_scr = [0; 8];
            self.read_register(&Command::r1(acmd::SEND_SCR, 0), true, &mut raw_scr)?;
            card.scr = Some(Scr::decode(&raw_scr));
        }

        card.flags |= match card.kind {
            CardKind::Mmc | CardKind::None => CardFlags::empty(),
            _ if csd.is_extended_capacity() => CardFlags::SDXC,
            CardKind::SdV2HighCapacity => CardFlags::SDHC,
            CardKind::SdV1 | CardKind::SdV2 => CardFlags::SDSC,
        };
        card.csd = Some(csd);

        card.frequency_hz = self.speed_up(&csd)?;
        debug!(
            "card ready: {} blocks, running at {} Hz",
            csd.block_count,
            card.frequency_hz
        );
        Ok(card)
    }

    fn power_up(&mut self) -> Result<(), LinkError<S, Cs>> {
        self.deselect()?;
        delay_ms(self.clock, 1);
        let hz = self.config.init_frequency_hz.min(self.spi.max_frequency());
        self.spi.set_frequency(hz)?;
        self.send(&[FILLER_BYTE; POWER_UP_CLOCK_BYTES])
    }

    /// CMD0 with CS low switches the card to SPI mode
    fn go_idle(&mut self) -> Result<(), LinkError<S, Cs>> {
        let timeout = self.config.command_timeout_ms;
        for _ in 0..self.config.go_idle_attempts {
            match self.transaction(|link| {
                link.send_command(&Command::r1(cmd::GO_IDLE_STATE, 0), timeout)
            }) {
                Ok(response) if response.r1() == R1::IN_IDLE_STATE => return Ok(()),
                Ok(response) => trace!("CMD0 answered 0b{:08b}", response.r1().bits()),
                Err(Error::Timeout) => {}
                Err(error) => return Err(error),
            }
        }
        warn!("no answer to CMD0");
        Err(Error::NoCard)
    }

    fn interface_condition(&mut self) -> Result<InterfaceCondition, LinkError<S, Cs>> {
        let timeout = self.config.command_timeout_ms;
        let mut argument = Command8Argument(0);
        argument.set_voltage_accepted(VoltageAccepted::_2_7V_3_6V.bits());
        argument.set_check_pattern(CHECK_PATTERN);
        let command = Command::new(cmd::SEND_IF_COND, argument.0, ResponseType::R7);

        let response = match self.transaction(|link| link.send_command(&command, timeout)) {
            Ok(response) => response,
            Err(Error::Timeout) => return Ok(InterfaceCondition::Legacy),
            Err(error) => return Err(error),
        };
        let r1 = response.r1();
        if r1.contains(R1::ILLEGAL_COMMAND) {
            return Ok(InterfaceCondition::Legacy);
        }
        if r1 != R1::IN_IDLE_STATE {
            return Err(Error::ResponseError(r1));
        }

        let echo = response.bytes();
        if echo[4] != CHECK_PATTERN {
            return Err(Error::CheckPatternMismatch(echo[4]));
        }
        if !R7Byte3(echo[3])
            .get_voltage_accepted()
            .contains(VoltageAccepted::_2_7V_3_6V)
        {
            return Err(Error::VoltageNotSupported);
        }
        Ok(InterfaceCondition::V2)
    }

    /// Repeats an operating condition command until the card leaves the idle state
    fn wait_op_cond(&mut self, command: &Command) -> Result<(), LinkError<S, Cs>> {
        let timeout = self.config.command_timeout_ms;
        let is_app_command = command.index == acmd::SD_SEND_OP_COND;
        let deadline = Deadline::after(self.clock, self.config.op_cond_timeout_ms);
        loop {
            let r1 = self
                .transaction(|link| {
                    if is_app_command {
                        link.send_app_command(command, timeout)
                    } else {
                        link.send_command(command, timeout)
                    }
                })?
                .r1();
            if r1.is_empty() {
                trace!(
                    "card left the idle state after {} ms",
                    deadline.elapsed(self.clock)
                );
                return Ok(());
            }
            if r1 != R1::IN_IDLE_STATE {
                return Err(Error::ResponseError(r1));
            }
            if deadline.is_expired(self.clock) {
                warn!("card is still idle, giving up");
                return Err(Error::Timeout);
            }
        }
    }

    /// SD version 1.x cards know ACMD41, MMC cards only know CMD1
    fn legacy_op_cond(&mut self) -> Result<CardKind, LinkError<S, Cs>> {
        let timeout = self.config.command_timeout_ms;
        let probe = Command::r1(acmd::SD_SEND_OP_COND, 0);
        match self.transaction(|link| link.send_app_command(&probe, timeout)) {
            Ok(response) if response.r1().is_empty() => Ok(CardKind::SdV1),
            Ok(response) if response.r1() == R1::IN_IDLE_STATE => {
                self.wait_op_cond(&probe)?;
                Ok(CardKind::SdV1)
            }
            Ok(_) | Err(Error::ResponseError(_) | Error::Timeout) => {
                self.wait_op_cond(&Command::r1(cmd::SEND_OP_COND, 0))?;
                Ok(CardKind::Mmc)
            }
            Err(error) => Err(error),
        }
    }

    fn read_ocr(&mut self) -> Result<Ocr, LinkError<S, Cs>> {
        let response = self.transaction(|link| {
            link.expect_ready(&Command::new(cmd::READ_OCR, 0, ResponseType::R3))
        })?;
        Ok(Ocr::from_bits_retain(response.trailing_u32()))
    }

    /// Registers are sent like a data block of their own length
    fn read_register(
        &mut self,
        command: &Command,
        is_app_command: bool,
        buffer: &mut [u8],
    ) -> Result<(), LinkError<S, Cs>> {
        let timeout = self.config.command_timeout_ms;
        self.transaction(|link| {
            if is_app_command {
                let r1 = link.send_app_command(command, timeout)?.r1();
                if !r1.is_empty() {
                    return Err(Error::ResponseError(r1));
                }
            } else {
                link.expect_ready(command)?;
            }
            link.read_data(buffer)
        })
    }

    /// Switches to the fastest clock that the card, the bus and the configuration all allow
    fn speed_up(&mut self, csd: &Csd) -> Result<u32, LinkError<S, Cs>> {
        let card_hz = csd
            .max_transfer_rate_hz()
            .unwrap_or(self.config.init_frequency_hz);
        let hz = card_hz
            .min(self.spi.max_frequency())
            .min(self.config.max_frequency_hz);
        self.spi.set_frequency(hz)?;
        Ok(hz)
    }
}
