use embedded_hal::digital::OutputPin;

use crate::{
    BLOCK_SIZE, CardFlags, Cid, Config, Csd, EmbassyClock, Error, ErrorKind, Ocr, R1, R2Byte2,
    Scr, SharedSpiBus,
    block_io::validate,
    clock::Clock,
    command::Link,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardKind {
    /// Not identified, or the last identification failed
    #[default]
    None,
    Mmc,
    SdV1,
    /// Standard capacity card that knows CMD8
    SdV2,
    /// SDHC or SDXC
    SdV2HighCapacity,
}

/// Everything learned about the card during identification
#[derive(Debug, Clone, Default)]
pub struct Card {
    pub(crate) kind: CardKind,
    pub(crate) ocr: Ocr,
    pub(crate) flags: CardFlags,
    pub(crate) csd: Option<Csd>,
    pub(crate) cid: Option<Cid>,
    pub(crate) scr: Option<Scr>,
    pub(crate) frequency_hz: u32,
    pub(crate) failure: Option<ErrorKind>,
}

impl Card {
    pub fn kind(&self) -> CardKind {
        self.kind
    }

    pub fn is_operational(&self) -> bool {
        self.kind != CardKind::None
    }

    pub fn ocr(&self) -> Ocr {
        self.ocr
    }

    pub fn flags(&self) -> CardFlags {
        self.flags
    }

    pub fn csd(&self) -> Option<&Csd> {
        self.csd.as_ref()
    }

    pub fn cid(&self) -> Option<&Cid> {
        self.cid.as_ref()
    }

    /// MMC cards don't have an SCR
    pub fn scr(&self) -> Option<&Scr> {
        self.scr.as_ref()
    }

    pub fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    /// 0 until the card is identified
    pub fn block_count(&self) -> u32 {
        self.csd.map_or(0, |csd| csd.block_count)
    }

    pub fn erase_sector_size(&self) -> u32 {
        self.csd.map_or(0, |csd| csd.erase_sector_blocks())
    }

    pub fn is_write_protected(&self) -> bool {
        self.csd.is_some_and(|csd| csd.is_write_protected())
    }

    /// The SPI clock the card is driven with after identification
    pub fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }

    /// Why the last initialization failed
    pub fn failure(&self) -> Option<ErrorKind> {
        self.failure
    }
}

pub type SdCardError<B, Cs> = Error<
    <<B as SharedSpiBus>::Bus as embedded_hal::spi::ErrorType>::Error,
    <Cs as embedded_hal::digital::ErrorType>::Error,
>;

/// An SD or MMC card on a (possibly shared) SPI bus.
///
/// The bus is only locked, and CS only asserted, while an operation is running.
pub struct SdCard<'a, B, Cs, C = EmbassyClock> {
    bus: &'a B,
    cs: Cs,
    clock: C,
    config: Config,
    card: Card,
    init_attempted: bool,
}

impl<'a, B: SharedSpiBus, Cs: OutputPin> SdCard<'a, B, Cs> {
    pub fn new(bus: &'a B, cs: Cs) -> Self {
        Self::with_config(bus, cs, EmbassyClock, Config::default())
    }
}

impl<'a, B: SharedSpiBus, Cs: OutputPin, C: Clock> SdCard<'a, B, Cs, C> {
    pub fn with_config(bus: &'a B, cs: Cs, clock: C, config: Config) -> Self {
        Self {
            bus,
            cs,
            clock,
            config,
            card: Card::default(),
            init_attempted: false,
        }
    }

    pub fn card(&self) -> &Card {
        &self.card
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Gives back the CS pin and the clock
    pub fn release(self) -> (Cs, C) {
        (self.cs, self.clock)
    }

    pub(crate) fn init_attempted(&self) -> bool {
        self.init_attempted
    }

    fn with_link<R>(&mut self, f: impl FnOnce(&mut Link<'_, B::Bus, Cs, C>, &Card) -> R) -> R {
        let Self {
            bus,
            cs,
            clock,
            config,
            card,
            ..
        } = self;
        bus.lock(|spi| f(&mut Link::new(spi, cs, clock, config), card))
    }

    /// Identifies the card from scratch. A card that was working before is forgotten first.
    pub fn try_init(&mut self) -> Result<(), SdCardError<B, Cs>> {
        self.init_attempted = true;
        self.card = Card::default();
        match self.with_link(|link, _| link.identify()) {
            Ok(card) => {
                self.card = card;
                Ok(())
            }
            Err(error) => {
                error!("card initialization failed: {}", error.kind());
                self.card.failure = Some(error.kind());
                Err(error)
            }
        }
    }

    /// Reads `count` blocks starting at block `start` into the beginning of `buffer`
    pub fn try_read_blocks(
        &mut self,
        buffer: &mut [u8],
        start: u32,
        count: u32,
    ) -> Result<(), SdCardError<B, Cs>> {
        let len = validate(&self.card, buffer.len(), start, count)?;
        if len == 0 {
            return Ok(());
        }
        self.with_link(|link, card| link.read_blocks(card, &mut buffer[..len], start))
    }

    /// Writes `count` blocks from the beginning of `buffer`, starting at block `start`
    pub fn try_write_blocks(
        &mut self,
        buffer: &[u8],
        start: u32,
        count: u32,
    ) -> Result<(), SdCardError<B, Cs>> {
        if self.card.is_operational() && self.card.is_write_protected() {
            return Err(Error::WriteProtected);
        }
        let len = validate(&self.card, buffer.len(), start, count)?;
        if len == 0 {
            return Ok(());
        }
        self.with_link(|link, card| link.write_blocks(card, &buffer[..len], start))
    }

    /// Reads the card status register
    pub fn try_card_status(&mut self) -> Result<(R1, R2Byte2), SdCardError<B, Cs>> {
        if !self.card.is_operational() {
            return Err(Error::NotInitialized);
        }
        self.with_link(|link, _| link.card_status())
    }
}
