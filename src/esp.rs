use embedded_hal::spi::{ErrorType, SpiBus};
use esp_hal::{
    Blocking,
    spi::master::{Config, Spi},
    time::Rate,
};

use crate::{FrequencyRejected, SpiTransport};

/// The SPI2 peripheral of the ESP32-C3 can generate up to 40 MHz without going through the GPIO matrix
/// (half of the 80 MHz APB clock)
pub const ESP32C3_MAX_SPI_FREQUENCY: u32 = 40_000_000;

/// Blocking esp-hal SPI master driving an SD card
pub struct EspSpi<'d> {
    spi: Spi<'d, Blocking>,
    config: Config,
}

impl<'d> EspSpi<'d> {
    /// `config` is used for everything except the frequency, which the SD card driver controls
    pub fn new(spi: Spi<'d, Blocking>, config: Config) -> Self {
        Self { spi, config }
    }

    pub fn into_inner(self) -> Spi<'d, Blocking> {
        self.spi
    }
}

impl ErrorType for EspSpi<'_> {
    type Error = esp_hal::spi::Error;
}

impl SpiBus<u8> for EspSpi<'_> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        SpiBus::read(&mut self.spi, words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        SpiBus::write(&mut self.spi, words)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        SpiBus::transfer(&mut self.spi, read, write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        SpiBus::transfer_in_place(&mut self.spi, words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        SpiBus::flush(&mut self.spi)
    }
}

impl SpiTransport for EspSpi<'_> {
    fn max_frequency(&self) -> u32 {
        ESP32C3_MAX_SPI_FREQUENCY
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), FrequencyRejected> {
        let config = self.config.clone().with_frequency(Rate::from_hz(hz));
        self.spi
            .apply_config(&config)
            .map_err(|_| FrequencyRejected(hz))?;
        self.config = config;
        Ok(())
    }
}
