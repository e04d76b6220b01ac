use embassy_embedded_hal::SetConfig;
use embedded_hal::spi::{ErrorType, SpiBus};

/// The bus refused to run at the requested frequency (in Hz)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrequencyRejected(pub u32);

/// A full-duplex SPI bus whose clock frequency can be changed at runtime.
/// The SD card needs to be initialized at a slow clock and can be read and written at a much faster one.
///
/// `SpiBus::transfer` is the byte exchange primitive.
/// When only clocking is needed, the driver sends `0xFF`.
pub trait SpiTransport: SpiBus<u8> {
    /// The fastest clock this bus can generate, in Hz
    fn max_frequency(&self) -> u32;
    fn set_frequency(&mut self, hz: u32) -> Result<(), FrequencyRejected>;
}

impl<T: SpiTransport + ?Sized> SpiTransport for &mut T {
    fn max_frequency(&self) -> u32 {
        T::max_frequency(self)
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), FrequencyRejected> {
        T::set_frequency(self, hz)
    }
}

/// Adapts any bus that implements [`SetConfig`] (most embassy HALs do).
/// `config_for` builds the bus configuration for a given frequency.
pub struct ConfigurableSpi<B, F> {
    bus: B,
    config_for: F,
    max_hz: u32,
}

impl<B, F> ConfigurableSpi<B, F> {
    pub fn new(bus: B, max_hz: u32, config_for: F) -> Self {
        Self {
            bus,
            config_for,
            max_hz,
        }
    }

    pub fn into_inner(self) -> B {
        self.bus
    }
}

impl<B: ErrorType, F> ErrorType for ConfigurableSpi<B, F> {
    type Error = B::Error;
}

impl<B: SpiBus<u8>, F> SpiBus<u8> for ConfigurableSpi<B, F> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.read(words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.bus.write(words)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.bus.transfer(read, write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.transfer_in_place(words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.bus.flush()
    }
}

impl<B, F> SpiTransport for ConfigurableSpi<B, F>
where
    B: SpiBus<u8> + SetConfig,
    F: FnMut(u32) -> B::Config,
{
    fn max_frequency(&self) -> u32 {
        self.max_hz
    }

    fn set_frequency(&mut self, hz: u32) -> Result<(), FrequencyRejected> {
        let config = (self.config_for)(hz);
        self.bus
            .set_config(&config)
            .map_err(|_| FrequencyRejected(hz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    #[derive(Default)]
    struct LoopbackBus {
        hz: u32,
    }

    impl ErrorType for LoopbackBus {
        type Error = Infallible;
    }

    impl SpiBus<u8> for LoopbackBus {
        fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
            words.fill(0xFF);
            Ok(())
        }

        fn write(&mut self, _words: &[u8]) -> Result<(), Infallible> {
            Ok(())
        }

        fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
            read.copy_from_slice(&write[..read.len()]);
            Ok(())
        }

        fn transfer_in_place(&mut self, _words: &mut [u8]) -> Result<(), Infallible> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Infallible> {
            Ok(())
        }
    }

    impl SetConfig for LoopbackBus {
        type Config = u32;
        type ConfigError = ();

        fn set_config(&mut self, config: &u32) -> Result<(), ()> {
            if *config > 50_000_000 {
                return Err(());
            }
            self.hz = *config;
            Ok(())
        }
    }

    #[test]
    fn frequency_goes_through_set_config() {
        let mut spi = ConfigurableSpi::new(LoopbackBus::default(), 25_000_000, |hz: u32| hz);
        assert_eq!(spi.max_frequency(), 25_000_000);
        spi.set_frequency(400_000).unwrap();
        assert_eq!(
            spi.set_frequency(80_000_000),
            Err(FrequencyRejected(80_000_000))
        );
        assert_eq!(spi.into_inner().hz, 400_000);
    }

    #[test]
    fn exchange_is_forwarded() {
        let mut spi = ConfigurableSpi::new(LoopbackBus::default(), 25_000_000, |hz: u32| hz);
        let mut read = [0; 3];
        spi.transfer(&mut read, &[1, 2, 3]).unwrap();
        assert_eq!(read, [1, 2, 3]);
    }
}
