#[cfg(feature = "embassy-sync")]
mod embassy;
use core::cell::RefCell;

#[cfg(feature = "embassy-sync")]
pub use embassy::*;

use crate::SpiTransport;

/// Lends exclusive access to an SPI bus that other devices may also be connected to.
/// Unlike [`embedded_hal::spi::SpiDevice`], this does not include a mechanism to control CS.
/// The user of the bus must ensure that CS is properly being used, and only asserted while the bus is locked.
pub trait SharedSpiBus {
    type Bus: SpiTransport;

    fn lock<R>(&self, f: impl FnOnce(&mut Self::Bus) -> R) -> R;
}

/// For a bus that is only ever used from one context
impl<B: SpiTransport> SharedSpiBus for RefCell<B> {
    type Bus = B;

    fn lock<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.borrow_mut())
    }
}
