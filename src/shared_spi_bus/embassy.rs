use core::cell::RefCell;

use embassy_sync::blocking_mutex::{Mutex, raw::RawMutex};

use crate::{SharedSpiBus, SpiTransport};

/// This is very similar to [`embassy_embedded_hal::shared_bus::blocking::spi::SpiDevice`], except that it doesn't control a CS pin.
pub struct EmbassySharedSpiBus<'a, M: RawMutex, BUS> {
    bus: &'a Mutex<M, RefCell<BUS>>,
}

impl<'a, M: RawMutex, BUS> EmbassySharedSpiBus<'a, M, BUS> {
    pub fn new(bus: &'a Mutex<M, RefCell<BUS>>) -> Self {
        Self { bus }
    }
}

impl<M: RawMutex, BUS: SpiTransport> SharedSpiBus for EmbassySharedSpiBus<'_, M, BUS> {
    type Bus = BUS;

    fn lock<R>(&self, f: impl FnOnce(&mut BUS) -> R) -> R {
        self.bus.lock(|bus| f(&mut bus.borrow_mut()))
    }
}
