mod diskio;

pub use diskio::*;
use embedded_hal::digital::OutputPin;

use crate::{Clock, SdCard, SharedSpiBus};

/// A simple trait for a disk made of fixed size blocks, where every operation either works or doesn't.
/// The disk guarantees that nothing else can read or write to the disk.
/// The number of blocks can only change by initializing again.
pub trait BlockDevice {
    /// (Re)initializes the disk. Returns whether it is ready.
    fn init(&mut self) -> bool;
    /// Whether the disk is ready. Initializes it if that was never tried.
    fn status(&mut self) -> bool;
    /// Reads `count` blocks starting at `start` into `buffer`
    fn read_blocks(&mut self, buffer: &mut [u8], start: u32, count: u32) -> bool;
    fn write_blocks(&mut self, buffer: &[u8], start: u32, count: u32) -> bool;
    fn block_count(&self) -> u32;
    fn block_size(&self) -> u32;
    /// Erase unit, in blocks
    fn erase_sector_size(&self) -> u32;
    fn is_write_protected(&self) -> bool {
        false
    }
}

impl<B: SharedSpiBus, Cs: OutputPin, C: Clock> BlockDevice for SdCard<'_, B, Cs, C> {
    fn init(&mut self) -> bool {
        self.try_init().is_ok()
    }

    fn status(&mut self) -> bool {
        if self.card().is_operational() {
            true
        } else if !self.init_attempted() {
            self.init()
        } else {
            false
        }
    }

    fn read_blocks(&mut self, buffer: &mut [u8], start: u32, count: u32) -> bool {
        match self.try_read_blocks(buffer, start, count) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    "reading {} blocks at {} failed: {}",
                    count,
                    start,
                    error.kind()
                );
                false
            }
        }
    }

    fn write_blocks(&mut self, buffer: &[u8], start: u32, count: u32) -> bool {
        match self.try_write_blocks(buffer, start, count) {
            Ok(()) => true,
            Err(error) => {
                warn!(
                    "writing {} blocks at {} failed: {}",
                    count,
                    start,
                    error.kind()
                );
                false
            }
        }
    }

    fn block_count(&self) -> u32 {
        self.card().block_count()
    }

    fn block_size(&self) -> u32 {
        self.card().block_size()
    }

    fn erase_sector_size(&self) -> u32 {
        self.card().erase_sector_size()
    }

    fn is_write_protected(&self) -> bool {
        self.card().is_write_protected()
    }
}
