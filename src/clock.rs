use embassy_time::Instant;

/// A monotonic millisecond counter. It is allowed to wrap around.
pub trait Clock {
    fn now_millis(&self) -> u32;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_millis(&self) -> u32 {
        T::now_millis(self)
    }
}

/// [`Clock`] backed by the embassy time driver
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now_millis(&self) -> u32 {
        // Truncation is fine, deadlines only look at wrapping differences
        Instant::now().as_millis() as u32
    }
}

/// A point in time after which a bounded wait gives up
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Deadline {
    start: u32,
    timeout_ms: u32,
}

impl Deadline {
    pub fn after<C: Clock>(clock: &C, timeout_ms: u32) -> Self {
        Self {
            start: clock.now_millis(),
            timeout_ms,
        }
    }

    pub fn elapsed<C: Clock>(&self, clock: &C) -> u32 {
        clock.now_millis().wrapping_sub(self.start)
    }

    pub fn is_expired<C: Clock>(&self, clock: &C) -> bool {
        self.elapsed(clock) >= self.timeout_ms
    }
}

/// Busy-waits for at least `ms` milliseconds
pub fn delay_ms<C: Clock>(clock: &C, ms: u32) {
    let deadline = Deadline::after(clock, ms);
    while !deadline.is_expired(clock) {
        core::hint::spin_loop();
    }
}
