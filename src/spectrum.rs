//! Pulse height histogram and battery state shared between the
//! decoding session and its readers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::proto::conv::battery_volts;
use crate::proto::response::Pulse;

pub const HISTOGRAM_BINS: usize = 4096;

pub type Histogram = [u32; HISTOGRAM_BINS];

/// Accumulated spectrum.
///
/// The histogram is only reachable through copy-out and in-place
/// update operations, all of which take the same lock. The battery
/// reading is a single atomic scalar.
#[derive(Debug)]
pub struct Spectrum {
    bins: Mutex<Box<Histogram>>,
    // f32 bits
    battery: AtomicU32,
}

impl Default for Spectrum {
    fn default() -> Self {
        Self::new()
    }
}

impl Spectrum {
    pub fn new() -> Self {
        Self {
            bins: Mutex::new(Box::new([0; HISTOGRAM_BINS])),
            battery: AtomicU32::new(0f32.to_bits()),
        }
    }

    fn bins(&self) -> MutexGuard<'_, Box<Histogram>> {
        // A panic while holding the lock cannot leave the counters torn.
        self.bins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment(&self, channel: u16, amount: u32) {
        let mut bins = self.bins();
        if let Some(bin) = bins.get_mut(usize::from(channel)) {
            *bin = bin.saturating_add(amount);
        }
    }

    pub fn apply(&self, pulse: &Pulse) {
        self.increment(pulse.channel, pulse.increment());
    }

    /// Copy of the histogram.
    pub fn snapshot(&self) -> Box<Histogram> {
        self.bins().clone()
    }

    pub fn clear(&self) {
        self.bins().fill(0);
    }

    /// Sum over all channels.
    pub fn total(&self) -> u64 {
        self.bins().iter().map(|c| u64::from(*c)).sum()
    }

    /// Last battery reading in volts, 0 until the first one arrived.
    pub fn battery(&self) -> f32 {
        f32::from_bits(self.battery.load(Ordering::Relaxed))
    }

    pub(crate) fn set_battery_raw(&self, raw: u16) -> f32 {
        let volts = battery_volts(raw);
        self.battery.store(volts.to_bits(), Ordering::Relaxed);
        volts
    }
}
