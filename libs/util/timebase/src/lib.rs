// This file is part of Kiln.
//
// Kiln is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Kiln is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Kiln.  If not, see <http://www.gnu.org/licenses/>.

//! Process-relative wall clock and TSC correspondence.
//!
//! All timings are nanoseconds since [Timebase::new]. TSC readings are
//! usable as a cheap high-resolution counter once anchored to a truth pair
//! `(ns, tsc)` taken at a known instant; conversions go through 128-bit
//! intermediates so multi-hour uptimes cannot overflow. `rdtscp` core ids
//! feed a per-core skew table normalizing every reading to core 0.

use log::debug;
use std::time::Instant;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// One raw counter sample and the core it was taken on.
#[derive(Clone, Copy, Debug)]
pub struct TscSample {
    pub tsc: u64,
    pub core: u32,
}

#[cfg(target_arch = "x86_64")]
fn read_tsc() -> TscSample {
    let mut aux = 0u32;
    let tsc = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
    // IA32_TSC_AUX holds the core id in the low bits on every OS we run on.
    TscSample {
        tsc,
        core: aux & 0xfff,
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn read_tsc() -> TscSample {
    // No invariant TSC; synthesize one from the monotonic clock at a fixed
    // 1 GHz so conversions stay exact.
    use once_cell::sync::OnceCell;
    static EPOCH: OnceCell<Instant> = OnceCell::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    TscSample {
        tsc: epoch.elapsed().as_nanos() as u64,
        core: 0,
    }
}

/// Raw counter sample for callers that manage their own truth pairs (the
/// profiler's scope guards).
pub fn tsc_sample() -> TscSample {
    read_tsc()
}

pub struct Timebase {
    start: Instant,
    tsc_at_start: u64,
    tsc_freq: u64,
    skew: Vec<u64>,
}

impl Timebase {
    /// Anchor the clock pair and estimate the counter frequency over a
    /// short calibration window.
    pub fn new() -> Self {
        let start = Instant::now();
        let tsc_at_start = read_tsc().tsc;

        std::thread::sleep(std::time::Duration::from_millis(20));

        let ns = start.elapsed().as_nanos() as u64;
        let ticks = read_tsc().tsc.wrapping_sub(tsc_at_start);
        let tsc_freq = ((ticks as u128 * NSEC_PER_SEC as u128) / ns as u128) as u64;
        debug!("tsc calibrated to {} Hz over {} ns", tsc_freq, ns);

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            start,
            tsc_at_start,
            tsc_freq,
            skew: vec![0; cores.max(1)],
        }
    }

    /// Construct with known calibration; used by file readers that must
    /// interpret timestamps recorded by another process.
    pub fn with_frequency(tsc_freq: u64) -> Self {
        Self {
            start: Instant::now(),
            tsc_at_start: read_tsc().tsc,
            tsc_freq,
            skew: vec![0],
        }
    }

    pub fn ns_now(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    /// Counter sample normalized to core 0 via the skew table.
    pub fn tsc_now(&self) -> u64 {
        let sample = read_tsc();
        sample.tsc.wrapping_add(self.skew_of(sample.core))
    }

    pub fn tsc_now_raw(&self) -> TscSample {
        read_tsc()
    }

    fn skew_of(&self, core: u32) -> u64 {
        *self.skew.get(core as usize).unwrap_or(&0)
    }

    /// Replace the measured skew estimate for one core.
    pub fn set_core_skew(&mut self, core: u32, skew: u64) {
        if let Some(slot) = self.skew.get_mut(core as usize) {
            *slot = skew;
        }
    }

    pub fn tsc_frequency(&self) -> u64 {
        self.tsc_freq
    }

    pub fn ns_from_tsc(&self, tsc: u64) -> u64 {
        ns_from_tsc_truth(tsc, 0, self.tsc_at_start, self.tsc_freq)
    }

    pub fn tsc_from_ns(&self, ns: u64) -> u64 {
        tsc_from_ns_truth(ns, 0, self.tsc_at_start, self.tsc_freq)
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::new()
    }
}

/// `ns_truth + (tsc - tsc_truth) / freq`, signed so samples slightly before
/// the truth pair still convert.
pub fn ns_from_tsc_truth(tsc: u64, ns_truth: u64, tsc_truth: u64, tsc_freq: u64) -> u64 {
    debug_assert!(tsc_freq > 0);
    let delta = tsc as i128 - tsc_truth as i128;
    let ns = ns_truth as i128 + delta * NSEC_PER_SEC as i128 / tsc_freq as i128;
    ns.max(0) as u64
}

pub fn tsc_from_ns_truth(ns: u64, ns_truth: u64, tsc_truth: u64, tsc_freq: u64) -> u64 {
    debug_assert!(tsc_freq > 0);
    let delta = ns as i128 - ns_truth as i128;
    let tsc = tsc_truth as i128 + delta * tsc_freq as i128 / NSEC_PER_SEC as i128;
    tsc.max(0) as u64
}

pub fn seconds_from_tsc(ticks: u64, tsc_freq: u64) -> f64 {
    ticks as f64 / tsc_freq as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truth_pair_round_trip() {
        let freq = 2_894_561_234u64;
        let ns_truth = 55_123_456_789u64;
        let tsc_truth = 160_000_000_000u64;

        for offset_ns in [0u64, 1, 16_667, 1_000_000_000, 3_600_000_000_000] {
            let tsc = tsc_from_ns_truth(ns_truth + offset_ns, ns_truth, tsc_truth, freq);
            let ns = ns_from_tsc_truth(tsc, ns_truth, tsc_truth, freq);
            // one conversion step of rounding each way
            assert!(ns.abs_diff(ns_truth + offset_ns) <= 1);
        }
    }

    #[test]
    fn conversion_handles_samples_before_truth() {
        let freq = 3_000_000_000u64;
        let ns = ns_from_tsc_truth(1_000, 10_000, 4_000, freq);
        assert_eq!(ns, 10_000 - 1_000);
    }

    #[test]
    fn clock_is_monotone() {
        let tb = Timebase::new();
        let a = tb.ns_now();
        let b = tb.ns_now();
        assert!(b >= a);
        assert!(tb.tsc_frequency() > 0);

        let t0 = tb.tsc_now();
        let t1 = tb.tsc_now();
        assert!(t1 >= t0);
    }

    #[test]
    fn ns_from_tsc_tracks_wall_clock() {
        let tb = Timebase::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let ns = tb.ns_now();
        let approx = tb.ns_from_tsc(tb.tsc_now());
        // calibration error stays well under 10% over a few ms
        assert!(approx.abs_diff(ns) < ns / 10 + 2_000_000);
    }
}
