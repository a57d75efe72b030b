//! Seeded fault-injecting link for deterministic testing.
//!
//! Real networks drop, reorder, duplicate, and corrupt datagrams.  To
//! exercise the reliability mechanisms without depending on actual network
//! conditions, [`Simulator`] models one direction of a link and applies a
//! configurable fault model to every datagram pushed through it:
//!
//! | Fault       | Description                                            |
//! |-------------|--------------------------------------------------------|
//! | Loss        | Drop the datagram with probability `loss_rate`.        |
//! | Duplication | Deliver it twice with probability `duplicate_rate`.    |
//! | Reordering  | Hold it back so the next datagram overtakes it.        |
//! | Corruption  | Flip one random bit with probability `corrupt_rate`.   |
//!
//! All randomness comes from a [`StdRng`] seeded by the caller, so a failing
//! run can be replayed exactly.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fault probabilities, each in `[0.0, 1.0]`.  Out-of-range values are
/// clamped; NaN means never.
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
    pub corrupt_rate: f64,
}

impl SimulatorConfig {
    /// The same probability for every fault.
    pub fn uniform(rate: f64) -> Self {
        Self {
            loss_rate: rate,
            duplicate_rate: rate,
            reorder_rate: rate,
            corrupt_rate: rate,
        }
    }
}

/// One direction of a faulty link.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
    /// A datagram being held back so that a later one overtakes it.
    held: Option<Vec<u8>>,
    stats: SimulatorStats,
}

/// What the simulator did so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub transmitted: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    pub corrupted: u64,
}

impl Simulator {
    pub fn new(config: SimulatorConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            held: None,
            stats: SimulatorStats::default(),
        }
    }

    /// A link that delivers everything unchanged, in order.
    pub fn perfect() -> Self {
        Self::new(SimulatorConfig::default(), 0)
    }

    /// Push one datagram into the link and return what comes out the other
    /// end, in delivery order.
    ///
    /// A datagram held back by an earlier call is released after this
    /// call's own deliveries.
    pub fn transmit(&mut self, datagram: &[u8]) -> Vec<Vec<u8>> {
        self.stats.transmitted += 1;
        let released = self.held.take();
        let mut out = Vec::with_capacity(3);

        if self.chance(self.config.loss_rate) {
            self.stats.dropped += 1;
        } else {
            let mut copy = datagram.to_vec();
            if !copy.is_empty() && self.chance(self.config.corrupt_rate) {
                let bit = self.rng.random_range(0..copy.len() * 8);
                copy[bit / 8] ^= 1 << (bit % 8);
                self.stats.corrupted += 1;
            }
            if self.chance(self.config.duplicate_rate) {
                out.push(copy.clone());
                self.stats.duplicated += 1;
            }
            if released.is_none() && self.chance(self.config.reorder_rate) {
                self.held = Some(copy);
                self.stats.reordered += 1;
            } else {
                out.push(copy);
            }
        }

        out.extend(released);
        out
    }

    /// Release a held-back datagram, if any.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        self.held.take()
    }

    pub fn stats(&self) -> SimulatorStats {
        self.stats
    }

    fn chance(&mut self, p: f64) -> bool {
        if p.is_nan() || p <= 0.0 {
            return false;
        }
        self.rng.random_bool(p.min(1.0))
    }
}
