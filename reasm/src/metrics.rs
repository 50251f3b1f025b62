//! Pool statistics.

/// Snapshot of slot usage in a reassembly pool.
///
/// Produced by scanning the slot array, so it is meant for diagnostics and
/// periodic reporting rather than the per-fragment path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Ring depth.
    pub depth: u32,
    /// Spare slots beyond the ring depth.
    pub burst: u32,
    /// Total slots (`depth + burst`).
    pub slot_count: u32,
    /// Slots holding no message.
    pub free: u32,
    /// Slots with a message being reassembled.
    pub busy: u32,
    /// Slots owning a ring line.
    pub published: u32,
    /// Slots whose state byte is not a valid state.
    pub corrupt: u32,
    /// Bytes held by busy slots.
    pub busy_bytes: u64,
}

impl PoolMetrics {
    /// Fraction of the burst slots holding in-progress messages (0.0 - 100.0).
    pub fn burst_utilization(&self) -> f64 {
        if self.burst == 0 {
            0.0
        } else {
            (self.busy as f64 / self.burst as f64) * 100.0
        }
    }

    /// Whether every slot is accounted for by exactly one valid state.
    pub fn is_consistent(&self) -> bool {
        self.corrupt == 0 && self.free + self.busy + self.published == self.slot_count
    }
}
