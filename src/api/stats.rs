//! Pool statistics.

use crate::util::size::format_bytes;

/// A snapshot of one pool's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Memories in existence (queued plus outstanding).
    pub created: usize,

    /// Memories handed out and not yet released.
    pub outstanding: usize,

    /// Memories waiting in the free queue.
    pub queued: usize,

    /// Highest `outstanding` seen (high water mark).
    pub peak_outstanding: usize,

    /// Successful acquires.
    pub acquires: u64,

    /// Times an acquire had to block.
    pub waits: u64,

    /// Bytes of one Memory.
    pub element_size: usize,

    /// Cap on `created` (0 = unbounded).
    pub max_count: usize,
}

impl PoolStats {
    /// Device bytes held by the pool.
    pub fn bytes_allocated(&self) -> usize {
        self.created * self.element_size
    }

    /// Fraction of acquires that blocked.
    pub fn wait_ratio(&self) -> f64 {
        if self.acquires == 0 {
            return 0.0;
        }
        self.waits as f64 / self.acquires as f64
    }
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pool Statistics:")?;
        if self.max_count == 0 {
            writeln!(f, "  Created:     {} (unbounded)", self.created)?;
        } else {
            writeln!(f, "  Created:     {} / {}", self.created, self.max_count)?;
        }
        writeln!(f, "  Outstanding: {} (peak {})", self.outstanding, self.peak_outstanding)?;
        writeln!(f, "  Queued:      {}", self.queued)?;
        writeln!(f, "  Acquires:    {}", self.acquires)?;
        writeln!(f, "  Waits:       {}", self.waits)?;
        writeln!(f, "  Device:      {}", format_bytes(self.bytes_allocated()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_ratios() {
        let stats = PoolStats {
            created: 3,
            outstanding: 2,
            queued: 1,
            peak_outstanding: 3,
            acquires: 8,
            waits: 2,
            element_size: 4096,
            max_count: 3,
        };
        assert_eq!(stats.bytes_allocated(), 12288);
        assert!((stats.wait_ratio() - 0.25).abs() < f64::EPSILON);

        let text = stats.to_string();
        assert!(text.contains("3 / 3"));
        assert!(text.contains("12.00 KB"));
    }
}
