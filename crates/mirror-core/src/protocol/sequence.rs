//! Per-connection frame numbering and presentation-timestamp normalization.
//!
//! # Why renumber frames? (for beginners)
//!
//! A viewer detects dropped or reordered video packets by looking at the
//! frame number in each header.  Numbers start at 1 for every new connection
//! and increase by exactly one per packet, so a gap always means loss and a
//! reset to 1 always means a fresh session.
//!
//! Encoders stamp packets with their own presentation timestamps (PTS), which
//! usually start at some arbitrary point on the encoder's clock.  The viewer
//! only cares about the spacing between frames, so the first defined PTS is
//! shifted to 1 and every later value is shifted by the same amount.

use std::sync::atomic::{AtomicU32, Ordering};

/// A thread-safe counter that hands out frame numbers starting at 1.
///
/// # Examples
///
/// ```rust
/// use mirror_core::protocol::FrameCounter;
///
/// let counter = FrameCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// assert_eq!(counter.current(), 2);
/// ```
#[derive(Debug, Default)]
pub struct FrameCounter {
    /// Last number handed out; 0 before the first frame.
    last: AtomicU32,
}

impl FrameCounter {
    /// Creates a counter whose first [`next`](Self::next) returns 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next frame number.
    ///
    /// `Relaxed` is enough: the value only orders packets on one channel and
    /// does not publish any other memory.
    pub fn next(&self) -> u32 {
        self.last.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Returns the most recently issued frame number, or 0 if none.
    pub fn current(&self) -> u32 {
        self.last.load(Ordering::Relaxed)
    }
}

/// Shifts encoder presentation timestamps so the stream starts near zero.
#[derive(Debug, Default, Clone)]
pub struct PtsNormalizer {
    offset: Option<i64>,
}

impl PtsNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes one raw encoder PTS in microseconds.
    ///
    /// The first defined value becomes 1.  Packets without a PTS are stamped
    /// 0.  Values that would fall before the stream start clamp to 0 instead
    /// of wrapping.
    pub fn normalize(&mut self, raw_pts_us: Option<i64>) -> u64 {
        let Some(raw) = raw_pts_us else {
            return 0;
        };
        let offset = *self.offset.get_or_insert(raw.saturating_sub(1));
        u64::try_from(raw.saturating_sub(offset)).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_frame_counter_starts_at_one() {
        // Arrange
        let counter = FrameCounter::new();

        // Act / Assert
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.next(), 1);
    }

    #[test]
    fn test_frame_counter_has_no_gaps() {
        let counter = FrameCounter::new();
        let values: Vec<u32> = (0..100).map(|_| counter.next()).collect();
        assert_eq!(values, (1..=100).collect::<Vec<_>>());
    }

    #[test]
    fn test_frame_counter_is_thread_safe() {
        // Arrange
        let counter = Arc::new(FrameCounter::new());

        // Act
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..250).map(|_| c.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert
        all.sort_unstable();
        assert_eq!(all, (1..=1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_first_pts_normalizes_to_one() {
        let mut pts = PtsNormalizer::new();
        assert_eq!(pts.normalize(Some(987_654_321)), 1);
        assert_eq!(pts.normalize(Some(987_654_321 + 33_333)), 33_334);
    }

    #[test]
    fn test_undefined_pts_is_zero_and_does_not_fix_offset() {
        let mut pts = PtsNormalizer::new();
        assert_eq!(pts.normalize(None), 0);
        assert_eq!(pts.normalize(Some(500)), 1);
    }

    #[test]
    fn test_pts_before_stream_start_clamps_to_zero() {
        let mut pts = PtsNormalizer::new();
        pts.normalize(Some(1_000));
        assert_eq!(pts.normalize(Some(10)), 0);
    }

    #[test]
    fn test_normalized_pts_is_non_decreasing_for_monotonic_input() {
        let mut pts = PtsNormalizer::new();
        let out: Vec<u64> = (0..50).map(|i| pts.normalize(Some(7_000 + i * 16_667))).collect();
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(out[0], 1);
    }
}
