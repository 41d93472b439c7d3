//! Tracks which byte ranges of a transfer have been delivered.
//!
//! Downloads may arrive out of order, overlap, or repeat (resumed
//! requests, adaptive media players, a tunnel re-delivering after a
//! reconnect). Coverage keeps a sorted list of disjoint, non-touching
//! half-open intervals and a running total of covered bytes.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    low: u64,
    high: u64,
}

impl Span {
    fn len(&self) -> u64 {
        self.high - self.low
    }
}

#[derive(Debug, Default)]
struct Inner {
    spans: Vec<Span>,
    downloaded: u64,
}

/// Concurrent set of delivered byte ranges.
#[derive(Debug, Default)]
pub struct RangeCoverage {
    inner: Mutex<Inner>,
}

impl RangeCoverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records delivery of `count` bytes at `offset`.
    ///
    /// Returns the number of bytes that were not already covered.
    pub fn download(&self, offset: u64, count: u64) -> u64 {
        if count == 0 {
            return 0;
        }
        let new = Span {
            low: offset,
            high: offset.saturating_add(count),
        };

        let mut inner = self.inner.lock().unwrap();
        // First span that touches or follows `new`, and one past the
        // last span that touches it.
        let first = inner.spans.partition_point(|s| s.high < new.low);
        let last = inner.spans.partition_point(|s| s.low <= new.high);

        let delta = if first == last {
            inner.spans.insert(first, new);
            new.len()
        } else {
            let merged = Span {
                low: new.low.min(inner.spans[first].low),
                high: new.high.max(inner.spans[last - 1].high),
            };
            let covered: u64 = inner.spans[first..last].iter().map(Span::len).sum();
            inner.spans.drain(first + 1..last);
            inner.spans[first] = merged;
            merged.len() - covered
        };

        inner.downloaded += delta;
        delta
    }

    /// Returns how many bytes of `[offset, offset + count)` are covered.
    pub fn downloaded_between(&self, offset: u64, count: u64) -> u64 {
        let low = offset;
        let high = offset.saturating_add(count);
        let inner = self.inner.lock().unwrap();
        let first = inner.spans.partition_point(|s| s.high <= low);
        inner.spans[first..]
            .iter()
            .take_while(|s| s.low < high)
            .map(|s| s.high.min(high) - s.low.max(low))
            .sum()
    }

    /// Total covered bytes.
    pub fn downloaded(&self) -> u64 {
        self.inner.lock().unwrap().downloaded
    }

    /// End of the highest covered span, or 0 when empty.
    pub fn high_water_mark(&self) -> u64 {
        self.inner.lock().unwrap().spans.last().map_or(0, |s| s.high)
    }

    /// Clears all coverage.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.spans.clear();
        inner.downloaded = 0;
    }

    #[cfg(test)]
    fn span_count(&self) -> usize {
        self.inner.lock().unwrap().spans.len()
    }
}
