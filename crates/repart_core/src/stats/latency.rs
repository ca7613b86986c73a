/// Epoch-scoped buffer of latency samples (nanoseconds) with a memoized
/// median. Any insert invalidates the cached median.
#[derive(Debug, Clone, Default)]
pub struct LatencyBuffer {
    samples: Vec<u64>,
    median: Option<u64>,
}

impl LatencyBuffer {
    pub fn push(&mut self, latency_ns: u64) {
        self.samples.push(latency_ns);
        self.median = None;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[u64] {
        &self.samples
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.median = None;
    }

    /// Median of the buffered samples; `None` when empty.
    ///
    /// Even-length buffers use the average of the two middle samples rounded
    /// half up.
    pub fn median(&mut self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        if let Some(median) = self.median {
            return Some(median);
        }
        let median = median_of(&self.samples);
        self.median = Some(median);
        Some(median)
    }
}

/// Median over a sorted copy of `samples`. Panics on empty input.
pub(crate) fn median_of(samples: &[u64]) -> u64 {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        rounded_mean(sorted[n / 2 - 1], sorted[n / 2])
    }
}

fn rounded_mean(a: u64, b: u64) -> u64 {
    ((u128::from(a) + u128::from(b) + 1) / 2) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(samples: &[u64]) -> LatencyBuffer {
        let mut buf = LatencyBuffer::default();
        for sample in samples {
            buf.push(*sample);
        }
        buf
    }

    #[test]
    fn odd_length_median_is_middle_element() {
        assert_eq!(buffer(&[9, 1, 5]).median(), Some(5));
        assert_eq!(buffer(&[7]).median(), Some(7));
    }

    #[test]
    fn even_length_median_rounds_half_up() {
        assert_eq!(buffer(&[2, 4]).median(), Some(3));
        assert_eq!(buffer(&[20, 30]).median(), Some(25));
        assert_eq!(buffer(&[1, 2]).median(), Some(2));
        assert_eq!(buffer(&[u64::MAX, u64::MAX]).median(), Some(u64::MAX));
    }

    #[test]
    fn insert_invalidates_cached_median() {
        let mut buf = buffer(&[2, 4]);
        assert_eq!(buf.median(), Some(3));
        buf.push(6);
        assert_eq!(buf.median(), Some(4));
    }

    #[test]
    fn empty_buffer_has_no_median() {
        let mut buf = LatencyBuffer::default();
        assert_eq!(buf.median(), None);
        buf.push(3);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.median(), None);
    }
}
