use crate::work::Range;

/// Restartable walk over `[1, max_k)` in windows of `range_size` ids.
/// The job cap is left to the consumer, the partitioner never consults tracking state.
#[derive(Debug, Clone)]
pub struct RangePartitioner {
    n: u64,
    max_k: u64,
    range_size: u64,
    step: u64,
    next: u64,
}

impl RangePartitioner {
    pub fn new(n: u64, max_k: u64, range_size: u64, step: u64) -> Self {
        Self {
            n,
            max_k,
            range_size: range_size.max(1),
            step: step.max(1),
            next: 1,
        }
    }

    /// partition the sweep for `n = 2^m`, with `max_k = 2^(m-1)`
    pub fn for_exponent(m: u32, range_size: u64, step: u64) -> Self {
        let n = 1u64.checked_shl(m).unwrap_or(0);

        Self::new(n, n / 2, range_size, step)
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    /// single-id mode, one id per job
    pub fn is_single(&self) -> bool {
        self.range_size == 1
    }

    fn stride(&self) -> u64 {
        self.range_size.saturating_mul(self.step)
    }

    pub fn restart(&mut self) {
        self.next = 1;
    }
}

impl Iterator for RangePartitioner {
    type Item = Range;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.max_k {
            return None;
        }

        let kmin = self.next;
        let kmax = kmin.saturating_add(self.stride()).min(self.max_k);
        self.next = kmax.max(kmin + 1);

        Some(Range::new(self.n, kmin, kmax, self.step))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.next >= self.max_k {
            0
        } else {
            (self.max_k - self.next).div_ceil(self.stride()) as usize
        };

        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RangePartitioner {}
