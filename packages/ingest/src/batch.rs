//! Fixed-size batch accumulation.

use std::num::NonZeroUsize;

/// Upper bound on the capacity reserved up front for a batch, so a huge
/// configured batch size does not allocate before records arrive.
const MAX_PREALLOC: usize = 65_536;

/// A sealed group of records, owned by whoever inserts it.
#[derive(Debug)]
pub struct Batch<T> {
    /// 1-based sequence number within the file.
    pub seq: u64,
    /// Records in read order.
    pub records: Vec<T>,
}

impl<T> Batch<T> {
    /// Number of records in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if the batch holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Groups records into batches of exactly `batch_size`.
///
/// [`Self::push`] hands back a sealed batch each time the current one
/// fills up; [`Self::finish`] hands back the partial remainder, if any.
#[derive(Debug)]
pub struct Batcher<T> {
    batch_size: NonZeroUsize,
    current: Vec<T>,
    sealed: u64,
}

impl<T> Batcher<T> {
    /// Creates an accumulator for batches of `batch_size` records.
    #[must_use]
    pub fn new(batch_size: NonZeroUsize) -> Self {
        Self {
            batch_size,
            current: Self::fresh(batch_size),
            sealed: 0,
        }
    }

    fn fresh(batch_size: NonZeroUsize) -> Vec<T> {
        Vec::with_capacity(batch_size.get().min(MAX_PREALLOC))
    }

    /// Adds `record`; returns the sealed batch when it reaches
    /// `batch_size`.
    pub fn push(&mut self, record: T) -> Option<Batch<T>> {
        self.current.push(record);

        if self.current.len() < self.batch_size.get() {
            return None;
        }

        let records = std::mem::replace(&mut self.current, Self::fresh(self.batch_size));
        Some(self.seal(records))
    }

    /// Seals whatever is left. Returns `None` when nothing is pending, so an
    /// empty batch is never produced.
    pub fn finish(mut self) -> Option<Batch<T>> {
        if self.current.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.current);
        Some(self.seal(records))
    }

    /// Records waiting in the unsealed batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.current.len()
    }

    /// Batches sealed so far.
    #[must_use]
    pub const fn sealed(&self) -> u64 {
        self.sealed
    }

    fn seal(&mut self, records: Vec<T>) -> Batch<T> {
        self.sealed += 1;
        Batch {
            seq: self.sealed,
            records,
        }
    }
}
