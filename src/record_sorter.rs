use std::cmp::max;
use std::io::Write;
use std::marker::PhantomData;
use std::mem::size_of;

use anyhow::anyhow;

use crate::array_sort::{quicksplit_by, ArrayOps, Landing, Scatter};
use crate::bucket::{Bucket, BucketWriter};
use crate::capabilities::{SortCapabilities, SortEnv};
use crate::merge::{self, Duplicates, Fixed};
use crate::record::{read_record, Record, Unifier};

/// Produces sorted runs of encoded records in place of an input stream. Returns true if more
/// runs follow.
pub type Presorter = Box<dyn FnMut(&mut dyn Write) -> Result<bool, anyhow::Error> + Send>;

/// [ArrayOps] over in-memory records, radix sorting by [Record::hash].
pub struct RecordArray<R: Record> {
    radix_bits: u32,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> RecordArray<R> {
    /// Radix passes resolve `radix_bits` bits, none when the record has no hash.
    pub fn new(radix_bits: u32) -> RecordArray<R> {
        RecordArray {
            radix_bits: if R::HASH_BITS > 0 { radix_bits } else { 0 },
            _record: PhantomData,
        }
    }

    #[inline]
    fn digit(&self, record: &R, shift: u32) -> usize {
        ((record.hash() >> shift) & ((1u64 << self.radix_bits) - 1)) as usize
    }
}

impl<R: Record> ArrayOps for RecordArray<R> {
    type Item = R;

    fn radix_bits(&self) -> u32 {
        self.radix_bits
    }

    fn quicksort(&self, items: &mut [R]) {
        items.sort_unstable();
    }

    fn quicksplit(&self, items: &mut [R]) -> (usize, usize) {
        quicksplit_by(items, |a, b| a < b)
    }

    fn radix_count(&self, items: &[R], counts: &mut [usize], shift: u32) {
        for item in items {
            counts[self.digit(item, shift)] += 1;
        }
    }

    fn radix_split(&self, src: &[R], dst: &mut Scatter<'_, R>, shift: u32) {
        for item in src {
            dst.put(self.digit(item, shift), *item);
        }
    }
}

/// The standard [SortCapabilities] for fixed-size [Record]s.
///
/// Records comparing equal are kept by default. [RecordSorter::with_unify] merges them into one
/// and [RecordSorter::with_assert_unique] makes them fail the sort.
///
/// # Examples
/// ```
/// use std::io::Cursor;
/// use adaptive_file_sort::record::{RecordIter, Record};
/// use adaptive_file_sort::record_sorter::RecordSorter;
/// use adaptive_file_sort::sort::Sort;
///
/// fn sort_numbers(numbers: &[u64]) -> Result<Vec<u64>, anyhow::Error> {
///     let mut bytes = vec![0u8; numbers.len() * 8];
///     for (i, n) in numbers.iter().enumerate() {
///         n.write_to(&mut bytes[i * 8..]);
///     }
///     let sort = Sort::new(Box::new(Cursor::new(bytes)), RecordSorter::<u64>::new());
///     let output = sort.sort()?;
///     RecordIter::<u64, _>::new(output).collect()
/// }
/// assert_eq!(sort_numbers(&[3, 1, 2]).unwrap(), vec![1, 2, 3]);
/// ```
pub struct RecordSorter<R: Record> {
    array: Vec<R>,
    scratch: Vec<R>,
    // read past the end of the previous run
    lookahead: Option<R>,
    presorter: Option<Presorter>,
    duplicates: Duplicates<R>,
    codec: Fixed<R>,
}

impl<R: Record> RecordSorter<R> {
    pub fn new() -> RecordSorter<R> {
        RecordSorter {
            array: Vec::new(),
            scratch: Vec::new(),
            lookahead: None,
            presorter: None,
            duplicates: Duplicates::Keep,
            codec: Fixed::new(),
        }
    }

    /// Take the input from `presorter` instead of an input stream.
    pub fn with_presorter(presorter: Presorter) -> RecordSorter<R> {
        let mut sorter = Self::new();
        sorter.presorter = Some(presorter);
        sorter
    }

    /// Merge records comparing equal with `unifier`, so that the output holds each key once.
    ///
    /// # Examples
    /// ```
    /// use adaptive_file_sort::record_sorter::RecordSorter;
    ///
    /// // drop repeated values
    /// let mut sorter = RecordSorter::<u32>::new();
    /// sorter.with_unify(Box::new(|first, _| first));
    /// ```
    pub fn with_unify(&mut self, unifier: Unifier<R>) {
        self.duplicates = Duplicates::Unify(unifier);
    }

    /// Fail the sort when two records compare equal.
    pub fn with_assert_unique(&mut self) {
        self.duplicates = Duplicates::Reject;
    }

    fn uses_radix(env: &SortEnv) -> bool {
        R::HASH_BITS > 0 && env.limits().use_radix
    }

    /// Records one internal sort holds, half of the memory going to radix scratch space if needed.
    fn max_records(env: &SortEnv) -> usize {
        let per_record = if Self::uses_radix(env) {
            2 * size_of::<R>()
        } else {
            size_of::<R>()
        };
        max(env.buffer_size() / max(per_record, 1), 1)
    }
}

impl<R: Record> Default for RecordSorter<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> SortCapabilities for RecordSorter<R> {
    fn hash_bits(&self) -> u32 {
        R::HASH_BITS
    }

    fn estimate(&self, env: &SortEnv, _bucket: &Bucket) -> u64 {
        ((Self::max_records(env) * R::SIZE) as u64).saturating_sub(1)
    }

    fn internal_sort(
        &mut self,
        env: &mut SortEnv,
        input: &mut Bucket,
        out: &mut Bucket,
        out_only: Option<&mut Bucket>,
    ) -> Result<bool, anyhow::Error> {
        let max_records = Self::max_records(env);
        let hash_bits = input.hash_bits();
        self.array.clear();
        self.array.reserve(max_records);
        self.array.extend(self.lookahead.take());
        let mut buf = vec![0u8; R::SIZE];
        {
            let reader = input.read()?;
            while self.array.len() < max_records {
                match read_record::<R, _>(reader, &mut buf)? {
                    Some(record) => self.array.push(record),
                    None => break,
                }
            }
            if self.array.len() == max_records {
                self.lookahead = read_record::<R, _>(reader, &mut buf)?;
            }
        }
        let n = self.array.len();
        if n == 0 {
            return Ok(false);
        }
        let more = self.lookahead.is_some();
        log::trace!("Presorting {} records, hash_bits={}, more={}", n, hash_bits, more);

        let ops = RecordArray::<R>::new(env.limits().radix_bits);
        let landing = if Self::uses_radix(env) {
            self.scratch.clear();
            self.scratch.resize(n, self.array[0]);
            env.sort_array(&ops, &mut self.array, &mut self.scratch, hash_bits)?
        } else {
            env.sort_array(&ops, &mut self.array, &mut [], hash_bits)?
        };
        let sorted = match landing {
            Landing::Array => &self.array,
            Landing::Buffer => &self.scratch,
        };

        let target = match out_only {
            Some(only) if !more => only,
            _ => out,
        };
        merge::write_run(&self.codec, &mut self.duplicates, sorted.iter().copied(), target)?;
        Ok(more)
    }

    fn has_custom_presort(&self) -> bool {
        self.presorter.is_some()
    }

    fn custom_presort(&mut self, _env: &mut SortEnv, out: &mut BucketWriter) -> Result<bool, anyhow::Error> {
        match self.presorter.as_mut() {
            Some(presorter) => presorter(out),
            None => Err(anyhow!("No custom presorter")),
        }
    }

    fn twoway_merge(
        &mut self,
        _env: &mut SortEnv,
        ins: [&mut Bucket; 2],
        out: &mut Bucket,
        second: Option<&mut Bucket>,
    ) -> Result<(), anyhow::Error> {
        merge::twoway(&self.codec, &mut self.duplicates, ins, out, second)
    }

    fn supports_multiway(&self) -> bool {
        true
    }

    fn multiway_merge(&mut self, _env: &mut SortEnv, ins: &mut [Bucket], out: &mut Bucket) -> Result<(), anyhow::Error> {
        merge::multiway(&self.codec, &mut self.duplicates, ins, out)
    }

    fn supports_radix_split(&self) -> bool {
        R::HASH_BITS > 0
    }

    fn radix_split(
        &mut self,
        _env: &mut SortEnv,
        input: &mut Bucket,
        outs: &mut [Bucket],
        shift: u32,
        bits: u32,
    ) -> Result<(), anyhow::Error> {
        merge::radix_split(&self.codec, input, outs, shift, bits)
    }

    fn release_buffer(&mut self) {
        self.array = Vec::new();
        self.scratch = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use crate::array_sort::ArrayLimits;
    use crate::bucket::tests::store;
    use crate::bucket::Bucket;
    use crate::capabilities::{SortCapabilities, SortEnv};
    use crate::record::{write_record, RecordIter};
    use crate::record_sorter::RecordSorter;

    fn env(buffer_size: usize) -> SortEnv {
        SortEnv::new(buffer_size, ArrayLimits::default(), None)
    }

    fn fill(bucket: &mut Bucket, values: &[u64]) -> Result<(), anyhow::Error> {
        let writer = bucket.write()?;
        let mut buf = [0u8; 8];
        for value in values {
            write_record(writer, value, &mut buf)?;
        }
        Ok(())
    }

    fn contents(bucket: &mut Bucket) -> Result<Vec<u64>, anyhow::Error> {
        if !bucket.have() {
            return Ok(Vec::new());
        }
        let mut bytes = Vec::new();
        bucket.read()?.read_to_end(&mut bytes)?;
        RecordIter::<u64, _>::new(bytes.as_slice()).collect()
    }

    #[test]
    fn test_internal_sort_chunks() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut input = store.bucket();
        input.set_hash_bits(64);
        fill(&mut input, &[9, 8, 7, 6, 5, 4, 3, 2, 1, 0])?;

        // Four records per run with radix scratch space
        let mut env = env(4 * 16);
        let mut sorter = RecordSorter::<u64>::new();
        let mut out = store.bucket();
        let mut only = store.bucket();
        assert!(sorter.internal_sort(&mut env, &mut input, &mut out, Some(&mut only))?);
        assert!(sorter.internal_sort(&mut env, &mut input, &mut out, Some(&mut only))?);
        assert!(!sorter.internal_sort(&mut env, &mut input, &mut out, Some(&mut only))?);
        assert_eq!(out.runs(), 2);
        assert_eq!(only.runs(), 1);
        assert_eq!(contents(&mut out)?, vec![6, 7, 8, 9, 2, 3, 4, 5]);
        assert_eq!(contents(&mut only)?, vec![0, 1]);
        Ok(())
    }

    #[test]
    fn test_internal_sort_exact_multiple_ends_in_last_run() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut input = store.bucket();
        input.set_hash_bits(64);
        fill(&mut input, &[7, 6, 5, 4, 3, 2, 1, 0])?;

        let mut env = env(4 * 16);
        let mut sorter = RecordSorter::<u64>::new();
        let mut out = store.bucket();
        let mut only = store.bucket();
        assert!(sorter.internal_sort(&mut env, &mut input, &mut out, Some(&mut only))?);
        // the second run is full and nothing follows it
        assert!(!sorter.internal_sort(&mut env, &mut input, &mut out, Some(&mut only))?);
        assert_eq!(out.runs(), 1);
        assert_eq!(only.runs(), 1);
        assert_eq!(contents(&mut out)?, vec![4, 5, 6, 7]);
        assert_eq!(contents(&mut only)?, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_internal_sort_unifies_within_run() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut input = store.bucket();
        input.set_hash_bits(64);
        fill(&mut input, &[3, 1, 3, 2, 1, 3])?;

        let mut sorter = RecordSorter::<u64>::new();
        sorter.with_unify(Box::new(|first, _| first));
        let mut out = store.bucket();
        assert!(!sorter.internal_sort(&mut env(1024), &mut input, &mut out, None)?);
        assert_eq!(contents(&mut out)?, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_internal_sort_rejects_duplicates() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut input = store.bucket();
        input.set_hash_bits(64);
        fill(&mut input, &[5, 9, 5])?;

        let mut sorter = RecordSorter::<u64>::new();
        sorter.with_assert_unique();
        let mut out = store.bucket();
        assert!(sorter.internal_sort(&mut env(1024), &mut input, &mut out, None).is_err());
        Ok(())
    }

    #[test]
    fn test_twoway_merge_alternates_outputs() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut in1 = store.bucket();
        let mut in2 = store.bucket();
        // runs: [1 5] [2 3] in the first input, [4 6] [0 7] in the second
        fill(&mut in1, &[1, 5, 2, 3])?;
        fill(&mut in2, &[4, 6, 0, 7])?;
        in1.add_runs(2);
        in2.add_runs(2);

        let mut sorter = RecordSorter::<u64>::new();
        let mut out1 = store.bucket();
        let mut out2 = store.bucket();
        sorter.twoway_merge(&mut env(1024), [&mut in1, &mut in2], &mut out1, Some(&mut out2))?;
        assert_eq!(out1.runs(), 1);
        assert_eq!(out2.runs(), 1);

        let mut last = store.bucket();
        sorter.twoway_merge(&mut env(1024), [&mut out1, &mut out2], &mut last, None)?;
        assert_eq!(last.runs(), 1);
        assert_eq!(contents(&mut last)?, vec![0, 1, 2, 3, 4, 5, 6, 7]);
        Ok(())
    }

    #[test]
    fn test_twoway_merge_run_contents() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut in1 = store.bucket();
        let mut in2 = store.bucket();
        fill(&mut in1, &[1, 5, 2, 3])?;
        fill(&mut in2, &[4, 6, 0, 7])?;

        let mut sorter = RecordSorter::<u64>::new();
        let mut out1 = store.bucket();
        let mut out2 = store.bucket();
        sorter.twoway_merge(&mut env(1024), [&mut in1, &mut in2], &mut out1, Some(&mut out2))?;
        assert_eq!(contents(&mut out1)?, vec![1, 4, 5, 6]);
        assert_eq!(contents(&mut out2)?, vec![0, 2, 3, 7]);
        Ok(())
    }

    #[test]
    fn test_twoway_merge_with_empty_second_input() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut in1 = store.bucket();
        let mut in2 = store.bucket();
        fill(&mut in1, &[3, 3, 4, 1, 2])?;

        let mut sorter = RecordSorter::<u64>::new();
        let mut out1 = store.bucket();
        let mut out2 = store.bucket();
        sorter.twoway_merge(&mut env(1024), [&mut in1, &mut in2], &mut out1, Some(&mut out2))?;
        assert_eq!(contents(&mut out1)?, vec![3, 3, 4]);
        assert_eq!(contents(&mut out2)?, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_multiway_merge() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut ins: Vec<Bucket> = (0..5).map(|_| store.bucket()).collect();
        for (i, bucket) in ins.iter_mut().enumerate() {
            let values: Vec<u64> = (0..10).map(|v| v * 5 + i as u64).collect();
            fill(bucket, &values)?;
            bucket.add_runs(1);
        }
        let mut out = store.bucket();
        let mut sorter = RecordSorter::<u64>::new();
        sorter.multiway_merge(&mut env(1024), &mut ins, &mut out)?;
        assert_eq!(out.runs(), 1);
        assert_eq!(contents(&mut out)?, (0..50).collect::<Vec<u64>>());
        Ok(())
    }

    #[test]
    fn test_radix_split_by_top_bits() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut input = store.bucket();
        fill(&mut input, &[0xff, 0x10, 0x3f, 0x80, 0x41])?;
        let mut outs: Vec<Bucket> = (0..4).map(|_| store.bucket()).collect();
        let mut sorter = RecordSorter::<u64>::new();
        sorter.radix_split(&mut env(1024), &mut input, &mut outs, 6, 2)?;
        assert_eq!(contents(&mut outs[0])?, vec![0x10, 0x3f]);
        assert_eq!(contents(&mut outs[1])?, vec![0x41]);
        assert_eq!(contents(&mut outs[2])?, vec![0x80]);
        assert_eq!(contents(&mut outs[3])?, vec![0xff]);
        Ok(())
    }

    #[test]
    fn test_hash_bits_follow_record_width() {
        assert_eq!(RecordSorter::<u32>::new().hash_bits(), 32);
        assert_eq!(RecordSorter::<u64>::new().hash_bits(), 64);
    }

    #[test]
    fn test_custom_presorter() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let store = store(dir.path(), false);
        let mut calls = 0;
        let mut sorter = RecordSorter::<u64>::with_presorter(Box::new(move |out: &mut dyn Write| -> Result<bool, anyhow::Error> {
            calls += 1;
            let mut buf = [0u8; 8];
            write_record(out, &(calls as u64), &mut buf)?;
            Ok(calls < 3)
        }));
        assert!(sorter.has_custom_presort());
        let mut out = store.bucket();
        let mut env = env(1024);
        while sorter.custom_presort(&mut env, out.write()?)? {}
        assert_eq!(contents(&mut out)?, vec![1, 2, 3]);
        Ok(())
    }
}
