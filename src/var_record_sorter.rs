use std::cmp::{max, Ordering};
use std::mem::size_of;
use std::sync::Arc;

use anyhow::anyhow;

use crate::array_sort::{quicksplit_by, ArrayOps, Landing, Scatter};
use crate::bucket::Bucket;
use crate::capabilities::{SortCapabilities, SortEnv};
use crate::merge::{self, Duplicates, Variable};
use crate::record::{Unifier, VarRecord};

/// Record size assumed before the first presort has seen any data.
const INITIAL_RECORD_SIZE: usize = 64;

/// Position of an in-memory record, sorted in place of the record itself.
#[derive(Clone, Copy, Debug)]
struct Entry {
    hash: u64,
    index: u32,
}

/// [ArrayOps] over the entries of one presorted batch. Entries are ordered by hash, then by the
/// records they point at.
struct EntryArray<R: VarRecord> {
    records: Arc<Vec<R>>,
    radix_bits: u32,
}

impl<R: VarRecord> EntryArray<R> {
    fn compare(&self, a: &Entry, b: &Entry) -> Ordering {
        a.hash
            .cmp(&b.hash)
            .then_with(|| self.records[a.index as usize].cmp(&self.records[b.index as usize]))
    }

    #[inline]
    fn digit(&self, entry: &Entry, shift: u32) -> usize {
        ((entry.hash >> shift) & ((1u64 << self.radix_bits) - 1)) as usize
    }
}

impl<R: VarRecord> ArrayOps for EntryArray<R> {
    type Item = Entry;

    fn radix_bits(&self) -> u32 {
        self.radix_bits
    }

    fn quicksort(&self, items: &mut [Entry]) {
        items.sort_unstable_by(|a, b| self.compare(a, b));
    }

    fn quicksplit(&self, items: &mut [Entry]) -> (usize, usize) {
        quicksplit_by(items, |a, b| self.compare(a, b) == Ordering::Less)
    }

    fn radix_count(&self, items: &[Entry], counts: &mut [usize], shift: u32) {
        for item in items {
            counts[self.digit(item, shift)] += 1;
        }
    }

    fn radix_split(&self, src: &[Entry], dst: &mut Scatter<'_, Entry>, shift: u32) {
        for item in src {
            dst.put(self.digit(item, shift), *item);
        }
    }
}

/// [SortCapabilities] for variable-size [VarRecord]s.
///
/// A presort reads records until their [VarRecord::memory_size] plus the sort index would exceed
/// the sort buffer. A single record larger than the buffer is sorted as a run of its own.
///
/// # Examples
/// ```
/// use std::io::Cursor;
/// use adaptive_file_sort::record::{VarRecord, VarRecordIter};
/// use adaptive_file_sort::sort::Sort;
/// use adaptive_file_sort::var_record_sorter::VarRecordSorter;
///
/// fn sort_words(words: &[&str]) -> Result<Vec<Vec<u8>>, anyhow::Error> {
///     let mut bytes = Vec::new();
///     for word in words {
///         word.as_bytes().to_vec().write_to(&mut bytes)?;
///     }
///     let sort = Sort::new(Box::new(Cursor::new(bytes)), VarRecordSorter::<Vec<u8>>::new());
///     VarRecordIter::<Vec<u8>, _>::new(sort.sort()?).collect()
/// }
/// assert_eq!(sort_words(&["b", "a"]).unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
/// ```
pub struct VarRecordSorter<R: VarRecord> {
    lookahead: Option<R>,
    // average memory size of the records presorted so far
    record_size: usize,
    duplicates: Duplicates<R>,
    codec: Variable<R>,
}

impl<R: VarRecord> VarRecordSorter<R> {
    pub fn new() -> VarRecordSorter<R> {
        VarRecordSorter {
            lookahead: None,
            record_size: INITIAL_RECORD_SIZE,
            duplicates: Duplicates::Keep,
            codec: Variable::new(),
        }
    }

    /// Merge records comparing equal with `unifier`.
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

    /// Index bytes per record, doubled for radix scratch space.
    fn overhead(env: &SortEnv) -> usize {
        if Self::uses_radix(env) {
            2 * size_of::<Entry>()
        } else {
            size_of::<Entry>()
        }
    }
}

impl<R: VarRecord> Default for VarRecordSorter<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: VarRecord> SortCapabilities for VarRecordSorter<R> {
    fn hash_bits(&self) -> u32 {
        R::HASH_BITS
    }

    fn estimate(&self, env: &SortEnv, _bucket: &Bucket) -> u64 {
        // the encoded size is taken to be close to the memory size
        let records = env.buffer_size() / (self.record_size + Self::overhead(env));
        ((records * self.record_size) as u64).saturating_sub(1)
    }

    fn internal_sort(
        &mut self,
        env: &mut SortEnv,
        input: &mut Bucket,
        out: &mut Bucket,
        out_only: Option<&mut Bucket>,
    ) -> Result<bool, anyhow::Error> {
        let budget = env.buffer_size();
        let overhead = Self::overhead(env);
        let hash_bits = input.hash_bits();
        let mut records: Vec<R> = Vec::new();
        let mut used = 0;
        let mut record_bytes = 0;
        if let Some(record) = self.lookahead.take() {
            used += record.memory_size() + overhead;
            record_bytes += record.memory_size();
            records.push(record);
        }
        {
            let reader = input.read()?;
            while let Some(record) = R::read_from(reader)? {
                let size = record.memory_size() + overhead;
                if !records.is_empty() && (used + size > budget || records.len() == u32::MAX as usize) {
                    self.lookahead = Some(record);
                    break;
                }
                used += size;
                record_bytes += record.memory_size();
                records.push(record);
            }
        }
        let n = records.len();
        if n == 0 {
            return Ok(false);
        }
        let more = self.lookahead.is_some();
        self.record_size = max(record_bytes / n, 1);
        log::trace!(
            "Presorting {} variable records of {} bytes, hash_bits={}, more={}",
            n,
            record_bytes,
            hash_bits,
            more
        );

        let records = Arc::new(records);
        let ops = EntryArray {
            records: Arc::clone(&records),
            radix_bits: if R::HASH_BITS > 0 { env.limits().radix_bits } else { 0 },
        };
        let mut entries: Vec<Entry> = records
            .iter()
            .enumerate()
            .map(|(index, record)| Entry {
                hash: record.hash(),
                index: index as u32,
            })
            .collect();
        let mut scratch = if Self::uses_radix(env) { entries.clone() } else { Vec::new() };
        let landing = env.sort_array(&ops, &mut entries, &mut scratch, hash_bits)?;
        let sorted = match landing {
            Landing::Array => entries,
            Landing::Buffer => scratch,
        };
        drop(ops);

        let records = Arc::try_unwrap(records).map_err(|_| anyhow!("Presorted records still shared"))?;
        let mut slots: Vec<Option<R>> = records.into_iter().map(Some).collect();
        let target = match out_only {
            Some(only) if !more => only,
            _ => out,
        };
        merge::write_run(
            &self.codec,
            &mut self.duplicates,
            sorted.iter().filter_map(|entry| slots[entry.index as usize].take()),
            target,
        )?;
        Ok(more)
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
}
