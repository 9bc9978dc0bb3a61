use std::time::{Duration, Instant};

use anyhow::anyhow;

use crate::array_sort::{sort_array, ArrayLimits, ArrayOps, Landing};
use crate::bucket::{Bucket, BucketWriter};
use crate::workers::Workers;

/// Resources a [SortCapabilities] implementation may use while sorting.
pub struct SortEnv {
    buffer_size: usize,
    limits: ArrayLimits,
    workers: Option<Workers>,
    internal_time: Duration,
}

impl SortEnv {
    /// `buffer_size` bounds the memory of one internal sort, `workers` enables threaded array sorting.
    pub fn new(buffer_size: usize, limits: ArrayLimits, workers: Option<Workers>) -> SortEnv {
        SortEnv {
            buffer_size,
            limits,
            workers,
            internal_time: Duration::ZERO,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn limits(&self) -> &ArrayLimits {
        &self.limits
    }

    /// Sort an in-memory array with the configured array sorter, accounting the time spent.
    pub fn sort_array<O: ArrayOps + 'static>(
        &mut self,
        ops: &O,
        array: &mut [O::Item],
        buffer: &mut [O::Item],
        hash_bits: u32,
    ) -> Result<Landing, anyhow::Error> {
        let start = Instant::now();
        let landing = sort_array(ops, array, buffer, hash_bits, &self.limits, self.workers.as_ref());
        self.internal_time += start.elapsed();
        landing
    }

    /// Total time spent sorting arrays.
    pub fn internal_time(&self) -> Duration {
        self.internal_time
    }
}

/// Record level operations the sort governor is built from.
///
/// An implementation knows how records are encoded in bucket streams and how they compare.
/// Every operation which produces sorted data accounts the runs it writes with
/// [Bucket::add_runs].
pub trait SortCapabilities {
    /// Significant bits of the record hashes, the key width used unless the caller sets one.
    fn hash_bits(&self) -> u32 {
        64
    }

    /// Bytes of `bucket` one internal sort can take at once.
    fn estimate(&self, env: &SortEnv, bucket: &Bucket) -> u64;

    /// Read as much of `input` as fits in memory, sort it and write it as one run. The run goes to
    /// `out_only` (when given) if it is the last one, to `out` otherwise. Returns true if input
    /// remains.
    fn internal_sort(
        &mut self,
        env: &mut SortEnv,
        input: &mut Bucket,
        out: &mut Bucket,
        out_only: Option<&mut Bucket>,
    ) -> Result<bool, anyhow::Error>;

    /// True when the input is produced by [SortCapabilities::custom_presort].
    fn has_custom_presort(&self) -> bool {
        false
    }

    /// Produce the next sorted run of input. Returns true if more runs follow.
    fn custom_presort(&mut self, _env: &mut SortEnv, _out: &mut BucketWriter) -> Result<bool, anyhow::Error> {
        Err(anyhow!("No custom presorter"))
    }

    /// Merge the runs of both inputs pairwise, writing the output runs alternately to `out` and
    /// `second`, or all of them to `out` when `second` is None.
    fn twoway_merge(
        &mut self,
        env: &mut SortEnv,
        ins: [&mut Bucket; 2],
        out: &mut Bucket,
        second: Option<&mut Bucket>,
    ) -> Result<(), anyhow::Error>;

    fn supports_multiway(&self) -> bool {
        false
    }

    /// Merge single-run buckets into one run.
    fn multiway_merge(&mut self, _env: &mut SortEnv, _ins: &mut [Bucket], _out: &mut Bucket) -> Result<(), anyhow::Error> {
        Err(anyhow!("Multi-way merge not supported"))
    }

    fn supports_radix_split(&self) -> bool {
        false
    }

    /// Distribute the records of `input` to `outs` by `(hash >> shift) & (2^bits - 1)`.
    fn radix_split(
        &mut self,
        _env: &mut SortEnv,
        _input: &mut Bucket,
        _outs: &mut [Bucket],
        _shift: u32,
        _bits: u32,
    ) -> Result<(), anyhow::Error> {
        Err(anyhow!("Radix split not supported"))
    }

    /// Free presort memory, called before passes which do not need it.
    fn release_buffer(&mut self) {}
}
