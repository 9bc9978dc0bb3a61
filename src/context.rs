use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;

use crate::array_sort::ArrayLimits;
use crate::bucket::{Bucket, BucketList, BucketStore};
use crate::capabilities::{SortCapabilities, SortEnv};
use crate::config::Config;
use crate::workers::{Workers, WorkersLease};

/// Counters and timings of one sort.
#[derive(Clone, Debug, Default)]
pub struct SortStats {
    /// Input size in bytes, None when not known up front.
    pub input_size: Option<u64>,
    pub output_size: u64,
    pub radix_splits: usize,
    pub multiway_merges: usize,
    pub twoway_passes: usize,
    pub presorted_runs: usize,
    /// Buckets appended to the output.
    pub joins: usize,
    /// Buckets which became the output without copying.
    pub final_replacements: usize,
    pub files_created: usize,
    pub external_time: Duration,
    pub presort_time: Duration,
    pub internal_time: Duration,
}

impl Display for SortStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "output: {} bytes, radix splits: {}, multiway merges: {}, twoway passes: {}, presorted runs: {}, \
             joins: {}, final replacements: {}, files: {}, external: {:.3}s, presort: {:.3}s, internal: {:.3}s",
            self.output_size,
            self.radix_splits,
            self.multiway_merges,
            self.twoway_passes,
            self.presorted_runs,
            self.joins,
            self.final_replacements,
            self.files_created,
            self.external_time.as_secs_f64(),
            self.presort_time.as_secs_f64(),
            self.internal_time.as_secs_f64(),
        )
    }
}

/// Where the records to sort come from.
pub(crate) enum Input {
    Stream {
        reader: Box<dyn Read + Send>,
        size: Option<u64>,
    },
    Custom,
}

/// State of one running sort: the bucket list with FINAL at its head, the capability set and
/// the accounting.
pub(crate) struct SortContext<C: SortCapabilities> {
    pub(crate) config: Config,
    pub(crate) store: Arc<BucketStore>,
    pub(crate) buckets: BucketList,
    pub(crate) caps: C,
    pub(crate) env: SortEnv,
    pub(crate) stats: SortStats,
    pass_start: Instant,
    last_pass: Duration,
    _lease: Option<WorkersLease>,
}

impl<C: SortCapabilities> SortContext<C> {
    pub(crate) fn new(
        config: Config,
        caps: C,
        input: Input,
        key_bits: u32,
        output: Option<File>,
        workers: Option<Workers>,
    ) -> Result<SortContext<C>, anyhow::Error> {
        let input_size = match &input {
            Input::Stream { size, .. } => *size,
            Input::Custom => None,
        };
        let store = BucketStore::new(&config, config.io_buffer_for(input_size.unwrap_or(u64::MAX)));
        let source = match input {
            Input::Stream { reader, size } => store.source(reader, size.unwrap_or(u64::MAX), key_bits),
            Input::Custom => {
                if !caps.has_custom_presort() {
                    return Err(anyhow!("Custom presorting requested without a custom presorter"));
                }
                store.custom_source(key_bits)
            }
        };
        log::info!("Input size: {}, {} hash bits", source, key_bits);
        let final_bucket = store.output(output)?;
        let buckets = BucketList::new(final_bucket, source);

        let limits = ArrayLimits {
            thread_threshold: config.thread_threshold(),
            thread_chunk: config.thread_chunk(),
            radix_threshold: config.radix_threshold(),
            radix_bits: config.array_radix_bits(),
            use_threads: !config.debug().array_no_threads,
            use_radix: !config.debug().array_no_radix,
        };
        let lease = workers.as_ref().map(|w| w.lease());
        let env = SortEnv::new(config.sort_buffer(), limits, workers);
        log::debug!("Sort buffer: {} bytes, array limits: {:?}", config.sort_buffer(), env.limits());

        Ok(SortContext {
            config,
            store,
            buckets,
            caps,
            env,
            stats: SortStats {
                input_size,
                ..SortStats::default()
            },
            pass_start: Instant::now(),
            last_pass: Duration::ZERO,
            _lease: lease,
        })
    }

    pub(crate) fn start_timer(&mut self) {
        self.pass_start = Instant::now();
    }

    /// Close the current pass and return its duration.
    pub(crate) fn stop_timer(&mut self) -> Duration {
        self.last_pass = self.pass_start.elapsed();
        self.last_pass
    }

    /// Throughput of the last pass in MB/s.
    pub(crate) fn speed(&self, size: u64) -> u64 {
        let secs = self.last_pass.as_secs_f64();
        if size == 0 || secs == 0.0 {
            return 0;
        }
        (size as f64 / (1 << 20) as f64 / secs) as u64
    }

    /// Release all resources and hand over FINAL.
    pub(crate) fn finish(mut self) -> (Bucket, SortStats) {
        self.caps.release_buffer();
        let output = self.buckets.into_output();
        let mut stats = self.stats;
        stats.output_size = output.size();
        stats.files_created = self.store.files_created();
        stats.internal_time = self.env.internal_time();
        log::info!("Final size: {}", output);
        log::info!(
            "Final timings: {:.3}s external sorting, {:.3}s presorting, {:.3}s internal sorting",
            stats.external_time.as_secs_f64(),
            stats.presort_time.as_secs_f64(),
            stats.internal_time.as_secs_f64()
        );
        (output, stats)
    }
}
