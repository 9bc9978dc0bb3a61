use std::cmp::{max, min};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use rlimit::{getrlimit, setrlimit, Resource};

use crate::bucket::Bucket;
use crate::capabilities::SortCapabilities;
use crate::config::{Config, DebugFlags};
use crate::context::{Input, SortContext, SortStats};
use crate::workers::Workers;

/// Sort a stream of records with an adaptive mix of radix splits, multi-way and two-way merges.
///
/// # Examples
/// ```
/// use std::fs::File;
/// use std::path::PathBuf;
/// use adaptive_file_sort::record_sorter::RecordSorter;
/// use adaptive_file_sort::sort::Sort;
///
/// // sort a file of little endian u64 values
/// fn sort_numbers(input: PathBuf, output: PathBuf, tmp: PathBuf) -> Result<(), anyhow::Error> {
///     let size = std::fs::metadata(&input)?.len();
///     let mut sort = Sort::new(Box::new(File::open(&input)?), RecordSorter::<u64>::new());
///     sort.with_input_size(size);
///     // the values are known to be below 2^40
///     sort.with_key_bits(40);
///     // set the directory for intermediate buckets. The default is the system temp dir -
///     // std::env::temp_dir(), however, for large inputs it is recommended to provide a dedicated
///     // directory, preferably on the same file system as the output.
///     sort.with_tmp_dir(tmp);
///     sort.with_sort_buffer(256 * 1024 * 1024);
///     sort.sort()?.persist(&output)
/// }
/// ```
pub struct Sort<C: SortCapabilities> {
    input: Input,
    capabilities: C,
    key_bits: Option<u32>,
    output: Option<File>,
    workers: Option<Workers>,
    tmp: PathBuf,
    tmp_prefix: String,
    tmp_suffix: String,
    tasks: usize,
    sort_buffer: usize,
    min_radix_bits: u32,
    max_radix_bits: u32,
    add_radix_bits: u32,
    min_multiway_bits: u32,
    max_multiway_bits: u32,
    thread_threshold: usize,
    thread_chunk: usize,
    radix_threshold: usize,
    array_radix_bits: u32,
    small_input: u64,
    io_buffer: usize,
    small_io_buffer: usize,
    debug: DebugFlags,
}

impl<C: SortCapabilities> Sort<C> {
    /// Create a default Sort of the records read from `input`.
    ///
    /// * the input size is unknown
    /// * keys have the hash bits of the record type, see [SortCapabilities::hash_bits]
    /// * the sorted output goes to a temporary file in std::env::temp_dir()
    /// * the sort buffer is 16 MiB
    /// * radix splits resolve 2 to 10 bits, with no extra bits
    /// * multi-way merges have between 2^2 and 2^8 ways
    /// * all CPU cores are used to sort arrays of at least 1 MiB, in chunks of 4 KiB
    /// * arrays of at least 4 KiB are radix sorted 10 bits at a time
    /// * inputs below 1 MiB use 4 KiB I/O buffers, others 64 KiB
    ///
    /// The Sort implementation will increase the file descriptor rlimit to accommodate the widest
    /// radix split and multi-way merge.
    pub fn new(input: Box<dyn Read + Send>, capabilities: C) -> Sort<C> {
        Self::with_input(Input::Stream { reader: input, size: None }, capabilities)
    }

    /// Create a Sort taking its input from the custom presorter of `capabilities`.
    pub fn custom(capabilities: C) -> Sort<C> {
        Self::with_input(Input::Custom, capabilities)
    }

    fn with_input(input: Input, capabilities: C) -> Sort<C> {
        Sort {
            input,
            capabilities,
            key_bits: None,
            output: None,
            workers: None,
            tmp: std::env::temp_dir(),
            tmp_prefix: "bucket-".to_string(),
            tmp_suffix: ".sort".to_string(),
            tasks: 0,
            sort_buffer: 16 << 20,
            min_radix_bits: 2,
            max_radix_bits: 10,
            add_radix_bits: 0,
            min_multiway_bits: 2,
            max_multiway_bits: 8,
            thread_threshold: 1 << 20,
            thread_chunk: 4096,
            radix_threshold: 4096,
            array_radix_bits: 10,
            small_input: 1 << 20,
            io_buffer: 64 * 1024,
            small_io_buffer: 4096,
            debug: DebugFlags::default(),
        }
    }

    /// Set the input size in bytes, if known. Helps choosing the strategy up front.
    pub fn with_input_size(&mut self, size: u64) {
        if let Input::Stream { size: input_size, .. } = &mut self.input {
            *input_size = Some(size);
        }
    }

    /// Set the number of significant bits of the record hashes. All hashes must be below
    /// 2^key_bits. The default is the full hash width of the record type.
    pub fn with_key_bits(&mut self, key_bits: u32) {
        self.key_bits = Some(min(key_bits, 64));
    }

    /// Append the sorted records to `output` instead of a temporary file. To read them back
    /// through [SortOutput], `output` must be open for reading too.
    pub fn with_output(&mut self, output: File) {
        self.output = Some(output);
    }

    /// Share an existing pool of worker threads instead of creating one.
    pub fn with_workers(&mut self, workers: Workers) {
        self.workers = Some(workers);
    }

    /// Set directory for intermediate files. By default use std::env::temp_dir()
    pub fn with_tmp_dir(&mut self, tmp: PathBuf) {
        self.tmp = tmp;
    }

    /// Set the prefix and suffix of intermediate file names.
    pub fn with_tmp_names(&mut self, prefix: String, suffix: String) {
        self.tmp_prefix = prefix;
        self.tmp_suffix = suffix;
    }

    /// Set the number of worker threads. The default is zero which will result in using all system cores
    pub fn with_tasks(&mut self, tasks: usize) {
        self.tasks = tasks;
    }

    /// Set the memory in bytes used by one internal sort.
    pub fn with_sort_buffer(&mut self, sort_buffer: usize) {
        self.sort_buffer = sort_buffer;
    }

    /// Set the bounds of bits resolved by one radix split. Fewer than `min` bits are never split.
    pub fn with_radix_bits(&mut self, min: u32, max: u32) {
        self.min_radix_bits = min;
        self.max_radix_bits = max.clamp(1, 16);
    }

    /// Split by `bits` more bits than needed to fit buckets in memory.
    pub fn with_add_radix_bits(&mut self, bits: u32) {
        self.add_radix_bits = bits;
    }

    /// Set the bounds of ways of a multi-way merge as powers of two.
    pub fn with_multiway_bits(&mut self, min: u32, max: u32) {
        self.min_multiway_bits = min;
        self.max_multiway_bits = max.clamp(1, 16);
    }

    /// Arrays of at least `bytes` are sorted by the worker threads.
    pub fn with_thread_threshold(&mut self, bytes: usize) {
        self.thread_threshold = bytes;
    }

    /// Radix buckets below `bytes` are finished by the thread which split them.
    pub fn with_thread_chunk(&mut self, bytes: usize) {
        self.thread_chunk = bytes;
    }

    /// Arrays of at least `bytes` are radix sorted, smaller ones quicksorted.
    pub fn with_radix_threshold(&mut self, bytes: usize) {
        self.radix_threshold = bytes;
    }

    /// Set the bits resolved by one radix pass of the array sorter.
    pub fn with_array_radix_bits(&mut self, bits: u32) {
        self.array_radix_bits = bits.clamp(1, 16);
    }

    /// Inputs below `bytes` use the small I/O buffers.
    pub fn with_small_input(&mut self, bytes: u64) {
        self.small_input = bytes;
    }

    /// Set the I/O buffer sizes for regular and small inputs.
    pub fn with_io_buffers(&mut self, regular: usize, small: usize) {
        self.io_buffer = max(regular, 1);
        self.small_io_buffer = max(small, 1);
    }

    /// Never presort, merge the natural runs of the input.
    pub fn with_no_presort(&mut self) {
        self.debug.no_presort = true;
    }

    pub fn with_no_radix(&mut self) {
        self.debug.no_radix = true;
    }

    pub fn with_no_multiway(&mut self) {
        self.debug.no_multiway = true;
    }

    /// Never write the last run of a bucket straight to the output.
    pub fn with_no_join(&mut self) {
        self.debug.no_join = true;
    }

    pub fn with_array_no_threads(&mut self) {
        self.debug.array_no_threads = true;
    }

    pub fn with_array_no_radix(&mut self) {
        self.debug.array_no_radix = true;
    }

    /// Keep intermediate bucket files in the tmp directory.
    pub fn with_keep_buckets(&mut self) {
        self.debug.keep_buckets = true;
    }

    /// Sort the input
    pub fn sort(self) -> Result<SortOutput, anyhow::Error> {
        let config = self.create_config();
        let (current_soft, current_hard) = Self::get_rlimits()?;
        log::info!("Current rlimit NOFILE, soft: {}, hard: {}", current_soft, current_hard);
        let new_soft = min(max((config.files() + 256) as u64, current_soft), current_hard);
        log::info!("Set new rlimit NOFILE, soft: {}, hard: {}", new_soft, current_hard);
        Self::set_rlimits(new_soft, current_hard)?;
        let result = self.internal_sort(config);
        log::info!("Restore rlimit NOFILE, soft: {}, hard: {}", current_soft, current_hard);
        Self::set_rlimits(current_soft, current_hard)?;
        result
    }

    fn get_rlimits() -> Result<(u64, u64), anyhow::Error> {
        getrlimit(Resource::NOFILE).with_context(|| "getrlimit")
    }

    fn set_rlimits(soft: u64, hard: u64) -> Result<(), anyhow::Error> {
        setrlimit(Resource::NOFILE, soft, hard)
            .with_context(|| format!("set rlimit NOFILE, soft: {}, hard: {}", soft, hard))?;
        Ok(())
    }

    fn create_config(&self) -> Config {
        let tasks = if self.tasks == 0 {
            num_cpus::get()
        } else {
            self.tasks
        };

        Config::new(
            self.tmp.clone(),
            self.tmp_prefix.clone(),
            self.tmp_suffix.clone(),
            tasks,
            self.sort_buffer,
            self.min_radix_bits,
            self.max_radix_bits,
            self.add_radix_bits,
            self.min_multiway_bits,
            self.max_multiway_bits,
            self.thread_threshold,
            self.thread_chunk,
            self.radix_threshold,
            self.array_radix_bits,
            self.small_input,
            self.io_buffer,
            self.small_io_buffer,
            self.debug.clone(),
        )
    }

    fn internal_sort(self, config: Config) -> Result<SortOutput, anyhow::Error> {
        log::info!("Start sort");
        let workers = if config.debug().array_no_threads {
            None
        } else {
            Some(
                self.workers
                    .unwrap_or_else(|| Workers::new(config.tasks()).with_queue_size(config.queue_size())),
            )
        };
        let key_bits = self
            .key_bits
            .unwrap_or_else(|| min(self.capabilities.hash_bits(), 64));
        let mut context = SortContext::new(
            config,
            self.capabilities,
            self.input,
            key_bits,
            self.output,
            workers,
        )?;
        context.run()?;
        let (output, stats) = context.finish();
        log::info!("Finish sort, {}", stats);
        Ok(SortOutput { output, stats })
    }
}

/// The sorted records of a finished [Sort].
///
/// Reading from it yields the sorted stream. The data lives in a temporary file, removed when
/// the output is dropped unless it is persisted.
pub struct SortOutput {
    output: Bucket,
    stats: SortStats,
}

impl SortOutput {
    pub fn stats(&self) -> &SortStats {
        &self.stats
    }

    /// Size of the sorted data in bytes.
    pub fn size(&self) -> u64 {
        self.stats.output_size
    }

    /// Store the sorted records at `path`, moving the temporary file there when possible.
    pub fn persist(mut self, path: &Path) -> Result<(), anyhow::Error> {
        if self.output.persist(path)? {
            return Ok(());
        }
        let mut file = File::create(path).with_context(|| format!("Create {}", path.display()))?;
        std::io::copy(&mut self, &mut file).with_context(|| format!("Write {}", path.display()))?;
        Ok(())
    }
}

impl Read for SortOutput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.output.has_file() {
            return Ok(0);
        }
        self.output
            .read()
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?
            .read(buf)
    }
}

impl std::fmt::Debug for SortOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortOutput")
            .field("output", &format!("{}", self.output))
            .field("stats", &self.stats)
            .finish()
    }
}
