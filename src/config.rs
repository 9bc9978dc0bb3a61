use std::path::PathBuf;

/// Toggles that switch individual parts of the sorter off, mostly useful for testing and for
/// comparing strategies on the same input.
#[derive(Clone, Debug, Default)]
pub(crate) struct DebugFlags {
    pub(crate) no_presort: bool,
    pub(crate) no_radix: bool,
    pub(crate) no_multiway: bool,
    pub(crate) no_join: bool,
    pub(crate) array_no_threads: bool,
    pub(crate) array_no_radix: bool,
    pub(crate) keep_buckets: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct Config {
    tmp: PathBuf,
    tmp_prefix: String,
    tmp_suffix: String,
    tasks: usize,
    queue_size: usize,
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

impl Config {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
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
    ) -> Config {
        let queue_size = 4096;
        Config {
            tmp,
            tmp_prefix,
            tmp_suffix,
            tasks,
            queue_size,
            sort_buffer,
            min_radix_bits,
            max_radix_bits,
            add_radix_bits,
            min_multiway_bits,
            max_multiway_bits,
            thread_threshold,
            thread_chunk,
            radix_threshold,
            array_radix_bits,
            small_input,
            io_buffer,
            small_io_buffer,
            debug,
        }
    }

    pub(crate) fn tmp(&self) -> &PathBuf {
        &self.tmp
    }

    pub(crate) fn tmp_prefix(&self) -> &String {
        &self.tmp_prefix
    }

    pub(crate) fn tmp_suffix(&self) -> &String {
        &self.tmp_suffix
    }

    pub(crate) fn tasks(&self) -> usize {
        self.tasks
    }

    pub(crate) fn queue_size(&self) -> usize {
        self.queue_size
    }

    pub(crate) fn sort_buffer(&self) -> usize {
        self.sort_buffer
    }

    pub(crate) fn min_radix_bits(&self) -> u32 {
        self.min_radix_bits
    }

    pub(crate) fn max_radix_bits(&self) -> u32 {
        self.max_radix_bits
    }

    pub(crate) fn add_radix_bits(&self) -> u32 {
        self.add_radix_bits
    }

    pub(crate) fn min_multiway_bits(&self) -> u32 {
        self.min_multiway_bits
    }

    pub(crate) fn max_multiway_bits(&self) -> u32 {
        self.max_multiway_bits
    }

    pub(crate) fn thread_threshold(&self) -> usize {
        self.thread_threshold
    }

    pub(crate) fn thread_chunk(&self) -> usize {
        self.thread_chunk
    }

    pub(crate) fn radix_threshold(&self) -> usize {
        self.radix_threshold
    }

    pub(crate) fn array_radix_bits(&self) -> u32 {
        self.array_radix_bits
    }

    pub(crate) fn small_input(&self) -> u64 {
        self.small_input
    }

    /// Buffer size of bucket streams, smaller for inputs below the small input threshold.
    pub(crate) fn io_buffer_for(&self, input_size: u64) -> usize {
        if input_size < self.small_input {
            self.small_io_buffer
        } else {
            self.io_buffer
        }
    }

    pub(crate) fn debug(&self) -> &DebugFlags {
        &self.debug
    }

    /// Widest fan-out of open bucket files: a radix split plus a multi-way merge.
    pub(crate) fn files(&self) -> usize {
        (1usize << self.max_radix_bits) + (1usize << self.max_multiway_bits)
    }
}
