//! This crate implements an adaptive external sort of record streams.
//!
//! Input that fits in memory is sorted there, with a hybrid radix/quicksort which uses multiple
//! CPU cores for large arrays. Larger input is reduced with whichever external strategy costs the
//! fewest passes: radix splits into buckets by key bits, multi-way merges of presorted runs, or
//! two-way merges of natural runs. Intermediate buckets live in temporary files which are swapped
//! out when many of them are open at once.
//!
//! The record encoding and ordering are supplied as a
//! [SortCapabilities](capabilities::SortCapabilities) implementation. The crate ships
//! [RecordSorter](record_sorter::RecordSorter) for any fixed-size type implementing
//! [Record](record::Record), including `u32` and `u64`, and
//! [VarRecordSorter](var_record_sorter::VarRecordSorter) for variable-size
//! [VarRecord](record::VarRecord)s such as length prefixed byte strings. Both can unify records
//! with equal keys or reject them.
//!
//! # Examples
//! ```
//! use std::fs::File;
//! use std::path::PathBuf;
//! use adaptive_file_sort::record_sorter::RecordSorter;
//! use adaptive_file_sort::sort::Sort;
//!
//! // optimized for use with Jemalloc
//! use tikv_jemallocator::Jemalloc;
//! #[global_allocator]
//! static GLOBAL: Jemalloc = Jemalloc;
//!
//! // sort a file of u64 records
//! fn sort_records(input: PathBuf, output: PathBuf, tmp: PathBuf) -> Result<(), anyhow::Error> {
//!     let size = std::fs::metadata(&input)?.len();
//!     let mut sort = Sort::new(Box::new(File::open(&input)?), RecordSorter::<u64>::new());
//!     sort.with_input_size(size);
//!
//!     // set number of CPU cores the in-memory sort will attempt to use. The default is to use
//!     // all available cores.
//!     sort.with_tasks(2);
//!
//!     // set the directory for intermediate buckets. The default is the system temp dir -
//!     // std::env::temp_dir(), however, for large files it is recommended to provide a dedicated
//!     // directory, preferably on the same file system as the output result.
//!     sort.with_tmp_dir(tmp);
//!
//!     let sorted = sort.sort()?;
//!     log::info!("{}", sorted.stats());
//!     sorted.persist(&output)
//! }
//! ```
//!

pub(crate) mod config;
pub(crate) mod governor;
pub(crate) mod merge;

pub mod array_sort;
pub mod bucket;
pub mod capabilities;
pub mod context;
pub mod record;
pub mod record_sorter;
pub mod sort;
pub mod var_record_sorter;
pub mod workers;
