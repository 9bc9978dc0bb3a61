use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tempfile::{Builder, TempPath};

use crate::config::Config;

/// State flags of a [Bucket].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    /// The raw input of the sort.
    pub const SOURCE: Flags = Flags(1);
    /// The bucket holding the sorted output.
    pub const FINAL: Flags = Flags(2);
    pub const OPEN_READ: Flags = Flags(4);
    pub const OPEN_WRITE: Flags = Flags(8);
    /// The stream is closed and reopened on next access.
    pub const SWAPPED_OUT: Flags = Flags(16);
    /// The input is produced by a custom presorter.
    pub const CUSTOM_PRESORT: Flags = Flags(32);
    pub const DESTROYED: Flags = Flags(64);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

enum Backing {
    Temp(TempPath),
    Kept(PathBuf),
    Caller,
}

enum Stream {
    Source(BufReader<Box<dyn Read + Send>>),
    Read(BufReader<File>),
    Write(BucketWriter),
}

/// Write side of a bucket, tracking the number of bytes written.
pub struct BucketWriter {
    writer: BufWriter<File>,
    pos: u64,
}

impl BucketWriter {
    fn new(file: File, capacity: usize, pos: u64) -> BucketWriter {
        BucketWriter {
            writer: BufWriter::with_capacity(capacity, file),
            pos,
        }
    }

    /// Bytes written to the bucket so far.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn into_file(self) -> Result<File, anyhow::Error> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to flush bucket: {}", e.error()))
    }
}

impl Write for BucketWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Creates buckets and their temporary files.
pub(crate) struct BucketStore {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    keep: bool,
    io_buffer: usize,
    next_id: AtomicU64,
    files_created: AtomicUsize,
}

impl BucketStore {
    pub(crate) fn new(config: &Config, io_buffer: usize) -> Arc<BucketStore> {
        Arc::new(BucketStore {
            dir: config.tmp().clone(),
            prefix: config.tmp_prefix().clone(),
            suffix: config.tmp_suffix().clone(),
            keep: config.debug().keep_buckets,
            io_buffer,
            next_id: AtomicU64::new(0),
            files_created: AtomicUsize::new(0),
        })
    }

    /// A new empty bucket without any backing file.
    pub(crate) fn bucket(self: &Arc<Self>) -> Bucket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::trace!("Creating bucket {}", id);
        Bucket {
            id,
            store: self.clone(),
            size: 0,
            runs: 0,
            hash_bits: 0,
            flags: Flags::default(),
            backing: None,
            origin: 0,
            resume: 0,
            stream: None,
        }
    }

    /// Bucket reading the caller's input stream. `size` is `u64::MAX` when unknown.
    pub(crate) fn source(self: &Arc<Self>, input: Box<dyn Read + Send>, size: u64, hash_bits: u32) -> Bucket {
        let mut bucket = self.bucket();
        bucket.flags = Flags::SOURCE | Flags::OPEN_READ;
        bucket.size = size;
        bucket.hash_bits = hash_bits;
        bucket.stream = Some(Stream::Source(BufReader::with_capacity(self.io_buffer, input)));
        bucket
    }

    /// Source bucket of a sort whose input is produced by a custom presorter.
    pub(crate) fn custom_source(self: &Arc<Self>, hash_bits: u32) -> Bucket {
        let mut bucket = self.bucket();
        bucket.flags = Flags::SOURCE | Flags::OPEN_READ | Flags::CUSTOM_PRESORT;
        bucket.size = u64::MAX;
        bucket.hash_bits = hash_bits;
        bucket
    }

    /// The FINAL bucket, writing to the caller's file when given.
    pub(crate) fn output(self: &Arc<Self>, file: Option<File>) -> Result<Bucket, anyhow::Error> {
        let mut bucket = self.bucket();
        bucket.flags = Flags::FINAL;
        bucket.runs = 1;
        if let Some(mut file) = file {
            bucket.origin = file
                .stream_position()
                .with_context(|| "Failed to query the output file position")?;
            bucket.backing = Some(Backing::Caller);
            bucket.stream = Some(Stream::Write(BucketWriter::new(file, self.io_buffer, 0)));
            bucket.flags.insert(Flags::OPEN_WRITE);
        }
        Ok(bucket)
    }

    pub(crate) fn files_created(&self) -> usize {
        self.files_created.load(Ordering::Relaxed)
    }

    fn create_file(&self, id: u64) -> Result<(File, Backing), anyhow::Error> {
        let file = Builder::new()
            .prefix(&self.prefix)
            .suffix(&self.suffix)
            .tempfile_in(&self.dir)
            .with_context(|| format!("Failed to create a file for bucket {} in {}", id, self.dir.display()))?;
        self.files_created.fetch_add(1, Ordering::Relaxed);
        let (file, path) = file.into_parts();
        log::trace!("Bucket {} backed by {}", id, path.display());
        let backing = if self.keep {
            Backing::Kept(path.keep().with_context(|| format!("Failed to keep the file of bucket {}", id))?)
        } else {
            Backing::Temp(path)
        };
        Ok((file, backing))
    }
}

/// A sequence of records at some stage of sorting, optionally backed by a file.
///
/// Buckets are created empty and get a temporary file on the first [Bucket::write]. The first
/// [Bucket::read] after writing freezes the size and rewinds the stream. Dropping a bucket closes
/// its stream and removes its file.
pub struct Bucket {
    id: u64,
    store: Arc<BucketStore>,
    size: u64,
    runs: u32,
    hash_bits: u32,
    flags: Flags,
    backing: Option<Backing>,
    origin: u64,
    resume: u64,
    stream: Option<Stream>,
}

impl Bucket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes. While the bucket is being written this is the current write position.
    pub fn size(&self) -> u64 {
        match &self.stream {
            Some(Stream::Write(writer)) => writer.pos,
            _ => self.size,
        }
    }

    /// True if the bucket holds any data.
    pub fn have(&self) -> bool {
        self.size() > 0
    }

    pub fn has_file(&self) -> bool {
        self.backing.is_some()
    }

    /// Number of sorted runs: 0 when unsorted, 1 for a single sorted run.
    pub fn runs(&self) -> u32 {
        self.runs
    }

    /// Account for `runs` more runs written to the bucket.
    pub fn add_runs(&mut self, runs: u32) {
        self.runs += runs;
    }

    /// Number of significant key bits not yet determined by radix splits.
    pub fn hash_bits(&self) -> u32 {
        self.hash_bits
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub(crate) fn set_hash_bits(&mut self, hash_bits: u32) {
        self.hash_bits = hash_bits;
    }

    pub(crate) fn set_runs(&mut self, runs: u32) {
        self.runs = runs;
    }

    pub(crate) fn make_final(&mut self) {
        self.flags.insert(Flags::FINAL);
    }

    fn path(&self) -> Option<&Path> {
        match &self.backing {
            Some(Backing::Temp(path)) => Some(&**path),
            Some(Backing::Kept(path)) => Some(path.as_path()),
            _ => None,
        }
    }

    fn capacity(&self) -> usize {
        self.store.io_buffer
    }

    /// Open the bucket for reading.
    pub fn read(&mut self) -> Result<&mut dyn Read, anyhow::Error> {
        self.swap_in()?;
        let stream = match self.stream.take() {
            Some(Stream::Write(writer)) => {
                self.size = writer.pos;
                let mut file = writer.into_file()?;
                file.seek(SeekFrom::Start(self.origin))
                    .with_context(|| format!("Failed to rewind bucket {}", self.id))?;
                self.flags.remove(Flags::OPEN_WRITE);
                self.flags.insert(Flags::OPEN_READ);
                log::trace!("Bucket {} switched to reading ({} bytes)", self.id, self.size);
                Stream::Read(BufReader::with_capacity(self.capacity(), file))
            }
            Some(stream) => stream,
            None => panic!("Reading bucket {} which was never written", self.id),
        };
        self.stream = Some(stream);
        match self.stream.as_mut() {
            Some(Stream::Source(reader)) => Ok(reader as &mut dyn Read),
            Some(Stream::Read(reader)) => Ok(reader as &mut dyn Read),
            _ => Err(anyhow!("Bucket {} is not readable", self.id)),
        }
    }

    /// Open the bucket for writing, appending to whatever was written before.
    pub fn write(&mut self) -> Result<&mut BucketWriter, anyhow::Error> {
        self.swap_in()?;
        if self.stream.is_none() {
            assert!(
                !self.flags.contains(Flags::OPEN_READ) && !self.flags.contains(Flags::DESTROYED),
                "Writing to bucket {} in state {:?}",
                self.id,
                self.flags
            );
            let (file, backing) = self.store.create_file(self.id)?;
            self.backing = Some(backing);
            self.origin = 0;
            self.size = 0;
            self.stream = Some(Stream::Write(BucketWriter::new(file, self.capacity(), 0)));
            self.flags.insert(Flags::OPEN_WRITE);
        }
        match self.stream.as_mut() {
            Some(Stream::Write(writer)) => Ok(writer),
            _ => panic!("Writing to bucket {} which is open for reading", self.id),
        }
    }

    /// Close the stream to free its buffer and file descriptor until the next access.
    pub(crate) fn swap_out(&mut self) -> Result<(), anyhow::Error> {
        if self.flags.contains(Flags::SOURCE) || self.path().is_none() {
            return Ok(());
        }
        match self.stream.take() {
            Some(Stream::Write(writer)) => {
                self.size = writer.pos;
                writer.into_file()?;
            }
            Some(Stream::Read(mut reader)) => {
                self.resume = reader
                    .stream_position()
                    .with_context(|| format!("Failed to query position of bucket {}", self.id))?;
            }
            other => {
                self.stream = other;
                return Ok(());
            }
        }
        self.flags.insert(Flags::SWAPPED_OUT);
        log::trace!("Swapped out bucket {} ({} bytes)", self.id, self.size);
        Ok(())
    }

    fn swap_in(&mut self) -> Result<(), anyhow::Error> {
        if !self.flags.contains(Flags::SWAPPED_OUT) {
            return Ok(());
        }
        let path = self
            .path()
            .ok_or_else(|| anyhow!("Swapped out bucket {} has no file", self.id))?
            .to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to swap in bucket {} from {}", self.id, path.display()))?;
        let stream = if self.flags.contains(Flags::OPEN_WRITE) {
            file.seek(SeekFrom::End(0))
                .with_context(|| format!("Failed to seek {}", path.display()))?;
            Stream::Write(BucketWriter::new(file, self.capacity(), self.size))
        } else {
            file.seek(SeekFrom::Start(self.resume))
                .with_context(|| format!("Failed to seek {}", path.display()))?;
            Stream::Read(BufReader::with_capacity(self.capacity(), file))
        };
        self.stream = Some(stream);
        self.flags.remove(Flags::SWAPPED_OUT);
        log::trace!("Swapped in bucket {}", self.id);
        Ok(())
    }

    /// Move the bucket's temporary file to `path`. Returns false when the bucket has no whole
    /// temporary file to hand over, or the file cannot be renamed there.
    pub(crate) fn persist(&mut self, path: &Path) -> Result<bool, anyhow::Error> {
        if !matches!(self.backing, Some(Backing::Temp(_))) || !self.flags.contains(Flags::OPEN_WRITE) {
            return Ok(false);
        }
        self.swap_out()?;
        match self.backing.take() {
            Some(Backing::Temp(temp)) => match temp.persist(path) {
                Ok(()) => {
                    self.flags.remove(Flags::SWAPPED_OUT | Flags::OPEN_WRITE);
                    log::trace!("Bucket {} persisted to {}", self.id, path.display());
                    Ok(true)
                }
                Err(e) => {
                    log::debug!("Failed to rename bucket {} to {}: {}", self.id, path.display(), e.error);
                    self.backing = Some(Backing::Temp(e.path));
                    Ok(false)
                }
            },
            other => {
                self.backing = other;
                Ok(false)
            }
        }
    }
}

impl Display for Bucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let size = self.size();
        if size == u64::MAX {
            write!(f, "bucket {} (unknown size)", self.id)
        } else {
            write!(f, "bucket {} ({} bytes)", self.id, size)
        }
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        self.flags.insert(Flags::DESTROYED);
        if let Some(Stream::Write(writer)) = self.stream.take() {
            if let Err(e) = writer.into_file() {
                log::warn!("Dropping bucket {}: {}", self.id, e);
            }
        }
        match &self.backing {
            Some(Backing::Kept(path)) => log::trace!("Dropping bucket {}, keeping {}", self.id, path.display()),
            _ => log::trace!("Dropping bucket {}", self.id),
        }
    }
}

/// Buckets of a running sort: FINAL first, then the buckets still to be reduced, in key order.
pub(crate) struct BucketList {
    buckets: VecDeque<Bucket>,
}

impl BucketList {
    pub(crate) fn new(output: Bucket, source: Bucket) -> BucketList {
        assert!(output.flags.contains(Flags::FINAL));
        let mut buckets = VecDeque::new();
        buckets.push_back(output);
        buckets.push_back(source);
        BucketList { buckets }
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn output(&mut self) -> &mut Bucket {
        &mut self.buckets[0]
    }

    /// Take out the bucket adjacent to FINAL.
    pub(crate) fn take_next(&mut self) -> Option<Bucket> {
        self.buckets.remove(1)
    }

    /// Queue `bucket` directly after FINAL.
    pub(crate) fn insert_next(&mut self, bucket: Bucket) {
        self.buckets.insert(1, bucket);
    }

    /// Queue `buckets` directly after FINAL, keeping their order.
    pub(crate) fn insert_all_next(&mut self, buckets: Vec<Bucket>) {
        for bucket in buckets.into_iter().rev() {
            self.insert_next(bucket);
        }
    }

    /// Make `bucket` the new FINAL, dropping the old one.
    pub(crate) fn replace_output(&mut self, mut bucket: Bucket) {
        bucket.make_final();
        self.buckets[0] = bucket;
    }

    pub(crate) fn into_output(mut self) -> Bucket {
        assert_eq!(self.buckets.len(), 1, "Unreduced buckets left");
        match self.buckets.pop_front() {
            Some(output) => output,
            None => unreachable!("FINAL bucket missing"),
        }
    }
}
