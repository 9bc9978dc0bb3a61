use std::fmt::Debug;
use std::io::{ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::mem::size_of;

use anyhow::{anyhow, Context};

/// A fixed-size record sorted by [crate::record_sorter::RecordSorter].
///
/// Records are ordered by [Ord]. When [Record::HASH_BITS] is not zero, [Record::hash] must be
/// below `2^HASH_BITS` and monotone with respect to that order: `a.hash() < b.hash()` implies
/// `a < b`. The hash then enables radix splitting of buckets and radix sorting of in-memory arrays.
///
/// # Examples
/// ```
/// use adaptive_file_sort::record::Record;
///
/// #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
/// struct Pair {
///     key: u32,
///     value: u32,
/// }
///
/// impl Record for Pair {
///     const SIZE: usize = 8;
///     const HASH_BITS: u32 = 32;
///
///     fn read_from(bytes: &[u8]) -> Self {
///         Pair {
///             key: u32::read_from(&bytes[0..4]),
///             value: u32::read_from(&bytes[4..8]),
///         }
///     }
///
///     fn write_to(&self, bytes: &mut [u8]) {
///         self.key.write_to(&mut bytes[0..4]);
///         self.value.write_to(&mut bytes[4..8]);
///     }
///
///     fn hash(&self) -> u64 {
///         self.key as u64
///     }
/// }
/// ```
pub trait Record: Copy + Ord + Debug + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Significant bits of [Record::hash], zero when records have no hash.
    const HASH_BITS: u32;

    /// Decode a record from exactly [Record::SIZE] bytes.
    fn read_from(bytes: &[u8]) -> Self;

    /// Encode the record into exactly [Record::SIZE] bytes.
    fn write_to(&self, bytes: &mut [u8]);

    fn hash(&self) -> u64 {
        0
    }
}

impl Record for u32 {
    const SIZE: usize = 4;
    const HASH_BITS: u32 = 32;

    fn read_from(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        u32::from_le_bytes(buf)
    }

    fn write_to(&self, bytes: &mut [u8]) {
        bytes[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn hash(&self) -> u64 {
        *self as u64
    }
}

impl Record for u64 {
    const SIZE: usize = 8;
    const HASH_BITS: u32 = 64;

    fn read_from(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        u64::from_le_bytes(buf)
    }

    fn write_to(&self, bytes: &mut [u8]) {
        bytes[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn hash(&self) -> u64 {
        *self
    }
}

/// Number of significant bits needed for hashes up to and including `max`.
pub fn key_bits(max: u64) -> u32 {
    u64::BITS - max.leading_zeros()
}

/// Read the next record. Returns None at a clean end of stream, an error on a truncated record.
pub fn read_record<R: Record, T: Read + ?Sized>(reader: &mut T, buf: &mut [u8]) -> Result<Option<R>, anyhow::Error> {
    let buf = &mut buf[..R::SIZE];
    let mut filled = 0;
    while filled < R::SIZE {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(None),
        n if n == R::SIZE => Ok(Some(R::read_from(buf))),
        n => Err(anyhow!("Truncated record: {} of {} bytes", n, R::SIZE)),
    }
}

pub fn write_record<R: Record, T: Write + ?Sized>(writer: &mut T, record: &R, buf: &mut [u8]) -> Result<(), anyhow::Error> {
    let buf = &mut buf[..R::SIZE];
    record.write_to(buf);
    writer.write_all(buf)?;
    Ok(())
}

/// Iterator over the records of an encoded stream.
pub struct RecordIter<R: Record, T: Read> {
    reader: T,
    buf: Vec<u8>,
    _record: PhantomData<R>,
}

impl<R: Record, T: Read> RecordIter<R, T> {
    pub fn new(reader: T) -> RecordIter<R, T> {
        RecordIter {
            reader,
            buf: vec![0; R::SIZE],
            _record: PhantomData,
        }
    }
}

impl<R: Record, T: Read> Iterator for RecordIter<R, T> {
    type Item = Result<R, anyhow::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        read_record(&mut self.reader, &mut self.buf).transpose()
    }
}

/// Check that an encoded record stream is in non-decreasing order.
pub fn is_sorted<R: Record, T: Read>(reader: T) -> Result<bool, anyhow::Error> {
    let mut previous: Option<R> = None;
    for record in RecordIter::<R, T>::new(reader) {
        let current = record?;
        if let Some(previous) = previous {
            if previous > current {
                return Ok(false);
            }
        }
        previous = Some(current);
    }
    Ok(true)
}

/// Merges two records which compare equal into one. The result must compare equal to both.
pub type Unifier<T> = Box<dyn FnMut(T, T) -> T + Send>;

/// A variable-size record sorted by [crate::var_record_sorter::VarRecordSorter].
///
/// Ordering and hashing follow the rules of [Record].
pub trait VarRecord: Ord + Debug + Send + Sync + Sized + 'static {
    /// Significant bits of [VarRecord::hash], zero when records have no hash.
    const HASH_BITS: u32;

    /// Decode the next record. Returns None at a clean end of stream.
    fn read_from(reader: &mut dyn Read) -> Result<Option<Self>, anyhow::Error>;

    fn write_to(&self, writer: &mut dyn Write) -> Result<(), anyhow::Error>;

    /// Bytes the record occupies in memory, used to fill the sort buffer.
    fn memory_size(&self) -> usize;

    fn hash(&self) -> u64 {
        0
    }
}

/// Byte strings in lexicographic order, encoded as a little endian u32 length followed by the
/// bytes. The hash is the first 8 bytes, zero padded.
impl VarRecord for Vec<u8> {
    const HASH_BITS: u32 = 64;

    fn read_from(reader: &mut dyn Read) -> Result<Option<Self>, anyhow::Error> {
        let mut buf = [0u8; 4];
        let len = match read_record::<u32, _>(reader, &mut buf)? {
            Some(len) => len as usize,
            None => return Ok(None),
        };
        let mut bytes = vec![0u8; len];
        reader
            .read_exact(&mut bytes)
            .with_context(|| anyhow!("Truncated record of {} bytes", len))?;
        Ok(Some(bytes))
    }

    fn write_to(&self, writer: &mut dyn Write) -> Result<(), anyhow::Error> {
        let len = u32::try_from(self.len()).map_err(|_| anyhow!("Record too long: {} bytes", self.len()))?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(self)?;
        Ok(())
    }

    fn memory_size(&self) -> usize {
        size_of::<Vec<u8>>() + self.len()
    }

    fn hash(&self) -> u64 {
        let mut prefix = [0u8; 8];
        let n = self.len().min(8);
        prefix[..n].copy_from_slice(&self[..n]);
        u64::from_be_bytes(prefix)
    }
}

/// Iterator over the records of an encoded stream of [VarRecord]s.
pub struct VarRecordIter<R: VarRecord, T: Read> {
    reader: T,
    _record: PhantomData<R>,
}

impl<R: VarRecord, T: Read> VarRecordIter<R, T> {
    pub fn new(reader: T) -> VarRecordIter<R, T> {
        VarRecordIter {
            reader,
            _record: PhantomData,
        }
    }
}

impl<R: VarRecord, T: Read> Iterator for VarRecordIter<R, T> {
    type Item = Result<R, anyhow::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        R::read_from(&mut self.reader).transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::record::{is_sorted, key_bits, read_record, write_record, Record, RecordIter, VarRecord, VarRecordIter};

    fn encode(values: &[u64]) -> Result<Vec<u8>, anyhow::Error> {
        let mut bytes = Vec::new();
        let mut buf = [0u8; 8];
        for value in values {
            write_record(&mut bytes, value, &mut buf)?;
        }
        Ok(bytes)
    }

    #[test]
    fn test_key_bits() {
        assert_eq!(key_bits(0), 0);
        assert_eq!(key_bits(1), 1);
        assert_eq!(key_bits(255), 8);
        assert_eq!(key_bits(256), 9);
        assert_eq!(key_bits(u32::MAX as u64), 32);
        assert_eq!(key_bits(u64::MAX), 64);
    }

    #[test]
    fn test_encoding_is_little_endian() {
        let mut bytes = [0u8; 4];
        0x0102_0304u32.write_to(&mut bytes);
        assert_eq!(bytes, [4, 3, 2, 1]);
        assert_eq!(u32::read_from(&bytes), 0x0102_0304);
    }

    #[test]
    fn test_iterate_records() -> Result<(), anyhow::Error> {
        let values = vec![3u64, 1, 4, 1, 5, 9, 2, 6];
        let bytes = encode(&values)?;
        let read: Vec<u64> = RecordIter::<u64, _>::new(Cursor::new(bytes)).collect::<Result<_, _>>()?;
        assert_eq!(read, values);
        Ok(())
    }

    #[test]
    fn test_truncated_record() -> Result<(), anyhow::Error> {
        let mut bytes = encode(&[7u64])?;
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut reader = Cursor::new(bytes);
        let mut buf = [0u8; 8];
        assert_eq!(read_record::<u64, _>(&mut reader, &mut buf)?, Some(7));
        assert!(read_record::<u64, _>(&mut reader, &mut buf).is_err());
        Ok(())
    }

    #[test]
    fn test_is_sorted() -> Result<(), anyhow::Error> {
        assert!(is_sorted::<u64, _>(Cursor::new(Vec::new()))?);
        assert!(is_sorted::<u64, _>(Cursor::new(encode(&[1, 1, 2, 10])?))?);
        assert!(!is_sorted::<u64, _>(Cursor::new(encode(&[1, 3, 2])?))?);
        Ok(())
    }

    #[test]
    fn test_byte_string_records() -> Result<(), anyhow::Error> {
        let values: Vec<Vec<u8>> = vec![b"pear".to_vec(), Vec::new(), b"apple pie".to_vec()];
        let mut bytes = Vec::new();
        for value in &values {
            value.write_to(&mut bytes)?;
        }
        assert_eq!(bytes.len(), 3 * 4 + 13);
        let read: Vec<Vec<u8>> = VarRecordIter::<Vec<u8>, _>::new(Cursor::new(bytes.clone())).collect::<Result<_, _>>()?;
        assert_eq!(read, values);

        bytes.truncate(bytes.len() - 1);
        let read: Result<Vec<Vec<u8>>, _> = VarRecordIter::<Vec<u8>, _>::new(Cursor::new(bytes)).collect();
        assert!(read.is_err());
        Ok(())
    }

    #[test]
    fn test_byte_string_hash_is_monotone() {
        let mut values: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"\0".to_vec(),
            b"a".to_vec(),
            b"a\0".to_vec(),
            b"abcdefgh".to_vec(),
            b"abcdefgh\xff".to_vec(),
            b"abcdefgi".to_vec(),
            b"b".to_vec(),
            vec![0xff; 12],
        ];
        values.sort();
        for pair in values.windows(2) {
            assert!(pair[0].hash() <= pair[1].hash(), "{:?}", pair);
        }
        assert_eq!(b"a".to_vec().hash(), 0x61 << 56);
    }
}
