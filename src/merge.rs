use std::fmt::Debug;
use std::io::{Read, Write};
use std::marker::PhantomData;

use anyhow::anyhow;

use crate::bucket::{Bucket, BucketWriter};
use crate::record::{read_record, write_record, Record, Unifier, VarRecord};

/// How the merge passes treat records which compare equal.
pub(crate) enum Duplicates<T> {
    Keep,
    Unify(Unifier<T>),
    /// Equal records are an error.
    Reject,
}

/// Encoding of items in bucket streams.
pub(crate) trait Codec {
    type Item: Ord + Debug;

    /// Returns None at a clean end of stream. `buf` is scratch space owned by the caller.
    fn read(&self, reader: &mut dyn Read, buf: &mut Vec<u8>) -> Result<Option<Self::Item>, anyhow::Error>;

    fn write(&self, writer: &mut dyn Write, item: &Self::Item, buf: &mut Vec<u8>) -> Result<(), anyhow::Error>;

    fn hash(&self, item: &Self::Item) -> u64;
}

pub(crate) struct Fixed<R: Record>(PhantomData<fn() -> R>);

impl<R: Record> Fixed<R> {
    pub(crate) fn new() -> Fixed<R> {
        Fixed(PhantomData)
    }
}

impl<R: Record> Codec for Fixed<R> {
    type Item = R;

    fn read(&self, reader: &mut dyn Read, buf: &mut Vec<u8>) -> Result<Option<R>, anyhow::Error> {
        buf.resize(R::SIZE, 0);
        read_record(reader, buf)
    }

    fn write(&self, writer: &mut dyn Write, item: &R, buf: &mut Vec<u8>) -> Result<(), anyhow::Error> {
        buf.resize(R::SIZE, 0);
        write_record(writer, item, buf)
    }

    fn hash(&self, item: &R) -> u64 {
        item.hash()
    }
}

pub(crate) struct Variable<R: VarRecord>(PhantomData<fn() -> R>);

impl<R: VarRecord> Variable<R> {
    pub(crate) fn new() -> Variable<R> {
        Variable(PhantomData)
    }
}

impl<R: VarRecord> Codec for Variable<R> {
    type Item = R;

    fn read(&self, reader: &mut dyn Read, _buf: &mut Vec<u8>) -> Result<Option<R>, anyhow::Error> {
        R::read_from(reader)
    }

    fn write(&self, writer: &mut dyn Write, item: &R, _buf: &mut Vec<u8>) -> Result<(), anyhow::Error> {
        item.write_to(writer)
    }

    fn hash(&self, item: &R) -> u64 {
        item.hash()
    }
}

/// Sequential reader over an opened bucket stream.
pub(crate) struct Source<'a, C: Codec> {
    codec: &'a C,
    reader: Option<&'a mut dyn Read>,
    buf: Vec<u8>,
}

impl<'a, C: Codec> Source<'a, C> {
    pub(crate) fn open(codec: &'a C, bucket: &'a mut Bucket) -> Result<Source<'a, C>, anyhow::Error> {
        let reader = if bucket.have() { Some(bucket.read()?) } else { None };
        Ok(Source {
            codec,
            reader,
            buf: Vec::new(),
        })
    }

    pub(crate) fn next(&mut self) -> Result<Option<C::Item>, anyhow::Error> {
        match &mut self.reader {
            Some(reader) => self.codec.read(&mut **reader, &mut self.buf),
            None => Ok(None),
        }
    }
}

/// Writes a sorted sequence, holding back the last item so that equal neighbours can be unified
/// or rejected before they reach the output.
pub(crate) struct Emitter<'a, C: Codec> {
    codec: &'a C,
    duplicates: &'a mut Duplicates<C::Item>,
    pending: Option<C::Item>,
    buf: Vec<u8>,
}

impl<'a, C: Codec> Emitter<'a, C> {
    pub(crate) fn new(codec: &'a C, duplicates: &'a mut Duplicates<C::Item>) -> Emitter<'a, C> {
        Emitter {
            codec,
            duplicates,
            pending: None,
            buf: Vec::new(),
        }
    }

    /// The item most recently pushed, possibly unified with its predecessors.
    pub(crate) fn last(&self) -> Option<&C::Item> {
        self.pending.as_ref()
    }

    /// Append `item`, writing the held back item to `writer` unless the two are unified.
    pub(crate) fn push(&mut self, writer: &mut dyn Write, item: C::Item) -> Result<(), anyhow::Error> {
        if let Some(pending) = self.pending.take() {
            if pending == item {
                match &mut *self.duplicates {
                    Duplicates::Keep => self.codec.write(writer, &pending, &mut self.buf)?,
                    Duplicates::Unify(unifier) => {
                        self.pending = Some(unifier(pending, item));
                        return Ok(());
                    }
                    Duplicates::Reject => return Err(anyhow!("Duplicate record: {:?}", item)),
                }
            } else {
                self.codec.write(writer, &pending, &mut self.buf)?;
            }
        }
        self.pending = Some(item);
        Ok(())
    }

    /// Write the held back item. Must be called before switching to another writer.
    pub(crate) fn flush(&mut self, writer: &mut dyn Write) -> Result<(), anyhow::Error> {
        if let Some(pending) = self.pending.take() {
            self.codec.write(writer, &pending, &mut self.buf)?;
        }
        Ok(())
    }
}

/// Write sorted `items` as one run of `out`.
pub(crate) fn write_run<C: Codec, I: IntoIterator<Item = C::Item>>(
    codec: &C,
    duplicates: &mut Duplicates<C::Item>,
    items: I,
    out: &mut Bucket,
) -> Result<(), anyhow::Error> {
    let writer = out.write()?;
    let mut emitter = Emitter::new(codec, duplicates);
    for item in items {
        emitter.push(writer, item)?;
    }
    emitter.flush(writer)?;
    out.add_runs(1);
    Ok(())
}

/// Merge the natural runs of both inputs pairwise. A new output run starts whenever the next item
/// is smaller than the last one written. Output runs alternate between `out` and `second`, or all
/// go to `out`.
pub(crate) fn twoway<C: Codec>(
    codec: &C,
    duplicates: &mut Duplicates<C::Item>,
    ins: [&mut Bucket; 2],
    out: &mut Bucket,
    mut second: Option<&mut Bucket>,
) -> Result<(), anyhow::Error> {
    let [first_in, second_in] = ins;
    let split = second.is_some();
    let run_count = {
        let mut in1 = Source::open(codec, first_in)?;
        let mut in2 = Source::open(codec, second_in)?;
        let mut targets: [Option<&mut Bucket>; 2] = [Some(&mut *out), second.as_deref_mut()];
        let mut writers: [Option<&mut BucketWriter>; 2] = [None, None];
        let mut emitter = Emitter::new(codec, duplicates);
        let mut current = 1;
        let mut run_count = 0u32;

        let mut next1 = in1.next()?;
        let mut next2 = in2.next()?;
        let mut run1 = next1.is_some();
        let mut run2 = next2.is_some();
        loop {
            let take_first = match (&next1, &next2) {
                (None, None) => break,
                (Some(a), Some(b)) if run1 && run2 => a <= b,
                (Some(_), _) if run1 => true,
                (_, Some(_)) => false,
                (Some(_), None) => true,
            };
            let item = if take_first { next1.take() } else { next2.take() }
                .ok_or_else(|| anyhow!("Merge input exhausted"))?;

            if emitter.last().map_or(true, |last| item < *last) {
                if let Some(writer) = writers[current].as_deref_mut() {
                    emitter.flush(writer)?;
                }
                current = if split { 1 - current } else { 0 };
                if writers[current].is_none() {
                    let target = targets[current]
                        .take()
                        .ok_or_else(|| anyhow!("Second output missing"))?;
                    writers[current] = Some(target.write()?);
                }
                run_count += 1;
            }
            match writers[current].as_deref_mut() {
                Some(writer) => emitter.push(writer, item)?,
                None => return Err(anyhow!("Output not opened")),
            }

            if take_first {
                next1 = in1.next()?;
                run1 = matches!((&next1, emitter.last()), (Some(next), Some(last)) if last <= next);
            } else {
                next2 = in2.next()?;
                run2 = matches!((&next2, emitter.last()), (Some(next), Some(last)) if last <= next);
            }
            if !run1 && !run2 {
                run1 = next1.is_some();
                run2 = next2.is_some();
            }
        }
        if let Some(writer) = writers[current].as_deref_mut() {
            emitter.flush(writer)?;
        }
        run_count
    };

    match second {
        Some(second) => {
            out.add_runs((run_count + 1) / 2);
            second.add_runs(run_count / 2);
        }
        None => out.add_runs(run_count),
    }
    Ok(())
}

/// Tree of winners over the current heads of a multi-way merge. Leaves are inputs, each inner
/// node holds the input with the smallest head in its subtree, ties going to the lower input.
pub(crate) struct Tournament {
    leaves: usize,
    tree: Vec<Option<usize>>,
}

impl Tournament {
    pub(crate) fn new<T: Ord>(heads: &[Option<T>]) -> Tournament {
        let leaves = heads.len().next_power_of_two();
        let mut tree = vec![None; 2 * leaves];
        for (i, head) in heads.iter().enumerate() {
            if head.is_some() {
                tree[leaves + i] = Some(i);
            }
        }
        for pos in (1..leaves).rev() {
            tree[pos] = Self::pick(tree[2 * pos], tree[2 * pos + 1], heads);
        }
        Tournament { leaves, tree }
    }

    pub(crate) fn winner(&self) -> Option<usize> {
        self.tree[1]
    }

    pub(crate) fn update<T: Ord>(&mut self, input: usize, heads: &[Option<T>]) {
        let mut pos = self.leaves + input;
        self.tree[pos] = heads[input].as_ref().map(|_| input);
        while pos > 1 {
            pos /= 2;
            self.tree[pos] = Self::pick(self.tree[2 * pos], self.tree[2 * pos + 1], heads);
        }
    }

    fn pick<T: Ord>(left: Option<usize>, right: Option<usize>, heads: &[Option<T>]) -> Option<usize> {
        match (left, right) {
            (Some(l), Some(r)) => {
                if heads[r] < heads[l] {
                    Some(r)
                } else {
                    Some(l)
                }
            }
            (l, None) => l,
            (None, r) => r,
        }
    }
}

/// Merge single-run buckets into one run of `out`.
pub(crate) fn multiway<C: Codec>(
    codec: &C,
    duplicates: &mut Duplicates<C::Item>,
    ins: &mut [Bucket],
    out: &mut Bucket,
) -> Result<(), anyhow::Error> {
    {
        let mut inputs = ins
            .iter_mut()
            .map(|bucket| Source::open(codec, bucket))
            .collect::<Result<Vec<_>, anyhow::Error>>()?;
        let mut heads = inputs
            .iter_mut()
            .map(|input| input.next())
            .collect::<Result<Vec<Option<C::Item>>, anyhow::Error>>()?;
        let mut tournament = Tournament::new(&heads);
        let writer = out.write()?;
        let mut emitter = Emitter::new(codec, duplicates);
        while let Some(i) = tournament.winner() {
            if let Some(item) = heads[i].take() {
                emitter.push(writer, item)?;
            }
            heads[i] = inputs[i].next()?;
            tournament.update(i, &heads);
        }
        emitter.flush(writer)?;
    }
    out.add_runs(1);
    Ok(())
}

/// Distribute the items of `input` to `outs` by `(hash >> shift) & (2^bits - 1)`. Outputs are
/// opened on their first item.
pub(crate) fn radix_split<C: Codec>(
    codec: &C,
    input: &mut Bucket,
    outs: &mut [Bucket],
    shift: u32,
    bits: u32,
) -> Result<(), anyhow::Error> {
    let mask = (1u64 << bits) - 1;
    let mut source = Source::open(codec, input)?;
    let mut buf = Vec::new();
    while let Some(item) = source.next()? {
        let i = ((codec.hash(&item) >> shift) & mask) as usize;
        codec.write(outs[i].write()?, &item, &mut buf)?;
    }
    Ok(())
}
