use std::cmp::max;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};

use anyhow::anyhow;
use command_executor::command::Command;

use crate::workers::{Workers, WorkersLease};

/// Ranges with fewer remaining key bits are never radix split.
pub const MIN_SHIFT: u32 = 2;

/// Element level operations the array sorter is built from.
///
/// All operations must be safe to call from several threads at once on disjoint slices.
pub trait ArrayOps: Sync {
    type Item: Copy + Send + Sync + 'static;

    /// Number of key bits resolved by one radix pass, zero when the items cannot be radix sorted.
    fn radix_bits(&self) -> u32;

    /// Sort `items` completely.
    fn quicksort(&self, items: &mut [Self::Item]);

    /// Partition `items` around a pivot. Returns `(left_end, right_start)`: `items[..left_end]`
    /// and `items[right_start..]` still need sorting, everything between is in place.
    fn quicksplit(&self, items: &mut [Self::Item]) -> (usize, usize);

    /// Add to `counts` the number of items with each digit `(hash >> shift) & (2^radix_bits - 1)`.
    fn radix_count(&self, items: &[Self::Item], counts: &mut [usize], shift: u32);

    /// Scatter `src` by the same digit as [ArrayOps::radix_count], preserving order within a digit.
    fn radix_split(&self, src: &[Self::Item], dst: &mut Scatter<'_, Self::Item>, shift: u32);
}

/// Which of the two arrays holds the sorted result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Landing {
    Array,
    Buffer,
}

impl Landing {
    fn other(self) -> Landing {
        match self {
            Landing::Array => Landing::Buffer,
            Landing::Buffer => Landing::Array,
        }
    }
}

/// Destination of a radix split: one write window per digit.
pub struct Scatter<'a, T> {
    base: *mut T,
    windows: Vec<Range<usize>>,
    _marker: PhantomData<&'a mut [T]>,
}

impl<'a, T: Copy> Scatter<'a, T> {
    /// Windows laid out back to back in `dst`, sized by `counts`.
    pub fn new(dst: &'a mut [T], counts: &[usize]) -> Scatter<'a, T> {
        let mut start = 0;
        let windows: Vec<Range<usize>> = counts
            .iter()
            .map(|count| {
                let window = start..start + count;
                start += count;
                window
            })
            .collect();
        assert!(start <= dst.len(), "radix counts exceed the destination");
        Scatter {
            base: dst.as_mut_ptr(),
            windows,
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// Every window must lie within the `len` elements at `base` and no other live reference or
    /// scatter may touch them while this one exists.
    unsafe fn from_raw(base: *mut T, len: usize, windows: Vec<Range<usize>>) -> Scatter<'a, T> {
        assert!(windows.iter().all(|w| w.start <= w.end && w.end <= len));
        Scatter {
            base,
            windows,
            _marker: PhantomData,
        }
    }

    /// Append `item` to the window of `digit`.
    #[inline]
    pub fn put(&mut self, digit: usize, item: T) {
        let window = &mut self.windows[digit];
        debug_assert!(window.start < window.end, "radix split overflows digit {}", digit);
        // SAFETY: the window is inside the destination and exclusively owned by this scatter.
        unsafe { self.base.add(window.start).write(item) };
        window.start += 1;
    }

    fn finish(self) {
        assert!(
            self.windows.iter().all(|w| w.start == w.end),
            "radix split does not match radix count"
        );
    }
}

/// Tuning of the array sorter. Sizes are in bytes and converted to element counts per sort.
#[derive(Clone, Debug)]
pub struct ArrayLimits {
    /// Arrays at least this large are sorted by the worker threads.
    pub thread_threshold: usize,
    /// Radix buckets smaller than this are finished inline instead of being scheduled.
    pub thread_chunk: usize,
    /// Ranges at least this large are radix sorted, smaller ones quicksorted.
    pub radix_threshold: usize,
    /// Key bits resolved by one radix pass of the standard record arrays.
    pub radix_bits: u32,
    pub use_threads: bool,
    pub use_radix: bool,
}

impl Default for ArrayLimits {
    fn default() -> Self {
        ArrayLimits {
            thread_threshold: 1 << 20,
            thread_chunk: 4096,
            radix_threshold: 4096,
            radix_bits: 10,
            use_threads: true,
            use_radix: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Plan {
    radix_bits: u32,
    radix_threshold: usize,
    thread_threshold: usize,
    thread_chunk: usize,
}

impl Plan {
    /// The single rule for taking a radix pass over `n` items with `bits` undetermined key bits.
    /// Returns the key bits left in each resulting bucket.
    fn radix_pass(&self, n: usize, bits: u32) -> Option<u32> {
        if self.radix_bits > 0 && n >= self.radix_threshold && bits >= MIN_SHIFT {
            Some(bits.saturating_sub(self.radix_bits))
        } else {
            None
        }
    }

    /// Where the result lands assuming evenly filled buckets.
    fn predict(&self, mut n: usize, mut bits: u32) -> Landing {
        let mut landing = Landing::Array;
        while let Some(shift) = self.radix_pass(n, bits) {
            landing = landing.other();
            n >>= self.radix_bits;
            bits = shift;
        }
        landing
    }

    fn buckets(&self) -> usize {
        1 << self.radix_bits
    }
}

/// Sort `array`, using `buffer` (at least as long, contents ignored) as radix scratch space.
///
/// `hash_bits` is the number of significant bits of the item hashes. Returns which of the two
/// arrays holds the result. Large arrays are sorted by the `workers` threads when given.
pub fn sort_array<O: ArrayOps + 'static>(
    ops: &O,
    array: &mut [O::Item],
    buffer: &mut [O::Item],
    hash_bits: u32,
    limits: &ArrayLimits,
    workers: Option<&Workers>,
) -> Result<Landing, anyhow::Error> {
    let n = array.len();
    let elt_size = max(size_of::<O::Item>(), 1);
    let plan = Plan {
        radix_bits: if limits.use_radix && buffer.len() >= n {
            ops.radix_bits()
        } else {
            0
        },
        radix_threshold: max(limits.radix_threshold / elt_size, 1),
        thread_threshold: max(limits.thread_threshold / elt_size, 2),
        thread_chunk: limits.thread_chunk / elt_size,
    };
    log::trace!(
        "Array-sorting {} items per {} bytes, hash_bits={}, limits: {:?}",
        n,
        elt_size,
        hash_bits,
        plan
    );

    let lease = workers
        .filter(|w| limits.use_threads && w.threads() > 1 && n >= plan.thread_threshold)
        .map(|w| w.lease());

    match plan.radix_pass(n, hash_bits) {
        None => {
            match &lease {
                Some(lease) => {
                    log::trace!("Decided to use parallel quicksort");
                    Dispatcher::new(ops, array, &mut [], plan, lease).quicksort(n)?;
                }
                None => {
                    log::trace!("Decided to use sequential quicksort");
                    ops.quicksort(array);
                }
            }
            Ok(Landing::Array)
        }
        Some(_) => {
            let landing = plan.predict(n, hash_bits);
            let buffer = &mut buffer[..n];
            match &lease {
                Some(lease) => {
                    log::trace!("Decided to use parallel radix-sort (landing={:?})", landing);
                    Dispatcher::new(ops, array, buffer, plan, lease).radix(n, hash_bits, landing)?;
                }
                None => {
                    log::trace!("Decided to use sequential radix-sort (landing={:?})", landing);
                    radix_local(ops, &plan, array, buffer, hash_bits, Landing::Array, landing);
                }
            }
            Ok(landing)
        }
    }
}

/// Median of three pivoted partition shared by [ArrayOps] implementations.
pub fn quicksplit_by<T: Copy, F: Fn(&T, &T) -> bool>(items: &mut [T], less: F) -> (usize, usize) {
    let n = items.len();
    if n < 2 {
        return (0, n);
    }
    let m = (n - 1) / 2;
    if less(&items[m], &items[0]) {
        items.swap(0, m);
    }
    if less(&items[n - 1], &items[m]) {
        items.swap(m, n - 1);
        if less(&items[m], &items[0]) {
            items.swap(0, m);
        }
    }
    let pivot = items[m];
    let mut l: isize = 0;
    let mut r: isize = n as isize - 1;
    loop {
        while less(&items[l as usize], &pivot) {
            l += 1;
        }
        while less(&pivot, &items[r as usize]) {
            r -= 1;
        }
        if l < r {
            items.swap(l as usize, r as usize);
            l += 1;
            r -= 1;
        } else if l == r {
            l += 1;
            r -= 1;
        }
        if l > r {
            break;
        }
    }
    ((r + 1) as usize, l as usize)
}

fn split_sides<'a, T>(
    array: &'a mut [T],
    buffer: &'a mut [T],
    data: Landing,
    range: Range<usize>,
) -> (&'a mut [T], &'a mut [T]) {
    match data {
        Landing::Array => (&mut array[range.clone()], &mut buffer[range]),
        Landing::Buffer => (&mut buffer[range.clone()], &mut array[range]),
    }
}

struct Pending {
    range: Range<usize>,
    bits: u32,
    data: Landing,
}

/// Radix sort `array` (whose data currently sits in the `data` side) until every item is in the
/// `result` side, draining an explicit work stack.
fn radix_local<O: ArrayOps>(
    ops: &O,
    plan: &Plan,
    array: &mut [O::Item],
    buffer: &mut [O::Item],
    bits: u32,
    data: Landing,
    result: Landing,
) {
    let mut counts = vec![0usize; plan.buckets()];
    let mut stack = vec![Pending {
        range: 0..array.len(),
        bits,
        data,
    }];
    while let Some(pending) = stack.pop() {
        let (src, dst) = split_sides(array, buffer, pending.data, pending.range.clone());
        match plan.radix_pass(src.len(), pending.bits) {
            None => {
                ops.quicksort(src);
                if pending.data != result {
                    dst.copy_from_slice(src);
                }
            }
            Some(shift) => {
                counts.fill(0);
                ops.radix_count(src, &mut counts, shift);
                let mut scatter = Scatter::new(dst, &counts);
                ops.radix_split(src, &mut scatter, shift);
                scatter.finish();
                let mut start = pending.range.start;
                for &count in counts.iter() {
                    if count > 0 {
                        stack.push(Pending {
                            range: start..start + count,
                            bits: shift,
                            data: pending.data.other(),
                        });
                    }
                    start += count;
                }
            }
        }
    }
}

/// Raw view of the arrays of one sort, handed to worker tasks.
struct Shared<O: ArrayOps> {
    ops: *const O,
    array: *mut O::Item,
    buffer: *mut O::Item,
    len: usize,
    buffer_len: usize,
}

impl<O: ArrayOps> Clone for Shared<O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O: ArrayOps> Copy for Shared<O> {}

// SAFETY: tasks only ever touch disjoint ranges and the dispatcher outlives all of them.
unsafe impl<O: ArrayOps> Send for Shared<O> {}
unsafe impl<O: ArrayOps> Sync for Shared<O> {}

impl<O: ArrayOps> Shared<O> {
    unsafe fn ops<'a>(&self) -> &'a O {
        &*self.ops
    }

    fn base(&self, side: Landing) -> *mut O::Item {
        match side {
            Landing::Array => self.array,
            Landing::Buffer => self.buffer,
        }
    }

    /// # Safety
    /// No other live reference may overlap `range` of that side.
    unsafe fn side<'a>(&self, side: Landing, range: Range<usize>) -> &'a mut [O::Item] {
        let len = match side {
            Landing::Array => self.len,
            Landing::Buffer => self.buffer_len,
        };
        assert!(range.start <= range.end && range.end <= len);
        std::slice::from_raw_parts_mut(self.base(side).add(range.start), range.len())
    }
}

enum Job {
    Quick(Range<usize>),
    Count {
        slice: usize,
        range: Range<usize>,
        data: Landing,
        shift: u32,
    },
    Split {
        range: Range<usize>,
        data: Landing,
        shift: u32,
        windows: Vec<Range<usize>>,
    },
    Finish {
        range: Range<usize>,
        bits: u32,
        data: Landing,
        result: Landing,
    },
}

enum Done {
    Quick(Vec<Range<usize>>),
    Counted { slice: usize, counts: Vec<usize> },
    Split,
    Finished,
    Failed(String),
}

struct Task<O: ArrayOps> {
    shared: Shared<O>,
    plan: Plan,
    job: Job,
    done: Sender<Done>,
}

impl<O: ArrayOps> Task<O> {
    unsafe fn run(&self) -> Done {
        let ops = self.shared.ops();
        match &self.job {
            Job::Quick(range) => {
                let items = self.shared.side(Landing::Array, range.clone());
                if items.len() < self.plan.thread_threshold {
                    ops.quicksort(items);
                    return Done::Quick(Vec::new());
                }
                let (left_end, right_start) = ops.quicksplit(items);
                let mut follow = Vec::with_capacity(2);
                if left_end > 1 {
                    follow.push(range.start..range.start + left_end);
                }
                if items.len() - right_start > 1 {
                    follow.push(range.start + right_start..range.end);
                }
                Done::Quick(follow)
            }
            Job::Count {
                slice,
                range,
                data,
                shift,
            } => {
                let src = self.shared.side(*data, range.clone());
                let mut counts = vec![0usize; self.plan.buckets()];
                ops.radix_count(src, &mut counts, *shift);
                Done::Counted {
                    slice: *slice,
                    counts,
                }
            }
            Job::Split {
                range,
                data,
                shift,
                windows,
            } => {
                let src = self.shared.side(*data, range.clone());
                let other = data.other();
                let len = match other {
                    Landing::Array => self.shared.len,
                    Landing::Buffer => self.shared.buffer_len,
                };
                let mut scatter = Scatter::from_raw(self.shared.base(other), len, windows.clone());
                ops.radix_split(src, &mut scatter, *shift);
                scatter.finish();
                Done::Split
            }
            Job::Finish {
                range,
                bits,
                data,
                result,
            } => {
                let array = self.shared.side(Landing::Array, range.clone());
                let buffer = self.shared.side(Landing::Buffer, range.clone());
                radix_local(ops, &self.plan, array, buffer, *bits, *data, *result);
                Done::Finished
            }
        }
    }
}

impl<O: ArrayOps + 'static> Command for Task<O> {
    fn execute(&self) -> Result<(), anyhow::Error> {
        // SAFETY: the dispatcher hands out disjoint ranges and waits for every task it submitted.
        let done = catch_unwind(AssertUnwindSafe(|| unsafe { self.run() })).unwrap_or_else(|e| {
            let reason = e
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| e.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Done::Failed(reason)
        });
        self.done.send(done)?;
        Ok(())
    }
}

/// Controller side of a parallel array sort: submits work items and collects their completions.
struct Dispatcher<'a, O: ArrayOps> {
    shared: Shared<O>,
    plan: Plan,
    lease: &'a WorkersLease,
    tx: Sender<Done>,
    rx: Receiver<Done>,
    outstanding: usize,
    _arrays: PhantomData<&'a mut [O::Item]>,
}

impl<'a, O: ArrayOps + 'static> Dispatcher<'a, O> {
    fn new(
        ops: &'a O,
        array: &'a mut [O::Item],
        buffer: &'a mut [O::Item],
        plan: Plan,
        lease: &'a WorkersLease,
    ) -> Dispatcher<'a, O> {
        let (tx, rx) = channel();
        Dispatcher {
            shared: Shared {
                ops: ops as *const O,
                array: array.as_mut_ptr(),
                buffer: buffer.as_mut_ptr(),
                len: array.len(),
                buffer_len: buffer.len(),
            },
            plan,
            lease,
            tx,
            rx,
            outstanding: 0,
            _arrays: PhantomData,
        }
    }

    fn submit(&mut self, job: Job) -> Result<(), anyhow::Error> {
        self.lease.submit(Box::new(Task {
            shared: self.shared,
            plan: self.plan,
            job,
            done: self.tx.clone(),
        }))?;
        self.outstanding += 1;
        Ok(())
    }

    fn wait(&mut self) -> Result<Done, anyhow::Error> {
        assert!(self.outstanding > 0, "waiting without outstanding work");
        let done = self.rx.recv()?;
        self.outstanding -= 1;
        match done {
            Done::Failed(reason) => Err(anyhow!("Array sorting task failed: {}", reason)),
            done => Ok(done),
        }
    }

    fn wait_all(&mut self) -> Result<(), anyhow::Error> {
        while self.outstanding > 0 {
            self.wait()?;
        }
        Ok(())
    }

    fn quicksort(&mut self, n: usize) -> Result<(), anyhow::Error> {
        self.submit(Job::Quick(0..n))?;
        while self.outstanding > 0 {
            if let Done::Quick(follow) = self.wait()? {
                for range in follow {
                    self.submit(Job::Quick(range))?;
                }
            }
        }
        Ok(())
    }

    /// Finish a bucket inline when it is tiny, otherwise in the background.
    fn finish(&mut self, range: Range<usize>, bits: u32, data: Landing, result: Landing) -> Result<(), anyhow::Error> {
        if range.len() < self.plan.thread_chunk {
            // SAFETY: no submitted task covers this range.
            unsafe {
                let array = self.shared.side(Landing::Array, range.clone());
                let buffer = self.shared.side(Landing::Buffer, range);
                radix_local(self.shared.ops(), &self.plan, array, buffer, bits, data, result);
            }
            Ok(())
        } else {
            self.submit(Job::Finish {
                range,
                bits,
                data,
                result,
            })
        }
    }

    fn radix(&mut self, n: usize, hash_bits: u32, result: Landing) -> Result<(), anyhow::Error> {
        let threads = self.lease.threads();
        let buckets = self.plan.buckets();
        let mut big = vec![Pending {
            range: 0..n,
            bits: hash_bits,
            data: Landing::Array,
        }];

        while let Some(pending) = big.pop() {
            let len = pending.range.len();
            let shift = match self.plan.radix_pass(len, pending.bits) {
                Some(shift) if len >= self.plan.thread_threshold => shift,
                _ => {
                    self.finish(pending.range, pending.bits, pending.data, result)?;
                    continue;
                }
            };

            // Background work may still be using the arrays
            self.wait_all()?;

            let block = len / threads;
            let slices: Vec<Range<usize>> = (0..threads)
                .map(|i| {
                    let start = pending.range.start + i * block;
                    let end = if i == threads - 1 {
                        pending.range.end
                    } else {
                        start + block
                    };
                    start..end
                })
                .collect();
            for (slice, range) in slices.iter().enumerate() {
                self.submit(Job::Count {
                    slice,
                    range: range.clone(),
                    data: pending.data,
                    shift,
                })?;
            }

            let mut partial: Vec<Vec<usize>> = vec![Vec::new(); threads];
            for _ in 0..threads {
                if let Done::Counted { slice, counts } = self.wait()? {
                    partial[slice] = counts;
                }
            }
            let mut totals = vec![0usize; buckets];
            for counts in &partial {
                for (total, count) in totals.iter_mut().zip(counts.iter()) {
                    *total += count;
                }
            }
            let mut starts = Vec::with_capacity(buckets);
            let mut pos = pending.range.start;
            for total in &totals {
                starts.push(pos);
                pos += total;
            }
            assert_eq!(pos, pending.range.end, "radix counts do not cover the range");

            let mut cursor = starts.clone();
            for (slice, range) in slices.iter().enumerate() {
                let windows = partial[slice]
                    .iter()
                    .enumerate()
                    .map(|(digit, count)| {
                        let window = cursor[digit]..cursor[digit] + count;
                        cursor[digit] += count;
                        window
                    })
                    .collect();
                self.submit(Job::Split {
                    range: range.clone(),
                    data: pending.data,
                    shift,
                    windows,
                })?;
            }
            self.wait_all()?;

            for (start, total) in starts.into_iter().zip(totals.into_iter()) {
                if total == 0 {
                    continue;
                }
                let child = Pending {
                    range: start..start + total,
                    bits: shift,
                    data: pending.data.other(),
                };
                if total >= self.plan.thread_threshold && self.plan.radix_pass(total, shift).is_some() {
                    big.push(child);
                } else {
                    self.finish(child.range, child.bits, child.data, result)?;
                }
            }
        }
        self.wait_all()
    }
}

impl<'a, O: ArrayOps> Drop for Dispatcher<'a, O> {
    fn drop(&mut self) {
        // The arrays must outlive every task that references them
        while self.outstanding > 0 {
            if self.rx.recv().is_err() {
                break;
            }
            self.outstanding -= 1;
        }
    }
}
