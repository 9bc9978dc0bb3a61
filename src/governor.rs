use std::cmp::{max, min};
use std::collections::VecDeque;

use crate::bucket::{Bucket, Flags};
use crate::capabilities::{SortCapabilities, SortEnv};
use crate::context::SortContext;

/// How much smaller than the estimate a bucket must be to be sorted in memory, accounting for
/// uneven distribution.
const ESTIMATE_FACTOR: f64 = 0.8;

impl<C: SortCapabilities> SortContext<C> {
    /// Reduce the bucket next to FINAL until FINAL is the only bucket left.
    pub(crate) fn run(&mut self) -> Result<(), anyhow::Error> {
        while let Some(bucket) = self.buckets.take_next() {
            self.decide(bucket)?;
        }
        Ok(())
    }

    fn decide(&mut self, bucket: Bucket) -> Result<(), anyhow::Error> {
        if !bucket.have() {
            log::trace!("Dropping empty {}", bucket);
            return Ok(());
        }

        // Bits of size to shed before the bucket fits in memory
        let size = bucket.size();
        let mem = (self.caps.estimate(&self.env, &bucket) as f64 * ESTIMATE_FACTOR) as u64;
        let mut bits = 0;
        while bits < u64::BITS && (size >> bits) > mem {
            bits += 1;
        }

        let debug = self.config.debug();
        let radix_bits = if !self.caps.supports_radix_split()
            || bucket.flags().contains(Flags::CUSTOM_PRESORT)
            || debug.no_radix
        {
            0
        } else {
            let radix_bits = min(min(bits, bucket.hash_bits()), self.config.max_radix_bits());
            if radix_bits < self.config.min_radix_bits() {
                0
            } else {
                radix_bits
            }
        };
        let multiway_bits = if !self.caps.supports_multiway() || debug.no_multiway || debug.no_presort {
            0
        } else {
            let multiway_bits = min(bits, self.config.max_multiway_bits());
            if multiway_bits < self.config.min_multiway_bits() {
                0
            } else {
                multiway_bits
            }
        };
        log::debug!(
            "Decisions: size={} max={} runs={} bits={} hash={} -> radix={} multi={}",
            size,
            mem,
            bucket.runs(),
            bits,
            bucket.hash_bits(),
            radix_bits,
            multiway_bits
        );

        if bucket.runs() > 0 {
            self.join(bucket)
        } else if bits == 0 {
            self.twoway(bucket)
        } else if radix_bits == bits {
            self.radix(bucket, radix_bits)
        } else if multiway_bits == bits {
            self.multiway(bucket)
        } else if radix_bits > 0 {
            self.radix(bucket, radix_bits)
        } else if multiway_bits > 0 {
            self.multiway(bucket)
        } else {
            self.twoway(bucket)
        }
    }

    /// Size of FINAL if the bucket being reduced may write its last run straight into it.
    fn join_to(&mut self) -> Option<u64> {
        if self.config.debug().no_join {
            return None;
        }
        let output = self.buckets.output();
        assert_eq!(output.runs(), 1, "FINAL must hold exactly one run");
        Some(output.size())
    }

    /// Queue `bucket` after FINAL, unless its data went straight to FINAL. Returns the size of
    /// the produced run.
    fn ins_or_join(&mut self, bucket: Option<Bucket>, join: Option<u64>) -> u64 {
        let output = self.buckets.output();
        if let Some(join_size) = join {
            if output.runs() >= 2 {
                assert_eq!(output.runs(), 2, "FINAL got more than one run");
                output.set_runs(1);
                return output.size() - join_size;
            }
        }
        match bucket {
            Some(bucket) => {
                let size = bucket.size();
                self.buckets.insert_next(bucket);
                size
            }
            None => 0,
        }
    }

    fn presort(
        caps: &mut C,
        env: &mut SortEnv,
        input: &mut Bucket,
        out: &mut Bucket,
        out_only: Option<&mut Bucket>,
    ) -> Result<bool, anyhow::Error> {
        if input.flags().contains(Flags::CUSTOM_PRESORT) {
            // A custom presorter never produces data in the middle of the output
            let more = caps.custom_presort(env, out.write()?)?;
            out.add_runs(1);
            return Ok(more);
        }
        caps.internal_sort(env, input, out, out_only)
    }

    fn join(&mut self, mut bucket: Bucket) -> Result<(), anyhow::Error> {
        assert_eq!(bucket.runs(), 1, "Joining a bucket which is not a single run");
        let output = self.buckets.output();
        if !output.has_file() {
            log::debug!("Replaced final bucket with {}", bucket);
            self.stats.final_replacements += 1;
            self.buckets.replace_output(bucket);
        } else {
            log::info!("Copying to output file: {}", bucket);
            let src = bucket.read()?;
            let dest = output.write()?;
            std::io::copy(src, dest)?;
            self.stats.joins += 1;
        }
        Ok(())
    }

    fn log_pass(&self, source: bool, message: String) {
        if source {
            log::info!("{}", message);
        } else {
            log::debug!("{}", message);
        }
    }

    fn twoway(&mut self, mut bucket: Bucket) -> Result<(), anyhow::Error> {
        let join = self.join_to();
        let custom = bucket.flags().contains(Flags::CUSTOM_PRESORT);
        let source = bucket.flags().contains(Flags::SOURCE);

        let mut ins = if !self.config.debug().no_presort || custom {
            log::debug!("{}", if custom { "Custom presorting" } else { "Presorting" });
            self.start_timer();
            let mut first = self.store.bucket();
            let more = match join {
                Some(_) => Self::presort(&mut self.caps, &mut self.env, &mut bucket, &mut first, Some(self.buckets.output()))?,
                None => Self::presort(&mut self.caps, &mut self.env, &mut bucket, &mut first, None)?,
            };
            if !more {
                let elapsed = self.stop_timer();
                self.stats.presort_time += elapsed;
                self.stats.presorted_runs += 1;
                let size = self.ins_or_join(Some(first), join);
                self.log_pass(source, format!("Sorted in memory ({} bytes, {} MB/s)", size, self.speed(size)));
                return Ok(());
            }

            let mut second = self.store.bucket();
            let mut i = 1;
            loop {
                let out = if i == 0 { &mut first } else { &mut second };
                if !Self::presort(&mut self.caps, &mut self.env, &mut bucket, out, None)? {
                    break;
                }
                i = 1 - i;
            }
            drop(bucket);
            let elapsed = self.stop_timer();
            self.stats.presort_time += elapsed;
            self.stats.presorted_runs += (first.runs() + second.runs()) as usize;
            log::info!(
                "Presorting pass ({}+{} runs, {}+{} bytes, {} MB/s)",
                first.runs(),
                second.runs(),
                first.size(),
                second.size(),
                self.speed(first.size() + second.size())
            );
            [first, second]
        } else {
            log::debug!("Presorting disabled");
            [bucket, self.store.bucket()]
        };

        log::debug!("Main sorting");
        let mut pass = 0;
        loop {
            pass += 1;
            self.start_timer();
            if join.is_some() && ins[0].runs() == 1 && ins[1].runs() <= 1 {
                // Guaranteed to produce a single run
                let [mut first, mut second] = ins;
                self.caps.twoway_merge(
                    &mut self.env,
                    [&mut first, &mut second],
                    self.buckets.output(),
                    None,
                )?;
                let size = self.ins_or_join(None, join);
                let elapsed = self.stop_timer();
                self.stats.external_time += elapsed;
                self.stats.twoway_passes += 1;
                log::info!("Mergesort pass {} (final run, {} bytes, {} MB/s)", pass, size, self.speed(size));
                return Ok(());
            }

            let mut first = self.store.bucket();
            let mut second = self.store.bucket();
            {
                let [in0, in1] = &mut ins;
                self.caps
                    .twoway_merge(&mut self.env, [in0, in1], &mut first, Some(&mut second))?;
            }
            let elapsed = self.stop_timer();
            self.stats.external_time += elapsed;
            self.stats.twoway_passes += 1;
            log::info!(
                "Mergesort pass {} ({}+{} runs, {}+{} bytes, {} MB/s)",
                pass,
                first.runs(),
                second.runs(),
                first.size(),
                second.size(),
                self.speed(first.size() + second.size())
            );
            ins = [first, second];
            if !ins[1].have() {
                break;
            }
        }

        let [sorted, _] = ins;
        self.buckets.insert_next(sorted);
        Ok(())
    }

    fn multiway(&mut self, mut bucket: Bucket) -> Result<(), anyhow::Error> {
        assert!(!self.config.debug().no_presort, "Multi-way merging requires presorting");
        let join = self.join_to();
        let source = bucket.flags().contains(Flags::SOURCE);
        log::debug!(
            "{}",
            if bucket.flags().contains(Flags::CUSTOM_PRESORT) {
                "Custom presorting"
            } else {
                "Presorting"
            }
        );

        let mut parts: VecDeque<Bucket> = VecDeque::new();
        let mut total_size = 0;
        self.start_timer();
        loop {
            let mut part = self.store.bucket();
            let more = if parts.is_empty() && join.is_some() {
                Self::presort(&mut self.caps, &mut self.env, &mut bucket, &mut part, Some(self.buckets.output()))?
            } else {
                Self::presort(&mut self.caps, &mut self.env, &mut bucket, &mut part, None)?
            };
            if part.have() {
                total_size += part.size();
                part.swap_out()?;
                parts.push_back(part);
            }
            if !more {
                break;
            }
        }
        let elapsed = self.stop_timer();
        self.stats.presort_time += elapsed;
        self.caps.release_buffer();
        drop(bucket);

        if parts.len() <= 1 {
            self.stats.presorted_runs += 1;
            let join = if parts.is_empty() { join } else { None };
            let size = self.ins_or_join(parts.pop_front(), join);
            self.log_pass(source, format!("Sorted in memory ({} bytes, {} MB/s)", size, self.speed(size)));
            return Ok(());
        }

        self.stats.presorted_runs += parts.len();
        log::info!(
            "Multi-way presorting pass ({} parts, {} bytes, {} MB/s)",
            parts.len(),
            total_size,
            self.speed(total_size)
        );

        let max_ways = max(1usize << self.config.max_multiway_bits(), 2);
        log::debug!("Starting up to {}-way merge", max_ways);
        loop {
            let n = min(max_ways, parts.len());
            let mut ways: Vec<Bucket> = parts.drain(..n).collect();
            assert!(n > 1, "Multi-way merge of a single bucket");
            let last = parts.is_empty();

            self.start_timer();
            let out = if last && join.is_some() {
                self.caps.multiway_merge(&mut self.env, &mut ways, self.buckets.output())?;
                None
            } else {
                let mut out = self.store.bucket();
                self.caps.multiway_merge(&mut self.env, &mut ways, &mut out)?;
                Some(out)
            };
            let elapsed = self.stop_timer();
            self.stats.external_time += elapsed;
            self.stats.multiway_merges += 1;
            drop(ways);

            match out {
                Some(mut out) if !last => {
                    out.swap_out()?;
                    log::info!(
                        "Multi-way merge pass ({} ways, {}, {} MB/s)",
                        n,
                        out,
                        self.speed(out.size())
                    );
                    parts.push_back(out);
                }
                out => {
                    let size = self.ins_or_join(out, join);
                    log::info!(
                        "Multi-way merge completed ({} ways, {} bytes, {} MB/s)",
                        n,
                        size,
                        self.speed(size)
                    );
                    return Ok(());
                }
            }
        }
    }

    fn radix(&mut self, mut bucket: Bucket, bits: u32) -> Result<(), anyhow::Error> {
        let bits = min(
            min(bits + self.config.add_radix_bits(), self.config.max_radix_bits()),
            bucket.hash_bits(),
        );
        let buckets = 1usize << bits;
        let child_bits = bucket.hash_bits() - bits;
        log::debug!(
            "Running radix split on {} with hash {} bits of {} (expecting {} bytes per bucket)",
            bucket,
            bits,
            bucket.hash_bits(),
            bucket.size() / buckets as u64
        );
        self.caps.release_buffer();
        self.start_timer();

        let mut outs: Vec<Bucket> = (0..buckets)
            .map(|_| {
                let mut out = self.store.bucket();
                out.set_hash_bits(child_bits);
                out
            })
            .collect();
        self.caps
            .radix_split(&mut self.env, &mut bucket, &mut outs, child_bits, bits)?;

        let (mut smallest, mut largest, mut sum) = (u64::MAX, 0, 0);
        for out in outs.iter_mut() {
            let size = out.size();
            smallest = min(smallest, size);
            largest = max(largest, size);
            sum += size;
            if buckets > 4 {
                out.swap_out()?;
            }
        }
        let elapsed = self.stop_timer();
        self.stats.external_time += elapsed;
        self.stats.radix_splits += 1;
        log::info!(
            "Radix split ({} buckets, {} min, {} max, {} avg, {} MB/s)",
            buckets,
            smallest,
            largest,
            sum / buckets as u64,
            self.speed(sum)
        );
        drop(bucket);
        self.buckets.insert_all_next(outs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Write};

    use crate::bucket::Bucket;
    use crate::capabilities::{SortCapabilities, SortEnv};
    use crate::config::{Config, DebugFlags};
    use crate::context::{Input, SortContext};
    use crate::record::{write_record, RecordIter};
    use crate::record_sorter::RecordSorter;

    /// Capabilities which only count calls.
    #[derive(Default)]
    struct Counting {
        sorts: usize,
        merges: usize,
    }

    impl SortCapabilities for Counting {
        fn estimate(&self, _env: &SortEnv, _bucket: &Bucket) -> u64 {
            1 << 20
        }

        fn internal_sort(
            &mut self,
            _env: &mut SortEnv,
            _input: &mut Bucket,
            _out: &mut Bucket,
            _out_only: Option<&mut Bucket>,
        ) -> Result<bool, anyhow::Error> {
            self.sorts += 1;
            Ok(false)
        }

        fn twoway_merge(
            &mut self,
            _env: &mut SortEnv,
            _ins: [&mut Bucket; 2],
            _out: &mut Bucket,
            _second: Option<&mut Bucket>,
        ) -> Result<(), anyhow::Error> {
            self.merges += 1;
            Ok(())
        }
    }

    fn config(dir: &std::path::Path) -> Config {
        Config::new(
            dir.to_path_buf(),
            "part-".to_string(),
            ".bucket".to_string(),
            1,
            1 << 20,
            2,
            10,
            0,
            2,
            8,
            1 << 20,
            4096,
            4096,
            10,
            1 << 20,
            64 * 1024,
            4096,
            DebugFlags::default(),
        )
    }

    fn context(dir: &std::path::Path, output: Option<std::fs::File>) -> Result<SortContext<Counting>, anyhow::Error> {
        SortContext::new(
            config(dir),
            Counting::default(),
            Input::Stream {
                reader: Box::new(Cursor::new(Vec::new())),
                size: Some(0),
            },
            8,
            output,
            None,
        )
    }

    fn single_run(context: &SortContext<Counting>, content: &[u8]) -> Result<Bucket, anyhow::Error> {
        let mut bucket = context.store.bucket();
        bucket.write()?.write_all(content)?;
        bucket.add_runs(1);
        Ok(bucket)
    }

    #[test]
    fn test_single_run_replaces_empty_final() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let mut context = context(dir.path(), None)?;
        let bucket = single_run(&context, b"sorted")?;
        let id = bucket.id();
        // the empty source is dropped first
        context.buckets.insert_next(bucket);
        context.run()?;
        assert_eq!(context.caps.sorts, 0);
        assert_eq!(context.caps.merges, 0);
        let (mut output, stats) = context.finish();
        assert_eq!(output.id(), id);
        assert_eq!(stats.final_replacements, 1);
        assert_eq!(stats.joins, 0);
        let mut content = String::new();
        output.read()?.read_to_string(&mut content)?;
        assert_eq!(content, "sorted");
        Ok(())
    }

    #[test]
    fn test_single_run_is_copied_to_output_file() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let file = tempfile::tempfile_in(dir.path())?;
        let mut context = context(dir.path(), Some(file))?;
        let first = single_run(&context, b"abc")?;
        let second = single_run(&context, b"def")?;
        context.buckets.insert_all_next(vec![first, second]);
        context.run()?;
        assert_eq!(context.caps.sorts, 0);
        assert_eq!(context.caps.merges, 0);
        let (mut output, stats) = context.finish();
        assert_eq!(stats.joins, 2);
        assert_eq!(stats.output_size, 6);
        let mut content = String::new();
        output.read()?.read_to_string(&mut content)?;
        assert_eq!(content, "abcdef");
        Ok(())
    }

    #[test]
    fn test_empty_input_leaves_final_without_file() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let mut context = context(dir.path(), None)?;
        context.run()?;
        let (output, stats) = context.finish();
        assert!(!output.has_file());
        assert_eq!(stats.files_created, 0);
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_radix_children_partition_the_bucket() -> Result<(), anyhow::Error> {
        let dir = tempfile::tempdir()?;
        let mut context = SortContext::new(
            config(dir.path()),
            RecordSorter::<u64>::new(),
            Input::Stream {
                reader: Box::new(Cursor::new(Vec::new())),
                size: Some(0),
            },
            16,
            None,
            None,
        )?;
        // the empty source
        assert!(context.buckets.take_next().is_some());

        let mut bucket = context.store.bucket();
        bucket.set_hash_bits(16);
        {
            let writer = bucket.write()?;
            let mut buf = [0u8; 8];
            for i in 0..10_000u64 {
                write_record(writer, &((i * 7919) % 65536), &mut buf)?;
            }
        }
        let size = bucket.size();
        assert_eq!(size, 80_000);

        context.radix(bucket, 4)?;
        assert_eq!(context.stats.radix_splits, 1);
        let mut children = Vec::new();
        while let Some(child) = context.buckets.take_next() {
            children.push(child);
        }
        assert_eq!(children.len(), 16);
        assert_eq!(children.iter().map(|child| child.size()).sum::<u64>(), size);

        let mut records = 0;
        for (digit, child) in children.iter_mut().enumerate() {
            assert_eq!(child.hash_bits(), 12);
            if !child.have() {
                continue;
            }
            let mut bytes = Vec::new();
            child.read()?.read_to_end(&mut bytes)?;
            for value in RecordIter::<u64, _>::new(bytes.as_slice()) {
                assert_eq!(value? >> 12, digit as u64);
                records += 1;
            }
        }
        assert_eq!(records, 10_000);
        Ok(())
    }
}
