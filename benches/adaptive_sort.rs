use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Error};
use benchmark_rs::benchmarks::Benchmarks;
use benchmark_rs::stopwatch::StopWatch;
use data_encoding::HEXLOWER;
use simple_logger::SimpleLogger;

use adaptive_file_sort::record::Record;
use adaptive_file_sort::record_sorter::RecordSorter;
use adaptive_file_sort::sort::Sort;

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Clone)]
pub struct BenchmarkConfig {
    files: BTreeMap<usize, PathBuf>,
    bench_results_dir: PathBuf,
    bench_tmp_dir: PathBuf,
    tasks: usize,
    sort_buffer: usize,
    key_bits: u32,
    no_radix: bool,
    description: String,
}

impl BenchmarkConfig {
    pub fn new(
        files: BTreeMap<usize, PathBuf>,
        bench_results_dir: PathBuf,
        bench_tmp_dir: PathBuf,
        tasks: usize,
        sort_buffer: usize,
        key_bits: u32,
        no_radix: bool,
        description: &str,
    ) -> BenchmarkConfig {
        BenchmarkConfig {
            files,
            bench_results_dir,
            bench_tmp_dir,
            tasks,
            sort_buffer,
            key_bits,
            no_radix,
            description: description.to_string(),
        }
    }

    pub fn get_input_path(&self, key: usize) -> PathBuf {
        self.files.get(&key).unwrap().clone()
    }

    pub fn bench_results_dir(&self) -> &PathBuf {
        &self.bench_results_dir
    }

    pub fn bench_tmp_dir(&self) -> &PathBuf {
        &self.bench_tmp_dir
    }
}

impl Display for BenchmarkConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "tasks: {}, sort buffer: {}, key bits: {}, no radix: {}, description: {}",
            self.tasks, self.sort_buffer, self.key_bits, self.no_radix, self.description,
        )
    }
}

fn temp_file_name(dir: &PathBuf) -> PathBuf {
    let mut result = PathBuf::from(dir);
    let name = HEXLOWER.encode(&rand::random::<[u8; 16]>());
    result.push(name);
    result
}

fn cleanup(bench_results_dir: &PathBuf) -> Result<(), anyhow::Error> {
    if bench_results_dir.exists() {
        fs::remove_dir_all(bench_results_dir.clone()).with_context(|| anyhow!("{}", bench_results_dir.to_string_lossy()))?;
    }
    Ok(())
}

fn setup(bench_input_dir: &PathBuf, bench_results_dir: &PathBuf, bench_tmp_dir: &PathBuf) -> Result<(), anyhow::Error> {
    cleanup(bench_results_dir)?;

    for dir in [bench_input_dir, bench_results_dir, bench_tmp_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir.clone()).with_context(|| anyhow!("{}", dir.to_string_lossy()))?;
        }
    }
    Ok(())
}

fn create_input_files(count: usize, factor: usize, base_path: PathBuf) -> Result<BTreeMap<usize, PathBuf>, anyhow::Error> {
    let mut files: BTreeMap<usize, PathBuf> = BTreeMap::new();
    for i in 1..=count {
        let number_of_records = i * factor;
        let path = base_path.join(PathBuf::from(number_of_records.to_string()));
        if !path.exists() {
            let mut writer = BufWriter::new(File::create(&path).with_context(|| anyhow!("path: {}", path.to_string_lossy()))?);
            let mut buf = [0u8; 8];
            for _j in 0..number_of_records {
                // keep the values below 2^48
                (rand::random::<u64>() >> 16).write_to(&mut buf);
                writer.write_all(&buf)?;
            }
        }
        files.insert(number_of_records, path);
    }
    Ok(files)
}

fn sort(stop_watch: &mut StopWatch, config: BenchmarkConfig, work: usize) -> Result<(), anyhow::Error> {
    stop_watch.pause();
    let input_path = config.get_input_path(work);
    let output_path = temp_file_name(config.bench_results_dir());
    log::info!("Start sorting {}", input_path.to_string_lossy());
    stop_watch.resume();
    let size = fs::metadata(&input_path)?.len();
    let mut sort = Sort::new(Box::new(File::open(&input_path)?), RecordSorter::<u64>::new());
    sort.with_input_size(size);
    sort.with_key_bits(config.key_bits);
    sort.with_tmp_dir(config.bench_tmp_dir().clone());
    sort.with_tasks(config.tasks);
    sort.with_sort_buffer(config.sort_buffer);
    if config.no_radix {
        sort.with_no_radix();
    }
    sort.sort()?.persist(&output_path)?;
    stop_watch.pause();
    log::info!("Finish sorting {}", input_path.to_string_lossy());
    fs::remove_file(output_path.clone()).with_context(|| anyhow!("{}", output_path.to_string_lossy()))?;
    Ok(())
}

#[test]
fn adaptive_sort_bench() -> Result<(), Error> {
    SimpleLogger::new().init().unwrap();
    log::info!("Started adaptive_sort_bench.");

    let bench_input_dir = PathBuf::from("./target/benchmarks/input");
    let bench_results_dir = PathBuf::from("./target/benchmarks/results");
    let bench_tmp_dir = PathBuf::from("./target/benchmarks/results/tmp");
    setup(&bench_input_dir, &bench_results_dir, &bench_tmp_dir)?;

    let small_files = create_input_files(10, 100_000, bench_input_dir.clone())?;
    let large_files = create_input_files(10, 1_000_000, bench_input_dir.clone())?;

    let mut benchmarks = Benchmarks::new("adaptive-file-sort");

    for (label, files, sort_buffer) in [
        ("small-files", &small_files, 16 << 20),
        ("large-files", &large_files, 32 << 20),
    ] {
        for tasks in [1, 2, 4, 8] {
            for no_radix in [false, true] {
                let name = if no_radix {
                    format!("{}-{}-tasks-merge", label, tasks)
                } else {
                    format!("{}-{}-tasks", label, tasks)
                };
                benchmarks.add(
                    name.as_str(),
                    sort,
                    BenchmarkConfig::new(
                        files.clone(),
                        bench_results_dir.clone(),
                        bench_tmp_dir.clone(),
                        tasks,
                        sort_buffer,
                        48,
                        no_radix,
                        label,
                    ),
                    files.keys().cloned().collect(),
                    3,
                    0,
                )?;
            }
        }
    }

    benchmarks.run()?;
    benchmarks.save_to_csv(PathBuf::from("./target/benchmarks/"), true, true)?;
    benchmarks.save_to_json(PathBuf::from("./target/benchmarks/"))?;

    log::info!("Finished adaptive_sort_bench.");
    Ok(())
}
