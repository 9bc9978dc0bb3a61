use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

use adaptive_file_sort::record::{Record, RecordIter};
use data_encoding::HEXLOWER;
use log::LevelFilter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use simple_logger::SimpleLogger;

#[allow(dead_code)]
pub fn setup() {
    // RUST_LOG overrides the level, only the first test of a binary installs the logger
    let _ = SimpleLogger::new().with_level(LevelFilter::Info).env().init();
    let results_dir_path = PathBuf::from_str("./target/results/").unwrap();

    if !results_dir_path.exists() {
        fs::create_dir_all(&results_dir_path).unwrap_or_else(|_|
            panic!("Failed to create results directory: {:?}", results_dir_path)
        );
    } else {
        println!("Results directory exists at {:?}", results_dir_path);
    }
}

/// A fresh scratch directory under ./target/results/
#[allow(dead_code)]
pub fn tmp_dir() -> Result<PathBuf, anyhow::Error> {
    let path = temp_file_name("./target/results/");
    fs::create_dir_all(&path)?;
    Ok(path)
}

#[allow(dead_code)]
pub fn temp_file_name(dir: &str) -> PathBuf {
    let mut result = PathBuf::from(dir);
    let name = HEXLOWER.encode(&rand::random::<[u8; 16]>());
    result.push(name);
    result
}

#[allow(dead_code)]
pub fn random_values(count: usize, bits: u32, seed: u64) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let max = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
    (0..count).map(|_| rng.gen_range(0..=max)).collect()
}

#[allow(dead_code)]
pub fn encode<R: Record>(records: &[R]) -> Vec<u8> {
    let mut bytes = vec![0u8; records.len() * R::SIZE];
    for (i, record) in records.iter().enumerate() {
        record.write_to(&mut bytes[i * R::SIZE..]);
    }
    bytes
}

#[allow(dead_code)]
pub fn decode<R: Record, T: Read>(reader: T) -> Result<Vec<R>, anyhow::Error> {
    RecordIter::<R, T>::new(reader).collect()
}
