//! One-time device read-speed measurement with an on-disk cache.
//!
//! Scan throttling is a percentage of the device's measured capacity. The
//! measurement is taken once per device and cached in a file named by the
//! device number, so repeated runs skip it entirely.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::info;

/// Size of the scratch file streamed to estimate sequential bandwidth.
const BENCH_FILE_SIZE: usize = 8 * 1024 * 1024;
const BENCH_CHUNK_SIZE: usize = 64 * 1024;
/// Number of small seek-and-read operations used to estimate the block
/// operation rate.
const BENCH_SEEK_OPS: u32 = 128;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("i/o error during speed measurement: {0}")]
    Io(#[from] std::io::Error),
}

/// Measured capacity of the device backing the managed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSpeed {
    pub bytes_per_second: u64,
    pub blocks_per_second: u64,
}

/// Return the device speed for the filesystem holding `working_dir`,
/// reading the cache under `cache_dir` when present and measuring (then
/// caching) otherwise.
pub async fn cached_speed(working_dir: &Path, cache_dir: &Path) -> Result<DeviceSpeed, BenchError> {
    let devnum = tokio::fs::metadata(working_dir).await?.dev();
    let bench_dir = cache_dir.join("fsbench");
    tokio::fs::create_dir_all(&bench_dir).await?;
    let cache_file = bench_dir.join(format!("{devnum:x}"));

    if let Some(speed) = read_cache(&cache_file).await {
        return Ok(speed);
    }

    let speed = measure(&bench_dir).await?;
    info!(
        bytes_per_second = speed.bytes_per_second,
        blocks_per_second = speed.blocks_per_second,
        device = format_args!("{devnum:x}"),
        "measured device read speed"
    );
    let contents = format!("{} {}\n", speed.bytes_per_second, speed.blocks_per_second);
    tokio::fs::write(&cache_file, contents).await?;
    Ok(speed)
}

async fn read_cache(cache_file: &PathBuf) -> Option<DeviceSpeed> {
    let data = tokio::fs::read_to_string(cache_file).await.ok()?;
    let mut fields = data.split_whitespace();
    let bytes_per_second = fields.next()?.parse().ok()?;
    let blocks_per_second = fields.next()?.parse().ok()?;
    Some(DeviceSpeed {
        bytes_per_second,
        blocks_per_second,
    })
}

/// Stream a scratch file to estimate sequential bandwidth, then issue small
/// scattered reads to estimate the operation rate. Coarse, but the result
/// only scales a percentage throttle.
async fn measure(bench_dir: &Path) -> Result<DeviceSpeed, BenchError> {
    let scratch = bench_dir.join("scratch");
    let data = vec![0xa5u8; BENCH_FILE_SIZE];
    tokio::fs::write(&scratch, &data).await?;
    drop(data);

    let mut file = tokio::fs::File::open(&scratch).await?;
    let mut buf = vec![0u8; BENCH_CHUNK_SIZE];
    let started = Instant::now();
    let mut total = 0usize;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    let elapsed = started.elapsed().as_secs_f64().max(1e-6);
    let bytes_per_second = (total as f64 / elapsed) as u64;

    let started = Instant::now();
    let mut small = [0u8; 512];
    for i in 0..BENCH_SEEK_OPS {
        let offset = (i as u64 * 37_123) % (BENCH_FILE_SIZE as u64 - 512);
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.read_exact(&mut small).await?;
    }
    let elapsed = started.elapsed().as_secs_f64().max(1e-6);
    let blocks_per_second = (BENCH_SEEK_OPS as f64 / elapsed) as u64;

    tokio::fs::remove_file(&scratch).await?;
    Ok(DeviceSpeed {
        bytes_per_second: bytes_per_second.max(1),
        blocks_per_second: blocks_per_second.max(1),
    })
}
