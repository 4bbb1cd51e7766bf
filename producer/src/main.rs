use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use shmq::{Queue, QueueConfig};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    #[clap(short = 'n', long = "name")]
    name: Option<String>,
    #[clap(long)]
    capacity: Option<usize>,
    #[clap(long)]
    count: Option<usize>,
    #[clap(long)]
    size: Option<usize>,
    #[clap(long)]
    interval_ms: Option<u64>,
    /// Drop whatever is queued before sending.
    #[clap(long)]
    clear: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ProducerConfig {
    queue: QueueConfig,
    count: usize,
    payload_size: usize,
    interval_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            queue: QueueConfig::default(),
            count: 10,
            payload_size: 64,
            interval_ms: 0,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let mut cfg: ProducerConfig = match &opts.config {
        Some(path) => confy::load_path(path)?,
        None => ProducerConfig::default(),
    };
    if let Some(name) = opts.name {
        cfg.queue.name = name;
    }
    if let Some(capacity) = opts.capacity {
        cfg.queue.capacity = capacity;
    }
    if let Some(count) = opts.count {
        cfg.count = count;
    }
    if let Some(size) = opts.size {
        cfg.payload_size = size;
    }
    if let Some(interval_ms) = opts.interval_ms {
        cfg.interval_ms = interval_ms;
    }

    let queue = Queue::with_config(&cfg.queue)?;
    if opts.clear {
        queue.clear()?;
    }
    run(&queue, &cfg)?;
    Ok(())
}

#[inline]
fn fill(seq: usize, size: usize, buff: &mut Vec<u8>) {
    buff.clear();
    buff.extend_from_slice(format!("msg-{}", seq).as_bytes());
    let len = size.max(buff.len());
    buff.resize(len, b'.');
}

fn run(queue: &Queue, cfg: &ProducerConfig) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let interval = Duration::from_millis(cfg.interval_ms);
    let report_every = (cfg.count / 10).max(1);
    let mut buff = Vec::with_capacity(cfg.payload_size);

    for seq in 0..cfg.count {
        fill(seq, cfg.payload_size, &mut buff);
        queue.send(&buff)?;
        debug!(seq, len = buff.len(), "sent");
        if seq % report_every == 0 {
            info!(queue = %queue.name(), sent = seq + 1, total = cfg.count, "progress");
        }
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }

    let duration = start.elapsed();
    let per_sec = cfg.count as f64 / duration.as_secs_f64().max(f64::EPSILON);
    let stats = queue.stats()?;
    info!(
        queue = %queue.name(),
        messages = cfg.count,
        elapsed = ?duration,
        per_sec = per_sec as u64,
        used_bytes = stats.used_bytes,
        "done"
    );
    Ok(())
}
