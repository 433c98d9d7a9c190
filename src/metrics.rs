use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::raft::{NodeId, RaftError, Term};

/// Emitted once per won election (Candidate -> Leader).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionRecord {
    pub node_id: NodeId,
    pub term: Term,
    pub election_start_ms: u64,
    pub election_end_ms: u64,
    pub duration_ms: u64,
}

/// Consumer of election records. Implementations must not block the caller
/// for long; they run on the electing node's loop.
pub trait MetricsSink: Send + Sync {
    fn record_election(&self, record: ElectionRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record_election(&self, _record: ElectionRecord) {}
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMetricsSink {
    records: Arc<Mutex<Vec<ElectionRecord>>>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ElectionRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record_election(&self, record: ElectionRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Process resource counters read from `/proc`. Missing sources read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_ticks: u64,
    pub memory_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

impl ResourceSample {
    pub fn capture() -> Self {
        let read = |path: &str| std::fs::read_to_string(path).unwrap_or_default();
        let (network_rx_bytes, network_tx_bytes) = parse_net_dev(&read("/proc/net/dev"));
        Self {
            cpu_ticks: parse_cpu_ticks(&read("/proc/self/stat")),
            memory_bytes: parse_vm_rss(&read("/proc/self/status")),
            network_rx_bytes,
            network_tx_bytes,
        }
    }
}

/// Source of resource counters for enriched election rows. Sampling may
/// block; callers run it off the election path.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcSampler;

impl ResourceSampler for ProcSampler {
    fn sample(&self) -> ResourceSample {
        ResourceSample::capture()
    }
}

// utime + stime, fields 14 and 15 of /proc/self/stat. The command name may
// contain spaces, so count from the closing parenthesis.
fn parse_cpu_ticks(stat: &str) -> u64 {
    let Some(rest) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
        return 0;
    };
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |i: usize| fields.get(i).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
    field(11) + field(12)
}

// VmRSS is reported in kB whatever the kernel page size.
fn parse_vm_rss(status: &str) -> u64 {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

fn parse_net_dev(dev: &str) -> (u64, u64) {
    dev.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(_, counters)| {
            let cols: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|v| v.parse().ok())
                .collect();
            (
                cols.first().copied().unwrap_or(0),
                cols.get(8).copied().unwrap_or(0),
            )
        })
        .fold((0, 0), |(rx, tx), (r, t)| (rx + r, tx + t))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CsvRow {
    node_id: u64,
    term: Term,
    start_time_ms: u64,
    end_time_ms: u64,
    time_elected_ms: u64,
    cpu_ticks: u64,
    ram_used_bytes: u64,
    network_in_bytes: u64,
    network_out_bytes: u64,
}

impl CsvRow {
    fn new(record: ElectionRecord, usage: ResourceSample) -> Self {
        Self {
            node_id: record.node_id.0,
            term: record.term,
            start_time_ms: record.election_start_ms,
            end_time_ms: record.election_end_ms,
            time_elected_ms: record.duration_ms,
            cpu_ticks: usage.cpu_ticks,
            ram_used_bytes: usage.memory_bytes,
            network_in_bytes: usage.network_rx_bytes,
            network_out_bytes: usage.network_tx_bytes,
        }
    }
}

enum SamplerJob {
    Record(ElectionRecord),
    Flush(oneshot::Sender<()>),
}

/// Writes election records as a CSV table, one row per won election.
///
/// `record_election` only queues the record. A sampler task owned by the
/// sink reads resource counters on the blocking pool and appends the
/// enriched row; `flush` waits for that queue to drain before writing.
pub struct CsvMetricsSink {
    path: PathBuf,
    jobs: mpsc::UnboundedSender<SamplerJob>,
    rows: Arc<Mutex<Vec<CsvRow>>>,
}

impl CsvMetricsSink {
    /// Must be called from within a tokio runtime.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_sampler(path, Arc::new(ProcSampler))
    }

    pub fn with_sampler<P: AsRef<Path>>(path: P, sampler: Arc<dyn ResourceSampler>) -> Self {
        let (jobs, queue) = mpsc::unbounded_channel();
        let rows = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(run_sampler(queue, sampler, Arc::clone(&rows)));
        Self {
            path: path.as_ref().to_path_buf(),
            jobs,
            rows,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for queued records to be enriched, then rewrites the whole
    /// table with every row recorded so far.
    pub async fn flush(&self) -> Result<usize, RaftError> {
        let (done, drained) = oneshot::channel();
        self.jobs
            .send(SamplerJob::Flush(done))
            .map_err(|_| sampler_stopped())?;
        drained.await.map_err(|_| sampler_stopped())?;

        let rows = self
            .rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut writer = csv::Writer::from_path(&self.path)?;
        for row in &rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(rows.len())
    }
}

fn sampler_stopped() -> RaftError {
    RaftError::Io(std::io::Error::other("metrics sampler stopped"))
}

async fn run_sampler(
    mut queue: mpsc::UnboundedReceiver<SamplerJob>,
    sampler: Arc<dyn ResourceSampler>,
    rows: Arc<Mutex<Vec<CsvRow>>>,
) {
    while let Some(job) = queue.recv().await {
        match job {
            SamplerJob::Record(record) => {
                let sampler = Arc::clone(&sampler);
                let usage = match tokio::task::spawn_blocking(move || sampler.sample()).await {
                    Ok(usage) => usage,
                    Err(e) => {
                        warn!("Resource sampling failed for {}: {e}", record.node_id);
                        ResourceSample::default()
                    }
                };
                rows.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(CsvRow::new(record, usage));
            }
            SamplerJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Metrics sampler stopped");
}

impl MetricsSink for CsvMetricsSink {
    fn record_election(&self, record: ElectionRecord) {
        if self.jobs.send(SamplerJob::Record(record)).is_err() {
            warn!("Metrics sampler stopped, dropping election record");
        }
    }
}

/// Raw per-node election counters.
#[derive(Debug, Default)]
pub struct ElectionCounters {
    elections_started: AtomicU64,
    elections_won: AtomicU64,
    vote_requests_sent: AtomicU64,
    votes_granted: AtomicU64,
    votes_denied: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeat_acks: AtomicU64,
    send_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub elections_started: u64,
    pub elections_won: u64,
    pub vote_requests_sent: u64,
    pub votes_granted: u64,
    pub votes_denied: u64,
    pub heartbeats_sent: u64,
    pub heartbeat_acks: u64,
    pub send_failures: u64,
}

impl ElectionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_election_started(&self) {
        self.elections_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_election_won(&self) {
        self.elections_won.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vote_request_sent(&self) {
        self.vote_requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_vote(&self, granted: bool) {
        if granted {
            self.votes_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.votes_denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_ack(&self) {
        self.heartbeat_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            elections_started: self.elections_started.load(Ordering::Relaxed),
            elections_won: self.elections_won.load(Ordering::Relaxed),
            vote_requests_sent: self.vote_requests_sent.load(Ordering::Relaxed),
            votes_granted: self.votes_granted.load(Ordering::Relaxed),
            votes_denied: self.votes_denied.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_acks: self.heartbeat_acks.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }
}
