//! Write/read-back verification pipeline
//!
//! Writes a sequence of payloads to one VDI handle while a second handle,
//! possibly on another connection, reads the same byte ranges back and
//! compares them.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   Payload (no offset)   ┌──────────────┐
//!  │    Writer    │ ──────────────────────▶ │    Reader    │
//!  │  write_at(P, │    bounded mpsc, FIFO   │  sleep(delay)│
//!  │   w_offset)  │                         │  read_at(r_  │
//!  └──────┬───────┘                         │   offset)    │
//!         │                                 └──────┬───────┘
//!         ▼                                        ▼
//!     write VDI                                 read VDI
//! ```
//!
//! The two cursors are never exchanged. They stay aligned because payloads
//! reach the reader in the order they were written. Dropping the sender is
//! the only end-of-run signal the reader gets.
//!
//! # Failure Policy
//!
//! - A write fault stops the writer; the report says how many payloads
//!   were written before it.
//! - Read faults and mismatches are counted and the reader moves on; only the
//!   most recent one is kept.
//! - Nothing is retried.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::payload::{Payload, PayloadGenerator};
use crate::vdi::Vdi;

// =============================================================================
// Outcomes
// =============================================================================

fn serialize_error<S: Serializer>(error: &Option<Error>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

/// What the writer achieved.
#[derive(Debug, Default, Serialize)]
pub struct WriteOutcome {
    /// Payloads written successfully
    pub written: usize,

    /// Final write cursor
    pub bytes_written: u64,

    /// The write fault that stopped the run, if any
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
}

/// What the reader verified.
#[derive(Debug, Default, Serialize)]
pub struct ReadOutcome {
    /// Read-backs attempted
    pub total: usize,

    /// Read-backs that failed or mismatched
    pub failed: usize,

    /// Failed read-backs that were mismatches
    pub mismatches: usize,

    /// Failed read-backs that were cluster read faults
    pub read_errors: usize,

    /// Final read cursor
    pub read_offset: u64,

    /// Most recent failure
    #[serde(serialize_with = "serialize_error")]
    pub last_error: Option<Error>,
}

/// Overall classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Everything written and verified
    Clean,
    /// Completed, but some read-backs failed
    Degraded,
    /// A write fault stopped the run early
    Aborted,
    /// Stopped through the cancellation token
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Clean => write!(f, "clean"),
            RunStatus::Degraded => write!(f, "degraded"),
            RunStatus::Aborted => write!(f, "aborted"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Final report of a pipeline run.
#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub vdi: String,
    pub write: WriteOutcome,
    pub read: ReadOutcome,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    pub fn status(&self) -> RunStatus {
        if self.write.error.is_some() {
            RunStatus::Aborted
        } else if self.cancelled {
            RunStatus::Cancelled
        } else if self.read.failed > 0 {
            RunStatus::Degraded
        } else {
            RunStatus::Clean
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// A finished run together with the handles it borrowed.
#[derive(Debug)]
pub struct PipelineRun {
    pub report: PipelineReport,
    pub writer: Vdi,
    pub reader: Vdi,
}

// =============================================================================
// Blocking Call Helpers
// =============================================================================

async fn write_blocking(mut vdi: Vdi, payload: Payload, offset: u64) -> Result<(Vdi, Result<usize>)> {
    let joined = tokio::task::spawn_blocking(move || {
        let res = vdi.write_at(&payload, offset);
        (vdi, res)
    })
    .await?;
    Ok(joined)
}

async fn read_blocking(
    mut vdi: Vdi,
    mut buf: Vec<u8>,
    offset: u64,
) -> Result<(Vdi, Vec<u8>, Result<usize>)> {
    let joined = tokio::task::spawn_blocking(move || {
        let res = vdi.read_at(&mut buf, offset);
        (vdi, buf, res)
    })
    .await?;
    Ok(joined)
}

// =============================================================================
// Writer
// =============================================================================

struct Writer<R> {
    generator: PayloadGenerator<R>,
    count: usize,
    metrics: PipelineMetrics,
    cancel: CancellationToken,
}

impl<R: RngCore> Writer<R> {
    async fn run(mut self, mut vdi: Vdi, tx: mpsc::Sender<Payload>) -> Result<(Vdi, WriteOutcome, bool)> {
        let mut outcome = WriteOutcome::default();
        let mut cancelled = false;

        for i in 0..self.count {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let payload = self.generator.next_payload();
            let offset = outcome.bytes_written;
            let (returned, res) = write_blocking(vdi, payload.clone(), offset).await?;
            vdi = returned;

            if let Err(e) = res {
                error!(item = i, offset, error = %e, "Error while writing");
                outcome.error = Some(e);
                break;
            }
            outcome.written += 1;
            outcome.bytes_written += payload.len() as u64;
            self.metrics.writes.inc();
            self.metrics.bytes_written.inc_by(payload.len() as u64);
            self.metrics.write_offset.set(outcome.bytes_written as i64);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                sent = tx.send(payload) => {
                    if sent.is_err() {
                        warn!(item = i, "Reader stopped, ending writes");
                        break;
                    }
                }
            }
        }

        // closing the channel is the reader's end-of-run signal
        drop(tx);
        debug!(written = outcome.written, "writer finished");
        Ok((vdi, outcome, cancelled))
    }
}

// =============================================================================
// Reader
// =============================================================================

struct Reader {
    delay: Duration,
    buf_len: usize,
    metrics: PipelineMetrics,
    cancel: CancellationToken,
}

impl Reader {
    async fn run(self, mut vdi: Vdi, mut rx: mpsc::Receiver<Payload>) -> Result<(Vdi, ReadOutcome, bool)> {
        let mut outcome = ReadOutcome::default();
        let mut cancelled = false;
        let mut buf = vec![0u8; self.buf_len];

        loop {
            let payload = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                item = rx.recv() => match item {
                    Some(payload) => payload,
                    None => break,
                },
            };

            if !self.delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        cancelled = true;
                        break;
                    }
                    _ = sleep(self.delay) => {}
                }
            }

            outcome.total += 1;
            self.metrics.reads.inc();

            let offset = outcome.read_offset;
            let (returned_vdi, returned_buf, res) = read_blocking(vdi, buf, offset).await?;
            vdi = returned_vdi;
            buf = returned_buf;

            let advance = match res {
                Err(e) => {
                    warn!(item = outcome.total, offset, error = %e, "Read-back failed");
                    // the cluster reports the requested length even on failure
                    let reported = match &e {
                        Error::Read { len, .. } => *len,
                        _ => 0,
                    };
                    outcome.failed += 1;
                    outcome.read_errors += 1;
                    outcome.last_error = Some(e);
                    self.metrics.record_failure("read");
                    reported
                }
                Ok(n) => {
                    let read = &buf[..n];
                    if read != payload.as_bytes() {
                        let e = Error::Mismatch {
                            vdi: vdi.name().to_string(),
                            offset,
                            expected: payload.to_string(),
                            actual: String::from_utf8_lossy(read).into_owned(),
                        };
                        warn!(item = outcome.total, offset, error = %e, "Read-back mismatch");
                        outcome.failed += 1;
                        outcome.mismatches += 1;
                        outcome.last_error = Some(e);
                        self.metrics.record_failure("mismatch");
                    } else {
                        debug!("Complete reading {} payloads", outcome.total);
                    }
                    n
                }
            };

            outcome.read_offset += advance as u64;
            self.metrics.read_offset.set(outcome.read_offset as i64);
        }

        Ok((vdi, outcome, cancelled))
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Drives one write-then-verify run.
///
/// # Example
///
/// ```
/// use picard::backend::MemoryCluster;
/// use picard::{Cluster, Pipeline, PipelineConfig, RunStatus};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> picard::Result<()> {
/// let backend = MemoryCluster::new();
/// let cluster = Cluster::connect(&backend, "127.0.0.1:7000")?;
/// let writer = cluster.create_open_vdi("testvdi", 1 << 16)?;
/// let reader = cluster.open_vdi("testvdi")?;
///
/// let run = Pipeline::new(PipelineConfig::default())?.run(writer, reader).await?;
/// assert_eq!(run.report.status(), RunStatus::Clean);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline<R = OsRng> {
    config: PipelineConfig,
    generator: PayloadGenerator<R>,
    metrics: PipelineMetrics,
    cancel: CancellationToken,
}

impl<R> std::fmt::Debug for Pipeline<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Pipeline<OsRng> {
    /// Pipeline drawing payload entropy from the operating system.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let generator = PayloadGenerator::with_seed_bytes(config.seed_bytes)?;
        Self::with_generator(config, generator)
    }
}

impl<R> Pipeline<R>
where
    R: RngCore + Send + 'static,
{
    /// Pipeline using a caller-supplied payload generator.
    pub fn with_generator(config: PipelineConfig, generator: PayloadGenerator<R>) -> Result<Self> {
        config.validate()?;
        if generator.max_len() != config.max_payload_len() {
            return Err(Error::Config(format!(
                "generator produces {}-byte payloads but the configuration expects {}",
                generator.max_len(),
                config.max_payload_len()
            )));
        }
        Ok(Self {
            config,
            generator,
            metrics: PipelineMetrics::new()?,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop the run when `token` is cancelled.
    ///
    /// The token is observed between cluster calls; a call already in
    /// flight always completes.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Write payloads through `writer` and verify them through `reader`.
    ///
    /// The two handles must be distinct; they may refer to the same VDI on
    /// the same or different connections. Both are handed back in the
    /// [`PipelineRun`] for the caller to close.
    #[instrument(skip_all, fields(vdi = %writer.name(), count = self.config.payload_count))]
    pub async fn run(self, writer: Vdi, reader: Vdi) -> Result<PipelineRun> {
        let started_at = Utc::now();
        let vdi = writer.name().to_string();
        info!(
            read_delay_ms = self.config.read_delay.as_millis() as u64,
            handoff_capacity = self.config.handoff_capacity,
            "Starting verification run"
        );

        let (tx, rx) = mpsc::channel(self.config.handoff_capacity);

        let write_task = Writer {
            generator: self.generator,
            count: self.config.payload_count,
            metrics: self.metrics.clone(),
            cancel: self.cancel.clone(),
        };
        let read_task = Reader {
            delay: self.config.read_delay,
            buf_len: self.config.max_payload_len(),
            metrics: self.metrics.clone(),
            cancel: self.cancel.clone(),
        };

        let write_handle = tokio::spawn(write_task.run(writer, tx));
        let read_result = read_task.run(reader, rx).await;
        let write_result = write_handle.await?;

        let (reader, read, read_cancelled) = read_result?;
        let (writer, write, write_cancelled) = write_result?;

        let report = PipelineReport {
            vdi,
            write,
            read,
            cancelled: read_cancelled || write_cancelled,
            started_at,
            finished_at: Utc::now(),
        };

        match report.status() {
            RunStatus::Clean => info!(total = report.read.total, "Verification run complete"),
            RunStatus::Aborted => {
                error!(written = report.write.written, "Verification run aborted by write fault")
            }
            status => warn!(
                %status,
                total = report.read.total,
                failed = report.read.failed,
                "Verification run finished with failures"
            ),
        }

        Ok(PipelineRun {
            report,
            writer,
            reader,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FaultPlan, MemoryCluster};
    use crate::Cluster;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(count: usize) -> PipelineConfig {
        PipelineConfig {
            payload_count: count,
            seed_bytes: 2,
            ..Default::default()
        }
    }

    fn seeded(seed: u64) -> PayloadGenerator<StdRng> {
        PayloadGenerator::from_rng(StdRng::seed_from_u64(seed), 2).unwrap()
    }

    #[tokio::test]
    async fn test_clean_run_aligns_cursors() {
        let backend = MemoryCluster::new();
        let cluster = Cluster::connect(&backend, "local").unwrap();
        let writer = cluster.create_open_vdi("t1", 64).unwrap();
        let reader = cluster.open_vdi("t1").unwrap();

        let pipeline = Pipeline::with_generator(config(8), seeded(1)).unwrap();
        let metrics = pipeline.metrics().clone();
        let run = pipeline.run(writer, reader).await.unwrap();
        let report = &run.report;

        assert_eq!(report.status(), RunStatus::Clean);
        assert_eq!(report.write.written, 8);
        assert_eq!(report.read.total, 8);
        assert_eq!(report.read.failed, 0);
        assert_eq!(report.write.bytes_written, 32);
        assert_eq!(report.read.read_offset, report.write.bytes_written);
        assert_eq!(metrics.writes.get(), 8);
        assert_eq!(metrics.read_offset.get(), 32);
    }

    #[tokio::test]
    async fn test_corrupted_read_is_mismatch() {
        let backend = MemoryCluster::new().with_faults(FaultPlan::new().corrupt_nth_read(3));
        let cluster = Cluster::connect(&backend, "local").unwrap();
        let writer = cluster.create_open_vdi("t1", 32).unwrap();
        let reader = cluster.open_vdi("t1").unwrap();

        let run = Pipeline::with_generator(config(4), seeded(2))
            .unwrap()
            .run(writer, reader)
            .await
            .unwrap();
        let read = &run.report.read;

        assert_eq!(run.report.status(), RunStatus::Degraded);
        assert_eq!(read.total, 4);
        assert_eq!(read.failed, 1);
        assert_eq!(read.mismatches, 1);
        assert_eq!(read.read_errors, 0);
        assert_matches!(read.last_error, Some(Error::Mismatch { offset: 8, .. }));
        // a mismatch still advances the cursor by what was read
        assert_eq!(read.read_offset, 16);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let backend = MemoryCluster::new();
        let cluster = Cluster::connect(&backend, "local").unwrap();
        let writer = cluster.create_open_vdi("t1", 32).unwrap();
        let reader = cluster.open_vdi("t1").unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let run = Pipeline::with_generator(config(4), seeded(3))
            .unwrap()
            .with_cancellation(token)
            .run(writer, reader)
            .await
            .unwrap();

        assert!(run.report.cancelled);
        assert_eq!(run.report.status(), RunStatus::Cancelled);
        assert_eq!(run.report.write.written, 0);
        assert_eq!(backend.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_during_read_delay() {
        let backend = MemoryCluster::new();
        let cluster = Cluster::connect(&backend, "local").unwrap();
        let writer = cluster.create_open_vdi("t1", 64).unwrap();
        let reader = cluster.open_vdi("t1").unwrap();

        let config = PipelineConfig {
            read_delay: Duration::from_secs(5),
            ..config(10)
        };
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = Pipeline::with_generator(config, seeded(6))
            .unwrap()
            .with_cancellation(token)
            .run(writer, reader)
            .await
            .unwrap();
        let report = &run.report;

        assert!(report.cancelled);
        assert_eq!(report.status(), RunStatus::Cancelled);
        assert!(report.read.total < 10);
        // the writer parks on the full handoff slot, well short of the count
        assert!(report.write.written < 10);
        assert!(report.finished_at - report.started_at < chrono::Duration::seconds(5));

        run.reader.close().unwrap();
        run.writer.close().unwrap();
        cluster.delete_vdi("t1").unwrap();
        cluster.disconnect().unwrap();
    }

    #[tokio::test]
    async fn test_writer_counts_bytes_when_reader_is_gone() {
        let backend = MemoryCluster::new();
        let cluster = Cluster::connect(&backend, "local").unwrap();
        let vdi = cluster.create_open_vdi("t1", 32).unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let writer = Writer {
            generator: seeded(7),
            count: 4,
            metrics: PipelineMetrics::new().unwrap(),
            cancel: CancellationToken::new(),
        };
        let (vdi, outcome, cancelled) = writer.run(vdi, tx).await.unwrap();

        assert!(!cancelled);
        assert!(outcome.error.is_none());
        assert_eq!(outcome.written, 1);
        assert_eq!(outcome.bytes_written, 4);
        assert_eq!(backend.write_calls(), 1);
        vdi.close().unwrap();
    }

    #[tokio::test]
    async fn test_handles_are_returned() {
        let backend = MemoryCluster::new();
        let cluster = Cluster::connect(&backend, "local").unwrap();
        let writer = cluster.create_open_vdi("t1", 32).unwrap();
        let reader = cluster.open_vdi("t1").unwrap();

        let run = Pipeline::with_generator(config(2), seeded(4))
            .unwrap()
            .run(writer, reader)
            .await
            .unwrap();

        assert_eq!(run.writer.name(), "t1");
        run.reader.close().unwrap();
        run.writer.close().unwrap();
        cluster.delete_vdi("t1").unwrap();
        cluster.disconnect().unwrap();
    }

    #[test]
    fn test_generator_must_match_config() {
        let generator = PayloadGenerator::from_rng(StdRng::seed_from_u64(0), 4).unwrap();
        assert_matches!(
            Pipeline::with_generator(config(1), generator),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_report_serializes_errors_as_text() {
        let report = PipelineReport {
            vdi: "t1".into(),
            write: WriteOutcome {
                written: 2,
                bytes_written: 8,
                error: Some(Error::Write {
                    vdi: "t1".into(),
                    offset: 8,
                    len: 4,
                    reason: "injected".into(),
                }),
            },
            read: ReadOutcome::default(),
            cancelled: false,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["write"]["written"], 2);
        assert!(json["write"]["error"]
            .as_str()
            .unwrap()
            .contains("injected"));
        assert!(json["read"]["last_error"].is_null());
        assert_eq!(report.status(), RunStatus::Aborted);
    }
}
