//! Pipeline metrics
//!
//! Prometheus counters for one verification run, kept on a private
//! [`Registry`] so that concurrent runs (and tests) do not collide.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Counters and gauges updated by the writer and reader tasks.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    pub writes: IntCounter,
    pub bytes_written: IntCounter,
    pub reads: IntCounter,
    pub read_failures: IntCounterVec,
    pub write_offset: IntGauge,
    pub read_offset: IntGauge,
}

fn register_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("picard".into()), None).map_err(register_err)?;

        let writes = IntCounter::new("pipeline_writes_total", "Payloads written successfully")
            .map_err(register_err)?;
        let bytes_written =
            IntCounter::new("pipeline_bytes_written_total", "Payload bytes written")
                .map_err(register_err)?;
        let reads = IntCounter::new("pipeline_reads_total", "Read-back attempts")
            .map_err(register_err)?;
        let read_failures = IntCounterVec::new(
            Opts::new("pipeline_read_failures_total", "Failed read-backs by kind"),
            &["kind"],
        )
        .map_err(register_err)?;
        let write_offset = IntGauge::new("pipeline_write_offset_bytes", "Writer cursor")
            .map_err(register_err)?;
        let read_offset = IntGauge::new("pipeline_read_offset_bytes", "Reader cursor")
            .map_err(register_err)?;

        registry.register(Box::new(writes.clone())).map_err(register_err)?;
        registry
            .register(Box::new(bytes_written.clone()))
            .map_err(register_err)?;
        registry.register(Box::new(reads.clone())).map_err(register_err)?;
        registry
            .register(Box::new(read_failures.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(write_offset.clone()))
            .map_err(register_err)?;
        registry
            .register(Box::new(read_offset.clone()))
            .map_err(register_err)?;

        Ok(Self {
            registry,
            writes,
            bytes_written,
            reads,
            read_failures,
            write_offset,
            read_offset,
        })
    }

    /// Record a failed read-back of the given kind ("read" or "mismatch").
    pub fn record_failure(&self, kind: &str) {
        self.read_failures.with_label_values(&[kind]).inc();
    }

    /// Failed read-backs of the given kind so far.
    pub fn failures(&self, kind: &str) -> u64 {
        self.read_failures.with_label_values(&[kind]).get()
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("metrics output is not utf-8: {}", e)))
    }
}
