//! Picard
//!
//! Writes a series of random payloads to a Sheepdog VDI and reads every one
//! of them back, optionally through a second connection, reporting how many
//! read-backs failed.
//!
//! # Lifecycle
//!
//! ```text
//! connect ─▶ create+open VDI ─▶ [connect replica ─▶ open VDI] ─▶ pipeline
//!                                                                  │
//! disconnect ◀─ delete VDI ◀─ close ◀─ [disconnect replica ◀─ close] ◀┘
//! ```

use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use picard::backend::{Connector, MemoryCluster};
use picard::{
    parse_duration, Cluster, Error, Pipeline, PipelineConfig, PipelineReport, Result, RunStatus,
    Vdi,
};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// Native libsheepdog client
    Sheepdog,
    /// In-process cluster (dry run)
    Memory,
}

/// Picard - Sheepdog VDI read/write verifier
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// host:port pair for the sheepdog cluster
    #[arg(long, env = "SHEEPDOG_HOSTPORT", default_value = "127.0.0.1:7000")]
    hostport: String,

    /// host:port pair for only issuing reads to the sheepdog cluster
    #[arg(long, env = "SHEEPDOG_READ_HOSTPORT")]
    read_hostport: Option<String>,

    /// Time to sleep before each read (e.g. 250ms, 2s)
    #[arg(long, env = "SHEEPDOG_READ_SLEEP", default_value = "0", value_parser = parse_duration)]
    read_sleep: Duration,

    /// Number of payloads to write and read back
    #[arg(long, env = "SHEEPDOG_TEST_PAYLOAD_COUNT", default_value_t = picard::config::DEFAULT_PAYLOAD_COUNT)]
    payload_count: usize,

    /// Size of the VDI to create, in bytes
    #[arg(long, env = "SHEEPDOG_VDI_SIZE", default_value_t = picard::config::DEFAULT_VDI_SIZE)]
    vdi_size: u64,

    /// Name of the VDI to test reads and writes across
    #[arg(long, env = "SHEEPDOG_VDI_NAME", default_value = picard::config::DEFAULT_VDI_NAME)]
    vdi_name: String,

    /// Cluster backend (defaults to sheepdog when built with native support)
    #[arg(long, env = "PICARD_BACKEND", value_enum)]
    backend: Option<BackendKind>,

    /// Payloads the writer may publish ahead of the reader
    #[arg(long, env = "PICARD_HANDOFF_CAPACITY", default_value_t = 1)]
    handoff_capacity: usize,

    /// Random bytes per payload (payloads are hex text, twice as long)
    #[arg(long, env = "PICARD_SEED_BYTES", default_value_t = picard::payload::DEFAULT_SEED_BYTES)]
    seed_bytes: usize,

    /// Print the final report as JSON on stdout
    #[arg(long, env = "PICARD_REPORT_JSON")]
    report_json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            payload_count: self.payload_count,
            read_delay: self.read_sleep,
            handoff_capacity: self.handoff_capacity,
            seed_bytes: self.seed_bytes,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let connector = make_connector(args.backend)?;
    let config = args.pipeline_config();
    config.validate_for_vdi(args.vdi_size)?;

    info!("Starting Picard");
    info!("  Backend: {}", connector.name());
    info!("  Write endpoint: {}", args.hostport);
    if let Some(ref read) = args.read_hostport {
        info!("  Read endpoint: {}", read);
    }
    info!("  VDI: {} ({} bytes)", args.vdi_name, args.vdi_size);
    info!("  Payloads: {}", config.payload_count);
    info!("  Read delay: {:?}", config.read_delay);

    let mut report = execute(&args, connector.as_ref(), config).await?;

    if args.report_json {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|e| Error::Internal(format!("cannot serialize report: {}", e)))?;
        println!("{}", json);
    }

    if let Some(ref e) = report.read.last_error {
        warn!(
            "Error occurred during reads: Total: {}, Failures: {}, Error: {}",
            report.read.total, report.read.failed, e
        );
    }

    info!(
        status = %report.status(),
        written = report.write.written,
        total = report.read.total,
        failed = report.read.failed,
        duration_ms = report.duration().num_milliseconds(),
        "Run finished"
    );

    if report.status() == RunStatus::Aborted {
        if let Some(e) = report.write.error.take() {
            error!("Error while writing at {}: {}", report.write.written, e);
            return Err(e);
        }
    }
    Ok(())
}

fn make_connector(kind: Option<BackendKind>) -> Result<Box<dyn Connector>> {
    let kind = kind.unwrap_or_else(|| {
        if picard::has_native_backend() {
            BackendKind::Sheepdog
        } else {
            warn!("Built without native sheepdog support, using the in-memory backend");
            BackendKind::Memory
        }
    });

    match kind {
        BackendKind::Memory => Ok(Box::new(MemoryCluster::new())),
        #[cfg(feature = "sheepdog")]
        BackendKind::Sheepdog => Ok(Box::new(picard::backend::SheepdogConnector::new())),
        #[cfg(not(feature = "sheepdog"))]
        BackendKind::Sheepdog => Err(Error::Config(
            "built without the `sheepdog` feature; rebuild with --features sheepdog or use --backend memory"
                .into(),
        )),
    }
}

// =============================================================================
// Resource Scoping
// =============================================================================

/// Collects teardown failures; the first one becomes the exit error.
#[derive(Default)]
struct Teardown {
    first_error: Option<Error>,
}

impl Teardown {
    fn step(&mut self, done: &str, result: Result<()>) {
        match result {
            Ok(()) => info!("{}", done),
            Err(e) => {
                error!(error = %e, "Teardown step failed");
                self.first_error.get_or_insert(e);
            }
        }
    }

    fn finish(self, result: Result<PipelineReport>) -> Result<PipelineReport> {
        let report = result?;
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

async fn execute(
    args: &Args,
    connector: &dyn Connector,
    config: PipelineConfig,
) -> Result<PipelineReport> {
    let cluster = Cluster::connect(connector, &args.hostport)?;
    info!("Created connection to sheepdog successfully");

    let mut teardown = Teardown::default();
    let result = with_write_vdi(args, connector, &cluster, config, &mut teardown).await;
    teardown.step("Successfully disconnected!", cluster.disconnect());
    teardown.finish(result)
}

async fn with_write_vdi(
    args: &Args,
    connector: &dyn Connector,
    cluster: &Cluster,
    config: PipelineConfig,
    teardown: &mut Teardown,
) -> Result<PipelineReport> {
    let writer = cluster.create_open_vdi(&args.vdi_name, args.vdi_size)?;
    info!("Created and opened VDI successfully");

    let (result, writer) = with_read_vdi(args, connector, cluster, writer, config, teardown).await;

    if let Some(writer) = writer {
        teardown.step("Closed write handle", writer.close());
    }
    teardown.step(
        &format!("Successfully deleted vdi: {:?}", args.vdi_name),
        cluster.delete_vdi(&args.vdi_name),
    );
    result
}

async fn with_read_vdi(
    args: &Args,
    connector: &dyn Connector,
    cluster: &Cluster,
    writer: Vdi,
    config: PipelineConfig,
    teardown: &mut Teardown,
) -> (Result<PipelineReport>, Option<Vdi>) {
    let Some(ref endpoint) = args.read_hostport else {
        let reader = match cluster.open_vdi(&args.vdi_name) {
            Ok(reader) => reader,
            Err(e) => return (Err(e), Some(writer)),
        };
        let (result, writer, reader) = run_pipeline(writer, reader, config).await;
        if let Some(reader) = reader {
            teardown.step("Closed read handle", reader.close());
        }
        return (result, writer);
    };

    let read_cluster = match Cluster::connect(connector, endpoint) {
        Ok(c) => c,
        Err(e) => return (Err(e), Some(writer)),
    };
    info!("Created read connection to sheepdog successfully");

    let reader = match read_cluster.open_vdi(&args.vdi_name) {
        Ok(reader) => reader,
        Err(e) => {
            teardown.step(
                "Successfully disconnected for read connection!",
                read_cluster.disconnect(),
            );
            return (Err(e), Some(writer));
        }
    };
    info!("Opened VDI successfully for reads");

    let (result, writer, reader) = run_pipeline(writer, reader, config).await;
    if let Some(reader) = reader {
        teardown.step("Closed read handle", reader.close());
    }
    teardown.step(
        "Successfully disconnected for read connection!",
        read_cluster.disconnect(),
    );
    (result, writer)
}

async fn run_pipeline(
    writer: Vdi,
    reader: Vdi,
    config: PipelineConfig,
) -> (Result<PipelineReport>, Option<Vdi>, Option<Vdi>) {
    let pipeline = match Pipeline::new(config) {
        Ok(p) => p,
        Err(e) => return (Err(e), Some(writer), Some(reader)),
    };
    let metrics = pipeline.metrics().clone();

    match pipeline.run(writer, reader).await {
        Ok(run) => {
            match metrics.render() {
                Ok(text) => debug!("Pipeline metrics:\n{}", text),
                Err(e) => debug!(error = %e, "Pipeline metrics unavailable"),
            }
            (Ok(run.report), Some(run.writer), Some(run.reader))
        }
        // handles lost with a panicked task were closed when dropped
        Err(e) => (Err(e), None, None),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
