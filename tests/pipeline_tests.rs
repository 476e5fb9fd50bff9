//! Picard Integration Tests
//!
//! Runs the verification pipeline end to end against the in-memory cluster:
//! - Round-trip identity of sequential writes
//! - Write faults abort the run
//! - Read faults and mismatches are counted without stopping the run
//! - Replica connections read what the primary wrote

use std::time::Duration;

use assert_matches::assert_matches;
use rand::rngs::StdRng;
use rand::SeedableRng;

use picard::backend::{FaultPlan, MemoryCluster};
use picard::{
    Cluster, Error, Payload, PayloadGenerator, Pipeline, PipelineConfig, PipelineRun, RunStatus,
};

const SEED: u64 = 0x5eed;

fn config(count: usize) -> PipelineConfig {
    PipelineConfig {
        payload_count: count,
        seed_bytes: 2,
        ..Default::default()
    }
}

fn generator() -> PayloadGenerator<StdRng> {
    PayloadGenerator::from_rng(StdRng::seed_from_u64(SEED), 2).unwrap()
}

/// The payloads a run with [`generator`] writes, in order.
fn expected_payloads(count: usize) -> Vec<Payload> {
    let mut gen = generator();
    (0..count).map(|_| gen.next_payload()).collect()
}

async fn run_single_connection(backend: &MemoryCluster, count: usize, size: u64) -> PipelineRun {
    let cluster = Cluster::connect(backend, "127.0.0.1:7000").unwrap();
    let writer = cluster.create_open_vdi("t1", size).unwrap();
    let reader = cluster.open_vdi("t1").unwrap();

    Pipeline::with_generator(config(count), generator())
        .unwrap()
        .run(writer, reader)
        .await
        .unwrap()
}

// =============================================================================
// Concrete Scenarios
// =============================================================================

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_four_payloads_round_trip() {
        let backend = MemoryCluster::new();
        let run = run_single_connection(&backend, 4, 32).await;
        let report = &run.report;

        assert_eq!(report.read.total, 4);
        assert_eq!(report.read.failed, 0);
        assert!(report.read.last_error.is_none());
        assert_eq!(report.status(), RunStatus::Clean);

        // each range at 0, 4, 8, 12 holds its payload
        let contents = backend.snapshot("t1").unwrap();
        for (i, payload) in expected_payloads(4).iter().enumerate() {
            let offset = i * 4;
            assert_eq!(payload.len(), 4);
            assert_eq!(&contents[offset..offset + 4], payload.as_bytes());
        }
        assert!(contents[16..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_third_write_fails() {
        let backend = MemoryCluster::new().with_faults(FaultPlan::new().fail_nth_write(3));
        let run = run_single_connection(&backend, 4, 32).await;
        let report = &run.report;

        assert_eq!(report.write.written, 2);
        assert_matches!(report.write.error, Some(Error::Write { offset: 8, len: 4, .. }));
        assert_eq!(report.read.total, 2);
        assert_eq!(report.read.failed, 0);
        assert_eq!(report.status(), RunStatus::Aborted);

        // items after the fault are never attempted
        assert_eq!(backend.write_calls(), 3);
    }

    #[tokio::test]
    async fn test_read_fault_on_second_item() {
        let backend = MemoryCluster::new().with_faults(FaultPlan::new().fail_nth_read(2));
        let run = run_single_connection(&backend, 4, 32).await;
        let read = &run.report.read;

        assert_eq!(read.total, 4);
        assert_eq!(read.failed, 1);
        assert_eq!(read.read_errors, 1);
        assert_eq!(read.mismatches, 0);
        assert_matches!(
            read.last_error,
            Some(Error::Read { offset: 4, ref reason, .. }) if reason.contains("injected")
        );
        // items 1, 3 and 4 still verify, so the cursor kept its alignment
        assert_eq!(read.read_offset, 16);
        assert_eq!(run.report.status(), RunStatus::Degraded);
    }
}

// =============================================================================
// Properties
// =============================================================================

mod properties {
    use super::*;

    #[tokio::test]
    async fn test_cursors_agree_without_faults() {
        let backend = MemoryCluster::new();
        let run = run_single_connection(&backend, 25, 100).await;

        assert_eq!(run.report.write.written, 25);
        assert_eq!(run.report.read.read_offset, run.report.write.bytes_written);
        assert_eq!(run.report.write.bytes_written, 100);
    }

    #[tokio::test]
    async fn test_only_last_error_is_kept() {
        let backend = MemoryCluster::new()
            .with_faults(FaultPlan::new().fail_nth_read(1).corrupt_nth_read(3));
        let run = run_single_connection(&backend, 4, 32).await;
        let read = &run.report.read;

        assert_eq!(read.failed, 2);
        assert_eq!(read.read_errors, 1);
        assert_eq!(read.mismatches, 1);
        assert_matches!(read.last_error, Some(Error::Mismatch { offset: 8, .. }));
    }

    #[tokio::test]
    async fn test_first_write_fails() {
        let backend = MemoryCluster::new().with_faults(FaultPlan::new().fail_nth_write(1));
        let run = run_single_connection(&backend, 4, 32).await;

        assert_eq!(run.report.write.written, 0);
        assert_eq!(run.report.read.total, 0);
        assert_eq!(backend.read_calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_payloads() {
        let backend = MemoryCluster::new();
        let run = run_single_connection(&backend, 0, 8).await;

        assert_eq!(run.report.status(), RunStatus::Clean);
        assert_eq!(run.report.read.total, 0);
        assert_eq!(backend.write_calls(), 0);
    }

    #[tokio::test]
    async fn test_buffered_handoff() {
        let backend = MemoryCluster::new();
        let cluster = Cluster::connect(&backend, "local").unwrap();
        let writer = cluster.create_open_vdi("t1", 64).unwrap();
        let reader = cluster.open_vdi("t1").unwrap();

        let config = PipelineConfig {
            handoff_capacity: 16,
            ..config(16)
        };
        let run = Pipeline::with_generator(config, generator())
            .unwrap()
            .run(writer, reader)
            .await
            .unwrap();

        assert_eq!(run.report.status(), RunStatus::Clean);
        assert_eq!(run.report.read.total, 16);
    }
}

// =============================================================================
// Replica Reads
// =============================================================================

mod replica {
    use super::*;

    #[tokio::test]
    async fn test_second_connection_verifies_writes() {
        let backend = MemoryCluster::new();
        let primary = Cluster::connect(&backend, "10.0.0.1:7000").unwrap();
        let replica = Cluster::connect(&backend, "10.0.0.2:7000").unwrap();

        let writer = primary.create_open_vdi("replicated", 64).unwrap();
        let reader = replica.open_vdi("replicated").unwrap();

        let config = PipelineConfig {
            read_delay: Duration::from_millis(5),
            ..config(6)
        };
        let run = Pipeline::with_generator(config, generator())
            .unwrap()
            .run(writer, reader)
            .await
            .unwrap();

        assert_eq!(run.report.status(), RunStatus::Clean);
        assert_eq!(run.report.read.total, 6);

        run.reader.close().unwrap();
        replica.disconnect().unwrap();
        run.writer.close().unwrap();
        primary.delete_vdi("replicated").unwrap();
        primary.disconnect().unwrap();

        assert_eq!(backend.live_sessions(), 0);
        assert!(backend.vdi_names().is_empty());
    }

    #[tokio::test]
    async fn test_replica_disconnected_mid_setup() {
        let backend = MemoryCluster::new();
        let primary = Cluster::connect(&backend, "10.0.0.1:7000").unwrap();
        let replica = Cluster::connect(&backend, "10.0.0.2:7000").unwrap();

        let writer = primary.create_open_vdi("replicated", 32).unwrap();
        let reader = replica.open_vdi("replicated").unwrap();
        replica.disconnect().unwrap();

        // every read fails, yet the run completes and counts each one
        let run = Pipeline::with_generator(config(4), generator())
            .unwrap()
            .run(writer, reader)
            .await
            .unwrap();

        assert_eq!(run.report.read.total, 4);
        assert_eq!(run.report.read.failed, 4);
        assert_matches!(run.report.read.last_error, Some(Error::Disconnected { .. }));
        assert_eq!(run.report.write.written, 4);
    }
}
