//! Synthetic workload driver: writes or verifies a keyspace of sequential
//! keys with deterministic payloads, fanned out over a configurable number
//! of concurrent workers. The default row shape is the classic stress
//! table: five fixed-size blob columns per key.

use bytes::Bytes;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::time::{Duration, Instant};

use crate::client::Session;
use crate::error::{CuttleError, Result};
use crate::wire::{Consistency, Selector, Statement, TableSchema, Value};

#[derive(Debug, Clone)]
pub struct StressProfile {
    /// Number of keys to write or read.
    pub n: u64,
    /// Concurrent workers.
    pub threads: usize,
    /// Replication factor used when the keyspace has to be created.
    pub replication_factor: usize,
    pub keyspace: String,
    pub table: String,
    /// Blob columns per row (C0..Cn).
    pub value_columns: usize,
    /// Bytes per blob column.
    pub value_size: usize,
    pub consistency: Consistency,
}

impl StressProfile {
    /// A write profile for `n` keys with the default row shape.
    pub fn write(n: u64) -> Self {
        Self {
            n,
            threads: 100,
            replication_factor: 1,
            keyspace: "keyspace1".to_string(),
            table: "standard1".to_string(),
            value_columns: 5,
            value_size: 34,
            consistency: Consistency::One,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_replication_factor(mut self, rf: usize) -> Self {
        self.replication_factor = rf;
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }
}

#[derive(Debug, Clone)]
pub struct StressSummary {
    pub ops: u64,
    pub elapsed: Duration,
    pub ops_per_sec: f64,
}

/// The key for row `i`, zero-padded so lexicographic and numeric order
/// agree.
pub fn stress_key(i: u64) -> String {
    format!("key{i:010}")
}

/// Deterministic payload for a key's column, so reads can verify bytes
/// without any bookkeeping.
pub fn stress_payload(i: u64, column: usize, size: usize) -> Bytes {
    let mut rng = StdRng::seed_from_u64(i.wrapping_mul(31).wrapping_add(column as u64));
    let mut buf = vec![0u8; size];
    rng.fill_bytes(&mut buf);
    Bytes::from(buf)
}

/// Create the stress keyspace and table if they do not exist. An existing
/// keyspace keeps its replication factor.
pub async fn ensure_schema(session: &Session, profile: &StressProfile) -> Result<()> {
    session
        .execute(
            Statement::CreateKeyspace {
                name: profile.keyspace.clone(),
                replication_factor: profile.replication_factor,
            },
            Consistency::All,
        )
        .await?;
    session
        .execute(
            Statement::CreateTable {
                keyspace: profile.keyspace.clone(),
                table: profile.table.clone(),
                schema: TableSchema {
                    partition_columns: vec!["key".to_string()],
                    clustering_columns: vec![],
                    reverse_clustering: false,
                    value_columns: (0..profile.value_columns)
                        .map(|c| format!("C{c}"))
                        .collect(),
                },
            },
            Consistency::All,
        )
        .await?;
    Ok(())
}

/// Write `profile.n` keys, returning a throughput summary.
pub async fn run_write(session: &Session, profile: &StressProfile) -> Result<StressSummary> {
    ensure_schema(session, profile).await?;
    let start = Instant::now();
    run_workers(session, profile, WorkerMode::Write).await?;
    let elapsed = start.elapsed();
    let summary = StressSummary {
        ops: profile.n,
        elapsed,
        ops_per_sec: profile.n as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    };
    tracing::info!(
        ops = summary.ops,
        ops_per_sec = summary.ops_per_sec as u64,
        "stress write complete"
    );
    Ok(summary)
}

/// Read back `profile.n` keys and verify their payloads.
pub async fn run_read(session: &Session, profile: &StressProfile) -> Result<StressSummary> {
    let start = Instant::now();
    run_workers(session, profile, WorkerMode::Read).await?;
    let elapsed = start.elapsed();
    Ok(StressSummary {
        ops: profile.n,
        elapsed,
        ops_per_sec: profile.n as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    })
}

#[derive(Clone, Copy)]
enum WorkerMode {
    Write,
    Read,
}

async fn run_workers(session: &Session, profile: &StressProfile, mode: WorkerMode) -> Result<()> {
    let threads = profile.threads.max(1) as u64;
    let workers = (0..threads).map(|worker| async move {
        let mut i = worker;
        while i < profile.n {
            match mode {
                WorkerMode::Write => write_one(session, profile, i).await?,
                WorkerMode::Read => read_one(session, profile, i).await?,
            }
            i += threads;
        }
        Ok::<(), CuttleError>(())
    });
    for outcome in join_all(workers).await {
        outcome?;
    }
    Ok(())
}

async fn write_one(session: &Session, profile: &StressProfile, i: u64) -> Result<()> {
    let columns = (0..profile.value_columns)
        .map(|c| {
            (
                format!("C{c}"),
                Value::Blob(stress_payload(i, c, profile.value_size)),
            )
        })
        .collect();
    session
        .execute(
            Statement::Insert {
                keyspace: profile.keyspace.clone(),
                table: profile.table.clone(),
                partition: vec![Value::text(stress_key(i))],
                clustering: vec![],
                columns,
            },
            profile.consistency,
        )
        .await?;
    Ok(())
}

async fn read_one(session: &Session, profile: &StressProfile, i: u64) -> Result<()> {
    let result = session
        .execute(
            Statement::Select {
                keyspace: profile.keyspace.clone(),
                table: profile.table.clone(),
                partition: vec![Value::text(stress_key(i))],
                clustering_prefix: vec![],
                selector: Selector::Rows,
            },
            profile.consistency,
        )
        .await?;
    let rows = result.rows();
    if rows.len() != 1 {
        return Err(CuttleError::Query(format!(
            "expected 1 row for {}, got {}",
            stress_key(i),
            rows.len()
        )));
    }
    let expected = Value::Blob(stress_payload(i, 0, profile.value_size));
    let actual = rows[0]
        .columns
        .iter()
        .find(|(name, _)| name == "C0")
        .map(|(_, v)| v.clone());
    if actual.as_ref() != Some(&expected) {
        return Err(CuttleError::Query(format!(
            "payload mismatch for {}",
            stress_key(i)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_zero_padded() {
        assert_eq!(stress_key(0), "key0000000000");
        assert_eq!(stress_key(10_000), "key0000010000");
    }

    #[test]
    fn test_payloads_deterministic_per_key_and_column() {
        assert_eq!(stress_payload(7, 0, 34), stress_payload(7, 0, 34));
        assert_ne!(stress_payload(7, 0, 34), stress_payload(7, 1, 34));
        assert_ne!(stress_payload(7, 0, 34), stress_payload(8, 0, 34));
        assert_eq!(stress_payload(7, 0, 34).len(), 34);
    }
}
