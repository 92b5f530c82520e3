#![allow(dead_code)]

use std::path::PathBuf;

use futures::future::join_all;

use cuttle::client::Session;
use cuttle::config::ClusterConfig;
use cuttle::wire::{Selector, TableSchema};
use cuttle::{Consistency, Statement, Value};

/// Install a stderr subscriber once per test binary.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// The daemon binary built alongside the tests.
pub fn node_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cuttled"))
}

pub fn cluster_config() -> ClusterConfig {
    ClusterConfig::new(node_binary())
}

pub async fn create_ks(session: &Session, name: &str, replication_factor: usize) {
    session
        .execute(
            Statement::CreateKeyspace {
                name: name.to_string(),
                replication_factor,
            },
            Consistency::All,
        )
        .await
        .unwrap();
}

/// The two-column table the denylisted-directory scenario works with.
pub async fn create_c1c2_table(session: &Session, keyspace: &str) {
    session
        .execute(
            Statement::CreateTable {
                keyspace: keyspace.to_string(),
                table: "cf".to_string(),
                schema: TableSchema {
                    partition_columns: vec!["key".to_string()],
                    clustering_columns: vec![],
                    reverse_clustering: false,
                    value_columns: vec!["c1".to_string(), "c2".to_string()],
                },
            },
            Consistency::All,
        )
        .await
        .unwrap();
}

pub async fn insert_c1c2(session: &Session, keyspace: &str, n: u64) {
    let workers: u64 = 100;
    let tasks = (0..workers).map(|worker| async move {
        let mut i = worker;
        while i < n {
            session
                .execute(
                    Statement::Insert {
                        keyspace: keyspace.to_string(),
                        table: "cf".to_string(),
                        partition: vec![Value::text(format!("k{i}"))],
                        clustering: vec![],
                        columns: vec![
                            ("c1".to_string(), Value::text("value1")),
                            ("c2".to_string(), Value::text("value2")),
                        ],
                    },
                    Consistency::One,
                )
                .await
                .unwrap();
            i += workers;
        }
    });
    join_all(tasks).await;
}

pub async fn query_c1c2(session: &Session, keyspace: &str, k: u64) {
    let rows = session
        .execute(
            Statement::Select {
                keyspace: keyspace.to_string(),
                table: "cf".to_string(),
                partition: vec![Value::text(format!("k{k}"))],
                clustering_prefix: vec![],
                selector: Selector::Rows,
            },
            Consistency::One,
        )
        .await
        .unwrap()
        .rows();
    assert_eq!(rows.len(), 1, "row k{k} should exist");
    let c1 = rows[0]
        .columns
        .iter()
        .find(|(name, _)| name == "c1")
        .map(|(_, v)| v.clone());
    assert_eq!(c1, Some(Value::text("value1")), "row k{k} c1 value");
}

/// Read back every key in [0, n) with bounded concurrency.
pub async fn query_c1c2_all(session: &Session, keyspace: &str, n: u64) {
    let workers: u64 = 100;
    let tasks = (0..workers).map(|worker| async move {
        let mut k = worker;
        while k < n {
            query_c1c2(session, keyspace, k).await;
            k += workers;
        }
    });
    join_all(tasks).await;
}
