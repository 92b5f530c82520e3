//! Disk-balance scenarios: after stress writes, bootstrap, decommission,
//! directory denylisting and replication changes, every node's per-directory
//! artifact totals stay within the balance tolerance.

mod common;

use cuttle::check::temp_dir;
use cuttle::config::single_token_default;
use cuttle::mgmt::DENYLISTED_DIRECTORIES_BEAN;
use cuttle::observe::assert_balanced;
use cuttle::stress::{self, StressProfile};
use cuttle::{Cluster, Consistency, Statement};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disk_balance_after_stress() {
    common::init_tracing();
    let scratch = temp_dir(Some("disk_balance_stress"), false);
    let mut config = common::cluster_config();
    config.set_datadir_count(3);
    config.set_option("allocate_tokens_for_keyspace", "keyspace1");

    let mut cluster = Cluster::new(config, scratch.path());
    cluster.populate(4).unwrap();
    cluster.start().await.unwrap();

    let session = cluster.session().await.unwrap();
    let profile = StressProfile::write(10_000)
        .with_threads(100)
        .with_replication_factor(2);
    stress::run_write(&session, &profile).await.unwrap();
    cluster.flush().await.unwrap();
    stress::run_read(&session, &profile).await.unwrap();

    // Make sure the data directories are balanced.
    for node in cluster.nodes() {
        assert_balanced(node, "keyspace1", "standard1");
    }

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disk_balance_after_bootstrap() {
    common::init_tracing();
    let scratch = temp_dir(Some("disk_balance_bootstrap"), false);
    let mut config = common::cluster_config();
    config.set_option("allocate_tokens_for_keyspace", "keyspace1");

    let mut cluster = Cluster::new(config, scratch.path());
    // Bootstrap streaming may leave retried errors in the log.
    cluster.allow_log_errors(true);
    cluster.populate(4).unwrap();
    cluster.start().await.unwrap();

    let session = cluster.session().await.unwrap();
    let profile = StressProfile::write(10_000)
        .with_threads(100)
        .with_replication_factor(3);
    stress::run_write(&session, &profile).await.unwrap();
    cluster.flush().await.unwrap();

    let node5 = cluster.bootstrap_node().await.unwrap();
    let node5_name = node5.name().to_string();
    assert_balanced(node5, "keyspace1", "standard1");

    cluster.cleanup().await.unwrap();

    assert_balanced(
        cluster.node(&node5_name).unwrap(),
        "keyspace1",
        "standard1",
    );

    if single_token_default() {
        for node in cluster.nodes() {
            node.admin("relocatesstables", &[]).await.unwrap();
        }
        let hits = cluster
            .node(&node5_name)
            .unwrap()
            .grep_log("No sstables to relocate for keyspace1.standard1")
            .unwrap();
        assert!(!hits.is_empty(), "expected the no-op relocate log line");
    }

    for node in cluster.nodes() {
        assert_balanced(node, "keyspace1", "standard1");
    }

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disk_balance_after_decommission() {
    common::init_tracing();
    let scratch = temp_dir(Some("disk_balance_decommission"), false);
    let mut config = common::cluster_config();
    config.set_datadir_count(3);
    config.set_option("allocate_tokens_for_keyspace", "keyspace1");

    let mut cluster = Cluster::new(config, scratch.path());
    cluster.populate(4).unwrap();
    cluster.start().await.unwrap();

    let session = cluster.session().await.unwrap();
    let warmup = StressProfile::write(1)
        .with_threads(100)
        .with_replication_factor(2);
    stress::run_write(&session, &warmup).await.unwrap();
    for node in cluster.nodes() {
        node.admin("disableautocompaction", &[]).await.unwrap();
    }

    let profile = StressProfile::write(10_000)
        .with_threads(100)
        .with_replication_factor(2);
    stress::run_write(&session, &profile).await.unwrap();
    cluster.flush().await.unwrap();

    cluster.decommission("node4").await.unwrap();

    if single_token_default() {
        for node in cluster.nodes() {
            node.admin("relocatesstables", &[]).await.unwrap();
        }
    }

    for node in cluster.nodes() {
        assert_balanced(node, "keyspace1", "standard1");
    }

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn denylisted_directory_keeps_queries_working() {
    common::init_tracing();
    let scratch = temp_dir(Some("denylisted_directory"), false);
    let mut config = common::cluster_config();
    config.set_datadir_count(3);

    let mut cluster = Cluster::new(config, scratch.path());
    cluster.populate(1).unwrap();
    cluster.start().await.unwrap();

    let session = cluster.session().await.unwrap();
    common::create_ks(&session, "ks", 1).await;
    common::create_c1c2_table(&session, "ks").await;
    common::insert_c1c2(&session, "ks", 10_000).await;

    let node = cluster.node("node1").unwrap();
    node.admin("flush", &[]).await.unwrap();
    common::query_c1c2_all(&session, "ks", 10_000).await;

    node.admin("compact", &[]).await.unwrap();

    let denylisted = node.datadirs()[0].clone();
    node.mgmt()
        .invoke(
            DENYLISTED_DIRECTORIES_BEAN,
            "markUnwritable",
            &[denylisted.to_str().unwrap()],
        )
        .await
        .unwrap();

    common::query_c1c2_all(&session, "ks", 10_000).await;

    node.admin("relocatesstables", &[]).await.unwrap();

    common::query_c1c2_all(&session, "ks", 10_000).await;

    cluster.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disk_balance_after_replication_change() {
    common::init_tracing();
    let scratch = temp_dir(Some("alter_replication"), false);
    let mut config = common::cluster_config();
    config.set_datadir_count(3);
    config.set_option("allocate_tokens_for_keyspace", "keyspace1");

    let mut cluster = Cluster::new(config, scratch.path());
    cluster.populate(3).unwrap();
    cluster.start().await.unwrap();

    let session = cluster.session().await.unwrap();
    let warmup = StressProfile::write(1)
        .with_threads(100)
        .with_replication_factor(1);
    stress::run_write(&session, &warmup).await.unwrap();
    cluster.flush().await.unwrap();

    session
        .execute(
            Statement::AlterKeyspaceReplication {
                name: "keyspace1".to_string(),
                replication_factor: 2,
            },
            Consistency::All,
        )
        .await
        .unwrap();

    let profile = StressProfile::write(100_000).with_threads(100);
    stress::run_write(&session, &profile).await.unwrap();
    cluster.flush().await.unwrap();

    for node in cluster.nodes() {
        assert_balanced(node, "keyspace1", "standard1");
    }

    cluster.stop().await.unwrap();
}
