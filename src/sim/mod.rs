//! Reference storage daemon. A single-process node that speaks the wire
//! contract against real disks: typed statements on the native port,
//! maintenance tools, management beans and internode streaming on the mgmt
//! port. Topology is pushed in by the control plane; nodes never gossip.

mod store;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

use crate::config::NodeConfig;
use crate::error::{CuttleError, Result};
use crate::mgmt::{MgmtClient, DENYLISTED_DIRECTORIES_BEAN, STORAGE_SERVICE_BEAN};
use crate::ring::Ring;
use crate::wire::{
    read_frame, rows_digest, write_frame, AdminRequest, AdminResponse, AdminResult, ClientRequest,
    ClientResponse, ClientResult, Row, Selector, Statement, Value,
};

use store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Starting,
    Joining,
    Normal,
    Drained,
    Decommissioned,
}

impl OperationMode {
    fn as_str(self) -> &'static str {
        match self {
            OperationMode::Starting => "STARTING",
            OperationMode::Joining => "JOINING",
            OperationMode::Normal => "NORMAL",
            OperationMode::Drained => "DRAINED",
            OperationMode::Decommissioned => "DECOMMISSIONED",
        }
    }
}

pub struct SimNode {
    config: NodeConfig,
    store: StdMutex<Store>,
    ring: StdMutex<Ring>,
    mode: StdMutex<OperationMode>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_triggered: AtomicBool,
}

impl SimNode {
    /// Full node lifecycle: recover local state, optionally bootstrap by
    /// streaming from peers, serve both ports until told to shut down.
    pub async fn run(config: NodeConfig) -> Result<()> {
        tracing::info!(
            "Starting cuttled {} release {} ({} data directories, {} tokens)",
            config.name,
            config.version,
            config.datadir_count,
            config.tokens.len()
        );
        for (key, value) in &config.options {
            tracing::info!(option = key.as_str(), value = value.as_str(), "node option");
        }

        let store = Store::open(&config.node_dir, config.datadir_count)?;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(4);
        let node = Arc::new(SimNode {
            ring: StdMutex::new(config.ring.clone()),
            store: StdMutex::new(store),
            mode: StdMutex::new(OperationMode::Starting),
            shutdown_tx,
            shutdown_triggered: AtomicBool::new(false),
            config,
        });

        // The mgmt port opens first so the control plane can observe the
        // mode while the node is still joining.
        let mgmt_listener = bind_listener(node.config.mgmt_addr)?;
        tracing::info!("Management endpoint listening on {}", node.config.mgmt_addr);
        Arc::clone(&node).spawn_mgmt_acceptor(mgmt_listener);

        if node.config.bootstrap {
            node.set_mode(OperationMode::Joining);
            node.bootstrap().await?;
        }

        let native_listener = bind_listener(node.config.native_addr)?;
        Arc::clone(&node).spawn_native_acceptor(native_listener);
        node.set_mode(OperationMode::Normal);
        tracing::info!(
            "Startup complete; listening for clients on {}",
            node.config.native_addr
        );

        let _ = shutdown_rx.recv().await;
        tracing::info!("{} shutting down", node.config.name);
        Ok(())
    }

    fn set_mode(&self, mode: OperationMode) {
        *self.mode.lock().expect("mode mutex poisoned") = mode;
        tracing::info!(mode = mode.as_str(), "operation mode changed");
    }

    fn current_mode(&self) -> OperationMode {
        *self.mode.lock().expect("mode mutex poisoned")
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().expect("store mutex poisoned")
    }

    fn current_ring(&self) -> Ring {
        self.ring.lock().expect("ring mutex poisoned").clone()
    }

    fn initiate_shutdown(&self) {
        if self.shutdown_triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
    }

    // ---- bootstrap ----

    /// Stream this node's replica ranges from its peers before serving.
    /// Transient failures are retried and logged at ERROR level.
    async fn bootstrap(&self) -> Result<()> {
        let ring = self.current_ring();
        let peers: Vec<_> = ring
            .members
            .iter()
            .filter(|m| m.name != self.config.name)
            .cloned()
            .collect();
        if peers.is_empty() {
            tracing::info!("No peers to bootstrap from; joining as a fresh ring");
            return Ok(());
        }
        tracing::info!(peers = peers.len(), "Joining ring: streaming replica ranges");

        self.fetch_schema_from_peers(&peers).await?;

        let tables = self.store().tables();
        let mut streamed_total = 0usize;
        for (keyspace, rf, table) in tables {
            let ranges = ring.replica_ranges(&self.config.name, rf);
            if ranges.is_empty() {
                continue;
            }
            // Merge across peers newest-wins; replicas overlap, so the same
            // row arrives more than once.
            let mut merged: BTreeMap<(Vec<Value>, Vec<Value>), Row> = BTreeMap::new();
            for peer in &peers {
                let client = MgmtClient::attach(peer.mgmt_addr);
                let mut attempt = 0;
                let rows = loop {
                    attempt += 1;
                    match client.stream_ranges(&keyspace, &table, &ranges).await {
                        Ok(rows) => break rows,
                        Err(e) if attempt < 3 => {
                            tracing::error!(
                                peer = peer.name.as_str(),
                                "Stream session failed ({e}); retrying"
                            );
                            sleep(Duration::from_millis(200)).await;
                        }
                        Err(e) => {
                            return Err(CuttleError::Stream(format!(
                                "bootstrap stream from {} failed: {e}",
                                peer.name
                            )))
                        }
                    }
                };
                for row in rows {
                    let key = (row.partition.clone(), row.clustering.clone());
                    match merged.get(&key) {
                        Some(existing) if existing.timestamp >= row.timestamp => {}
                        _ => {
                            merged.insert(key, row);
                        }
                    }
                }
            }
            streamed_total += merged.len();
            let rows: Vec<Row> = merged.into_values().collect();
            self.store().stream_in(&keyspace, &table, rows)?;
        }
        tracing::info!(rows = streamed_total, "Bootstrap streaming complete");
        Ok(())
    }

    async fn fetch_schema_from_peers(&self, peers: &[crate::ring::RingMember]) -> Result<()> {
        let mut last_err = None;
        for peer in peers {
            match fetch_schema(peer.native_addr).await {
                Ok(description) => {
                    self.store().apply_schema(&description)?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(
                        peer = peer.name.as_str(),
                        "Schema fetch failed ({e}); trying next peer"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CuttleError::Stream("no peers with schema".to_string())))
    }

    // ---- decommission ----

    /// Stream every row to the members that become responsible for it once
    /// this node leaves, then report DECOMMISSIONED.
    async fn decommission(&self) -> Result<String> {
        let old_ring = self.current_ring();
        let new_ring = old_ring.without(&self.config.name);
        if new_ring.members.is_empty() {
            return Err(CuttleError::Admin(
                "cannot decommission the only ring member".to_string(),
            ));
        }
        tracing::info!("Announcing decommission of {}", self.config.name);

        // Snapshot outgoing batches without holding the store lock across
        // network calls.
        let batches: Vec<(String, String, String, Vec<Row>)> = {
            let store = self.store();
            let mut out: Vec<(String, String, String, Vec<Row>)> = Vec::new();
            for (keyspace, rf, table) in store.tables() {
                let mut by_target: BTreeMap<String, Vec<Row>> = BTreeMap::new();
                for row in store.resolved_rows(&keyspace, &table)? {
                    let token = crate::ring::partition_token(&row.partition);
                    let old_replicas: Vec<String> = old_ring
                        .replicas_for(token, rf)
                        .iter()
                        .map(|m| m.name.clone())
                        .collect();
                    for member in new_ring.replicas_for(token, rf) {
                        if !old_replicas.contains(&member.name) {
                            by_target
                                .entry(member.name.clone())
                                .or_default()
                                .push(row.clone());
                        }
                    }
                }
                for (target, rows) in by_target {
                    out.push((keyspace.clone(), table.clone(), target, rows));
                }
            }
            out
        };

        let mut pushed = 0usize;
        for (keyspace, table, target, rows) in batches {
            let member = new_ring.member(&target)?;
            let client = MgmtClient::attach(member.mgmt_addr);
            pushed += rows.len();
            tracing::info!(
                keyspace = keyspace.as_str(),
                table = table.as_str(),
                target = target.as_str(),
                rows = rows.len(),
                "streaming to new owner"
            );
            client.stream_push(&keyspace, &table, rows).await?;
        }

        self.set_mode(OperationMode::Decommissioned);
        tracing::info!("{} decommissioned; leaving the ring", self.config.name);
        Ok(format!("streamed {pushed} rows to new owners"))
    }

    // ---- native port ----

    fn spawn_native_acceptor(self: Arc<Self>, listener: TcpListener) {
        let node = self;
        let mut shutdown_rx = node.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    recv = shutdown_rx.recv() => {
                        let _ = recv;
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                tracing::debug!(client = %addr, "client connected");
                                let node = Arc::clone(&node);
                                tokio::spawn(async move {
                                    if let Err(e) = node.serve_client(stream).await {
                                        tracing::debug!(client = %addr, "client connection ended: {e}");
                                    }
                                });
                            }
                            Err(e) => tracing::error!("accept failed on native port: {e}"),
                        }
                    }
                }
            }
        });
    }

    async fn serve_client(&self, mut stream: TcpStream) -> Result<()> {
        while let Some(request) = read_frame::<_, ClientRequest>(&mut stream).await? {
            let response = match request {
                ClientRequest::Execute {
                    id,
                    statement,
                    consistency: _,
                    timestamp,
                } => ClientResponse {
                    id,
                    result: self.execute_statement(statement, timestamp),
                },
                ClientRequest::DescribeSchema { id } => ClientResponse {
                    id,
                    result: ClientResult::Schema(self.store().schema_description()),
                },
            };
            write_frame(&mut stream, &response).await?;
        }
        Ok(())
    }

    fn execute_statement(&self, statement: Statement, timestamp: u64) -> ClientResult {
        if statement.is_mutation() && self.current_mode() == OperationMode::Drained {
            return ClientResult::Error("node is drained".to_string());
        }
        let outcome = match statement {
            Statement::CreateKeyspace {
                name,
                replication_factor,
            } => self
                .store()
                .create_keyspace(&name, replication_factor)
                .map(|_| ClientResult::Applied),
            Statement::AlterKeyspaceReplication {
                name,
                replication_factor,
            } => self
                .store()
                .alter_keyspace(&name, replication_factor)
                .map(|_| ClientResult::Applied),
            Statement::CreateTable {
                keyspace,
                table,
                schema,
            } => self
                .store()
                .create_table(&keyspace, &table, schema)
                .map(|_| ClientResult::Applied),
            Statement::Insert {
                keyspace,
                table,
                partition,
                clustering,
                columns,
            } => self
                .store()
                .apply_write(&keyspace, &table, partition, clustering, columns, timestamp)
                .map(|_| ClientResult::Applied),
            Statement::Delete {
                keyspace,
                table,
                partition,
                clustering_prefix,
            } => self
                .store()
                .apply_delete(&keyspace, &table, partition, clustering_prefix, timestamp)
                .map(|_| ClientResult::Applied),
            Statement::Select {
                keyspace,
                table,
                partition,
                clustering_prefix,
                selector,
            } => {
                let store = self.store();
                match selector {
                    Selector::Rows => store
                        .read_rows(&keyspace, &table, &partition, &clustering_prefix)
                        .map(ClientResult::Rows),
                    Selector::Count => store
                        .count_rows(&keyspace, &table, &partition, &clustering_prefix)
                        .map(ClientResult::Count),
                }
            }
        };
        outcome.unwrap_or_else(|e| ClientResult::Error(e.to_string()))
    }

    // ---- mgmt port ----

    fn spawn_mgmt_acceptor(self: Arc<Self>, listener: TcpListener) {
        let node = self;
        let mut shutdown_rx = node.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    recv = shutdown_rx.recv() => {
                        let _ = recv;
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                let node = Arc::clone(&node);
                                tokio::spawn(async move {
                                    if let Err(e) = node.serve_mgmt(stream).await {
                                        tracing::debug!(client = %addr, "mgmt connection ended: {e}");
                                    }
                                });
                            }
                            Err(e) => tracing::error!("accept failed on mgmt port: {e}"),
                        }
                    }
                }
            }
        });
    }

    async fn serve_mgmt(&self, mut stream: TcpStream) -> Result<()> {
        while let Some(request) = read_frame::<_, AdminRequest>(&mut stream).await? {
            let id = request.id();
            let (result, shutdown_after) = self.handle_admin(request).await;
            write_frame(&mut stream, &AdminResponse { id, result }).await?;
            if shutdown_after {
                self.initiate_shutdown();
                break;
            }
        }
        Ok(())
    }

    async fn handle_admin(&self, request: AdminRequest) -> (AdminResult, bool) {
        match request {
            AdminRequest::Tool { command, args, .. } => self.run_tool(&command, &args).await,
            AdminRequest::SetRing { ring, .. } => {
                tracing::info!(members = ring.members.len(), "topology updated");
                *self.ring.lock().expect("ring mutex poisoned") = ring;
                (AdminResult::Ok, false)
            }
            AdminRequest::InvokeBean {
                bean,
                operation,
                args,
                ..
            } => (self.invoke_bean(&bean, &operation, &args), false),
            AdminRequest::ReadBeanAttribute {
                bean, attribute, ..
            } => (self.read_bean_attribute(&bean, &attribute), false),
            AdminRequest::StreamRanges {
                keyspace,
                table,
                ranges,
                ..
            } => {
                let outcome = self.store().stream_out(&keyspace, &table, &ranges);
                match outcome {
                    Ok(rows) => (AdminResult::Rows(rows), false),
                    Err(e) => (AdminResult::Error(e.to_string()), false),
                }
            }
            AdminRequest::StreamPush {
                keyspace,
                table,
                rows,
                digest,
                ..
            } => {
                let verified = match rows_digest(&rows) {
                    Ok(actual) if actual == digest => Ok(()),
                    Ok(_) => Err(CuttleError::Stream(
                        "stream digest mismatch".to_string(),
                    )),
                    Err(e) => Err(e),
                };
                let outcome =
                    verified.and_then(|_| self.store().stream_in(&keyspace, &table, rows));
                match outcome {
                    Ok(()) => (AdminResult::Ok, false),
                    Err(e) => (AdminResult::Error(e.to_string()), false),
                }
            }
        }
    }

    async fn run_tool(&self, command: &str, args: &[String]) -> (AdminResult, bool) {
        tracing::info!(command, ?args, "maintenance command");
        let outcome: Result<(AdminResult, bool)> = match command {
            "flush" => self
                .store()
                .flush()
                .map(|written| (AdminResult::ToolOutput(format!("{written} sstables written")), false)),
            "compact" => self
                .store()
                .compact()
                .map(|_| (AdminResult::ToolOutput(String::new()), false)),
            "cleanup" => {
                let ring = self.current_ring();
                self.store()
                    .cleanup(&ring, &self.config.name)
                    .map(|_| (AdminResult::ToolOutput(String::new()), false))
            }
            "relocatesstables" => self
                .store()
                .relocate_sstables()
                .map(|_| (AdminResult::ToolOutput(String::new()), false)),
            "disableautocompaction" => {
                self.store().set_auto_compaction(false);
                Ok((AdminResult::ToolOutput(String::new()), false))
            }
            "drain" => {
                let flushed = self.store().flush();
                match flushed {
                    Ok(_) => {
                        self.set_mode(OperationMode::Drained);
                        tracing::info!("Node drained; no longer accepting writes");
                        Ok((AdminResult::ToolOutput(String::new()), false))
                    }
                    Err(e) => Err(e),
                }
            }
            "decommission" => match self.decommission().await {
                Ok(output) => Ok((AdminResult::ToolOutput(output), true)),
                Err(e) => Err(e),
            },
            other => Err(CuttleError::Admin(format!("unknown command: {other}"))),
        };
        outcome.unwrap_or_else(|e| (AdminResult::Error(e.to_string()), false))
    }

    fn invoke_bean(&self, bean: &str, operation: &str, args: &[String]) -> AdminResult {
        tracing::info!(bean, operation, ?args, "bean operation invoked");
        match (bean, operation) {
            (DENYLISTED_DIRECTORIES_BEAN, "markUnwritable") => {
                let Some(path) = args.first() else {
                    return AdminResult::Error("markUnwritable requires a path".to_string());
                };
                let outcome = {
                    let mut store = self.store();
                    store
                        .dir_index_of(std::path::Path::new(path))
                        .and_then(|index| store.mark_unwritable(index))
                };
                match outcome {
                    Ok(()) => AdminResult::Ok,
                    Err(e) => AdminResult::Error(e.to_string()),
                }
            }
            _ => AdminResult::Error(format!("no operation {operation} on bean {bean}")),
        }
    }

    fn read_bean_attribute(&self, bean: &str, attribute: &str) -> AdminResult {
        match (bean, attribute) {
            (STORAGE_SERVICE_BEAN, "OperationMode") => {
                AdminResult::Attribute(self.current_mode().as_str().to_string())
            }
            (STORAGE_SERVICE_BEAN, "ReleaseVersion") => {
                AdminResult::Attribute(self.config.version.clone())
            }
            (STORAGE_SERVICE_BEAN, "AutoCompaction") => {
                AdminResult::Attribute(self.store().auto_compaction_enabled().to_string())
            }
            (DENYLISTED_DIRECTORIES_BEAN, "Denylisted") => AdminResult::Attribute(
                self.store()
                    .denylisted_dirs()
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => AdminResult::Error(format!("no attribute {attribute} on bean {bean}")),
        }
    }
}

/// Bind with SO_REUSEADDR: a restarted node must be able to reclaim its
/// port while connections from its previous life sit in TIME_WAIT.
fn bind_listener(addr: std::net::SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(128)?)
}

/// One-shot schema fetch from a peer's native port, used while joining.
async fn fetch_schema(addr: std::net::SocketAddr) -> Result<crate::wire::SchemaDescription> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, &ClientRequest::DescribeSchema { id: 1 }).await?;
    let response: ClientResponse = read_frame(&mut stream)
        .await?
        .ok_or_else(|| CuttleError::Protocol("peer closed during schema fetch".to_string()))?;
    match response.result {
        ClientResult::Schema(description) => Ok(description),
        other => Err(CuttleError::Protocol(format!(
            "unexpected schema response: {other:?}"
        ))),
    }
}
