//! Client query interface: a connection-pooled, ring-aware session that
//! executes typed statements at a consistency level. DDL broadcasts to the
//! whole ring; data statements route to the replicas of their partition
//! token, with the session acting as coordinator (it fans writes out to all
//! replicas and counts acknowledgements).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};

use crate::error::{CuttleError, Result};
use crate::ring::{partition_token, Ring};
use crate::wire::{
    read_frame, write_frame, ClientRequest, ClientResponse, ClientResult, Consistency, Row,
    Statement, Value,
};

/// Result of executing a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Applied,
    Rows(Vec<Row>),
    Count(u64),
}

impl QueryResult {
    pub fn rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            _ => Vec::new(),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            QueryResult::Count(n) => *n,
            QueryResult::Rows(rows) => rows.len() as u64,
            QueryResult::Applied => 0,
        }
    }
}

struct Connection {
    stream: TcpStream,
}

impl Connection {
    async fn request(&mut self, req: &ClientRequest) -> Result<ClientResult> {
        write_frame(&mut self.stream, req).await?;
        let response: ClientResponse = read_frame(&mut self.stream)
            .await?
            .ok_or_else(|| CuttleError::Protocol("connection closed mid-request".to_string()))?;
        if response.id != req.id() {
            return Err(CuttleError::Protocol(format!(
                "response id {} does not match request id {}",
                response.id,
                req.id()
            )));
        }
        Ok(response.result)
    }
}

pub struct Session {
    ring: Ring,
    pool: RwLock<HashMap<SocketAddr, Arc<Mutex<Connection>>>>,
    rf_cache: StdMutex<HashMap<String, usize>>,
    next_id: AtomicU64,
    last_ts: AtomicU64,
}

impl Session {
    /// Connect to a cluster and prime the schema cache from the first
    /// reachable member.
    pub async fn connect(ring: Ring) -> Result<Self> {
        let session = Self {
            ring,
            pool: RwLock::new(HashMap::new()),
            rf_cache: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            last_ts: AtomicU64::new(0),
        };
        if !session.ring.members.is_empty() {
            session.refresh_schema().await?;
        }
        Ok(session)
    }

    /// Execute a statement at the given consistency level.
    pub async fn execute(&self, statement: Statement, consistency: Consistency) -> Result<QueryResult> {
        if statement.routing().is_none() {
            self.execute_ddl(statement).await
        } else if statement.is_mutation() {
            self.execute_write(statement, consistency).await
        } else {
            self.execute_read(statement, consistency).await
        }
    }

    /// Strictly monotonic microsecond timestamps for mutations.
    fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let mut current = self.last_ts.load(Ordering::Relaxed);
        loop {
            let next = if now > current { now } else { current + 1 };
            match self.last_ts.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    async fn execute_ddl(&self, statement: Statement) -> Result<QueryResult> {
        let addrs: Vec<SocketAddr> = self.ring.members.iter().map(|m| m.native_addr).collect();
        if addrs.is_empty() {
            return Err(CuttleError::Query("no members to apply DDL to".to_string()));
        }
        // Schema changes require agreement from every member.
        for addr in addrs {
            match self.request_on(addr, statement.clone(), Consistency::All, 0).await? {
                ClientResult::Applied => {}
                ClientResult::Error(e) => return Err(CuttleError::Query(e)),
                other => {
                    return Err(CuttleError::Protocol(format!(
                        "unexpected DDL response: {other:?}"
                    )))
                }
            }
        }
        match &statement {
            Statement::CreateKeyspace {
                name,
                replication_factor,
            }
            | Statement::AlterKeyspaceReplication {
                name,
                replication_factor,
            } => {
                // CreateKeyspace on an existing keyspace leaves its rf
                // untouched, so trust the server view afterwards.
                if matches!(statement, Statement::AlterKeyspaceReplication { .. }) {
                    self.rf_cache
                        .lock()
                        .unwrap()
                        .insert(name.clone(), *replication_factor);
                } else {
                    self.rf_cache
                        .lock()
                        .unwrap()
                        .entry(name.clone())
                        .or_insert(*replication_factor);
                }
            }
            _ => {}
        }
        Ok(QueryResult::Applied)
    }

    async fn execute_write(&self, statement: Statement, consistency: Consistency) -> Result<QueryResult> {
        let (keyspace, partition) = statement
            .routing()
            .map(|(ks, p)| (ks.to_string(), p.to_vec()))
            .expect("write statements carry routing");
        let rf = self.rf_for(&keyspace).await?;
        let token = partition_token(&partition);
        let replicas: Vec<SocketAddr> = self
            .ring
            .replicas_for(token, rf)
            .into_iter()
            .map(|m| m.native_addr)
            .collect();
        if replicas.is_empty() {
            return Err(CuttleError::Query("no replicas for partition".to_string()));
        }
        let required = consistency.required(rf).min(replicas.len());
        let timestamp = self.next_timestamp();

        let attempts = join_all(replicas.iter().map(|addr| {
            let statement = statement.clone();
            async move {
                self.request_on(*addr, statement, consistency, timestamp)
                    .await
            }
        }))
        .await;

        let mut acked = 0usize;
        for (addr, attempt) in replicas.iter().zip(attempts) {
            match attempt {
                Ok(ClientResult::Applied) => acked += 1,
                Ok(ClientResult::Error(e)) => {
                    tracing::debug!(replica = %addr, "write rejected: {e}")
                }
                Ok(other) => {
                    tracing::debug!(replica = %addr, "unexpected write response: {other:?}")
                }
                Err(e) => tracing::debug!(replica = %addr, "write failed: {e}"),
            }
        }
        if acked >= required {
            Ok(QueryResult::Applied)
        } else {
            Err(CuttleError::Unavailable {
                required,
                alive: acked,
            })
        }
    }

    async fn execute_read(&self, statement: Statement, consistency: Consistency) -> Result<QueryResult> {
        let (keyspace, partition) = statement
            .routing()
            .map(|(ks, p)| (ks.to_string(), p.to_vec()))
            .expect("read statements carry routing");
        let rf = self.rf_for(&keyspace).await?;
        let token = partition_token(&partition);
        let replicas: Vec<SocketAddr> = self
            .ring
            .replicas_for(token, rf)
            .into_iter()
            .map(|m| m.native_addr)
            .collect();
        let required = consistency.required(rf).min(replicas.len().max(1));

        let mut results = Vec::new();
        let mut last_err = None;
        for addr in &replicas {
            match self
                .request_on(*addr, statement.clone(), consistency, 0)
                .await
            {
                Ok(ClientResult::Error(e)) => last_err = Some(CuttleError::Query(e)),
                Ok(result) => {
                    results.push(result);
                    if results.len() >= required {
                        break;
                    }
                }
                Err(e) => last_err = Some(e),
            }
        }
        if results.len() < required {
            return Err(last_err.unwrap_or(CuttleError::Unavailable {
                required,
                alive: results.len(),
            }));
        }
        Ok(Self::merge_reads(results))
    }

    /// Newest-timestamp-wins union across replica responses. Counts are
    /// served by the first responding replica.
    fn merge_reads(results: Vec<ClientResult>) -> QueryResult {
        if results.len() == 1 {
            return match results.into_iter().next().unwrap() {
                ClientResult::Rows(rows) => QueryResult::Rows(rows),
                ClientResult::Count(n) => QueryResult::Count(n),
                _ => QueryResult::Applied,
            };
        }
        let mut counts = Vec::new();
        let mut merged: std::collections::BTreeMap<Vec<Value>, Row> =
            std::collections::BTreeMap::new();
        let mut saw_rows = false;
        for result in results {
            match result {
                ClientResult::Count(n) => counts.push(n),
                ClientResult::Rows(rows) => {
                    saw_rows = true;
                    for row in rows {
                        match merged.get(&row.clustering) {
                            Some(existing) if existing.timestamp >= row.timestamp => {}
                            _ => {
                                merged.insert(row.clustering.clone(), row);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        if saw_rows {
            QueryResult::Rows(merged.into_values().collect())
        } else {
            QueryResult::Count(counts.first().copied().unwrap_or(0))
        }
    }

    async fn rf_for(&self, keyspace: &str) -> Result<usize> {
        if let Some(rf) = self.rf_cache.lock().unwrap().get(keyspace).copied() {
            return Ok(rf);
        }
        self.refresh_schema().await?;
        self.rf_cache
            .lock()
            .unwrap()
            .get(keyspace)
            .copied()
            .ok_or_else(|| CuttleError::UnknownKeyspace(keyspace.to_string()))
    }

    /// Re-prime the replication-factor cache from the first reachable
    /// member.
    async fn refresh_schema(&self) -> Result<()> {
        let mut last_err = None;
        for member in &self.ring.members {
            let req = ClientRequest::DescribeSchema {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
            };
            match self.raw_request(member.native_addr, req).await {
                Ok(ClientResult::Schema(description)) => {
                    let mut cache = self.rf_cache.lock().unwrap();
                    for ks in description.keyspaces {
                        cache.insert(ks.name, ks.replication_factor);
                    }
                    return Ok(());
                }
                Ok(other) => {
                    last_err = Some(CuttleError::Protocol(format!(
                        "unexpected schema response: {other:?}"
                    )))
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CuttleError::Query("empty ring".to_string())))
    }

    async fn request_on(
        &self,
        addr: SocketAddr,
        statement: Statement,
        consistency: Consistency,
        timestamp: u64,
    ) -> Result<ClientResult> {
        let req = ClientRequest::Execute {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            statement,
            consistency,
            timestamp,
        };
        self.raw_request(addr, req).await
    }

    async fn raw_request(&self, addr: SocketAddr, req: ClientRequest) -> Result<ClientResult> {
        let conn = self.conn(addr).await?;
        let mut guard = conn.lock().await;
        match guard.request(&req).await {
            Ok(result) => Ok(result),
            Err(first_err) => {
                // The node may have restarted since this connection was
                // pooled; reconnect once before giving up on the replica.
                tracing::debug!(replica = %addr, "retrying after {first_err}");
                drop(guard);
                self.invalidate(addr).await;
                let conn = self.conn(addr).await?;
                let mut guard = conn.lock().await;
                guard.request(&req).await
            }
        }
    }

    async fn conn(&self, addr: SocketAddr) -> Result<Arc<Mutex<Connection>>> {
        {
            let pool = self.pool.read().await;
            if let Some(conn) = pool.get(&addr) {
                return Ok(Arc::clone(conn));
            }
        }
        let mut pool = self.pool.write().await;
        // Double-check after acquiring the write lock.
        if let Some(conn) = pool.get(&addr) {
            return Ok(Arc::clone(conn));
        }
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let conn = Arc::new(Mutex::new(Connection { stream }));
        pool.insert(addr, Arc::clone(&conn));
        Ok(conn)
    }

    async fn invalidate(&self, addr: SocketAddr) {
        self.pool.write().await.remove(&addr);
    }
}
