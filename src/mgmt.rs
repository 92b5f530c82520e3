//! Management-protocol client: attach to a node's mgmt endpoint, run named
//! maintenance tools, invoke operations on named beans, push topology, and
//! drive internode streaming. Used by the cluster controller and by the
//! daemon itself when bootstrapping or decommissioning.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::error::{CuttleError, Result};
use crate::ring::{Ring, TokenRange};
use crate::wire::{
    read_frame, rows_digest, write_frame, AdminRequest, AdminResponse, AdminResult, Row,
};

/// Format a bean name from its domain and type, e.g.
/// `make_bean("db", "DenylistedDirectories")` -> `db:type=DenylistedDirectories`.
pub fn make_bean(domain: &str, bean_type: &str) -> String {
    format!("{domain}:type={bean_type}")
}

/// Storage-service bean exposed by every node.
pub const STORAGE_SERVICE_BEAN: &str = "db:type=StorageService";
/// Bean controlling which data directories accept writes.
pub const DENYLISTED_DIRECTORIES_BEAN: &str = "db:type=DenylistedDirectories";

pub struct MgmtClient {
    addr: SocketAddr,
    conn: Mutex<Option<TcpStream>>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl MgmtClient {
    /// Attach to a node's management endpoint. The connection is
    /// established lazily on first use.
    pub fn attach(addr: SocketAddr) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
            next_id: AtomicU64::new(1),
            request_timeout: Duration::from_secs(120),
        }
    }

    /// Run a named maintenance subcommand with string arguments, returning
    /// its captured output.
    pub async fn tool(&self, command: &str, args: &[&str]) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = AdminRequest::Tool {
            id,
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        match self.request(req).await? {
            AdminResult::ToolOutput(output) => Ok(output),
            AdminResult::Ok => Ok(String::new()),
            AdminResult::Error(e) => Err(CuttleError::Admin(format!("{command}: {e}"))),
            other => Err(CuttleError::Protocol(format!(
                "unexpected tool response: {other:?}"
            ))),
        }
    }

    /// Push a new topology to the node.
    pub async fn set_ring(&self, ring: &Ring) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = AdminRequest::SetRing {
            id,
            ring: ring.clone(),
        };
        match self.request(req).await? {
            AdminResult::Ok => Ok(()),
            AdminResult::Error(e) => Err(CuttleError::Admin(e)),
            other => Err(CuttleError::Protocol(format!(
                "unexpected set_ring response: {other:?}"
            ))),
        }
    }

    /// Invoke a named operation on a management bean.
    pub async fn invoke(&self, bean: &str, operation: &str, args: &[&str]) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = AdminRequest::InvokeBean {
            id,
            bean: bean.to_string(),
            operation: operation.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        match self.request(req).await? {
            AdminResult::Ok => Ok(()),
            AdminResult::Error(e) => Err(CuttleError::Admin(format!("{bean}.{operation}: {e}"))),
            other => Err(CuttleError::Protocol(format!(
                "unexpected invoke response: {other:?}"
            ))),
        }
    }

    /// Read a named attribute from a management bean.
    pub async fn read_attribute(&self, bean: &str, attribute: &str) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = AdminRequest::ReadBeanAttribute {
            id,
            bean: bean.to_string(),
            attribute: attribute.to_string(),
        };
        match self.request(req).await? {
            AdminResult::Attribute(value) => Ok(value),
            AdminResult::Error(e) => Err(CuttleError::Admin(format!("{bean}.{attribute}: {e}"))),
            other => Err(CuttleError::Protocol(format!(
                "unexpected attribute response: {other:?}"
            ))),
        }
    }

    /// Fetch the resolved rows of a table within the given token ranges.
    pub async fn stream_ranges(
        &self,
        keyspace: &str,
        table: &str,
        ranges: &[TokenRange],
    ) -> Result<Vec<Row>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = AdminRequest::StreamRanges {
            id,
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            ranges: ranges.to_vec(),
        };
        match self.request(req).await? {
            AdminResult::Rows(rows) => Ok(rows),
            AdminResult::Error(e) => Err(CuttleError::Stream(e)),
            other => Err(CuttleError::Protocol(format!(
                "unexpected stream response: {other:?}"
            ))),
        }
    }

    /// Hand a batch of rows to a node that became a replica for them. The
    /// batch is digest-verified on the receiving side.
    pub async fn stream_push(&self, keyspace: &str, table: &str, rows: Vec<Row>) -> Result<()> {
        let digest = rows_digest(&rows)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = AdminRequest::StreamPush {
            id,
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            rows,
            digest,
        };
        match self.request(req).await? {
            AdminResult::Ok => Ok(()),
            AdminResult::Error(e) => Err(CuttleError::Stream(e)),
            other => Err(CuttleError::Protocol(format!(
                "unexpected push response: {other:?}"
            ))),
        }
    }

    async fn request(&self, req: AdminRequest) -> Result<AdminResult> {
        let fut = self.request_inner(&req);
        timeout(self.request_timeout, fut)
            .await
            .map_err(|_| CuttleError::Timeout(format!("mgmt request to {}", self.addr)))?
    }

    async fn request_inner(&self, req: &AdminRequest) -> Result<AdminResult> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(self.addr).await?;
            stream.set_nodelay(true)?;
            *guard = Some(stream);
        }
        let stream = guard.as_mut().expect("connection just established");
        let outcome: Result<AdminResponse> = async {
            write_frame(&mut *stream, req).await?;
            read_frame(&mut *stream)
                .await?
                .ok_or_else(|| CuttleError::Protocol("mgmt connection closed".to_string()))
        }
        .await;
        match outcome {
            Ok(response) => {
                if response.id != req.id() {
                    return Err(CuttleError::Protocol(format!(
                        "mgmt response id {} does not match request id {}",
                        response.id,
                        req.id()
                    )));
                }
                Ok(response.result)
            }
            Err(e) => {
                // Force a reconnect on the next request.
                *guard = None;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_bean() {
        assert_eq!(
            make_bean("db", "DenylistedDirectories"),
            DENYLISTED_DIRECTORIES_BEAN
        );
        assert_eq!(make_bean("db", "StorageService"), STORAGE_SERVICE_BEAN);
    }
}
