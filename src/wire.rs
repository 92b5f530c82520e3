//! Framed wire protocol spoken on both node ports: length-prefixed bincode
//! envelopes with correlation ids. The `native` port carries typed query
//! statements; the `mgmt` port carries maintenance tools, management beans
//! and internode streaming.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CuttleError, Result};
use crate::ring::{Ring, TokenRange};

/// Upper bound on a single frame. Streaming responses carry whole range
/// transfers, so this is generous.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub type MessageId = u64;

/// Write one `u32`-length-prefixed bincode frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(msg)?;
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(CuttleError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on clean EOF before a length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CuttleError::Protocol(format!(
            "incoming frame of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(bincode::deserialize(&body)?))
}

/// A typed cell value. Ordering is derived so values can key BTreeMaps on
/// the storage side.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    Int(i64),
    Blob(Bytes),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn int(v: i64) -> Self {
        Value::Int(v)
    }

    pub fn blob(data: impl Into<Bytes>) -> Self {
        Value::Blob(data.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub partition_columns: Vec<String>,
    pub clustering_columns: Vec<String>,
    /// Rows within a partition are returned in reverse clustering order.
    pub reverse_clustering: bool,
    pub value_columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    Rows,
    Count,
}

/// Typed statements: the strongly-typed rendition of parameterized queries.
/// Mutations carry their bind values; the coordinator session supplies the
/// write timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    CreateKeyspace {
        name: String,
        replication_factor: usize,
    },
    AlterKeyspaceReplication {
        name: String,
        replication_factor: usize,
    },
    CreateTable {
        keyspace: String,
        table: String,
        schema: TableSchema,
    },
    Insert {
        keyspace: String,
        table: String,
        partition: Vec<Value>,
        clustering: Vec<Value>,
        columns: Vec<(String, Value)>,
    },
    Delete {
        keyspace: String,
        table: String,
        partition: Vec<Value>,
        /// Prefix of the clustering key; an empty prefix deletes the
        /// whole partition.
        clustering_prefix: Vec<Value>,
    },
    Select {
        keyspace: String,
        table: String,
        partition: Vec<Value>,
        clustering_prefix: Vec<Value>,
        selector: Selector,
    },
}

impl Statement {
    /// The keyspace a data statement routes to; DDL broadcasts instead.
    pub fn routing(&self) -> Option<(&str, &[Value])> {
        match self {
            Statement::Insert {
                keyspace, partition, ..
            }
            | Statement::Delete {
                keyspace, partition, ..
            }
            | Statement::Select {
                keyspace, partition, ..
            } => Some((keyspace, partition)),
            _ => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, Statement::Insert { .. } | Statement::Delete { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    One,
    Quorum,
    All,
}

impl Consistency {
    /// Number of replica acknowledgements required at a replication factor.
    pub fn required(self, rf: usize) -> usize {
        match self {
            Consistency::One => 1,
            Consistency::Quorum => rf / 2 + 1,
            Consistency::All => rf.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub partition: Vec<Value>,
    pub clustering: Vec<Value>,
    pub columns: Vec<(String, Value)>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyspaceDef {
    pub name: String,
    pub replication_factor: usize,
    pub tables: Vec<(String, TableSchema)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub keyspaces: Vec<KeyspaceDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Execute {
        id: MessageId,
        statement: Statement,
        consistency: Consistency,
        /// Coordinator-assigned microsecond timestamp for mutations.
        timestamp: u64,
    },
    DescribeSchema {
        id: MessageId,
    },
}

impl ClientRequest {
    pub fn id(&self) -> MessageId {
        match self {
            ClientRequest::Execute { id, .. } | ClientRequest::DescribeSchema { id } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientResult {
    Applied,
    Rows(Vec<Row>),
    Count(u64),
    Schema(SchemaDescription),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientResponse {
    pub id: MessageId,
    pub result: ClientResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AdminRequest {
    /// A named maintenance subcommand with string arguments.
    Tool {
        id: MessageId,
        command: String,
        args: Vec<String>,
    },
    /// Control-plane topology push.
    SetRing {
        id: MessageId,
        ring: Ring,
    },
    /// Invoke a named operation on a management bean.
    InvokeBean {
        id: MessageId,
        bean: String,
        operation: String,
        args: Vec<String>,
    },
    /// Read a named attribute from a management bean.
    ReadBeanAttribute {
        id: MessageId,
        bean: String,
        attribute: String,
    },
    /// Internode: fetch the resolved rows of a table within token ranges.
    StreamRanges {
        id: MessageId,
        keyspace: String,
        table: String,
        ranges: Vec<TokenRange>,
    },
    /// Internode: hand a digest-verified batch of rows to a new replica.
    StreamPush {
        id: MessageId,
        keyspace: String,
        table: String,
        rows: Vec<Row>,
        digest: [u8; 32],
    },
}

impl AdminRequest {
    pub fn id(&self) -> MessageId {
        match self {
            AdminRequest::Tool { id, .. }
            | AdminRequest::SetRing { id, .. }
            | AdminRequest::InvokeBean { id, .. }
            | AdminRequest::ReadBeanAttribute { id, .. }
            | AdminRequest::StreamRanges { id, .. }
            | AdminRequest::StreamPush { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdminResult {
    Ok,
    ToolOutput(String),
    Attribute(String),
    Rows(Vec<Row>),
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminResponse {
    pub id: MessageId,
    pub result: AdminResult,
}

/// SHA-256 digest of a row batch, checked on the receiving end of a stream.
pub fn rows_digest(rows: &[Row]) -> Result<[u8; 32]> {
    use sha2::{Digest, Sha256};
    let bytes = bincode::serialize(rows)?;
    let digest = Sha256::digest(&bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let req = ClientRequest::DescribeSchema { id: 7 };
        write_frame(&mut client, &req).await.unwrap();

        let echoed: ClientRequest = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(echoed.id(), 7);

        // Clean EOF once the peer is gone.
        drop(client);
        let eof: Option<ClientRequest> = read_frame(&mut server).await.unwrap();
        assert!(eof.is_none());
    }

    #[test]
    fn test_quorum_required() {
        assert_eq!(Consistency::One.required(3), 1);
        assert_eq!(Consistency::Quorum.required(1), 1);
        assert_eq!(Consistency::Quorum.required(2), 2);
        assert_eq!(Consistency::Quorum.required(3), 2);
        assert_eq!(Consistency::All.required(3), 3);
    }

    #[test]
    fn test_rows_digest_detects_tampering() {
        let row = Row {
            partition: vec![Value::text("CORP"), Value::int(2004)],
            clustering: vec![Value::int(25), Value::int(1)],
            columns: vec![("volume".to_string(), Value::int(100))],
            timestamp: 1,
        };
        let digest = rows_digest(&[row.clone()]).unwrap();
        let mut tampered = row;
        tampered.timestamp = 2;
        assert_ne!(digest, rows_digest(&[tampered]).unwrap());
    }
}
