use thiserror::Error;

#[derive(Error, Debug)]
pub enum CuttleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Cannot achieve consistency: {required} replicas required, {alive} responded")]
    Unavailable { required: usize, alive: usize },

    #[error("Unknown keyspace: {0}")]
    UnknownKeyspace(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Admin error: {0}")]
    Admin(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("{count} unexpected ERROR lines in log of {node}")]
    LogErrors { node: String, count: usize },
}

pub type Result<T> = std::result::Result<T, CuttleError>;
