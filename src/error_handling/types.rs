use sea_orm::DbErr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),
    #[error("Missing value: {0}")]
    MissingValue(String),
    #[error("Value out of range: {0}")]
    NotInRange(String),
}

/// Errors surfaced by the transaction layer.
///
/// Connection problems never show up here: the layer retries them until the
/// database comes back.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database runtime could not be created: {0}")]
    Runtime(std::io::Error),
    #[error("Query failed: {0}")]
    Query(#[from] DbErr),
    #[error("Transaction rolled back after a failure in a nested scope")]
    Poisoned,
    #[error("Unexpected row content: {0}")]
    BadRow(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("Empty filter expression")]
    Empty,
    #[error("Unknown filter code {0:?}")]
    UnknownCode(String),
    #[error("Filter code {0:?} takes no arguments")]
    UnexpectedArguments(char),
    #[error("Negation needs exactly one sub-expression, got {0}")]
    NotArity(usize),
    #[error("Unterminated argument list")]
    Unterminated,
    #[error("Unexpected '(' inside a value list")]
    UnexpectedParen,
    #[error("Trailing input after filter: {0:?}")]
    Trailing(String),
    #[error("Invalid IP address {0:?}")]
    InvalidAddress(String),
    #[error("Invalid port {0:?}")]
    InvalidPort(String),
    #[error("Port set of {0} entries does not fit a 16 bit count")]
    TooManyPorts(usize),
    #[error("Truncated binary filter")]
    Truncated,
    #[error("Unknown address family {0}")]
    UnknownFamily(u8),
    #[error("{0} trailing bytes after binary filter")]
    TrailingBytes(usize),
}

/// Malformed data on the wire, either from a client or from storage.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("Empty message")]
    Empty,
    #[error("Unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("Message truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("Flow batch header too short ({0} bytes)")]
    ShortHeader(usize),
    #[error("Invalid UTF-8 in name")]
    BadName,
    #[error("Config value {key:?} is missing or not a number: {value:?}")]
    BadConfigValue { key: String, value: Option<String> },
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
}

/// Reasons a flow batch is not stored.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Malformed flow batch: {0}")]
    Wire(#[from] WireError),
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),
    #[error("Client {0:?} is not known to the database")]
    UnknownClient(String),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Bind failed: {0}")]
    BindFail(std::io::Error),
    #[error("Accept failed: {0}")]
    AcceptFail(std::io::Error),
    #[error("Socket error: {0}")]
    SockError(#[from] std::io::Error),
    #[error("Connection closed before hello")]
    NoHello,
    #[error("Malformed frame: {0}")]
    Frame(#[from] WireError),
    #[error("Front-end proxy failed to start: {0}")]
    FrontendSpawn(std::io::Error),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("Storage error: {0}")]
    Storage(#[from] DbError),
    #[error("Front-end proxy terminated")]
    FrontendLost,
    #[error("Storage workers are not answering")]
    StorageUnavailable,
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
