use archive_proto::WireError;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),
    #[error("unexpected packet from server: {0}")]
    UnexpectedPacket(String),
    #[error("connection closed")]
    Closed,
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid server address: {0}")]
    InvalidAddress(String),
    /// The server refused a lock because another transaction holds a conflicting one.
    /// Carries that transaction's busy status.
    #[error("busy: {0}")]
    LockDenied(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("a transaction is already open on this connection")]
    TransactionOpen,
    #[error("no transaction is open on this connection")]
    NoTransaction,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

impl ConnectionError {
    pub fn is_lock_denied(&self) -> bool {
        matches!(self, ConnectionError::LockDenied(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ConnectionError::FileNotFound(_))
    }

    /// Errors after which the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::Protocol(_)
                | ConnectionError::UnexpectedPacket(_)
                | ConnectionError::Closed
                | ConnectionError::Timeout(_)
                | ConnectionError::Io(_)
        )
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(err.to_string())
    }
}
