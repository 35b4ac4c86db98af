use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction {0} is still pending")]
    Pending(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Batch returned {actual} responses for {expected} requests")]
    BatchLength { expected: usize, actual: usize },

    #[error("Parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cursor regression: stored {stored}, attempted {attempted}")]
    CursorRegression { stored: u64, attempted: u64 },

    #[error("Corrupt value for setting {name}: {value}")]
    Corrupt { name: String, value: String },
}

#[derive(Debug, Error)]
pub enum AmountError {
    #[error("Unsupported decimals: {0}")]
    Decimals(u32),

    #[error("Amount {0} exceeds decimal precision")]
    Overflow(String),
}

#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Amount error: {0}")]
    Amount(#[from] AmountError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Symbol {0} is not defined in config")]
    UnknownSymbol(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SentinelError {
    /// Configuration errors are reported once and never retried.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::UnknownSymbol(_) | Self::Config(_))
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification transport failed: {0}")]
    Transport(String),

    #[error("Malformed notification response: {0}")]
    Response(String),

    #[error("Notification cancelled by shutdown")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("Symbol {0} is not supported for draining")]
    UnsupportedSymbol(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Amount error: {0}")]
    Amount(#[from] AmountError),

    #[error("Drain executor failed: {0}")]
    Executor(String),
}

impl From<SentinelError> for DrainError {
    fn from(err: SentinelError) -> Self {
        match err {
            SentinelError::UnknownSymbol(symbol) => Self::UnsupportedSymbol(symbol),
            SentinelError::Chain(e) => Self::Chain(e),
            SentinelError::Store(e) => Self::Store(e),
            SentinelError::Amount(e) => Self::Amount(e),
            other => Self::Executor(other.to_string()),
        }
    }
}
