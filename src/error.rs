use thiserror::Error;
use uuid::Uuid;

// Failure reported by the remote data service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    // 4xx-equivalent: validation rejection, missing row, forbidden. Never retried.
    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },
    // Network or 5xx-equivalent failure.
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote service unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    pub fn client(status: u16, message: impl Into<String>) -> Self {
        Self::Client {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::client(404, format!("{what} not found"))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Client { .. })
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Client { status, .. } => *status,
            Self::Transient(_) => 502,
            Self::Unavailable(_) => 503,
        }
    }
}

impl From<sqlx::Error> for RemoteError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::client(404, "row not found"),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Self::client(409, db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(e.to_string())
            }
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(e: serde_json::Error) -> Self {
        Self::client(422, e.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("query failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: RemoteError,
    },
    #[error("cached payload could not be decoded: {0}")]
    Decode(String),
}

impl QueryError {
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Failed { source, .. } => Some(source),
            Self::Decode(_) => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum MutationError {
    #[error("mutation {mutation_id} rolled back: {source}")]
    Rejected {
        mutation_id: Uuid,
        #[source]
        source: RemoteError,
    },
}

impl MutationError {
    pub fn remote(&self) -> &RemoteError {
        match self {
            Self::Rejected { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("change feed connect failed: {0}")]
    Connect(String),
    #[error("change feed dropped: {0}")]
    Stream(String),
    #[error("change feed lagged, {0} event(s) lost")]
    Lagged(u64),
}

// Attempt-store failure. The limiter swallows these and fails open.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("attempt store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
