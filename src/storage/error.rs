use thiserror::Error;

/// Failures surfaced by the ledger store, classified from the driver's
/// native error so the transfer core can decide between abort, retry and
/// reporting a client error.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// The store refused the transaction because of a concurrent writer
    /// (SQLite busy/locked). Nothing was committed.
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    #[error("Store unreachable: {0}")]
    Connectivity(String),

    #[error("Query failed: {0}")]
    Query(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

// SQLite primary result codes. Extended codes carry the primary one in the
// low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CANTOPEN: i32 = 14;

fn primary_code(code: &str) -> Option<i32> {
    code.parse::<i32>().ok().map(|c| c & 0xff)
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound {
                entity: "row",
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                use sqlx::error::ErrorKind;

                let message = db_err.message().to_string();
                let primary = db_err.code().and_then(|code| primary_code(&code));
                let contended = matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED))
                    || message.contains("database is locked")
                    || message.contains("database table is locked");

                if contended {
                    return StoreError::Conflict(message);
                }
                if primary == Some(SQLITE_CANTOPEN) {
                    return StoreError::Connectivity(message);
                }

                match db_err.kind() {
                    ErrorKind::ForeignKeyViolation
                    | ErrorKind::CheckViolation
                    | ErrorKind::UniqueViolation
                    | ErrorKind::NotNullViolation => StoreError::ConstraintViolation(message),
                    _ if message.contains("constraint failed") => {
                        StoreError::ConstraintViolation(message)
                    }
                    _ => StoreError::Query(message),
                }
            }

            sqlx::Error::PoolTimedOut => {
                StoreError::Connectivity("timed out waiting for a connection".to_string())
            }
            sqlx::Error::PoolClosed => StoreError::Connectivity("pool is closed".to_string()),
            sqlx::Error::Io(e) => StoreError::Connectivity(e.to_string()),
            sqlx::Error::Tls(e) => StoreError::Connectivity(e.to_string()),
            sqlx::Error::Protocol(e) => StoreError::Connectivity(e),
            sqlx::Error::WorkerCrashed => {
                StoreError::Connectivity("database worker crashed".to_string())
            }

            other => StoreError::Query(other.to_string()),
        }
    }
}
