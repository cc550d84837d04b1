use std::path::PathBuf;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, StatsError>;

/// Errors raised below the metric-operation boundary.
///
/// None of these ever reach the collector: each of the nine metric
/// operations converts its error into the operation's null/empty default
/// and logs it. The variants exist so the conversion sites have something
/// structured to log and so adapter construction (secret resolution,
/// session setup) can fail loudly.
#[derive(ThisError, Debug)]
pub enum StatsError {
    /// A required credential is absent from both the environment and the
    /// secret-file tree. Fatal to the owning adapter's construction.
    #[error("missing required secret '{name}' for warehouse '{kind}'")]
    MissingSecret { kind: &'static str, name: String },

    /// A secret file exists but could not be read.
    #[error("failed to read secret file {path}")]
    SecretRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configured warehouse kind is not one we know how to build.
    #[error("unsupported warehouse kind: {0}")]
    UnknownWarehouse(String),

    /// An identifier destined for interpolation into a catalog query failed
    /// the allow-list check.
    #[error("identifier '{0}' contains characters not allowed in query templates")]
    InvalidIdentifier(String),

    /// HTTP-level failure talking to a REST warehouse API.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The warehouse accepted the request but reported an error, or returned
    /// a payload we could not interpret.
    #[error("warehouse query failed: {0}")]
    Query(String),

    /// Postgres-wire (Redshift) failure.
    #[error(transparent)]
    Redshift(#[from] sqlx::Error),

    /// TDS (Fabric / SQL Server) failure.
    #[error(transparent)]
    Fabric(#[from] tiberius::error::Error),

    /// Token minting for BigQuery service accounts.
    #[error("failed to sign service-account assertion")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for StatsError {
    fn from(err: std::io::Error) -> Self {
        StatsError::Other(err.into())
    }
}
