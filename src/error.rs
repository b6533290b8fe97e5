use crate::auth::AuthError;
use crate::retry::CallError;
use datafusion::{arrow::error::ArrowError, error::DataFusionError, parquet::errors::ParquetError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("DataFusion: {0}")]
    DataFusion(#[from] DataFusionError),

    #[error("Arrow: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Parquet: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Object store: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Object path: {0}")]
    ObjectPath(#[from] object_store::path::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Zip: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Platform call failed: {0}")]
    Call(#[from] CallError),

    #[error("The start date: '{start_date}' is greater than the end date: '{end_date}'")]
    StartDateAfterEndDate {
        start_date: String,
        end_date: String,
    },

    #[error("Secret '{secret_id}' could not be read: {reason}")]
    SecretUnavailable { secret_id: String, reason: String },

    #[error("Secret '{secret_id}' is missing key '{key}' for {section}")]
    MissingSecretKey {
        secret_id: String,
        section: String,
        key: String,
    },

    #[error("Unknown report source '{0}'")]
    UnknownSource(String),

    #[error("Unknown report entity '{0}'")]
    UnknownEntity(String),

    #[error("No field definitions for {source_name}/{entity}")]
    MissingFieldSpec { source_name: String, entity: String },

    #[error("Report could not be parsed: {0}")]
    ReportParse(String),

    #[error("Unknown Microsoft Advertising environment '{0}'")]
    UnknownEnvironment(String),

    #[error("Storage is misconfigured: {0}")]
    StorageConfig(String),

    #[error("No target accounts discovered for any source")]
    NoTargetAccounts,
}
