#![forbid(unsafe_code)]

use calc_core::RegistryError;
use calc_core::ids::CalcId;
use calc_core::model::JobStatus;

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    UnknownId(CalcId),
    InvalidTransition {
        calc_id: CalcId,
        from: JobStatus,
        to: JobStatus,
    },
    CorruptRow {
        calc_id: i64,
        column: &'static str,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "sqlite: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::UnknownId(calc_id) => write!(f, "unknown id {calc_id}"),
            Self::InvalidTransition { calc_id, from, to } => {
                write!(f, "invalid transition (id={calc_id}, from={from}, to={to})")
            }
            Self::CorruptRow { calc_id, column } => {
                write!(f, "corrupt row (id={calc_id}, column={column})")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

impl From<StoreError> for RegistryError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::UnknownId(calc_id) => RegistryError::UnknownJob(calc_id),
            StoreError::InvalidTransition { calc_id, from, to } => {
                RegistryError::InvalidTransition { calc_id, from, to }
            }
            StoreError::InvalidInput(message) => RegistryError::InvalidInput(message.to_string()),
            other => RegistryError::Unavailable(other.to_string()),
        }
    }
}
