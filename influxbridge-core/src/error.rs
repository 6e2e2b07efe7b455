use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Source Error - {0}")]
    Source(String),

    /// A sink call failed in a way that a later attempt may fix.
    #[error("Sink Error - {0}")]
    Sink(String),

    /// The sink refused the data, retrying the same data will not help.
    #[error("Sink Rejected - {0}")]
    Rejected(String),

    #[error("Parse Error - {0}")]
    Parse(String),

    #[error("Provision Error - {0}")]
    Provision(String),

    /// The resource being created already exists.
    #[error("Conflict - {0}")]
    Conflict(String),

    #[error("Dead Letter Error - {0}")]
    DeadLetter(String),

    #[error("Health Server Error - {0}")]
    Health(String),

    /// Shutdown interrupted the operation.
    #[error("cancelled")]
    Cancelled,
}

impl From<influxbridge_kafka::Error> for Error {
    fn from(value: influxbridge_kafka::Error) -> Self {
        Error::Source(value.to_string())
    }
}

impl From<influxbridge_influxdb::Error> for Error {
    fn from(value: influxbridge_influxdb::Error) -> Self {
        match value {
            influxbridge_influxdb::Error::Conflict(body) => Error::Conflict(body),
            e if e.is_retryable() => Error::Sink(e.to_string()),
            e => Error::Rejected(e.to_string()),
        }
    }
}

impl Error {
    /// Whether the resilient writer should try again.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, Error::Sink(_))
    }
}
