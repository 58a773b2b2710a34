use thiserror::Error;

/// Failure to open the transport.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The port does not exist or cannot be opened with these settings.
    #[error("serial port unavailable: {0}")]
    Unavailable(String),

    /// The port exists but could not be opened right now.
    #[error("serial port busy: {0}")]
    Busy(String),
}

impl ConnectError {
    /// Whether another attempt to open the same port may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectError::Busy(_))
    }
}

impl From<tokio_serial::Error> for ConnectError {
    fn from(e: tokio_serial::Error) -> Self {
        use tokio_serial::ErrorKind;

        match e.kind() {
            ErrorKind::NoDevice | ErrorKind::InvalidInput => {
                ConnectError::Unavailable(e.to_string())
            }
            ErrorKind::Io(std::io::ErrorKind::NotFound) => ConnectError::Unavailable(e.to_string()),
            _ => ConnectError::Busy(e.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("serial link is disconnected")]
    Disconnected,

    #[error("serial write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("serial reader task has stopped")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid pattern '{name}': {source}")]
    Pattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}
