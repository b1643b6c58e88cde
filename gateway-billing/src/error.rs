use std::fmt::Display;

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    /// Build an error without logging it.
    ///
    /// Backend faults go through here: the health monitor logs them once per
    /// state transition instead of once per call.
    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Whether this error means the counter store could not be reached
    /// (as opposed to a bad value or bad input).
    pub fn is_backend_fault(&self) -> bool {
        matches!(
            *self.0,
            ErrorDetails::BackendUnavailable { .. }
                | ErrorDetails::BackendTimeout { .. }
                | ErrorDetails::BackendCommand { .. }
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    BackendUnavailable {
        backend: String,
        message: String,
    },
    BackendTimeout {
        backend: String,
        operation: String,
        timeout_ms: u64,
    },
    BackendCommand {
        backend: String,
        operation: String,
        message: String,
    },
    /// The backend answered but refused the command because of the stored data.
    BackendRejected {
        backend: String,
        operation: String,
        message: String,
    },
    Config {
        message: String,
    },
    InvalidCounterValue {
        key: String,
        value: String,
    },
    InvalidTariff {
        message: String,
    },
    InvalidTokenCount {
        api_key: String,
        tokens: i64,
    },
    Observability {
        message: String,
    },
    Serialization {
        message: String,
    },
    UnknownTariffPlan {
        plan_name: String,
    },
    Unrecoverable {
        operation: String,
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::BackendUnavailable { .. } => tracing::Level::WARN,
            ErrorDetails::BackendTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::BackendCommand { .. } => tracing::Level::WARN,
            ErrorDetails::BackendRejected { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidCounterValue { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidTariff { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidTokenCount { .. } => tracing::Level::WARN,
            ErrorDetails::Observability { .. } => tracing::Level::ERROR,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::UnknownTariffPlan { .. } => tracing::Level::WARN,
            ErrorDetails::Unrecoverable { .. } => tracing::Level::ERROR,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::BackendUnavailable { backend, message } => {
                write!(f, "Counter backend `{backend}` is unavailable: {message}")
            }
            ErrorDetails::BackendTimeout {
                backend,
                operation,
                timeout_ms,
            } => {
                write!(
                    f,
                    "Counter backend `{backend}` timed out after {timeout_ms}ms during `{operation}`"
                )
            }
            ErrorDetails::BackendCommand {
                backend,
                operation,
                message,
            } => {
                write!(
                    f,
                    "Counter backend `{backend}` failed during `{operation}`: {message}"
                )
            }
            ErrorDetails::BackendRejected {
                backend,
                operation,
                message,
            } => {
                write!(
                    f,
                    "Counter backend `{backend}` rejected `{operation}`: {message}"
                )
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InvalidCounterValue { key, value } => {
                write!(f, "Value `{value}` stored under `{key}` is not an integer counter")
            }
            ErrorDetails::InvalidTariff { message } => write!(f, "Invalid tariff: {message}"),
            ErrorDetails::InvalidTokenCount { api_key, tokens } => {
                write!(f, "Invalid token count {tokens} for API key {api_key}")
            }
            ErrorDetails::Observability { message } => write!(f, "{message}"),
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::UnknownTariffPlan { plan_name } => {
                write!(
                    f,
                    "Unknown tariff plan: `{plan_name}`. Expected one of basic, premium, enterprise, unlimited"
                )
            }
            ErrorDetails::Unrecoverable { operation, message } => {
                write!(
                    f,
                    "Both the counter backend and the fallback store failed during `{operation}`: {message}"
                )
            }
        }
    }
}
