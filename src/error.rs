//! Error types for the scanner bot

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the scanner bot
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Missing exchange credentials: {0}")]
    MissingCredentials(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    // Position management errors
    #[error("Position persistence failed: {0}")]
    PositionPersistence(String),

    // Scanner errors
    #[error("Candidate scan failed: {0}")]
    Scan(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error should never be retried against the exchange
    pub fn is_order_permanent(&self) -> bool {
        matches!(
            self,
            Error::OrderRejected(_)
                | Error::InsufficientBalance { .. }
                | Error::UnknownInstrument(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_order_errors() {
        let err = Error::InsufficientBalance {
            available: 1000.0,
            required: 5500.0,
        };
        assert!(err.is_order_permanent());
        assert!(err.to_string().contains("5500"));
        assert!(Error::OrderRejected("bad side".into()).is_order_permanent());
        assert!(Error::UnknownInstrument("KRW-FOO".into()).is_order_permanent());
    }

    #[test]
    fn test_transient_errors_are_retried() {
        assert!(!Error::Gateway("502".into()).is_order_permanent());
        assert!(!Error::Io("connection reset".into()).is_order_permanent());
    }
}
