//! Error types for feed capture and lap history.
//!
//! All errors implement the `std::error::Error` trait and carry enough context
//! for the caller to decide between retrying, fixing its request, or reporting
//! an internal failure.
//!
//! ## Error Categories
//!
//! - **Connection Errors**: The live timing feed dropped or could not be opened
//! - **Decode Errors**: A single feed frame could not be understood
//! - **Validation Errors**: A caller supplied an incomplete payload or query
//! - **Persistence Errors**: The record store rejected a read or write
//! - **Config Errors**: Startup configuration is unreadable or inconsistent
//!
//! Absence of data is *not* an error. Unknown drivers, unknown sessions and
//! empty progressions are reported through [`Lookup`](crate::Lookup) and empty
//! collections instead.
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use kartwall::KartwallError;
//!
//! let error = KartwallError::connection_failed("feed host unreachable");
//! assert!(error.is_retryable());
//! assert!(!error.is_caller_error());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::ParseFailure;

/// Result type alias for kartwall operations.
pub type Result<T, E = KartwallError> = std::result::Result<T, E>;

/// Main error type for kartwall operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KartwallError {
    #[error("Feed connection failed: {reason}")]
    Connection {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Feed frame rejected: {0}")]
    Decode(#[from] ParseFailure),

    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("External user {external_user_id} is already linked to driver '{linked_driver}'")]
    IdentityConflict { external_user_id: String, linked_driver: String },

    #[error("Record store failure during {operation}: {details}")]
    Persistence {
        operation: String,
        details: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Configuration error in {}: {details}", path.display())]
    Config { path: PathBuf, details: String },
}

impl KartwallError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            KartwallError::Connection { .. } => true,
            KartwallError::Timeout { .. } => true,
            KartwallError::Decode(_) => false,
            KartwallError::Validation { .. } => false,
            KartwallError::IdentityConflict { .. } => false,
            KartwallError::Persistence { .. } => false,
            KartwallError::Config { .. } => false,
        }
    }

    /// Returns whether the caller caused this error and should fix its request.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, KartwallError::Validation { .. } | KartwallError::IdentityConflict { .. })
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            KartwallError::Connection { .. } => vec![
                "Check that the timing feed host is reachable",
                "Verify the feed port is not blocked by a firewall",
                "Wait for the automatic reconnect to succeed",
            ],
            KartwallError::Decode(_) => vec![
                "Check the feed vendor format version",
                "Inspect the raw frame in debug logs",
            ],
            KartwallError::Validation { .. } => vec![
                "Provide every required parameter for the action",
                "Check the session payload shape",
            ],
            KartwallError::IdentityConflict { .. } => vec![
                "Unlink the external user from the other driver first",
                "Verify the driver name being linked",
            ],
            KartwallError::Persistence { .. } => vec![
                "Check the record store is available",
                "Verify free disk space for the store path",
                "Retry the request once the store recovers",
            ],
            KartwallError::Timeout { .. } => vec![
                "Increase the connect timeout",
                "Check network latency to the feed host",
            ],
            KartwallError::Config { .. } => vec![
                "Check the configuration file syntax",
                "Compare values against the documented defaults",
            ],
        }
    }

    /// Helper constructor for connection errors.
    pub fn connection_failed(reason: impl Into<String>) -> Self {
        KartwallError::Connection { reason: reason.into(), source: None }
    }

    /// Helper constructor for connection errors with source.
    pub fn connection_failed_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        KartwallError::Connection { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for validation errors.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        KartwallError::Validation { field: field.into(), reason: reason.into() }
    }

    /// Helper constructor for a required parameter that was not supplied.
    pub fn missing(field: impl Into<String>) -> Self {
        Self::validation(field, "is required")
    }

    /// Helper constructor for persistence errors.
    pub fn persistence(operation: impl Into<String>, details: impl Into<String>) -> Self {
        KartwallError::Persistence { operation: operation.into(), details: details.into(), source: None }
    }

    /// Helper constructor for persistence errors with source.
    pub fn persistence_with_source(
        operation: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        KartwallError::Persistence {
            operation: operation.into(),
            details: source.to_string(),
            source: Some(source),
        }
    }

    /// Helper constructor for configuration errors.
    pub fn config(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        KartwallError::Config { path: path.into(), details: details.into() }
    }
}

impl From<sled::Error> for KartwallError {
    fn from(err: sled::Error) -> Self {
        KartwallError::persistence_with_source("sled", Box::new(err))
    }
}

impl From<serde_json::Error> for KartwallError {
    fn from(err: serde_json::Error) -> Self {
        KartwallError::persistence_with_source("serialization", Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn error_messages_carry_their_context(
                reason in ".*",
                field in "\\w+",
                operation in "[a-z_]+",
                details in ".*",
            ) {
                let connection = KartwallError::connection_failed(reason.clone());
                let validation = KartwallError::validation(field.clone(), reason.clone());
                let persistence = KartwallError::persistence(operation.clone(), details.clone());

                prop_assert!(connection.to_string().contains(&reason));
                prop_assert!(validation.to_string().contains(&field));
                prop_assert!(persistence.to_string().contains(&operation));
                prop_assert!(persistence.to_string().contains(&details));
            }

            #[test]
            fn source_chain_reaches_the_root_cause(
                base_message in "[a-z ]{1,20}",
                depth in 1usize..5usize,
            ) {
                let mut current: Box<dyn std::error::Error + Send + Sync> =
                    Box::new(std::io::Error::other(base_message.clone()));
                for level in 0..depth {
                    current = Box::new(KartwallError::connection_failed_with_source(
                        format!("level {}", level),
                        current,
                    ));
                }

                let mut found = false;
                let root: &(dyn std::error::Error + 'static) = current.as_ref();
                let mut cursor = Some(root);
                let mut hops = 0;
                while let Some(err) = cursor {
                    if err.to_string() == base_message {
                        found = true;
                    }
                    cursor = err.source();
                    hops += 1;
                    if hops > 10 {
                        break;
                    }
                }
                prop_assert!(found);
            }
        }
    }

    #[test]
    fn classification_separates_caller_and_transient_errors() {
        assert!(KartwallError::connection_failed("x").is_retryable());
        assert!(KartwallError::Timeout { duration: Duration::from_secs(1) }.is_retryable());
        assert!(!KartwallError::persistence("upsert", "disk full").is_retryable());

        assert!(KartwallError::missing("sessionId").is_caller_error());
        assert!(
            KartwallError::IdentityConflict {
                external_user_id: "u1".into(),
                linked_driver: "Max".into()
            }
            .is_caller_error()
        );
        assert!(!KartwallError::persistence("upsert", "disk full").is_caller_error());
    }

    #[test]
    fn missing_parameter_message_names_the_field() {
        let err = KartwallError::missing("webUserId");
        assert_eq!(err.to_string(), "Invalid webUserId: is required");
    }

    #[test]
    fn every_variant_offers_recovery_guidance() {
        let errors = [
            KartwallError::connection_failed("x"),
            KartwallError::Decode(ParseFailure::Empty),
            KartwallError::missing("name"),
            KartwallError::persistence("cleanup", "locked"),
            KartwallError::Timeout { duration: Duration::from_millis(5) },
            KartwallError::config("kartwall.toml", "bad port"),
        ];
        for error in &errors {
            let suggestions = error.recovery_suggestions();
            assert!(!suggestions.is_empty(), "no guidance for {error}");
            assert!(suggestions.iter().all(|s| s.len() > 5));
        }
    }

    #[test]
    fn error_is_send_sync_static() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<KartwallError>();
    }

    #[test]
    fn serde_errors_become_persistence_failures() {
        let err: KartwallError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, KartwallError::Persistence { .. }));
    }
}
