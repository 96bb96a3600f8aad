//! Error types for microvmd.
//!
//! # Error Message Style
//!
//! - **Format**: `"<operation> failed: <reason>"` or `"<entity> not found: <identifier>"`
//! - **Case**: all lowercase
//! - **Context**: include the relevant identifier (instance id, image reference,
//!   command name) when available
//!
//! Subprocess failures carry the tool's combined stdout/stderr so the HTTP
//! layer can surface the underlying cause verbatim.

use thiserror::Error;

/// Result type alias using microvmd's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at the engine boundary.
///
/// Each variant corresponds to a distinct failure kind the control plane
/// reports; the HTTP layer maps them to machine-readable codes.
#[derive(Error, Debug)]
pub enum Error {
    /// Container-image to raw-disk conversion failed (pull, create,
    /// allocate, mkfs, mount, export).
    #[error("image preparation failed: {0}")]
    Image(String),

    /// TAP or iptables provisioning failed.
    #[error("network provisioning failed: {0}")]
    Network(String),

    /// Per-instance disk copy failed.
    #[error("disk copy failed: {0}")]
    DiskCopy(String),

    /// Cloud-init user-data/meta-data rendering or ISO packing failed.
    #[error("seed generation failed: {0}")]
    Seed(String),

    /// Loop-mount credential injection failed. Downgraded to a warning by
    /// the manager since cloud-init is the primary credential path.
    #[error("credential injection failed: {0}")]
    Inject(String),

    /// The hypervisor child could not be spawned.
    #[error("hypervisor launch failed: {0}")]
    Launch(String),

    /// No instance with the given id in the table.
    #[error("instance not found: {id}")]
    InstanceNotFound {
        /// Id that was not found.
        id: String,
    },

    /// Manage action outside {start, stop, reboot}.
    #[error("unknown action: {action}")]
    UnknownAction {
        /// The rejected action string.
        action: String,
    },

    /// The guest address pool (172.16.0.3-172.16.0.255) is used up for this
    /// agent lifetime. Allocations are never recycled.
    #[error("address pool exhausted: {0}")]
    AddressPoolExhausted(String),

    /// External command failed, with its combined output attached.
    #[error("command '{command}' failed: {reason}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Combined stdout/stderr or spawn error.
        reason: String,
    },

    /// Configuration load/save failed.
    #[error("config operation failed: {operation}: {reason}")]
    Config {
        /// The operation that failed (e.g. "load", "save").
        operation: String,
        /// The reason for the failure.
        reason: String,
    },

    /// IO error wrapper.
    #[error("io operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an image preparation error.
    pub fn image(reason: impl Into<String>) -> Self {
        Self::Image(reason.into())
    }

    /// Create a network provisioning error.
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network(reason.into())
    }

    /// Create a disk copy error.
    pub fn disk_copy(reason: impl Into<String>) -> Self {
        Self::DiskCopy(reason.into())
    }

    /// Create a seed generation error.
    pub fn seed(reason: impl Into<String>) -> Self {
        Self::Seed(reason.into())
    }

    /// Create a credential injection error.
    pub fn inject(reason: impl Into<String>) -> Self {
        Self::Inject(reason.into())
    }

    /// Create a hypervisor launch error.
    pub fn launch(reason: impl Into<String>) -> Self {
        Self::Launch(reason.into())
    }

    /// Create an instance not found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::InstanceNotFound { id: id.into() }
    }

    /// Create an unknown action error.
    pub fn unknown_action(action: impl Into<String>) -> Self {
        Self::UnknownAction {
            action: action.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Create a config operation error.
    pub fn config(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_includes_id() {
        let err = Error::not_found("b2c4");
        let msg = err.to_string();
        assert!(msg.contains("b2c4"), "error should include the id");
        assert!(msg.contains("not found"));
    }

    #[test]
    fn test_unknown_action_includes_action() {
        let err = Error::unknown_action("suspend");
        assert!(err.to_string().contains("suspend"));
    }

    #[test]
    fn test_command_failed_includes_command_and_reason() {
        let err = Error::command_failed("iptables", "chain missing");
        let msg = err.to_string();
        assert!(msg.contains("iptables"));
        assert!(msg.contains("chain missing"));
    }

    #[test]
    fn test_all_errors_are_lowercase() {
        let errors: Vec<Error> = vec![
            Error::image("x"),
            Error::network("x"),
            Error::disk_copy("x"),
            Error::seed("x"),
            Error::inject("x"),
            Error::launch("x"),
            Error::not_found("x"),
            Error::unknown_action("x"),
            Error::AddressPoolExhausted("x".into()),
            Error::command_failed("x", "y"),
            Error::config("x", "y"),
        ];
        for err in errors {
            let msg = err.to_string();
            let first = msg.chars().next().unwrap();
            assert!(
                first.is_lowercase(),
                "error message should start lowercase: {}",
                msg
            );
        }
    }

    #[test]
    fn test_operation_errors_contain_failed() {
        let errors: Vec<Error> = vec![
            Error::image("x"),
            Error::network("x"),
            Error::disk_copy("x"),
            Error::seed("x"),
            Error::inject("x"),
            Error::launch("x"),
            Error::command_failed("x", "y"),
        ];
        for err in errors {
            assert!(
                err.to_string().contains("failed"),
                "operation error should contain 'failed': {}",
                err
            );
        }
    }
}
