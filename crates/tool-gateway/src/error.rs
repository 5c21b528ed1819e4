use ai_agent::ToolInvokeError;

/// Convenient result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors raised by the tool gateway. Failures reported by a backend itself
/// (a SQL syntax error, a failing script) are not errors here; they come
/// back as error-kind tool results.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    /// Connection parameters are missing or malformed.
    #[error("invalid configuration for backend `{backend}`: {reason}")]
    BackendConfig {
        /// Name of the offending registration.
        backend: String,
        /// What is wrong with it.
        reason: String,
    },
    /// No backend is registered under this name.
    #[error("unknown backend `{0}`")]
    UnknownBackend(String),
    /// The backend does not expose the requested operation.
    #[error("backend `{backend}` has no operation `{operation}`")]
    UnknownOperation {
        /// Backend that was asked.
        backend: String,
        /// Operation that does not exist.
        operation: String,
    },
    /// The backend is disabled, down, or failed to connect.
    #[error("backend `{backend}` is unavailable: {reason}")]
    BackendUnavailable {
        /// Backend name.
        backend: String,
        /// Last known cause.
        reason: String,
    },
    /// The call exceeded its deadline and was abandoned.
    #[error("`{operation}` on backend `{backend}` timed out after {timeout_ms} ms")]
    OperationTimeout {
        /// Backend name.
        backend: String,
        /// Operation name.
        operation: String,
        /// Deadline that was exceeded.
        timeout_ms: u64,
    },
    /// The backend answered with something that is not a valid response.
    #[error("protocol error from backend `{backend}`: {detail}")]
    Protocol {
        /// Backend name.
        backend: String,
        /// Decoder message.
        detail: String,
    },
}

impl GatewayError {
    pub(crate) fn config(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::BackendConfig {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        GatewayError::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }
}

impl From<GatewayError> for ToolInvokeError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::UnknownBackend(name) => ToolInvokeError::UnknownBackend(name),
            GatewayError::UnknownOperation { backend, operation } => {
                ToolInvokeError::UnknownOperation { backend, operation }
            }
            GatewayError::BackendUnavailable { backend, reason } => {
                ToolInvokeError::BackendUnavailable { backend, reason }
            }
            GatewayError::OperationTimeout {
                backend,
                operation,
                timeout_ms,
            } => ToolInvokeError::Timeout {
                backend,
                operation,
                timeout_ms,
            },
            GatewayError::Protocol { backend, detail } => ToolInvokeError::BackendUnavailable {
                backend,
                reason: format!("unreadable response: {detail}"),
            },
            other @ GatewayError::BackendConfig { .. } => ToolInvokeError::Fatal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_misconfiguration_is_fatal_to_a_run() {
        let protocol: ToolInvokeError = GatewayError::Protocol {
            backend: "db".into(),
            detail: "expected a JSON-RPC object".into(),
        }
        .into();
        assert!(protocol.is_recoverable());

        let config: ToolInvokeError = GatewayError::config("db", "missing endpoint").into();
        assert!(!config.is_recoverable());
    }
}
