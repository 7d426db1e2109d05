use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("host not ready: {0}")]
    HostNotReady(String),

    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error("vm is {actual}, expected {expected}")]
    State {
        actual: &'static str,
        expected: &'static str,
    },

    #[error("guest rejected run: {0}")]
    GuestRejected(String),

    #[error("guest protocol error: {0}")]
    GuestProtocol(String),

    #[error("guest health check timed out after {0:?}")]
    HealthTimeout(Duration),

    #[error("event stream closed before a terminal event")]
    StreamClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmError>;
