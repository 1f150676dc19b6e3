//! Error taxonomy for the broker.
//!
//! Every hot-path error is handled locally (logged, counted, retried); only
//! [`BrokerError::Configuration`] and [`BrokerError::FatalListenerConflict`]
//! (plus [`BrokerError::Lifecycle`] at startup) are allowed to terminate the
//! process. Call sites match on variant rather than parsing messages so the
//! propagation policy can be enforced at the type level.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed YAML, a missing required key, or an unparseable upstream host.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Rebind or permission-change failure; retried on the next listener tick.
    #[error("transient listener error: {0}")]
    TransientListener(String),

    /// Another live broker already owns the intake socket path.
    #[error("another broker is already bound to {0}")]
    FatalListenerConflict(std::path::PathBuf),

    /// Bad length prefix or undersized datagram on intake.
    #[error("intake framing error: {0}")]
    IntakeFraming(String),

    /// Connect/resolve/TLS/write/read failure or EOF on the upstream link.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    /// Spool open/lock/read/write failure; records are retained in memory.
    #[error("spool I/O error: {0}")]
    SpoolIo(String),

    /// Pidfile contention, lock failure, or a stale pidfile owned by a live PID.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
}
