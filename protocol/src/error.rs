use thiserror::Error;

/// Crate-wide error type unifying the framing, transport, control and
/// external-service failure classes.
///
/// Library code returns this and propagates with `?`; the process boundary
/// (the agent's `main` and its top-level dispatcher) collapses it into
/// `anyhow::Result`.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("BLE scan did not find the target device")]
    BleScanMiss,

    #[error("BLE connect attempts exhausted")]
    BleConnectFailed,

    #[error("BLE characteristic {uuid} missing required property {required}")]
    BleCharacteristicMissing {
        uuid: uuid::Uuid,
        required: &'static str,
    },

    #[error("UDP send did not complete after retries")]
    UdpShortSend,

    #[error("control protocol error: {0}")]
    ControlProtocol(String),

    #[error("store error: {0}")]
    Store(#[from] serde_json::Error),

    #[cfg(feature = "reqwest")]
    #[error("leshan request failed: {0}")]
    Leshan(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("precondition failed: {0}")]
    Precondition(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
