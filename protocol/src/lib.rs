//! Protocol-level building blocks for the HQV BLE↔UDP/LwM2M bridge: the
//! link-layer codec, the control-channel framing, the wire command/response
//! types, process-wide session state, and (behind the `reqwest` feature) the
//! Leshan HTTP client. Everything here is transport-agnostic — no BLE, TCP
//! or UDP sockets are opened from this crate; `hqv-agent` wires it to real
//! I/O.

pub mod command;
pub mod control_codec;
pub mod error;
pub mod event;
pub mod hqv_codec;
#[cfg(feature = "reqwest")]
pub mod leshan;
pub mod session_state;

pub use error::{AgentError, Result};
