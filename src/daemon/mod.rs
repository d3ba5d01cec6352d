//! Runtime layer: fan-out bus, authentication gate, connection handling,
//! wire protocol, and metrics.

pub mod auth;
pub mod broadcast;
pub mod ipc;
pub mod metrics;
pub mod server;
pub mod stream;

pub use auth::{AuthError, AuthGate, KeyedDigestVerifier, RequestClass, TokenVerifier};
pub use broadcast::{BusError, EventBus, Subscription};
pub use ipc::{IpcError, Request, RequestEnvelope, Response, ResponsePayload};
pub use server::{ServerState, run_server};
pub use stream::{CloseReason, ConnectionPhase};
