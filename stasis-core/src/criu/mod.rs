//! CRIU engine integration.
//!
//! The engine runs as an external coprocess in swrk mode; this module owns
//! the wire schema, the transport that drives it, and the typed callback
//! dispatch it raises mid-operation.

pub mod notify;
pub mod rpc;
pub mod transport;

pub use notify::{Callback, CheckpointHooks, NoopHooks};
pub use rpc::{CriuOpts, CriuReqType, CriuResp};
pub use transport::{send_fd, Criu, MAX_MSG_SIZE, MAX_NAME_LEN};
