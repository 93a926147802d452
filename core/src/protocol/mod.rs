// Protocol module: the reader's authentication state machine

pub mod handler;

pub use handler::{HandleOutcome, HandlerConfig, PendingCredential, ProtocolHandler};
