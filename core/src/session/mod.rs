// Session module: per-connection state and its owning store

pub mod state;
pub mod store;

pub use state::{ConnectionState, SessionContext};
pub use store::{SessionStats, SessionStore};
