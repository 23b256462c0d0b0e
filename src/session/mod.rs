//! Session management module
//!
//! A session scopes service de-duplication and debug attachment to one
//! client connection. Closing it releases its services through the grace
//! path.

pub mod registry;
pub mod state;

pub use registry::SessionRegistry;
pub use state::{Session, SessionId, SessionStatus};
