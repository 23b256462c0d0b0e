//! Service lifecycle management
//!
//! Long-lived sandboxes that other operations bind to by hostname. The
//! manager de-duplicates them per (session, fingerprint), probes them until
//! healthy and keeps them alive for a grace period after their last user
//! goes away.

pub mod expose;
pub mod health;
mod hostname;
pub mod manager;
mod spec;
pub mod state;

pub use expose::{PortBinding, PortMapping};
pub use health::{HealthCheck, HealthPolicy};
pub use hostname::hostname_for;
pub use manager::{ServiceLease, ServiceManager};
pub use spec::{ServiceMount, ServiceSpec};
pub use state::ServiceState;
