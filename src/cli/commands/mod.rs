//! CLI command implementations

pub mod cache;
pub mod config;
pub mod run;
pub mod status;
pub mod validate;

pub use cache::execute as cache;
pub use config::execute as config;
pub use run::execute as run;
pub use status::execute as status;
pub use validate::execute as validate;
