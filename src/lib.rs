//! Kiln - lazy content-addressed build and service executor
//!
//! Evaluates graphs of filesystem, exec and service operations inside
//! rootless sandboxes. Results are memoised by fingerprint, identical work
//! runs once across concurrent clients, and secrets reach sandboxes without
//! ever being persisted.

pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod debug;
pub mod engine;
pub mod error;
pub mod graph;
pub mod runtime;
pub mod secrets;
pub mod service;
pub mod session;
pub mod store;
pub mod ui;

pub use engine::{Engine, EngineSession, EvaluationReport};
pub use error::{KilnError, KilnResult};
