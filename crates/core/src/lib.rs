//! Tally Core Library
//!
//! Session model, canonical state operations, auto-reveal rules, liveness
//! classification, configuration and storage for Tally planning-poker rooms.

pub mod config;
mod countdown;
pub mod error;
pub mod invariants;
pub mod liveness;
pub mod models;
pub mod session;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
pub use liveness::{LivenessThresholds, LivenessTracker};
pub use models::*;
pub use session::{JoinOutcome, SessionState};
pub use storage::{Database, IdentityProvider, SessionGateway};
