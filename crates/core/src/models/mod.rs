//! Data models for Tally

mod ids;
mod participant;
mod record;

pub use ids::*;
pub use participant::*;
pub use record::*;
