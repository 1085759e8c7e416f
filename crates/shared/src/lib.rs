//! Shared types for the eventsub client: wire models and the API error taxonomy.

pub mod error;
pub mod models;

pub use error::*;
pub use models::*;
