//! Client-side state stores.

pub mod errors;
pub mod loading;

pub use errors::{ErrorChannel, ErrorNotice, ErrorSubscription, Severity};
pub use loading::LoadingRegistry;
