// TextMatch - near-duplicate text detection engine
// Core library module

pub mod api;
pub mod client;
pub mod document;
pub mod error;
pub mod matcher;
pub mod posting;
pub mod queue;
pub mod registry;
pub mod store;

pub use error::{MatchError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
