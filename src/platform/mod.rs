//! Host integration: connectivity signals and the async runtime used for background work.

pub mod connectivity;
pub mod runtime;

pub use connectivity::Connectivity;
