//! CLI command implementations.

pub mod cache;
pub mod deps;
pub mod pull;
pub mod push;
pub mod resolve;
pub mod vendor;
