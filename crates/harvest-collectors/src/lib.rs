//! # Harvest Collectors
//!
//! Concrete [`Processor`](harvest_core::traits::Processor) adapters, one per
//! API surface. Each adapter translates its native errors into
//! [`ItemError`](harvest_core::traits::ItemError) exactly once.

pub mod http;

pub use http::{HttpJsonProcessor, StatusClass, classify_status, sanitize_item};
