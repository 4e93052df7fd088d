//! Narrow interfaces between the engine and its collaborators.

pub mod notifier;
pub mod processor;
pub mod store;

pub use notifier::Notifier;
pub use processor::{ItemError, Processed, Processor};
pub use store::BatchStore;
