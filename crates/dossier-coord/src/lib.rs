pub mod allocator;
pub mod case;
pub mod config;
pub mod error;
pub mod gates;
pub mod ledger;
pub mod lock;
pub mod merge;
pub mod registry;
pub mod signature;

#[cfg(test)]
mod test_support;

pub use allocator::AllocationStatusReport;
pub use case::Case;
pub use config::{CoordConfig, LockConfig};
pub use error::CoordError;
pub use gates::{DerivedGates, Evaluation, NextAction};
pub use lock::{LockGuard, LockManager};
pub use merge::{Batch, BatchResults, MergeReport};
pub use signature::Verification;
