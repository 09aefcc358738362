//! 缓存失效

mod generation;
mod listener;

pub use generation::PartitionGenerations;
pub use listener::{HandleOutcome, InvalidationListener};
