//! Hierarchical multi-granularity locking.
//!
//! Three layers, leaf to root:
//!
//! - [`LockKind`]: the lattice of lock modes with its compatibility,
//!   parent-child, and substitutability tables.
//! - [`LockManager`]: flat per-resource grant lists and FIFO wait queues;
//!   knows nothing about hierarchy.
//! - [`LockContext`]: a tree node over a [`ResourceName`] enforcing the
//!   multigranularity rules and child-lock accounting on top of the
//!   manager; [`lock_util::ensure_sufficient_lock_held`] drives it
//!   declaratively.
//!
//! Waiting is conservative: a request that cannot be granted blocks the
//! calling thread until the queue reaches it. There is no deadlock
//! detection; callers order acquisitions top-down through the context tree.

mod context;
mod kind;
pub mod lock_util;
mod manager;
mod resource;

pub use context::LockContext;
pub use kind::LockKind;
pub use manager::{Lock, LockManager};
pub use resource::ResourceName;
