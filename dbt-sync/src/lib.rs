//! Synchronisation primitives shared by the memory manager and the
//! translation cache.
//!
//! The recursive lock exists because fault recovery can re-enter code-cache
//! mutation while already holding it: a just-committed chunk's page
//! protection step can itself fault on some hosts, and that fault's recovery
//! path needs the same lock the commit path is still holding.

mod reentrant;
mod timed_condition;

pub use reentrant::ReentrantLock;
pub use timed_condition::{GuestCondition, WaitOutcome};
