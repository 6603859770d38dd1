//! Hierarchy-free timer scheduling: an indexed deadline heap driven by a
//! dedicated ticking thread, exposed through a cloneable command handle.

mod heap;
mod wheel;

pub use heap::TimerHeap;
pub use wheel::{granularity_for, TimerWheel};
