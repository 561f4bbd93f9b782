#![forbid(unsafe_code)]

//! Lock-light building blocks shared by the MVCC table and vacuum.

mod queue;
mod seqlock;

pub use queue::BoundedQueue;
pub use seqlock::SeqRing;
