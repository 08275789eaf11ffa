//! Worker task scheduler (component G).
//!
//! Tasks are dispatched into named priority lanes (`very-high` through
//! `snail`), each with its own concurrency cap and a maximum time budget
//! per chunk. A periodic examiner tick compares each running task's
//! elapsed time against its (table, chunk)'s historical share of total
//! scan time and boots tasks that are running away, escalating a query
//! to the snail lane once it's been booted too many times.

pub mod examiner;
pub mod lanes;

pub use examiner::Examiner;
pub use lanes::{Lane, LaneName, Scheduler};
