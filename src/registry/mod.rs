//! Service registry (component F).
//!
//! A directory of workers, czars, and controllers that each periodically
//! re-registers itself over HTTP. The registry never evicts a stale entry
//! on its own; staleness detection is left to whoever reads the directory
//! (`is_stale`), matching the real service's separation between "the
//! registry records what it's told" and "callers decide what's too old to
//! trust."

pub mod server;
pub mod state;

pub use state::{is_stale, RegistryState};
