//! Czar-side chunk query dispatch (components I/J).

pub mod dispatcher;
pub mod query_request;
pub mod server;

pub use dispatcher::{ChunkQueryDispatcher, DispatcherState};
pub use query_request::QueryRequest;
pub use server::CzarManagementServer;
