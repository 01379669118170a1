//! HTTP surface for Drophost: upload and download pipelines plus server
//! scaffolding.

pub mod download;
pub mod server;
pub mod upload;

pub use server::{build_router, start_server, AppState, SharedState};
