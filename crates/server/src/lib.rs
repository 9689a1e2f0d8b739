//! HTTP server for parcel.
//!
//! This crate provides:
//! - the upload and file lifecycle engine
//! - the background cleaning routine
//! - the HTTP API over both

pub mod auth;
pub mod cleaning;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod routes;
pub mod state;

pub use auth::TraceId;
pub use cleaning::{CleaningEngine, CleaningReport, PassStats};
pub use error::ApiError;
pub use lifecycle::{Lifecycle, LifecycleError};
pub use routes::create_router;
pub use state::AppState;
