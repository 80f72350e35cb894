//! REST API module for external integrations
//!
//! Exposes health, metrics and status, and accepts relation changes that
//! are forwarded to the controller loop.

mod dto;
mod handlers;
mod server;

pub use dto::{AcceptedResponse, ErrorResponse, HealthResponse, RelationRequest};
pub use server::{router, run_server, ApiState};
