//! API routes and handlers

pub mod auth;
pub mod files;
pub mod internal;
pub mod queue;
pub mod request_context;
mod router;

pub use router::create_router;
