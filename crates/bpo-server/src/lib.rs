//! HTTP server for the bpo build coordinator.
//!
//! Receives push hooks and job callbacks, checks their tokens and hands them
//! to the scheduler. All state lives in the scheduler and its store.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

#[cfg(test)]
mod testing;

pub use state::AppState;
