//! HTTP front end and debug-session orchestration.
//!
//! Two endpoints: `/healthz` and `/api/v1/debug`. A debug request is
//! validated, upgraded onto the multiplexed stream protocol, and handed to
//! a [`session::DebugSession`], which sequences LXCFS rebinds, the image
//! pull and the namespace-joined debug container through a runtime adapter.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod audit;
pub mod error;
pub mod handlers;
pub mod server;
pub mod session;

pub use error::{Result, ServerError};
pub use server::AgentServer;
