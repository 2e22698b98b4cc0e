//! Core types for the Revi client-side application monitoring agent.
//!
//! Revi runs inside an end-user application, captures errors, user
//! interactions, network traffic, performance metrics and a visual record of
//! the page, and forwards that telemetry to an ingestion service with strong
//! delivery guarantees over unreliable networks.
//!
//! This crate holds the vocabulary the rest of the agent speaks: event
//! shapes, trace context, the propagation codec, the configuration record and
//! the error taxonomy. It performs no I/O and spawns no tasks — the capture
//! and delivery machinery lives in the `revi-sdk` crate, and the HTTP client
//! abstraction in `revi-http`.
//!
//! # Getting Started
//!
//! ```
//! use revi::config::MonitorConfig;
//! use revi::event::{Breadcrumb, BreadcrumbCategory};
//!
//! let config = MonitorConfig::new("pk_live_1234")
//!     .with_api_url("https://ingest.example.com")
//!     .with_sample_rate(0.25);
//! assert!(config.validate().is_ok());
//!
//! let crumb = Breadcrumb::new("route change")
//!     .with_category(BreadcrumbCategory::Navigation)
//!     .with_data("to", "/settings");
//! # drop(crumb);
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]

pub mod common;
pub mod config;
pub mod error;
pub mod event;
pub mod propagation;
pub mod trace;

pub use common::{now_millis, Value};
pub use config::MonitorConfig;
pub use error::{AgentError, AgentResult};
pub use event::{
    Breadcrumb, BreadcrumbCategory, ErrorEvent, EventId, EventKind, NetworkEvent, Priority,
    SessionEvent, Severity, UserContext,
};
