//! Implements the Revi client-side application-monitoring agent.
//!
//! The `revi` crate holds the vocabulary (events, trace context,
//! configuration, errors); this crate holds the machinery:
//!
//! * **Capture** — the [`capture::Monitor`] entry points, network
//!   interception ([`capture::network`]), performance recording
//!   ([`capture::performance`]) and the breadcrumb timeline
//!   ([`breadcrumbs`]).
//! * **Grouping** — error normalization and fingerprinting
//!   ([`fingerprint`]).
//! * **Resilience** — sampling ([`sampler`]), compaction/compression
//!   ([`compress`]), retry ([`retry`]), circuit breaking ([`circuit`]),
//!   health probing ([`health`]), the persistent offline queue ([`store`]),
//!   reconnect drains ([`sync`]), idempotent submission ([`idempotency`])
//!   and the coordinator wiring them together ([`coordinator`]).
//! * **Replay** — DOM snapshots and the incremental change stream
//!   ([`replay`]).
//!
//! # Getting Started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use revi::config::MonitorConfig;
//! use revi_sdk::capture::{CaptureOptions, HostInfo, Monitor};
//! use revi_sdk::testing::MockHttpClient;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let monitor = Monitor::builder(MonitorConfig::new("pk_live_1234"))
//!     .with_http_client(Arc::new(MockHttpClient::new()))
//!     .with_host_info(HostInfo {
//!         user_agent: "my-app/1.0".into(),
//!         viewport_width: 1280,
//!         viewport_height: 720,
//!     })
//!     .build();
//!
//! monitor.capture_message("it lives", CaptureOptions::default());
//! monitor.flush().await;
//! monitor.destroy();
//! # }
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

pub mod breadcrumbs;
pub mod capture;
pub mod circuit;
pub mod compress;
pub mod coordinator;
pub mod fingerprint;
pub mod health;
pub mod idempotency;
pub mod ids;
pub mod replay;
pub mod retry;
pub mod runtime;
pub mod sampler;
pub mod store;
pub mod sync;
pub mod testing;
pub mod transport;

pub use capture::{CaptureOptions, HostInfo, Monitor, MonitorBuilder};
pub use coordinator::{ResilienceCoordinator, SubmitReceipt};
pub use runtime::CancelToken;
