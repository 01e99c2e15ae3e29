//! Retrace - Record-and-Replay Testing Engine
//!
//! A testing engine for networked applications that records real traffic
//! and replays it later, providing:
//!
//! - **Capture**: reconstructs complete HTTP exchanges from intercepted
//!   byte streams and turns them into test cases
//! - **Transparent Proxy**: records outbound dependency calls (HTTP, gRPC,
//!   Mongo) as mocks, or synthesizes the dependencies back from the store
//! - **Replay**: re-drives recorded requests against the application and
//!   compares responses structurally under a configurable noise policy
//! - **Reports**: per-test diffs rolled up into per-set and per-run verdicts
//!
//! # Configuration
//!
//! Retrace is configured via YAML or TOML files:
//!
//! ```yaml
//! command: "python app.py"
//! path: "./recordings"
//! delay: 5
//! api_timeout: 10
//! global_noise:
//!   global:
//!     header.Date: []
//! ```

pub mod capture;
pub mod compare;
pub mod config;
pub mod error;
pub mod instrument;
pub mod mocks;
pub mod models;
pub mod proxy;
pub mod record;
pub mod replay;
pub mod shutdown;
pub mod storage;

pub use config::Config;
pub use error::{Result, RetraceError};
pub use record::Recorder;
pub use replay::Replayer;
pub use shutdown::StopHandle;

/// Retrace version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Retrace name
pub const NAME: &str = env!("CARGO_PKG_NAME");
