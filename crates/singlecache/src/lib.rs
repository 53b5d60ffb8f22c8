//! Time-bounded call coalescing.
//!
//! This crate provides:
//! - [`Group`]: a per-key registry of in-flight calls; concurrent callers for
//!   the same key share one execution of an expensive operation while its
//!   join window is open
//! - Blocking ([`Group::do_call`]) and channel ([`Group::do_chan`]) delivery
//! - [`Group::forget`] to force the next caller onto a fresh execution
//! - Lock-free [`CoalesceMetrics`] and env-driven [`GroupConfig`]
//!
//! Results are not cached: once a call completes its entry is gone.
//!
//! ```
//! use std::time::Duration;
//! use singlecache::Group;
//!
//! let users: Group<String, String, String> = Group::new();
//! let r = users.do_call("user:42".into(), Duration::from_secs(1), || {
//!     Ok("alice".to_string())
//! });
//! assert_eq!(r.result.as_deref(), Ok("alice"));
//! assert!(!r.shared);
//! ```

#![forbid(unsafe_code)]

pub mod call;
pub mod clock;
pub mod config;
pub mod error;
pub mod group;
pub mod metrics;

pub use call::CallResult;
pub use clock::{Clock, Expiry, ManualClock, SystemClock};
pub use config::{DEFAULT_GROUP_NAME, GroupConfig};
pub use error::{ConfigError, GroupError, GroupResult};
pub use group::Group;
pub use metrics::CoalesceMetrics;
