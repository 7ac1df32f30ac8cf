//! # Core Engine Module
//!
//! Everything between the upstream device API and the shadow store:
//!
//! - **`rate_governor`**: token buckets that gate each class of upstream call.
//! - **`reconciler`**: pure shadow construction, merge and diff.
//! - **`event_bus`**: filtered fan-out of diffs to in-process subscribers.
//! - **`session_manager`**: reference-counted polling sessions with a bounded
//!   number of live slots.
//! - **`fleet_job`**: periodic fleet listing and shadow seeding.
//! - **`fleet_read`** / **`supervisor`**: read path and periodic health logging.

#![forbid(unsafe_code)]

/// Per-class token buckets for upstream calls.
pub mod rate_governor;
/// Shadow construction, merge and field-level diff.
pub mod reconciler;
/// Predicate-filtered diff broadcaster.
pub mod event_bus;
/// The upstream capability the core depends on.
pub mod upstream;
/// Per-device realtime polling with admission control.
pub mod session_manager;
/// Fleet refresh and startup bootstrap.
pub mod fleet_job;
pub mod fleet_read;
pub mod supervisor;

pub use event_bus::{ShadowEventBus, Subscription};
pub use fleet_job::{bootstrap_shadows, FleetAdmissionJob, FleetRefreshReport};
pub use fleet_read::FleetReadService;
pub use rate_governor::{RateBucket, RateGovernor, TokenBucket};
pub use session_manager::{RealtimeSessionManager, SessionSnapshot};
pub use supervisor::{RealtimeSupervisor, SupervisorReport};
pub use upstream::UpstreamApi;
