pub mod client;
pub mod metrics;
pub mod migrations;
pub mod record;
pub mod reducer;
pub mod state;
pub mod store;
pub mod tracker;

pub use client::{HttpUsageClient, Session, SyncError, UsageBackend};
pub use metrics::TimeMetrics;
pub use record::{AlertLevel, CallEvent, CallRecord, RequestOrigin};
pub use reducer::{alert_level_for, reduce, UsageAction};
pub use state::UsageState;
pub use store::{DailyTotal, UsageStats, UsageStore};
pub use tracker::{TrackerOptions, UsageTracker};
