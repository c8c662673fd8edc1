pub mod mentor;
pub mod models;
pub mod paths;

pub use mentor::MentorConfig;
pub use models::{ModelLimits, ModelTable, ResetTimezone, DEFAULT_DAILY_LIMIT, DEFAULT_MODEL};
pub use paths::ConfigPaths;
