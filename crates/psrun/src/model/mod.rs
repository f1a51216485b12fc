pub mod config;
pub mod ids;
pub mod paths;
pub mod run;

pub use config::{ElevationConfig, RunnerConfig, RunnerConfigBuilder};
pub use ids::RunId;
pub use paths::{EscapedPath, RunPaths};
pub use run::{RefreshOutcome, RunState, RunSummary};
