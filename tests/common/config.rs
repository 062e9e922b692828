//! Test configuration helpers

use post_dl::{Config, Runner, Session};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Config rooted in `temp_dir` with every delay disabled and a single attempt per file
pub fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.download_dir = temp_dir.path().join("downloads");
    config.download.post_delay = Duration::ZERO;
    config.retry.max_attempts = 1;
    config.extraction.detail_cache_dir = None;
    config.extraction.favorites_delay = Duration::ZERO;
    config.pipeline.queue_capacity = 2;
    config.pipeline.poll_interval = Duration::from_millis(20);
    config.pipeline.progress_interval = Duration::from_millis(50);
    config.ledger_path = temp_dir.path().join("failed_downloads.txt");
    config
}

/// Runner over `config` with an unauthenticated session
pub fn create_test_runner(config: Config) -> Arc<Runner> {
    let session = Session::new().expect("failed to build HTTP client");
    Arc::new(Runner::new(config, session).expect("test config should be valid"))
}
