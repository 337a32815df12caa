use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{DEFAULT_DATA_DIR, SEND_TIMEOUT_SECS};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    /// Budget for a remote write to acknowledge before the send is failed.
    pub send_timeout: Duration,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            send_timeout: Duration::from_secs(SEND_TIMEOUT_SECS),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}
