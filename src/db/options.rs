use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DbOptions {
    /// How often the background worker folds base buffers into the trees
    /// and publishes a new state block.
    pub persist_interval: Duration,
    /// Checker age clock period; transactions older than `MAX_AGE` ticks
    /// are aborted.
    pub tick_interval: Duration,
    /// Run the quick integrity check when opening an existing file.
    pub check_on_open: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(1),
            tick_interval: Duration::from_secs(1),
            check_on_open: true,
        }
    }
}
