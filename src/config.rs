#[derive(Debug, Clone)]
pub struct Config {
    /// Number of frames each table's page cache may keep resident.
    pub page_cache_frames: usize,
    /// Whether log appends are fsynced before the mutation becomes visible.
    pub sync_log: bool,
    /// Capacity of the bounded channel carrying join results.
    pub join_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_cache_frames: 1024,
            sync_log: true,
            join_channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Trades durability for speed; suitable for bulk loads and tests.
    pub fn relaxed() -> Self {
        Self {
            sync_log: false,
            ..Self::default()
        }
    }
}
