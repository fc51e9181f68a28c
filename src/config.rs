use std::time::Duration;

/// `io_direct_flags` bit disabling `prefetch_buffer`'s smgr prefetch hint.
pub const IO_DIRECT_DISABLE_PREFETCH: u32 = 1 << 0;
/// `io_direct_flags` bit disabling writeback hints (`schedule_writeback`,
/// the background writer's/checkpointer's post-flush writeback call).
pub const IO_DIRECT_DISABLE_WRITEBACK: u32 = 1 << 1;

/// Fixed-at-construction configuration for a `BufferPool`. There is no hot
/// reload: changing any of these fields means building a new pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// `shared_buffers`: number of descriptor/payload slots, fixed for the
    /// life of the pool.
    pub shared_buffers: usize,
    /// Number of partitions in the buffer mapping index.
    pub page_table_partitions: usize,
    /// 0 disables the background writer's LRU scan.
    pub bgwriter_lru_maxpages: usize,
    pub bgwriter_lru_multiplier: f64,
    pub bgwriter_delay: Duration,
    /// 0 disables writeback hints at that call site.
    pub checkpoint_flush_after: usize,
    pub bgwriter_flush_after: usize,
    pub backend_flush_after: usize,
    pub checkpoint_completion_target: f64,
    pub zero_damaged_pages: bool,
    pub track_io_timing: bool,
    pub checksums_enabled: bool,
    pub data_directory: String,
    /// Bound on `invalidate`'s busy-wait for a pinned, being-written buffer.
    /// See SPEC_FULL.md §9, open question 1.
    pub invalidate_wait_timeout: Duration,
    /// Prefetch depth for ordinary backend reads; 0 disables `prefetch_buffer`.
    pub effective_io_concurrency: usize,
    /// Prefetch depth for maintenance operations (checkpoint/bgwriter
    /// writeback hints); 0 disables them.
    pub maintenance_io_concurrency: usize,
    /// Bitmask of `IO_DIRECT_DISABLE_*` flags forcing prefetch and/or
    /// writeback hints off regardless of the concurrency settings above.
    pub io_direct_flags: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shared_buffers: 16384,
            page_table_partitions: 128,
            bgwriter_lru_maxpages: 100,
            bgwriter_lru_multiplier: 2.0,
            bgwriter_delay: Duration::from_millis(200),
            checkpoint_flush_after: 32,
            bgwriter_flush_after: 64,
            backend_flush_after: 0,
            checkpoint_completion_target: 0.9,
            zero_damaged_pages: false,
            track_io_timing: false,
            checksums_enabled: true,
            data_directory: "./data".to_string(),
            invalidate_wait_timeout: Duration::from_secs(30),
            effective_io_concurrency: 1,
            maintenance_io_concurrency: 1,
            io_direct_flags: 0,
        }
    }
}

/// Fluent builder for `PoolConfig`, mirroring the validate-on-`build` shape
/// used throughout this codebase's configuration types.
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    pub fn shared_buffers(mut self, n: usize) -> Self {
        self.config.shared_buffers = n;
        self
    }

    pub fn page_table_partitions(mut self, n: usize) -> Self {
        self.config.page_table_partitions = n;
        self
    }

    pub fn bgwriter_lru_maxpages(mut self, n: usize) -> Self {
        self.config.bgwriter_lru_maxpages = n;
        self
    }

    pub fn bgwriter_lru_multiplier(mut self, m: f64) -> Self {
        self.config.bgwriter_lru_multiplier = m;
        self
    }

    pub fn bgwriter_delay(mut self, d: Duration) -> Self {
        self.config.bgwriter_delay = d;
        self
    }

    pub fn checkpoint_completion_target(mut self, t: f64) -> Self {
        self.config.checkpoint_completion_target = t;
        self
    }

    pub fn zero_damaged_pages(mut self, v: bool) -> Self {
        self.config.zero_damaged_pages = v;
        self
    }

    pub fn checksums_enabled(mut self, v: bool) -> Self {
        self.config.checksums_enabled = v;
        self
    }

    pub fn data_directory(mut self, dir: impl Into<String>) -> Self {
        self.config.data_directory = dir.into();
        self
    }

    pub fn invalidate_wait_timeout(mut self, d: Duration) -> Self {
        self.config.invalidate_wait_timeout = d;
        self
    }

    pub fn effective_io_concurrency(mut self, n: usize) -> Self {
        self.config.effective_io_concurrency = n;
        self
    }

    pub fn maintenance_io_concurrency(mut self, n: usize) -> Self {
        self.config.maintenance_io_concurrency = n;
        self
    }

    pub fn io_direct_flags(mut self, flags: u32) -> Self {
        self.config.io_direct_flags = flags;
        self
    }

    pub fn build(self) -> Result<PoolConfig, String> {
        if self.config.shared_buffers == 0 {
            return Err("shared_buffers must be > 0".to_string());
        }
        if self.config.page_table_partitions == 0 {
            return Err("page_table_partitions must be > 0".to_string());
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_shared_buffers() {
        let err = PoolConfigBuilder::new().shared_buffers(0).build();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_zero_partitions() {
        let err = PoolConfigBuilder::new()
            .shared_buffers(16)
            .page_table_partitions(0)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn builder_defaults_are_valid() {
        assert!(PoolConfigBuilder::new().build().is_ok());
    }
}
