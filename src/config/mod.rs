#[derive(Debug, Clone, Copy)]
pub struct BufferPoolConfig {
    pub buffer_pool_size: usize,
    pub lru_k_k: usize,
    /// Capacity of each bucket in the page-id directory.
    pub page_table_bucket_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        BufferPoolConfig {
            buffer_pool_size: 1000,
            lru_k_k: 2,
            page_table_bucket_size: 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IoSchedulerConfig {
    /// Number of I/O worker threads.
    pub workers: usize,
}

impl IoSchedulerConfig {
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(4)
    }
}

impl Default for IoSchedulerConfig {
    fn default() -> Self {
        IoSchedulerConfig {
            workers: Self::default_workers(),
        }
    }
}
