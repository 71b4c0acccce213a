use std::path::PathBuf;

/// Configuration for a single blob.
///
/// `path` is a file prefix, not a directory: a blob owns `<path>.0.data`,
/// `<path>.0.chunk`, `<path>.1.data` and `<path>.1.chunk`.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// File prefix for the two on-disk stores
    pub path: PathBuf,

    /// Bloom filter size per chunk, in bytes (default: 128)
    pub bloom_size: usize,

    /// Records per flush batch; also the write-cache overflow threshold
    /// (default: 1000)
    pub cache_size: usize,

    /// Maximum sparse-index entries kept per chunk (default: 64)
    pub rcache_budget: usize,

    /// Unsorted-chunk count above which the next flush resorts
    /// (default: 50)
    pub resort_threshold: usize,

    /// zstd compression level (default: 3)
    pub compression_level: i32,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./shaledb/blob"),
            bloom_size: 128,
            cache_size: 1000,
            rcache_budget: 64,
            resort_threshold: 50,
            compression_level: 3,
        }
    }
}

impl BlobConfig {
    /// Create a new config with the given file prefix
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set bloom filter size in bytes
    pub fn bloom_size(mut self, size: usize) -> Self {
        self.bloom_size = size;
        self
    }

    /// Set records per flush batch
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Set the per-chunk sparse-index budget
    pub fn rcache_budget(mut self, budget: usize) -> Self {
        self.rcache_budget = budget;
        self
    }

    /// Set the unsorted-chunk resort threshold
    pub fn resort_threshold(mut self, threshold: usize) -> Self {
        self.resort_threshold = threshold;
        self
    }

    /// Set the zstd compression level
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BlobConfig::default();
        assert_eq!(config.bloom_size, 128);
        assert_eq!(config.cache_size, 1000);
        assert_eq!(config.rcache_budget, 64);
        assert_eq!(config.resort_threshold, 50);
    }

    #[test]
    fn test_config_builder() {
        let config = BlobConfig::new("/tmp/blobs/b-00")
            .bloom_size(1024)
            .cache_size(500)
            .rcache_budget(32)
            .resort_threshold(10)
            .compression_level(6);

        assert_eq!(config.path, PathBuf::from("/tmp/blobs/b-00"));
        assert_eq!(config.bloom_size, 1024);
        assert_eq!(config.cache_size, 500);
        assert_eq!(config.rcache_budget, 32);
        assert_eq!(config.resort_threshold, 10);
        assert_eq!(config.compression_level, 6);
    }
}
