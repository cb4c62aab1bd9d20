// src/config.rs
// Tunables a caller sets when creating or opening a forest. Everything
// here is programmatic; the core consults no environment variables
// (spec section on external interfaces is explicit about that).

/// Configuration for [`crate::forest::Forest::create`] and
/// [`crate::forest::Forest::open`].
///
/// `node_size` and `key_size` are forest-wide and fixed at creation.
/// `read_cache_size` and `upload_queue_size` tune the disk store's two
/// LRU caches and may be changed freely between opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForestConfig {
    pub node_size: usize,
    pub key_size: u8,
    pub read_cache_size: usize,
    pub upload_queue_size: usize,
}

impl ForestConfig {
    pub fn new(key_size: u8, node_size: usize) -> Self {
        ForestConfig {
            node_size,
            key_size,
            read_cache_size: 500,
            upload_queue_size: 1024,
        }
    }

    pub fn with_read_cache_size(mut self, size: usize) -> Self {
        self.read_cache_size = size;
        self
    }

    pub fn with_upload_queue_size(mut self, size: usize) -> Self {
        self.upload_queue_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ForestConfig::new(4, 128);
        assert_eq!(cfg.read_cache_size, 500);
        assert_eq!(cfg.upload_queue_size, 1024);
    }
}
