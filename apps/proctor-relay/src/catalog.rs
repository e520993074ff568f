use std::collections::HashSet;

use async_trait::async_trait;

/// Answers whether a test is currently open for proctoring.
#[async_trait]
pub trait TestCatalog: Send + Sync {
    async fn is_active(&self, test_id: i64) -> bool;
}

/// Accepts every test id. Used when no catalog is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenCatalog;

#[async_trait]
impl TestCatalog for OpenCatalog {
    async fn is_active(&self, _test_id: i64) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    active: HashSet<i64>,
}

impl StaticCatalog {
    pub fn new(active: impl IntoIterator<Item = i64>) -> Self {
        Self {
            active: active.into_iter().collect(),
        }
    }
}

#[async_trait]
impl TestCatalog for StaticCatalog {
    async fn is_active(&self, test_id: i64) -> bool {
        self.active.contains(&test_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_catalog_only_knows_listed_tests() {
        let catalog = StaticCatalog::new([3, 7]);
        assert!(catalog.is_active(7).await);
        assert!(!catalog.is_active(8).await);
        assert!(OpenCatalog.is_active(8).await);
    }
}
