use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::cache::{CacheStats, TtlCache};

// ---------------------------------------------------------------------------
// FileContext
// ---------------------------------------------------------------------------

/// Who depends on a file, and what it depends on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactGraph {
    pub dependents: Vec<String>,
    pub dependencies: Vec<String>,
}

/// Recent-change summary for a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileHistory {
    pub recent_commits: Vec<String>,
    pub change_frequency: u32,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Size/complexity metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetrics {
    pub lines: u32,
    pub complexity: f64,
}

/// Everything the analyzer knows about one file. The core treats this as
/// an opaque value; only the analyzer produces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileContext {
    pub path: String,
    #[serde(default)]
    pub impact_graph: Option<ImpactGraph>,
    #[serde(default)]
    pub history: Option<FileHistory>,
    #[serde(default)]
    pub metrics: Option<FileMetrics>,
    #[serde(default)]
    pub learned_patterns: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

/// What to include in an analysis request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextOptions {
    pub include_impact: bool,
    pub include_history: bool,
    pub include_patterns: bool,
    /// Bypass the cache and re-analyze.
    pub force_refresh: bool,
}

// ---------------------------------------------------------------------------
// Analyzer contract
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("analysis failed for {path}: {message}")]
    Failed { path: String, message: String },
}

/// The external codebase analyzer. The core only consumes this contract;
/// parsing and dependency graphs live with the collaborator behind it.
#[async_trait]
pub trait CodebaseAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        path: &str,
        options: ContextOptions,
    ) -> Result<FileContext, AnalyzerError>;
}

// ---------------------------------------------------------------------------
// CodebaseContextService
// ---------------------------------------------------------------------------

const CACHE_MAX_ENTRIES: usize = 1000;
const CACHE_TTL_SECONDS: i64 = 300;

/// Read-through cached facade over a [`CodebaseAnalyzer`].
///
/// `force_scan` swaps in a fresh cache generation atomically; readers that
/// already hold the old generation finish against it undisturbed.
pub struct CodebaseContextService {
    analyzer: Arc<dyn CodebaseAnalyzer>,
    cache: RwLock<Arc<TtlCache<FileContext>>>,
}

impl CodebaseContextService {
    pub fn new(analyzer: Arc<dyn CodebaseAnalyzer>) -> Self {
        Self {
            analyzer,
            cache: RwLock::new(Arc::new(TtlCache::new(CACHE_MAX_ENTRIES, CACHE_TTL_SECONDS))),
        }
    }

    async fn current_cache(&self) -> Arc<TtlCache<FileContext>> {
        Arc::clone(&*self.cache.read().await)
    }

    /// Fetch context for a file, analyzing on a cache miss (or always,
    /// with `force_refresh`).
    pub async fn get_file_context(
        &self,
        path: &str,
        options: ContextOptions,
    ) -> Result<FileContext, AnalyzerError> {
        let cache = self.current_cache().await;

        if !options.force_refresh {
            if let Some(context) = cache.get(path) {
                return Ok(context);
            }
        }

        let context = self.analyzer.analyze(path, options).await?;
        cache.set(path, context.clone(), None);
        Ok(context)
    }

    /// Drop the cached context for one file.
    pub async fn invalidate_file(&self, path: &str) -> bool {
        self.current_cache().await.invalidate(path)
    }

    /// Prefetch contexts for a set of paths concurrently. Failures are
    /// logged and skipped; returns the number warmed.
    pub async fn warm(&self, paths: &[String]) -> usize {
        let results = join_all(paths.iter().map(|path| {
            let path = path.clone();
            async move {
                let outcome = self
                    .get_file_context(&path, ContextOptions::default())
                    .await;
                (path, outcome)
            }
        }))
        .await;

        let mut warmed = 0;
        for (path, outcome) in results {
            match outcome {
                Ok(_) => warmed += 1,
                Err(e) => warn!(path = %path, error = %e, "cache warm-up failed"),
            }
        }
        debug!(warmed, total = paths.len(), "cache warm-up complete");
        warmed
    }

    /// Invalidate everything via a two-generation swap: a new empty cache
    /// replaces the old one; concurrent readers keep the generation they
    /// already hold.
    pub async fn force_scan(&self) {
        let fresh = Arc::new(TtlCache::new(CACHE_MAX_ENTRIES, CACHE_TTL_SECONDS));
        let mut cache = self.cache.write().await;
        *cache = fresh;
        debug!("codebase context cache reset (generation swap)");
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.current_cache().await.stats()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAnalyzer {
        calls: AtomicUsize,
        fail_paths: Vec<String>,
    }

    impl CountingAnalyzer {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_paths: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl CodebaseAnalyzer for CountingAnalyzer {
        async fn analyze(
            &self,
            path: &str,
            options: ContextOptions,
        ) -> Result<FileContext, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_paths.iter().any(|p| p == path) {
                return Err(AnalyzerError::Failed {
                    path: path.to_string(),
                    message: "unparseable".into(),
                });
            }
            Ok(FileContext {
                path: path.to_string(),
                impact_graph: options.include_impact.then(ImpactGraph::default),
                recommendations: vec!["add tests".into()],
                analyzed_at: Some(Utc::now()),
                ..FileContext::default()
            })
        }
    }

    #[tokio::test]
    async fn read_through_caches_results() {
        let analyzer = Arc::new(CountingAnalyzer::new());
        let service = CodebaseContextService::new(Arc::clone(&analyzer) as Arc<dyn CodebaseAnalyzer>);

        let first = service
            .get_file_context("src/lib.rs", ContextOptions::default())
            .await
            .unwrap();
        let second = service
            .get_file_context("src/lib.rs", ContextOptions::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        let stats = service.cache_stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let analyzer = Arc::new(CountingAnalyzer::new());
        let service = CodebaseContextService::new(Arc::clone(&analyzer) as Arc<dyn CodebaseAnalyzer>);

        service
            .get_file_context("src/lib.rs", ContextOptions::default())
            .await
            .unwrap();
        service
            .get_file_context(
                "src/lib.rs",
                ContextOptions {
                    force_refresh: true,
                    ..ContextOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reanalysis() {
        let analyzer = Arc::new(CountingAnalyzer::new());
        let service = CodebaseContextService::new(Arc::clone(&analyzer) as Arc<dyn CodebaseAnalyzer>);

        service
            .get_file_context("src/lib.rs", ContextOptions::default())
            .await
            .unwrap();
        assert!(service.invalidate_file("src/lib.rs").await);
        service
            .get_file_context("src/lib.rs", ContextOptions::default())
            .await
            .unwrap();

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_prefetches_and_skips_failures() {
        let analyzer = Arc::new(CountingAnalyzer {
            calls: AtomicUsize::new(0),
            fail_paths: vec!["src/broken.rs".into()],
        });
        let service = CodebaseContextService::new(Arc::clone(&analyzer) as Arc<dyn CodebaseAnalyzer>);

        let warmed = service
            .warm(&["src/a.rs".into(), "src/b.rs".into(), "src/broken.rs".into()])
            .await;
        assert_eq!(warmed, 2);

        // Warmed entries are cache hits now.
        service
            .get_file_context("src/a.rs", ContextOptions::default())
            .await
            .unwrap();
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn force_scan_resets_the_cache() {
        let analyzer = Arc::new(CountingAnalyzer::new());
        let service = CodebaseContextService::new(Arc::clone(&analyzer) as Arc<dyn CodebaseAnalyzer>);

        service
            .get_file_context("src/lib.rs", ContextOptions::default())
            .await
            .unwrap();
        service.force_scan().await;
        service
            .get_file_context("src/lib.rs", ContextOptions::default())
            .await
            .unwrap();

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
        // Fresh generation starts with clean stats.
        assert_eq!(service.cache_stats().await.hits, 0);
    }

    #[tokio::test]
    async fn options_shape_the_result() {
        let analyzer = Arc::new(CountingAnalyzer::new());
        let service = CodebaseContextService::new(analyzer as Arc<dyn CodebaseAnalyzer>);

        let context = service
            .get_file_context(
                "src/lib.rs",
                ContextOptions {
                    include_impact: true,
                    ..ContextOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(context.impact_graph.is_some());
        assert_eq!(context.recommendations, vec!["add tests".to_string()]);
    }
}
