//! Queue routing: job name → queue name via pattern matching.

use serde::{Deserialize, Serialize};

/// A routing rule. `pattern` is either an exact job name or a prefix
/// with a trailing `*` wildcard (`retrain_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub pattern: String,
    pub queue: String,
}

impl Route {
    pub fn new(pattern: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            queue: queue.into(),
        }
    }

    fn matches(&self, job_name: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => job_name.starts_with(prefix),
            None => job_name == self.pattern,
        }
    }

    /// Specificity for most-specific-first ordering: exact matches beat
    /// any wildcard, longer prefixes beat shorter ones.
    fn specificity(&self) -> (bool, usize) {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => (false, prefix.len()),
            None => (true, self.pattern.len()),
        }
    }
}

/// Resolves the queue a job belongs to. Deterministic and
/// side-effect-free; routes are loaded once at startup.
#[derive(Debug, Clone)]
pub struct QueueRouter {
    routes: Vec<Route>,
    default_queue: String,
}

impl QueueRouter {
    pub fn new(mut routes: Vec<Route>, default_queue: impl Into<String>) -> Self {
        routes.sort_by(|a, b| b.specificity().cmp(&a.specificity()));
        Self {
            routes,
            default_queue: default_queue.into(),
        }
    }

    /// Route a job name to its queue, falling back to the default.
    pub fn route(&self, job_name: &str) -> &str {
        self.routes
            .iter()
            .find(|r| r.matches(job_name))
            .map(|r| r.queue.as_str())
            .unwrap_or(&self.default_queue)
    }

    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// The platform's standard route table: each task family flows to
    /// its dedicated queue.
    pub fn platform_default() -> Self {
        Self::new(
            vec![
                Route::new("generate_*", "recommendations"),
                Route::new("retrain_*", "training"),
                Route::new("analyze_*", "analysis"),
                Route::new("extract_*", "features"),
                Route::new("cleanup_*", "maintenance"),
                Route::new("aggregate_*", "maintenance"),
            ],
            "default",
        )
    }
}
