//! Built-in job catalogue.
//!
//! These handlers cover the platform's task surface. The bodies are
//! thin: the real recommendation, training, and analysis work lives in
//! external collaborators, so each handler validates its arguments,
//! logs, and reports an outcome. `cleanup_expired_results` is the one
//! exception with a real body, sweeping the result store.

use std::sync::Arc;

use crate::error::Result;

use super::{
    Backoff, FnHandler, JobRegistry, JobSpec, Outcome, Priority, ResultStore, RetryPolicy,
};

/// Register the full built-in catalogue.
pub fn register_builtin_jobs(
    registry: &mut JobRegistry,
    store: Arc<dyn ResultStore>,
) -> Result<()> {
    registry.register(
        JobSpec::new("generate_user_recommendations")
            .priority(Priority::high())
            .retry(RetryPolicy::with_attempts(3)),
        Arc::new(FnHandler(|job_id, args: Vec<serde_json::Value>, _cancel| async move {
            let Some(user_id) = args.first().and_then(|v| v.as_str()) else {
                return Outcome::PermanentFailure("expected user id as first argument".into());
            };
            tracing::info!(%job_id, user_id, "Generating user recommendations");
            Outcome::Success(serde_json::json!({ "user_id": user_id, "generated": true }))
        })),
    )?;

    registry.register(
        JobSpec::new("generate_daily_recommendations")
            .priority(Priority::high())
            .retry(RetryPolicy::with_attempts(3)),
        Arc::new(FnHandler(|job_id, _args, _cancel| async move {
            tracing::info!(%job_id, "Running daily recommendation refresh");
            Outcome::Success(serde_json::json!({ "refreshed": true }))
        })),
    )?;

    registry.register(
        JobSpec::new("retrain_collaborative_model").retry(RetryPolicy::heavy()),
        Arc::new(FnHandler(|job_id, _args, _cancel| async move {
            tracing::info!(%job_id, "Retraining collaborative filtering model");
            Outcome::Success(serde_json::json!({ "model": "collaborative", "retrained": true }))
        })),
    )?;

    registry.register(
        JobSpec::new("retrain_content_model").retry(RetryPolicy::heavy()),
        Arc::new(FnHandler(|job_id, _args, _cancel| async move {
            tracing::info!(%job_id, "Retraining content-based model");
            Outcome::Success(serde_json::json!({ "model": "content", "retrained": true }))
        })),
    )?;

    registry.register(
        JobSpec::new("analyze_cv")
            .priority(Priority::high())
            .retry(RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::fixed(60),
            }),
        Arc::new(FnHandler(|job_id, args: Vec<serde_json::Value>, _cancel| async move {
            let Some(document_id) = args.first().and_then(|v| v.as_str()) else {
                return Outcome::PermanentFailure("expected document id as first argument".into());
            };
            tracing::info!(%job_id, document_id, "Analyzing CV");
            Outcome::Success(serde_json::json!({ "document_id": document_id, "analyzed": true }))
        })),
    )?;

    registry.register(
        JobSpec::new("extract_user_features").retry(RetryPolicy::with_attempts(3)),
        Arc::new(FnHandler(|job_id, _args, _cancel| async move {
            tracing::info!(%job_id, "Extracting user features");
            Outcome::Success(serde_json::json!({ "extracted": true }))
        })),
    )?;

    let cleanup_store = store.clone();
    registry.register(
        JobSpec::new("cleanup_expired_results")
            .priority(Priority::low())
            .retry(RetryPolicy::no_retry()),
        Arc::new(FnHandler(move |job_id, _args, _cancel| {
            let store = cleanup_store.clone();
            async move {
                match store.purge_expired().await {
                    Ok(purged) => {
                        tracing::info!(%job_id, purged, "Purged expired results");
                        Outcome::Success(serde_json::json!({ "purged": purged }))
                    }
                    Err(e) => Outcome::TransientFailure(format!("purge failed: {}", e)),
                }
            }
        })),
    )?;

    registry.register(
        JobSpec::new("aggregate_interaction_stats")
            .priority(Priority::low())
            .retry(RetryPolicy::with_attempts(2)),
        Arc::new(FnHandler(|job_id, _args, _cancel| async move {
            tracing::info!(%job_id, "Aggregating interaction statistics");
            Outcome::Success(serde_json::json!({ "aggregated": true }))
        })),
    )?;

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Handler, InMemoryResultStore, JobId, JobResult};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn catalogue() -> (JobRegistry, Arc<InMemoryResultStore>) {
        let store = Arc::new(InMemoryResultStore::with_ttl(Duration::from_millis(20)));
        let mut registry = JobRegistry::new();
        register_builtin_jobs(&mut registry, store.clone()).unwrap();
        (registry, store)
    }

    #[test]
    fn test_catalogue_is_complete() {
        let (registry, _) = catalogue();
        for name in [
            "generate_user_recommendations",
            "generate_daily_recommendations",
            "retrain_collaborative_model",
            "retrain_content_model",
            "analyze_cv",
            "extract_user_features",
            "cleanup_expired_results",
            "aggregate_interaction_stats",
        ] {
            assert!(registry.contains(name), "missing builtin: {}", name);
        }
        assert_eq!(registry.len(), 8);
    }

    #[tokio::test]
    async fn test_recommendations_require_user_id() {
        let (registry, _) = catalogue();
        let handler = registry
            .resolve("generate_user_recommendations")
            .unwrap()
            .handler
            .clone();

        let outcome = handler
            .run(JobId::new(), &[], CancellationToken::new())
            .await;
        assert!(matches!(outcome, Outcome::PermanentFailure(_)));

        let outcome = handler
            .run(JobId::new(), &[serde_json::json!("user-7")], CancellationToken::new())
            .await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_cleanup_purges_store() {
        let (registry, store) = catalogue();
        store
            .record(JobResult::succeeded(
                JobId::new(),
                "analyze_cv",
                serde_json::json!(null),
                1,
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let handler = registry
            .resolve("cleanup_expired_results")
            .unwrap()
            .handler
            .clone();
        let outcome = handler
            .run(JobId::new(), &[], CancellationToken::new())
            .await;
        match outcome {
            Outcome::Success(payload) => assert_eq!(payload["purged"], 1),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_heavy_jobs_use_exponential_backoff() {
        let (registry, _) = catalogue();
        let policy = &registry
            .resolve("retrain_collaborative_model")
            .unwrap()
            .spec
            .retry_policy;
        assert!(matches!(policy.backoff, Backoff::Exponential { .. }));
    }
}
