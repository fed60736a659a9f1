//! Two-stage search → fetch pipeline
//!
//! Searches fan out across services, results are mapped and capped per
//! service in their original order, then fetches fan out across the mapped
//! results. A failing branch only costs its own output and a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::future::join_all;

use super::adapter::{FetchAction, MappedResult, SearchHit, SearchRequest, ServiceAdapter};
use super::retry::RetryPolicy;
use super::warnings::{drain, record, Warnings};
use crate::rpc::ToolBackend;

/// Per-service cap on mapped results
pub const MAX_RESULTS_PER_SERVICE: usize = 3;

/// Terminal pipeline record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    pub service: String,
    pub kind: String,
    pub title: String,
    pub snippet: String,
    pub uri: String,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub documents: Vec<FetchedDocument>,
    pub warnings: Warnings,
}

struct ServiceBinding {
    backend: Arc<dyn ToolBackend>,
    adapter: Arc<dyn ServiceAdapter>,
}

/// Per-branch warning slots for one run, owned outside the run's future
#[derive(Default)]
struct RunWarnings {
    search: Vec<Mutex<Warnings>>,
    mapping: Mutex<Warnings>,
    fetch: OnceLock<Vec<Mutex<Warnings>>>,
}

impl RunWarnings {
    fn new(searches: usize) -> Self {
        Self {
            search: (0..searches).map(|_| Mutex::default()).collect(),
            ..Default::default()
        }
    }

    /// Everything recorded so far, in stage then input order
    fn collect(&self) -> Warnings {
        let mut merged = Warnings::new();
        let fetch = self.fetch.get().map(Vec::as_slice).unwrap_or_default();
        for slot in self.search.iter().chain([&self.mapping]).chain(fetch) {
            merged.extend(drain(slot));
        }
        merged
    }
}

pub struct Pipeline {
    bindings: HashMap<String, ServiceBinding>,
    policy: RetryPolicy,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Pipeline {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            bindings: HashMap::new(),
            policy,
        }
    }

    /// Register the backend and adapter serving `service`
    pub fn bind(
        &mut self,
        service: impl Into<String>,
        backend: Arc<dyn ToolBackend>,
        adapter: Arc<dyn ServiceAdapter>,
    ) {
        self.bindings
            .insert(service.into(), ServiceBinding { backend, adapter });
    }

    /// Bound service names, sorted
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bindings.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run both stages; `run_with_deadline` bounds the wall clock
    pub async fn run(&self, searches: &[SearchRequest]) -> PipelineOutput {
        let warnings = RunWarnings::new(searches.len());
        let documents = self.run_stages(searches, &warnings).await;
        let warnings = warnings.collect();

        tracing::info!(
            "Pipeline finished: {} document(s), {} warning(s)",
            documents.len(),
            warnings.len()
        );
        PipelineOutput {
            documents,
            warnings,
        }
    }

    /// Like [`Pipeline::run`], abandoning outstanding branches at `deadline`
    ///
    /// Warnings recorded before the deadline are kept; documents are not.
    pub async fn run_with_deadline(
        &self,
        searches: &[SearchRequest],
        deadline: Duration,
    ) -> PipelineOutput {
        let warnings = RunWarnings::new(searches.len());
        let finished = tokio::time::timeout(deadline, self.run_stages(searches, &warnings)).await;

        let mut collected = warnings.collect();
        let documents = match finished {
            Ok(documents) => documents,
            Err(_) => {
                collected.push(format!(
                    "search pipeline deadline exceeded after {:.1}s",
                    deadline.as_secs_f64()
                ));
                Vec::new()
            }
        };

        PipelineOutput {
            documents,
            warnings: collected,
        }
    }

    async fn run_stages(
        &self,
        searches: &[SearchRequest],
        warnings: &RunWarnings,
    ) -> Vec<FetchedDocument> {
        let batches = join_all(
            searches
                .iter()
                .zip(&warnings.search)
                .map(|(request, slot)| self.search_one(request, slot)),
        )
        .await;
        let raw: Vec<(String, SearchHit)> = batches.into_iter().flatten().collect();

        let mapped = self.map_results(raw, &warnings.mapping);
        tracing::debug!("{} mapped result(s) to fetch", mapped.len());

        let fetch_slots = warnings
            .fetch
            .get_or_init(|| (0..mapped.len()).map(|_| Mutex::default()).collect());
        let fetched = join_all(
            mapped
                .iter()
                .zip(fetch_slots)
                .map(|(result, slot)| self.fetch_one(result, slot)),
        )
        .await;

        fetched.into_iter().flatten().collect()
    }

    async fn search_one(
        &self,
        request: &SearchRequest,
        warnings: &Mutex<Warnings>,
    ) -> Vec<(String, SearchHit)> {
        let service = request.service.as_str();

        let Some(binding) = self.bindings.get(service) else {
            record(warnings, format!("no search runner registered for {}", service));
            return Vec::new();
        };

        let capped = SearchRequest {
            max_results: request.max_results.min(MAX_RESULTS_PER_SERVICE),
            ..request.clone()
        };
        let (operation, args) = binding.adapter.search_call(&capped);

        let outcome = self
            .policy
            .run(service, "search", warnings, || {
                binding.backend.invoke(&operation, args.clone())
            })
            .await;
        let Some(raw) = outcome.value else {
            return Vec::new();
        };

        match binding.adapter.parse_hits(service, &raw) {
            Ok(hits) => {
                tracing::debug!("{}: {} raw hit(s)", service, hits.len());
                hits.into_iter()
                    .map(|hit| (service.to_string(), hit))
                    .collect()
            }
            Err(e) => {
                record(
                    warnings,
                    format!("{} search result unusable; skipping: {:#}", service, e),
                );
                Vec::new()
            }
        }
    }

    /// Cap per service, keeping first-seen order, and plan each fetch
    fn map_results(
        &self,
        raw: Vec<(String, SearchHit)>,
        warnings: &Mutex<Warnings>,
    ) -> Vec<MappedResult> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut mapped = Vec::new();

        for (service, hit) in raw {
            let count = counts.entry(service.clone()).or_default();
            if *count >= MAX_RESULTS_PER_SERVICE {
                continue;
            }

            let Some(binding) = self.bindings.get(&service) else {
                record(warnings, format!("{} result dropped: service not bound", service));
                continue;
            };

            *count += 1;
            let fetch = binding.adapter.fetch_action(&hit);
            mapped.push(MappedResult {
                service,
                hit,
                fetch,
            });
        }

        mapped
    }

    async fn fetch_one(
        &self,
        result: &MappedResult,
        warnings: &Mutex<Warnings>,
    ) -> Option<FetchedDocument> {
        let service = result.service.as_str();

        let Some(binding) = self.bindings.get(service) else {
            record(warnings, format!("{} fetch runner missing", service));
            return None;
        };

        let content = match &result.fetch {
            FetchAction::UseSnippet => Some(result.hit.snippet.clone()),
            FetchAction::Invoke { operation, args } => self
                .policy
                .run(service, "fetch", warnings, || {
                    binding.backend.invoke(operation, args.clone())
                })
                .await
                .value
                .map(|raw| binding.adapter.content_text(&raw)),
            FetchAction::ReadResource { uri } => {
                self.policy
                    .run(service, "fetch", warnings, || {
                        binding.backend.read_resource(uri)
                    })
                    .await
                    .value
            }
        };

        content.map(|content| FetchedDocument {
            service: result.service.clone(),
            kind: result.hit.kind.clone(),
            title: result.hit.title.clone(),
            snippet: result.hit.snippet.clone(),
            uri: result.hit.uri.clone(),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::adapter::GenericAdapter;
    use crate::pipeline::retry::SkipReason;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Backend returning `hits` search results and echoing fetch requests
    struct FakeBackend {
        hits: usize,
        search_error: Option<&'static str>,
        fetch_failures: AtomicU32,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl FakeBackend {
        fn new(hits: usize) -> Self {
            Self {
                hits,
                search_error: None,
                fetch_failures: AtomicU32::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolBackend for FakeBackend {
        async fn invoke(&self, operation: &str, arguments: Value) -> anyhow::Result<Value> {
            self.calls
                .lock()
                .unwrap()
                .push((operation.to_string(), arguments.clone()));
            if operation == "search" {
                if let Some(message) = self.search_error {
                    anyhow::bail!("{}", message);
                }
                let hits: Vec<Value> = (0..self.hits)
                    .map(|i| json!({"title": format!("hit {}", i), "uri": format!("doc://{}", i)}))
                    .collect();
                return Ok(json!([{"type": "text", "text": Value::Array(hits).to_string()}]));
            }
            Ok(json!([{"type": "text", "text": format!("body of {}", arguments["uri"])}]))
        }

        async fn read_resource(&self, uri: &str) -> anyhow::Result<String> {
            if self.fetch_failures.load(Ordering::SeqCst) > 0 {
                self.fetch_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into());
            }
            Ok(format!("resource {}", uri))
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            backoff_start: Duration::from_millis(20),
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_caps_results_per_service_in_order() {
        let backend = Arc::new(FakeBackend::new(5));
        let mut pipeline = Pipeline::new(fast_policy());
        pipeline.bind("drive", backend.clone(), Arc::new(GenericAdapter::default()));

        let output = pipeline
            .run(&[SearchRequest::new("drive", "roadmap", 10)])
            .await;

        assert!(output.warnings.is_empty());
        let titles: Vec<&str> = output.documents.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(titles, vec!["hit 0", "hit 1", "hit 2"]);
        assert_eq!(output.documents[1].content, "resource doc://1");
    }

    #[tokio::test]
    async fn test_requested_limit_is_capped_before_search() {
        let backend = Arc::new(FakeBackend::new(1));
        let mut pipeline = Pipeline::new(fast_policy());
        let adapter: GenericAdapter =
            GenericAdapter::new(toml::from_str("limit_param = \"limit\"\nfetch = \"tool\"").unwrap());
        pipeline.bind("github", backend.clone(), Arc::new(adapter));

        let output = pipeline
            .run(&[SearchRequest::new("github", "bug", 50)])
            .await;

        let calls = backend.calls.lock().unwrap();
        assert_eq!(calls[0], ("search".to_string(), json!({"query": "bug", "limit": 3})));
        assert_eq!(calls[1].0, "fetch");
        assert_eq!(output.documents[0].content, "body of \"doc://0\"");
    }

    #[tokio::test]
    async fn test_failing_branch_does_not_abort_siblings() {
        let healthy = Arc::new(FakeBackend::new(2));
        let limited = Arc::new(FakeBackend {
            search_error: Some("HTTP 429: rate limit exceeded"),
            ..FakeBackend::new(2)
        });

        let mut pipeline = Pipeline::new(fast_policy());
        pipeline.bind("drive", healthy, Arc::new(GenericAdapter::default()));
        pipeline.bind("slack", limited.clone(), Arc::new(GenericAdapter::default()));

        let output = pipeline
            .run(&[
                SearchRequest::new("slack", "incident", 3),
                SearchRequest::new("drive", "incident", 3),
                SearchRequest::new("jira", "incident", 3),
            ])
            .await;

        assert_eq!(output.documents.len(), 2);
        assert!(output.documents.iter().all(|d| d.service == "drive"));
        assert_eq!(limited.calls.lock().unwrap().len(), 1);

        let warnings: Vec<&str> = output.warnings.iter().collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("slack search skipped due to rate limit (429)"));
        assert_eq!(warnings[1], "no search runner registered for jira");
        assert_eq!(SkipReason::RateLimit.to_string(), "rate_limit");
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_is_retried() {
        let backend = Arc::new(FakeBackend::new(1));
        backend.fetch_failures.store(1, Ordering::SeqCst);
        let mut pipeline = Pipeline::new(fast_policy());
        pipeline.bind("drive", backend, Arc::new(GenericAdapter::default()));

        let output = pipeline.run(&[SearchRequest::new("drive", "q", 3)]).await;

        assert_eq!(output.documents.len(), 1);
        let warnings: Vec<&str> = output.warnings.iter().collect();
        assert!(warnings[0].starts_with("drive fetch transient error on attempt 1"));
        assert_eq!(warnings[1], "drive fetch succeeded after retry #1");
    }

    #[tokio::test]
    async fn test_snippet_strategy_skips_fetch_call() {
        let backend = Arc::new(FakeBackend::new(2));
        let mut pipeline = Pipeline::new(fast_policy());
        let adapter = GenericAdapter::new(toml::from_str("fetch = \"snippet\"").unwrap());
        pipeline.bind("notes", backend.clone(), Arc::new(adapter));

        let output = pipeline.run(&[SearchRequest::new("notes", "q", 3)]).await;

        assert_eq!(output.documents.len(), 2);
        assert_eq!(backend.calls.lock().unwrap().len(), 1);
    }

    struct Hanging;

    #[async_trait]
    impl ToolBackend for Hanging {
        async fn invoke(&self, _operation: &str, _arguments: Value) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }

        async fn read_resource(&self, _uri: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_deadline_keeps_warnings_from_finished_branches() {
        let limited = Arc::new(FakeBackend {
            search_error: Some("HTTP 429: rate limit exceeded"),
            ..FakeBackend::new(2)
        });
        let mut pipeline = Pipeline::new(fast_policy());
        pipeline.bind("slack", limited, Arc::new(GenericAdapter::default()));
        pipeline.bind("slow", Arc::new(Hanging), Arc::new(GenericAdapter::default()));

        let output = pipeline
            .run_with_deadline(
                &[
                    SearchRequest::new("slack", "q", 3),
                    SearchRequest::new("slow", "q", 3),
                ],
                Duration::from_millis(300),
            )
            .await;

        assert!(output.documents.is_empty());
        let warnings: Vec<&str> = output.warnings.iter().collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("slack search skipped due to rate limit (429)"));
        assert_eq!(warnings[1], "search pipeline deadline exceeded after 0.3s");
    }

    #[tokio::test]
    async fn test_deadline_keeps_retry_warning_of_abandoned_branch() {
        struct ResetThenHang {
            calls: AtomicU32,
        }

        #[async_trait]
        impl ToolBackend for ResetThenHang {
            async fn invoke(&self, _operation: &str, _arguments: Value) -> anyhow::Result<Value> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into());
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }

            async fn read_resource(&self, _uri: &str) -> anyhow::Result<String> {
                Ok(String::new())
            }
        }

        let mut pipeline = Pipeline::new(fast_policy());
        pipeline.bind(
            "github",
            Arc::new(ResetThenHang {
                calls: AtomicU32::new(0),
            }),
            Arc::new(GenericAdapter::default()),
        );

        let output = pipeline
            .run_with_deadline(
                &[SearchRequest::new("github", "q", 3)],
                Duration::from_millis(300),
            )
            .await;

        let warnings: Vec<&str> = output.warnings.iter().collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].starts_with("github search transient error on attempt 1"));
        assert!(warnings[1].contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn test_deadline_abandons_run() {

        let mut pipeline = Pipeline::new(fast_policy());
        pipeline.bind("slow", Arc::new(Hanging), Arc::new(GenericAdapter::default()));

        let output = pipeline
            .run_with_deadline(
                &[SearchRequest::new("slow", "q", 3)],
                Duration::from_millis(100),
            )
            .await;

        assert!(output.documents.is_empty());
        assert!(output
            .warnings
            .iter()
            .next()
            .unwrap()
            .contains("deadline exceeded"));
    }
}
