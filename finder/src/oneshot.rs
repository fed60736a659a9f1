//! One-shot search flow
//!
//! resolve modes → launch → bind clients → search/fetch → evidence + summary
//! → shutdown. Processes are always shut down before returning.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{mode_summary, resolve_service_modes, ServersConfig};
use crate::pipeline::{
    FetchedDocument, GenericAdapter, Pipeline, PipelineOutput, RetryPolicy, SearchRequest,
    Warnings, MAX_RESULTS_PER_SERVICE,
};
use crate::process::{default_base_env, RuntimeStatus, Supervisor, SupervisorOptions};
use crate::rpc::DEFAULT_CALL_TIMEOUT;
use crate::summary::{summarize_fail_soft, Summarizer, SummaryResult, DEFAULT_SUMMARY_TIMEOUT};

#[derive(Debug, Clone)]
pub struct OneshotOptions {
    pub question: String,
    pub force_fallback: bool,
    pub max_results: usize,
    pub readiness_timeout: Duration,
    pub call_timeout: Duration,
    /// Bound on the search/fetch stages
    pub deadline: Option<Duration>,
    pub policy: RetryPolicy,
}

impl OneshotOptions {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            force_fallback: false,
            max_results: MAX_RESULTS_PER_SERVICE,
            readiness_timeout: Duration::from_secs(10),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            deadline: None,
            policy: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct OneshotResult {
    pub modes: String,
    pub documents: Vec<FetchedDocument>,
    pub summary: SummaryResult,
    pub warnings: Warnings,
}

/// Run the full flow against `config`
pub async fn run_oneshot(
    config: &ServersConfig,
    options: &OneshotOptions,
    summarizer: Option<&dyn Summarizer>,
) -> OneshotResult {
    let mut warnings = Warnings::new();
    let base_env = default_base_env();

    let resolved = resolve_service_modes(&config.services, options.force_fallback, true, &base_env);
    for decision in resolved.values() {
        if let Some(warning) = &decision.warning {
            warnings.push_quiet(warning.clone());
        }
    }
    let modes = mode_summary(&resolved);
    tracing::info!("Service modes: {}", modes);

    let supervisor = Supervisor::new(
        config.services.clone(),
        resolved,
        SupervisorOptions {
            readiness_timeout: options.readiness_timeout,
            base_env,
            ..Default::default()
        },
    );
    let mut statuses = supervisor.launch_all().await;

    let pipeline = bind_ready_services(&supervisor, &mut statuses, options, &mut warnings);
    let requests: Vec<SearchRequest> = pipeline
        .services()
        .into_iter()
        .map(|service| SearchRequest::new(service, options.question.clone(), options.max_results))
        .collect();

    let output = if requests.is_empty() {
        warnings.push("no tool server is ready; nothing to search");
        PipelineOutput::default()
    } else {
        match options.deadline {
            Some(deadline) => pipeline.run_with_deadline(&requests, deadline).await,
            None => pipeline.run(&requests).await,
        }
    };
    drop(pipeline);
    warnings.extend(output.warnings);

    let summary = summarize_fail_soft(
        &options.question,
        &output.documents,
        summarizer,
        DEFAULT_SUMMARY_TIMEOUT,
        &mut warnings,
    )
    .await;

    supervisor.shutdown(&mut statuses).await;

    OneshotResult {
        modes,
        documents: output.documents,
        summary,
        warnings,
    }
}

/// Hand each ready service's pipes to an RPC client and bind it
fn bind_ready_services(
    supervisor: &Supervisor,
    statuses: &mut BTreeMap<String, RuntimeStatus>,
    options: &OneshotOptions,
    warnings: &mut Warnings,
) -> Pipeline {
    let mut pipeline = Pipeline::new(options.policy);

    for (name, status) in statuses.iter_mut() {
        if !status.ready {
            let reason = status
                .warning
                .as_deref()
                .or(status.error.as_deref())
                .unwrap_or("not ready");
            warnings.push(format!("{} unavailable: {}", name, reason));
            continue;
        }

        let (Some(process), Some(definition)) =
            (status.process.as_mut(), supervisor.definition(name))
        else {
            continue;
        };
        let client = match process.take_client(name) {
            Ok(client) => client,
            Err(e) => {
                warnings.push(format!("{} unavailable: {}", name, e));
                continue;
            }
        };

        let client = client.with_call_timeout(options.call_timeout);
        pipeline.bind(
            name.clone(),
            Arc::new(client),
            Arc::new(GenericAdapter::new(definition.adapter.clone())),
        );
    }

    pipeline
}
