//! Concurrent search/fetch pipeline
//!
//! - [`Pipeline`]: two fan-out stages over bound services
//! - [`RetryPolicy`]: timeout, backoff and skip rules shared by every remote call
//! - [`ServiceAdapter`]: per-service interpretation of raw results
//! - [`Warnings`]: caller-owned accumulator returned with the documents

mod adapter;
mod retry;
mod runner;
mod warnings;

pub use adapter::{
    content_text, FetchAction, GenericAdapter, MappedResult, SearchHit, SearchRequest,
    ServiceAdapter, SNIPPET_MAX_CHARS,
};
pub use retry::{
    classify_failure, AttemptTimeout, FailureKind, RetryOutcome, RetryPolicy, SkipReason,
    DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_BACKOFF_START, DEFAULT_MAX_ATTEMPTS,
};
pub use runner::{FetchedDocument, Pipeline, PipelineOutput, MAX_RESULTS_PER_SERVICE};
pub use warnings::Warnings;
