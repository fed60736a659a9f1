//! Summarization boundary
//!
//! The language-model summarizer lives outside this crate; it plugs in
//! through [`Summarizer`]. [`summarize_fail_soft`] never fails: on error or
//! timeout it records a warning and falls back to a plain document list.

use std::time::Duration;

use async_trait::async_trait;

use crate::evidence::{format_evidence_links, EvidenceLink};
use crate::pipeline::{FetchedDocument, Warnings};

/// Upper bound on one summarizer call
pub const DEFAULT_SUMMARY_TIMEOUT: Duration = Duration::from_secs(60);

/// Produces markdown from a question and fetched documents
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, question: &str, documents: &[FetchedDocument]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryResult {
    pub markdown: String,
    pub links: Vec<EvidenceLink>,
    pub used_fallback: bool,
}

/// Markdown listing each document's title, service and URI
pub fn fallback_markdown(documents: &[FetchedDocument]) -> String {
    let mut lines = vec!["## Retrieved documents (fallback)".to_string()];
    if documents.is_empty() {
        lines.push("- no documents could be retrieved".to_string());
    }
    for document in documents {
        let uri = match document.uri.trim() {
            "" => "URI missing",
            uri => uri,
        };
        lines.push(format!("- {} ({}): {}", document.title, document.service, uri));
    }
    lines.join("\n")
}

/// Summarize with `summarizer` when given, falling back to [`fallback_markdown`]
pub async fn summarize_fail_soft(
    question: &str,
    documents: &[FetchedDocument],
    summarizer: Option<&dyn Summarizer>,
    timeout: Duration,
    warnings: &mut Warnings,
) -> SummaryResult {
    let links = format_evidence_links(documents, warnings);

    if let Some(summarizer) = summarizer {
        match tokio::time::timeout(timeout, summarizer.summarize(question, documents)).await {
            Ok(Ok(markdown)) => {
                return SummaryResult {
                    markdown,
                    links,
                    used_fallback: false,
                }
            }
            Ok(Err(e)) => warnings.push(format!("summary failed: {:#}", e)),
            Err(_) => warnings.push(format!(
                "summary timeout after {:.1}s",
                timeout.as_secs_f64()
            )),
        }
    }

    SummaryResult {
        markdown: fallback_markdown(documents),
        links,
        used_fallback: true,
    }
}
