//! Numbered evidence links for fetched documents

use crate::pipeline::{FetchedDocument, Warnings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceLink {
    pub number: usize,
    pub title: String,
    pub service: String,
    pub uri: String,
}

impl EvidenceLink {
    /// `[n] title (service)` followed by the URI on its own line
    pub fn markdown(&self) -> String {
        format!("[{}] {} ({})\n{}", self.number, self.title, self.service, self.uri)
    }
}

/// Number links from 1 across services, dropping duplicate URIs
///
/// Documents without a URI are left out and reported in `warnings`.
pub fn format_evidence_links(
    documents: &[FetchedDocument],
    warnings: &mut Warnings,
) -> Vec<EvidenceLink> {
    let mut links: Vec<EvidenceLink> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for document in documents {
        let uri = document.uri.trim();
        if uri.is_empty() {
            warnings.push(format!(
                "URI missing for {} ({})",
                document.title, document.service
            ));
            continue;
        }
        if !seen.insert(uri.to_string()) {
            continue;
        }

        links.push(EvidenceLink {
            number: links.len() + 1,
            title: document.title.clone(),
            service: document.service.clone(),
            uri: uri.to_string(),
        });
    }

    links
}
