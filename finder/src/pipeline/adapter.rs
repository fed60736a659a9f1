//! Per-service result adapters
//!
//! Tool servers disagree about what a search result looks like. A
//! [`ServiceAdapter`] turns one server's raw output into [`SearchHit`]s and
//! decides how each hit's full content is fetched; the pipeline itself never
//! looks inside raw payloads.

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};

use crate::config::{AdapterConfig, FetchStrategy};

/// Snippets longer than this are cut
pub const SNIPPET_MAX_CHARS: usize = 200;

const DEFAULT_KIND: &str = "document";
const DEFAULT_FETCH_TOOL: &str = "fetch";

// ============================================================================
// Records
// ============================================================================

/// One search to run against one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub service: String,
    pub query: String,
    pub max_results: usize,
}

impl SearchRequest {
    pub fn new(service: impl Into<String>, query: impl Into<String>, max_results: usize) -> Self {
        Self {
            service: service.into(),
            query: query.into(),
            max_results,
        }
    }
}

/// A normalized search result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHit {
    pub kind: String,
    pub title: String,
    pub snippet: String,
    pub uri: String,
    /// Fields not consumed by normalization
    pub extra: Map<String, Value>,
}

/// How a hit's content is obtained
#[derive(Debug, Clone, PartialEq)]
pub enum FetchAction {
    Invoke { operation: String, args: Value },
    ReadResource { uri: String },
    UseSnippet,
}

/// A capped, validated hit plus its fetch plan
#[derive(Debug, Clone, PartialEq)]
pub struct MappedResult {
    pub service: String,
    pub hit: SearchHit,
    pub fetch: FetchAction,
}

// ============================================================================
// Adapter trait
// ============================================================================

/// Interprets one tool server's search and fetch shapes
pub trait ServiceAdapter: Send + Sync {
    /// Remote operation and arguments for a search
    fn search_call(&self, request: &SearchRequest) -> (String, Value);

    /// Normalize a raw search result
    fn parse_hits(&self, service: &str, raw: &Value) -> Result<Vec<SearchHit>>;

    fn fetch_action(&self, hit: &SearchHit) -> FetchAction;

    /// Text of a fetched document from an `Invoke` result
    fn content_text(&self, raw: &Value) -> String {
        content_text(raw)
    }
}

/// First content item's `text` (or `content`), the string itself, or the JSON rendering
pub fn content_text(raw: &Value) -> String {
    match raw {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => match items.first() {
            None => String::new(),
            Some(first) => first
                .get("text")
                .or_else(|| first.get("content"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| first.to_string()),
        },
        Value::Object(map) => map
            .get("text")
            .or_else(|| map.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| raw.to_string()),
        other => other.to_string(),
    }
}

// ============================================================================
// Generic adapter
// ============================================================================

/// Config-driven adapter covering list-of-objects and text-wrapped JSON results
#[derive(Debug, Clone, Default)]
pub struct GenericAdapter {
    config: AdapterConfig,
}

impl GenericAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }

    fn collect_objects(&self, service: &str, raw: &Value, out: &mut Vec<Map<String, Value>>) -> Result<()> {
        match raw {
            Value::Array(items) => {
                for item in items {
                    self.collect_item(item, out);
                }
            }
            Value::Object(map) => {
                let nested = ["results", "items", "hits"]
                    .iter()
                    .find_map(|key| map.get(*key).filter(|v| v.is_array()));
                match nested {
                    Some(list) => self.collect_objects(service, list, out)?,
                    None => self.collect_item(raw, out),
                }
            }
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(parsed) if parsed.is_array() || parsed.is_object() => {
                    self.collect_objects(service, &parsed, out)?
                }
                _ => out.push(text_hit(text)),
            },
            Value::Null => {}
            other => bail!("{} search returned unexpected {} result", service, type_name(other)),
        }
        Ok(())
    }

    fn collect_item(&self, item: &Value, out: &mut Vec<Map<String, Value>>) {
        let Value::Object(map) = item else {
            if let Some(text) = item.as_str() {
                out.push(text_hit(text));
            }
            return;
        };

        // Text content item wrapping a JSON payload
        if map.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = map.get("text").and_then(Value::as_str) {
                match serde_json::from_str::<Value>(text) {
                    Ok(Value::Array(inner)) => {
                        for entry in &inner {
                            self.collect_item(entry, out);
                        }
                    }
                    Ok(Value::Object(inner)) => out.push(inner),
                    _ => out.push(text_hit(text)),
                }
                return;
            }
        }

        out.push(map.clone());
    }
}

impl ServiceAdapter for GenericAdapter {
    fn search_call(&self, request: &SearchRequest) -> (String, Value) {
        let mut args = Map::new();
        args.insert(self.config.query_param.clone(), json!(request.query));
        if let Some(limit_param) = &self.config.limit_param {
            args.insert(limit_param.clone(), json!(request.max_results));
        }
        (self.config.search_tool.clone(), Value::Object(args))
    }

    fn parse_hits(&self, service: &str, raw: &Value) -> Result<Vec<SearchHit>> {
        let mut objects = Vec::new();
        self.collect_objects(service, raw, &mut objects)?;
        Ok(objects.into_iter().map(normalize_hit).collect())
    }

    fn fetch_action(&self, hit: &SearchHit) -> FetchAction {
        match self.config.fetch {
            FetchStrategy::Snippet => FetchAction::UseSnippet,
            FetchStrategy::Resource if hit.uri.is_empty() => FetchAction::UseSnippet,
            FetchStrategy::Resource => FetchAction::ReadResource {
                uri: hit.uri.clone(),
            },
            FetchStrategy::Tool => {
                let mut args = Map::new();
                args.insert("uri".to_string(), json!(hit.uri));
                for field in &self.config.fetch_fields {
                    if let Some(value) = hit.extra.get(field) {
                        args.insert(field.clone(), value.clone());
                    }
                }
                FetchAction::Invoke {
                    operation: self
                        .config
                        .fetch_tool
                        .clone()
                        .unwrap_or_else(|| DEFAULT_FETCH_TOOL.to_string()),
                    args: Value::Object(args),
                }
            }
        }
    }
}

fn text_hit(text: &str) -> Map<String, Value> {
    let title: String = text.lines().next().unwrap_or_default().chars().take(80).collect();
    let mut map = Map::new();
    map.insert("title".to_string(), json!(title));
    map.insert("snippet".to_string(), json!(text));
    map
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn take_string(map: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    let mut found = None;
    for key in keys {
        if let Some(value) = map.remove(*key) {
            if found.is_none() {
                found = match value {
                    Value::String(text) if !text.is_empty() => Some(text),
                    Value::String(_) | Value::Null => None,
                    other => Some(other.to_string()),
                };
            }
        }
    }
    found
}

fn normalize_hit(mut map: Map<String, Value>) -> SearchHit {
    let title = take_string(&mut map, &["title", "name"]).unwrap_or_default();
    let snippet = take_string(&mut map, &["snippet", "text", "description"]).unwrap_or_default();
    let uri = take_string(&mut map, &["uri", "url", "permalink", "html_url"]).unwrap_or_default();
    let kind = take_string(&mut map, &["kind", "type"]).unwrap_or_else(|| DEFAULT_KIND.to_string());

    SearchHit {
        kind,
        title,
        snippet: snippet.chars().take(SNIPPET_MAX_CHARS).collect(),
        uri,
        extra: map,
    }
}
