//! Batched topic-tag lookup against the question-metadata GraphQL service.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const DEFAULT_TAG_SERVICE_URL: &str = "https://leetcode.com/graphql";

#[derive(Debug, Error)]
pub enum TagSourceError {
    #[error("tag request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding tag response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result of one batched lookup, positionally aligned with the requested slugs.
/// `None` means the service had nothing for that slug and its tags must be left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagBatch {
    pub resolved: Vec<Option<Vec<String>>>,
    pub errors: Vec<JsonValue>,
}

#[async_trait]
pub trait TagSource: Send + Sync {
    async fn fetch_tags(&self, slugs: &[String]) -> Result<TagBatch, TagSourceError>;
}

#[derive(Debug, Clone)]
pub struct TagSourceConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for TagSourceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_TAG_SERVICE_URL.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: "Mozilla/5.0 (compatible; qbank-tag-sync/0.1)".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct GraphqlTagSource {
    client: reqwest::Client,
    endpoint: String,
}

impl GraphqlTagSource {
    pub fn new(config: TagSourceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
        })
    }
}

#[async_trait]
impl TagSource for GraphqlTagSource {
    async fn fetch_tags(&self, slugs: &[String]) -> Result<TagBatch, TagSourceError> {
        let body = serde_json::json!({ "query": build_batch_query(slugs) });
        let resp = self.client.post(&self.endpoint).json(&body).send().await?;

        // GraphQL reports most failures with a 200; only throttling and server
        // errors fail the batch.
        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TagSourceError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let bytes = resp.bytes().await?;
        Ok(decode_batch_response(&bytes, slugs.len())?)
    }
}

/// One query with aliases `q0..qN`, one `question(titleSlug:)` lookup per slug.
pub fn build_batch_query(slugs: &[String]) -> String {
    let mut query = String::from("query {\n");
    for (idx, slug) in slugs.iter().enumerate() {
        // A JSON string literal is also a valid GraphQL string literal.
        let quoted = JsonValue::from(slug.as_str()).to_string();
        let _ = writeln!(query, "  q{idx}: question(titleSlug: {quoted}) {{");
        query.push_str("    questionId\n");
        query.push_str("    topicTags { name slug }\n");
        query.push_str("  }\n");
    }
    query.push_str("}\n");
    query
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    data: Option<HashMap<String, Option<QuestionEntry>>>,
    #[serde(default)]
    errors: Option<Vec<JsonValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuestionEntry {
    #[serde(default)]
    question_id: Option<String>,
    #[serde(default)]
    topic_tags: Option<Vec<TopicTag>>,
}

#[derive(Debug, Deserialize)]
struct TopicTag {
    name: String,
}

pub fn decode_batch_response(body: &[u8], count: usize) -> Result<TagBatch, serde_json::Error> {
    let parsed: BatchResponse = serde_json::from_slice(body)?;
    let mut data = parsed.data.unwrap_or_default();

    let resolved: Vec<Option<Vec<String>>> = (0..count)
        .map(|idx| {
            let entry = data.remove(&format!("q{idx}")).flatten()?;
            let question_id = entry.question_id.unwrap_or_default();
            if question_id.trim().is_empty() {
                return None;
            }
            Some(
                entry
                    .topic_tags
                    .unwrap_or_default()
                    .into_iter()
                    .map(|tag| tag.name)
                    .collect(),
            )
        })
        .collect();

    Ok(TagBatch {
        resolved,
        errors: parsed.errors.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_aliases_each_slug_in_order() {
        let query = build_batch_query(&["two-sum".to_string(), "word-search".to_string()]);
        assert!(query.starts_with("query {\n"));
        assert!(query.contains("  q0: question(titleSlug: \"two-sum\") {\n"));
        assert!(query.contains("  q1: question(titleSlug: \"word-search\") {\n"));
        assert_eq!(query.matches("topicTags { name slug }").count(), 2);
    }

    #[test]
    fn slugs_are_quoted_safely() {
        let query = build_batch_query(&["evil\"slug".to_string()]);
        assert!(query.contains(r#"titleSlug: "evil\"slug""#));
    }

    #[test]
    fn decodes_resolved_unresolved_and_null_aliases() {
        let body = br#"{
            "data": {
                "q0": {"questionId": "1", "topicTags": [{"name": "Array", "slug": "array"}, {"name": "Hash Table", "slug": "hash-table"}]},
                "q1": null,
                "q2": {"questionId": "", "topicTags": []},
                "q3": {"questionId": "79", "topicTags": []}
            },
            "errors": [{"message": "question not found"}]
        }"#;
        let batch = decode_batch_response(body, 5).unwrap();
        assert_eq!(
            batch.resolved,
            vec![
                Some(vec!["Array".to_string(), "Hash Table".to_string()]),
                None,
                None,
                Some(vec![]),
                None,
            ]
        );
        assert_eq!(batch.errors.len(), 1);
    }

    #[test]
    fn missing_data_resolves_nothing() {
        let batch = decode_batch_response(br#"{"errors": [{"message": "rate limited"}]}"#, 2).unwrap();
        assert_eq!(batch.resolved, vec![None, None]);
    }

    #[test]
    fn garbage_body_is_a_decode_error() {
        assert!(decode_batch_response(b"<html>busy</html>", 1).is_err());
    }
}
