//! Transcript corpus over HTTP, for the exploration sub-loop.
//!
//! Previews and targeted searches go through the semantic-search endpoint;
//! full pulls use the segments-by-sessions endpoint.

use async_trait::async_trait;
use clinscribe_core::corpus::CorpusSource;
use clinscribe_core::error::ToolError;
use clinscribe_core::tool::ToolContext;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use crate::client::PracticeApiClient;

/// Upper bound on segments requested by a full pull.
const PULL_LIMIT_PER_SESSION: usize = 1000;
/// Similarity floor for targeted searches.
const SEARCH_THRESHOLD: f64 = 0.3;

pub struct HttpCorpusSource {
    client: Arc<PracticeApiClient>,
}

impl HttpCorpusSource {
    pub fn new(client: Arc<PracticeApiClient>) -> Self {
        Self { client }
    }

    async fn semantic_search(
        &self,
        ctx: &ToolContext,
        operation: &str,
        source_id: &str,
        query: &str,
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<serde_json::Value>, ToolError> {
        let url = self.client.endpoint(&["ai", "semantic-search"]);
        let body = json!({
            "query": query,
            "transcript_ids": [source_id],
            "limit": limit,
            "similarity_threshold": threshold,
        });
        let response = self.client.post(ctx, operation, url, &body).await?;
        Ok(segments(response))
    }
}

/// Segments from a response that is either `{ "segments": [...] }` or a bare array.
fn segments(response: serde_json::Value) -> Vec<serde_json::Value> {
    match response {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("segments") {
            Some(serde_json::Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl CorpusSource for HttpCorpusSource {
    async fn preview(
        &self,
        ctx: &ToolContext,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, ToolError> {
        // A zero threshold returns segments in transcript order
        self.semantic_search(ctx, "preview_source", source_id, "session conversation", limit, 0.0)
            .await
    }

    async fn pull(&self, ctx: &ToolContext, source_id: &str) -> Result<Vec<serde_json::Value>, ToolError> {
        let url = self.client.endpoint(&["ai", "transcripts", "segments-by-sessions"]);
        let body = json!({
            "session_ids": [source_id],
            "limit_per_session": PULL_LIMIT_PER_SESSION,
        });
        let items = segments(self.client.post(ctx, "pull_source", url, &body).await?);
        debug!(source = source_id, items = items.len(), "Pulled source");
        Ok(items)
    }

    async fn search(
        &self,
        ctx: &ToolContext,
        source_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, ToolError> {
        self.semantic_search(ctx, "search_source", source_id, query, limit, SEARCH_THRESHOLD)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_server::serve_once;
    use std::time::Duration;

    #[test]
    fn segments_accepts_both_shapes() {
        assert_eq!(segments(json!([{"text": "a"}])).len(), 1);
        assert_eq!(segments(json!({"segments": [{"text": "a"}, {"text": "b"}]})).len(), 2);
        assert!(segments(json!({"error": "nope"})).is_empty());
    }

    #[tokio::test]
    async fn pull_posts_session_ids() {
        let (base, request) = serve_once(200, r#"{"segments":[{"text":"hi"},{"text":"there"}]}"#).await;
        let client = Arc::new(PracticeApiClient::new(&base, Duration::from_secs(5)).unwrap());
        let source = HttpCorpusSource::new(client);
        let ctx = ToolContext {
            auth_token: Some("tok".into()),
            ..ToolContext::default()
        };

        let items = source.pull(&ctx, "sess-1").await.unwrap();
        assert_eq!(items.len(), 2);

        let raw = request.await.unwrap();
        assert!(raw.starts_with("POST /api/v1/ai/transcripts/segments-by-sessions "));
        assert!(raw.contains(r#""session_ids":["sess-1"]"#));
    }
}
