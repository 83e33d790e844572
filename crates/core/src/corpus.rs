//! Corpus source trait: read-only retrieval over a document corpus.
//!
//! The exploration sub-loop reads recorded session transcripts through this
//! trait. Items are opaque JSON objects (transcript segments); only their
//! count matters for budget accounting.

use async_trait::async_trait;

use crate::error::ToolError;
use crate::tool::ToolContext;

#[async_trait]
pub trait CorpusSource: Send + Sync {
    /// The first `limit` items of a source.
    async fn preview(
        &self,
        ctx: &ToolContext,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, ToolError>;

    /// Every item of a source.
    async fn pull(&self, ctx: &ToolContext, source_id: &str) -> Result<Vec<serde_json::Value>, ToolError>;

    /// Items of a source relevant to `query`, best first.
    async fn search(
        &self,
        ctx: &ToolContext,
        source_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, ToolError>;
}
