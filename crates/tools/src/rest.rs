//! Generic REST tool executor.
//!
//! A [`RestTool`] is a tool identity bound to a [`Route`] on the
//! practice-management API. Arguments named in the path template fill its
//! `{param}` segments; the rest become query parameters (GET) or the JSON
//! body (POST).

use async_trait::async_trait;
use clinscribe_core::error::ToolError;
use clinscribe_core::tool::{ToolContext, ToolExecutor, ToolKind};
use std::sync::Arc;
use tracing::debug;

use crate::client::PracticeApiClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Where a tool's request goes.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    /// Slash-separated template, e.g. `haystack/sessions/{session_id}`
    pub path: &'static str,
    /// Arguments that must be present and non-empty
    pub required: &'static [&'static str],
    /// Return only this field of the response object
    pub unwrap: Option<&'static str>,
}

impl Route {
    pub const fn get(path: &'static str) -> Self {
        Self {
            method: Method::Get,
            path,
            required: &[],
            unwrap: None,
        }
    }

    pub const fn post(path: &'static str) -> Self {
        Self {
            method: Method::Post,
            path,
            required: &[],
            unwrap: None,
        }
    }

    pub const fn requires(mut self, required: &'static [&'static str]) -> Self {
        self.required = required;
        self
    }

    pub const fn unwrapping(mut self, field: &'static str) -> Self {
        self.unwrap = Some(field);
        self
    }

    fn path_params(&self) -> impl Iterator<Item = &'static str> {
        self.path
            .split('/')
            .filter_map(|seg| seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')))
    }
}

pub struct RestTool {
    kind: ToolKind,
    description: &'static str,
    schema: serde_json::Value,
    route: Route,
    client: Arc<PracticeApiClient>,
}

impl RestTool {
    pub fn new(
        kind: ToolKind,
        description: &'static str,
        schema: serde_json::Value,
        route: Route,
        client: Arc<PracticeApiClient>,
    ) -> Self {
        Self {
            kind,
            description,
            schema,
            route,
            client,
        }
    }

    fn validate(&self, args: &serde_json::Map<String, serde_json::Value>) -> Result<(), ToolError> {
        let missing: Vec<&str> = self
            .route
            .required
            .iter()
            .copied()
            .chain(self.route.path_params())
            .filter(|name| match args.get(*name) {
                None | Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            })
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ToolError::InvalidArguments(format!(
                "{} requires {}",
                self.kind,
                missing.join(", ")
            )))
        }
    }
}

fn scalar_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ToolExecutor for RestTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn description(&self) -> &str {
        self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let mut args = match arguments {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "{} expects an object, got {other}",
                    self.kind
                )));
            }
        };
        self.validate(&args)?;

        let segments: Vec<String> = self
            .route
            .path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|seg| match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(param) => args.remove(param).map(|v| scalar_text(&v)).unwrap_or_default(),
                None => seg.to_string(),
            })
            .collect();
        let url = self.client.endpoint(&segments);

        debug!(tool = %self.kind, method = ?self.route.method, path = self.route.path, "Calling backend");

        let response = match self.route.method {
            Method::Get => {
                let query: Vec<(String, String)> = args
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), scalar_text(v)))
                    .collect();
                self.client.get(ctx, self.kind.as_str(), url, &query).await?
            }
            Method::Post => {
                self.client
                    .post(ctx, self.kind.as_str(), url, &serde_json::Value::Object(args))
                    .await?
            }
        };

        Ok(match self.route.unwrap {
            Some(field) => response.get(field).cloned().unwrap_or(serde_json::Value::Array(vec![])),
            None => response,
        })
    }
}
