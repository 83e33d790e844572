//! Argument repair and resolution-cache learning.
//!
//! Before a tool runs, identifier parameters it requires are checked with
//! [`is_resolved_identifier`]. A missing or name-shaped identifier is
//! replaced from the resolution cache, or looked up through the matching
//! search tool when only a display name is known. Nothing is ever made up:
//! when repair fails the arguments pass through and the executor reports
//! what is wrong.
//!
//! After a tool runs, identifiers found in its arguments and result are
//! fed back into the cache.

use clinscribe_core::error::{ResolutionError, ToolError};
use clinscribe_core::session::{ResolutionCache, is_resolved_identifier, is_resolved_identifier_value};
use clinscribe_core::tool::{ToolCatalog, ToolContext, ToolKind};
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::{debug, warn};

use crate::driver::IterationBudget;

pub const CLIENT_ID: &str = "client_id";
pub const CLIENT_NAME: &str = "client_name";
pub const ASSIGNMENT_ID: &str = "assignment_id";
pub const GENERATION_INSTRUCTIONS: &str = "generation_instructions";

/// One identifier written into an invocation's arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairedParam {
    pub param: &'static str,
    pub via_lookup: bool,
}

/// What repair did to one invocation.
#[derive(Debug, Default)]
pub struct RepairReport {
    pub repaired: Vec<RepairedParam>,
    /// Cache fields that changed, to merge into the session
    pub changed: Map<String, Value>,
    pub failures: Vec<ResolutionError>,
}

pub struct ArgumentRepair<'a> {
    catalog: &'a ToolCatalog,
    ctx: &'a ToolContext,
    lookup_timeout: Duration,
}

impl<'a> ArgumentRepair<'a> {
    pub fn new(catalog: &'a ToolCatalog, ctx: &'a ToolContext, lookup_timeout: Duration) -> Self {
        Self {
            catalog,
            ctx,
            lookup_timeout,
        }
    }

    /// Repair `arguments` in place for a call to `kind`.
    pub async fn repair(
        &self,
        kind: ToolKind,
        arguments: &mut Map<String, Value>,
        cache: &mut ResolutionCache,
        budget: &mut IterationBudget,
        user_utterance: Option<&str>,
    ) -> RepairReport {
        let mut report = RepairReport::default();
        let required = self.required_params(kind);

        if required.iter().any(|p| p == CLIENT_ID) {
            match self.resolve_client(arguments, cache, budget, &mut report).await {
                Ok(()) => {}
                Err(e) => {
                    debug!(tool = %kind, error = %e, "Client id left unresolved");
                    report.failures.push(e);
                }
            }
        } else if is_resolved_identifier_value(arguments.get(CLIENT_ID)) {
            let name = non_empty(arguments.get(CLIENT_NAME));
            if let Some(id) = arguments.get(CLIENT_ID).and_then(Value::as_str) {
                report.changed.extend(cache.remember_client(id, name));
            }
        }

        if required.iter().any(|p| p == ASSIGNMENT_ID) {
            if let Err(e) = self.resolve_assignment(arguments, cache, budget, &mut report).await {
                debug!(tool = %kind, error = %e, "Assignment id left unresolved");
                report.failures.push(e);
            }
        }

        if kind.generates_document() && non_empty(arguments.get(GENERATION_INSTRUCTIONS)).is_none() {
            if let Some(utterance) = user_utterance.filter(|u| !u.trim().is_empty()) {
                arguments.insert(GENERATION_INSTRUCTIONS.into(), utterance.into());
            }
        }

        report
    }

    fn required_params(&self, kind: ToolKind) -> Vec<String> {
        self.catalog
            .get(kind)
            .and_then(|tool| {
                tool.parameters_schema()
                    .get("required")
                    .and_then(Value::as_array)
                    .map(|fields| fields.iter().filter_map(Value::as_str).map(str::to_string).collect())
            })
            .unwrap_or_default()
    }

    async fn resolve_client(
        &self,
        arguments: &mut Map<String, Value>,
        cache: &mut ResolutionCache,
        budget: &mut IterationBudget,
        report: &mut RepairReport,
    ) -> Result<(), ResolutionError> {
        let current = arguments.get(CLIENT_ID);
        if is_resolved_identifier_value(current) {
            let id = current.and_then(Value::as_str).unwrap_or_default().to_string();
            let name = non_empty(arguments.get(CLIENT_NAME)).map(str::to_string);
            report.changed.extend(cache.remember_client(&id, name.as_deref()));
            return Ok(());
        }

        // A name the model put in the id slot still names the client
        let name = non_empty(arguments.get(CLIENT_NAME))
            .or_else(|| non_empty(current))
            .map(str::to_string);

        if let Some(id) = cache.client_id_for(name.as_deref()) {
            arguments.insert(CLIENT_ID.into(), id.into());
            report.repaired.push(RepairedParam {
                param: CLIENT_ID,
                via_lookup: false,
            });
            return Ok(());
        }

        let name = name.ok_or(ResolutionError::NoCandidate { param: CLIENT_ID.into() })?;
        let found = self
            .lookup(
                ToolKind::SearchClients,
                json!({ "query": name, "limit": 1 }),
                CLIENT_ID,
                budget,
            )
            .await?;

        let top = first_item(&found, "clients").ok_or_else(|| ResolutionError::NoMatch {
            lookup: ToolKind::SearchClients.to_string(),
        })?;
        let id = top
            .get(CLIENT_ID)
            .and_then(Value::as_str)
            .filter(|id| is_resolved_identifier(id))
            .ok_or_else(|| ResolutionError::NoMatch {
                lookup: ToolKind::SearchClients.to_string(),
            })?;
        let resolved_name = non_empty(top.get("name")).unwrap_or(name.as_str());

        report.changed.extend(cache.remember_client(id, Some(resolved_name)));
        arguments.insert(CLIENT_ID.into(), id.into());
        report.repaired.push(RepairedParam {
            param: CLIENT_ID,
            via_lookup: true,
        });
        Ok(())
    }

    async fn resolve_assignment(
        &self,
        arguments: &mut Map<String, Value>,
        cache: &mut ResolutionCache,
        budget: &mut IterationBudget,
        report: &mut RepairReport,
    ) -> Result<(), ResolutionError> {
        if let Some(id) = arguments.get(ASSIGNMENT_ID).and_then(Value::as_str) {
            if is_resolved_identifier(id) {
                let id = id.to_string();
                report.changed.extend(cache.remember_assignment(&id));
                return Ok(());
            }
        }

        if let Some(id) = cache.assignment_id.as_deref() {
            arguments.insert(ASSIGNMENT_ID.into(), id.into());
            report.repaired.push(RepairedParam {
                param: ASSIGNMENT_ID,
                via_lookup: false,
            });
            return Ok(());
        }

        let client_id = arguments
            .get(CLIENT_ID)
            .and_then(Value::as_str)
            .filter(|id| is_resolved_identifier(id))
            .ok_or(ResolutionError::NoCandidate {
                param: ASSIGNMENT_ID.into(),
            })?
            .to_string();

        let latest = self
            .lookup(
                ToolKind::GetLatestConversation,
                json!({ "client_id": client_id, "message_limit": 1 }),
                ASSIGNMENT_ID,
                budget,
            )
            .await?;
        let id = latest
            .get("latest_assignment_id")
            .and_then(Value::as_str)
            .filter(|id| is_resolved_identifier(id))
            .ok_or_else(|| ResolutionError::NoMatch {
                lookup: ToolKind::GetLatestConversation.to_string(),
            })?;

        report.changed.extend(cache.remember_assignment(id));
        arguments.insert(ASSIGNMENT_ID.into(), id.into());
        report.repaired.push(RepairedParam {
            param: ASSIGNMENT_ID,
            via_lookup: true,
        });
        Ok(())
    }

    /// Run a lookup tool, charging the iteration budget.
    async fn lookup(
        &self,
        kind: ToolKind,
        arguments: Value,
        param: &str,
        budget: &mut IterationBudget,
    ) -> Result<Value, ResolutionError> {
        let lookup_failed = |reason: String| ResolutionError::LookupFailed {
            lookup: kind.to_string(),
            reason,
        };

        if !self.catalog.contains(kind) {
            return Err(lookup_failed("not in this catalog".into()));
        }
        if !budget.try_charge() {
            return Err(ResolutionError::BudgetSpent { param: param.into() });
        }

        debug!(lookup = %kind, param, "Resolving identifier by lookup");
        match tokio::time::timeout(self.lookup_timeout, self.catalog.execute(kind, self.ctx, arguments)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(lookup = %kind, error = %e, "Identifier lookup failed");
                Err(lookup_failed(e.to_string()))
            }
            Err(_) => Err(lookup_failed(
                ToolError::Timeout {
                    tool_name: kind.to_string(),
                    timeout_secs: self.lookup_timeout.as_secs(),
                }
                .to_string(),
            )),
        }
    }
}

/// Cache fields to learn from a successful tool result.
pub fn learn_from_result(
    kind: ToolKind,
    arguments: &Map<String, Value>,
    payload: &Value,
    cache: &mut ResolutionCache,
) -> Map<String, Value> {
    let mut changed = Map::new();

    if let Some(id) = arguments.get(CLIENT_ID).and_then(Value::as_str) {
        changed.extend(cache.remember_client(id, non_empty(arguments.get(CLIENT_NAME))));
    }

    match kind {
        ToolKind::SearchClients => {
            if let Some(top) = first_item(payload, "clients") {
                if let Some(id) = top.get(CLIENT_ID).and_then(Value::as_str) {
                    changed.extend(cache.remember_client(id, non_empty(top.get("name"))));
                }
            }
        }
        ToolKind::GetLatestConversation => {
            if let Some(id) = payload.get("latest_assignment_id").and_then(Value::as_str) {
                changed.extend(cache.remember_assignment(id));
            }
        }
        ToolKind::GetConversations => {
            if let Some(id) = first_item(payload, "conversations")
                .and_then(|c| c.get(ASSIGNMENT_ID))
                .and_then(Value::as_str)
            {
                changed.extend(cache.remember_assignment(id));
            }
        }
        _ => {}
    }

    changed
}

/// First element of a payload that is an array or an object holding one under `field`.
fn first_item<'v>(payload: &'v Value, field: &str) -> Option<&'v Value> {
    match payload {
        Value::Array(items) => items.first(),
        Value::Object(map) => map.get(field)?.as_array()?.first(),
        _ => None,
    }
}

fn non_empty(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}
