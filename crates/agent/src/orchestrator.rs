//! Turn orchestration: admission, session recovery, persona selection, the
//! agent loop and persistence for one user request.

use chrono::Utc;
use clinscribe_config::{AppConfig, MAX_ITERATION_CAP, PersonaConfig};
use clinscribe_core::Error;
use clinscribe_core::completion::CompletionClient;
use clinscribe_core::corpus::CorpusSource;
use clinscribe_core::event::{DomainEvent, EventBus};
use clinscribe_core::message::{Conversation, ConversationId, Message};
use clinscribe_core::session::{ResolutionCache, SessionState, SessionStore};
use clinscribe_core::tool::{PageContext, ToolCatalog, ToolContext};
use clinscribe_providers::OpenAiCompatClient;
use clinscribe_tools::{HttpCorpusSource, PracticeApiClient};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::exploration::Explorer;
use crate::loop_runner::{AgentLoop, TurnOutcome};
use crate::stream_event::{AgentStreamEvent, EventSink};

/// One user request.
#[derive(Clone, Default)]
pub struct TurnRequest {
    pub user_id: String,
    /// Continue this conversation; a new one is opened when absent
    pub conversation_id: Option<ConversationId>,
    pub message: String,
    pub persona: String,
    pub auth_token: Option<String>,
    pub profile_id: Option<String>,
    pub page: Option<PageContext>,
}

impl std::fmt::Debug for TurnRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnRequest")
            .field("user_id", &self.user_id)
            .field("conversation_id", &self.conversation_id)
            .field("persona", &self.persona)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("profile_id", &self.profile_id)
            .field("page", &self.page)
            .finish_non_exhaustive()
    }
}

pub struct Orchestrator {
    config: AppConfig,
    client: Arc<dyn CompletionClient>,
    catalog: ToolCatalog,
    sessions: Arc<dyn SessionStore>,
    admission: Arc<AdmissionController>,
    event_bus: Arc<EventBus>,
    corpus: Option<Arc<dyn CorpusSource>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        client: Arc<dyn CompletionClient>,
        catalog: ToolCatalog,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let admission = Arc::new(
            AdmissionController::new(config.admission.max_requests_per_user).with_event_bus(event_bus.clone()),
        );
        Self {
            config,
            client,
            catalog,
            sessions,
            admission,
            event_bus,
            corpus: None,
        }
    }

    /// Wire up the completion client, practice API tools, corpus source and
    /// session store described by `config`.
    pub fn from_config(config: AppConfig) -> Result<Self, Error> {
        config.validate()?;
        let client = Arc::new(OpenAiCompatClient::from_config(&config.completion)?);
        let backend = Arc::new(PracticeApiClient::from_config(&config.backend)?);
        let catalog = clinscribe_tools::default_catalog(backend.clone());
        let sessions = clinscribe_session::from_config(&config.session);

        info!(
            model = %config.completion.model,
            tools = catalog.len(),
            sessions = sessions.name(),
            personas = config.personas.len(),
            "Orchestrator ready"
        );

        Ok(Self::new(config, client, catalog, sessions).with_corpus(Arc::new(HttpCorpusSource::new(backend))))
    }

    /// Replace the event bus. Admission events follow the new bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.admission = Arc::new(
            AdmissionController::new(self.config.admission.max_requests_per_user).with_event_bus(event_bus.clone()),
        );
        self.event_bus = event_bus;
        self
    }

    pub fn with_corpus(mut self, corpus: Arc<dyn CorpusSource>) -> Self {
        self.corpus = Some(corpus);
        self
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// A bounded channel sized for one turn's stream events.
    pub fn stream_channel(&self) -> (mpsc::Sender<AgentStreamEvent>, mpsc::Receiver<AgentStreamEvent>) {
        mpsc::channel(self.config.agent.stream_buffer.max(1))
    }

    /// Reclaim idle admission slots every `sweep_interval_secs` until cancelled.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.admission
            .spawn_sweeper(Duration::from_secs(self.config.admission.sweep_interval_secs), cancel)
    }

    /// Purge expired sessions every `session.sweep_interval_secs` until cancelled.
    pub fn spawn_session_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let interval = self.config.session.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match sessions.purge_expired().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, store = sessions.name(), "Session sweep"),
                        Err(e) => warn!(error = %e, store = sessions.name(), "Session sweep failed"),
                    },
                }
            }
            info!("Session sweeper stopped");
        })
    }

    /// An exploration runner over the configured corpus, if one is wired.
    pub fn explorer(&self) -> Option<Explorer> {
        let corpus = self.corpus.clone()?;
        Some(
            Explorer::new(
                self.client.clone(),
                corpus,
                self.config.completion.model.clone(),
                self.config.exploration.clone(),
            )
            .with_completion_timeout(self.config.completion.timeout())
            .with_event_bus(self.event_bus.clone()),
        )
    }

    /// Handle one user turn, streaming events into `tx`.
    ///
    /// The admission permit is held for the whole turn. A cancelled turn
    /// leaves the stored transcript untouched.
    pub async fn handle_turn(
        &self,
        request: TurnRequest,
        tx: mpsc::Sender<AgentStreamEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, Error> {
        let persona = self.config.persona(&request.persona).ok_or_else(|| Error::Config {
            message: format!("unknown persona '{}'", request.persona),
        })?;
        let kinds = persona.tool_kinds()?;

        let waiting = Instant::now();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(user_id = %request.user_id, "Turn cancelled while waiting for admission");
                return Ok(TurnOutcome::cancelled());
            }
            permit = self.admission.acquire(&request.user_id) => {
                permit.map_err(|e| Error::Internal(e.to_string()))?
            }
        };

        let conversation_id = request.conversation_id.clone().unwrap_or_default();
        self.event_bus.publish(DomainEvent::TurnAdmitted {
            user_id: request.user_id.clone(),
            conversation_id: conversation_id.to_string(),
            waited_ms: waiting.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });

        let state = self.open_session(&conversation_id, &request).await?;

        let mut conversation = Conversation::with_id(conversation_id.clone());
        conversation.set_system_prompt(persona.system_prompt.clone());
        for message in state.recent_messages(self.config.agent.history_limit) {
            conversation.push(message.clone());
        }
        conversation.push(Message::user(request.message.clone()));

        let mut cache = ResolutionCache::from_context(&state.context);
        let ctx = ToolContext {
            user_id: request.user_id.clone(),
            conversation_id: conversation_id.clone(),
            auth_token: state.auth_token.clone(),
            profile_id: state.profile_id.clone(),
            page: request.page.clone(),
        };

        let agent = self.agent_for(persona, self.catalog.restricted(&kinds));
        let sink = EventSink::new(tx, cancel);
        let outcome = agent.run(&mut conversation, &ctx, &mut cache, &sink).await;

        if outcome.is_cancelled() {
            info!(conversation_id = %conversation_id, "Turn cancelled; transcript not persisted");
        } else {
            self.persist(state, &request.message, &outcome.text, &cache).await?;
        }

        self.admission.release(permit);
        Ok(outcome)
    }

    /// Load the session, or recreate it under the same id. The session is
    /// stored before the loop runs so mid-turn cache merges have a target.
    async fn open_session(&self, id: &ConversationId, request: &TurnRequest) -> Result<SessionState, Error> {
        let mut state = match self.sessions.get(id).await? {
            Some(state) => state,
            None => {
                if request.conversation_id.is_some() {
                    warn!(conversation_id = %id, "Session missing or expired; recreating");
                }
                SessionState::new(id.clone(), request.persona.clone())
            }
        };

        if request.auth_token.is_some() {
            state.auth_token = request.auth_token.clone();
        }
        if request.profile_id.is_some() {
            state.profile_id = request.profile_id.clone();
        }
        state.touch();

        self.sessions.put(state.clone(), self.config.session.ttl()).await?;
        Ok(state)
    }

    /// Append the exchange and write the session back in one `put`.
    async fn persist(
        &self,
        fallback: SessionState,
        user_message: &str,
        reply: &str,
        cache: &ResolutionCache,
    ) -> Result<(), Error> {
        // Re-read to keep fields merged during the turn
        let mut state = self
            .sessions
            .get(&fallback.conversation_id)
            .await?
            .unwrap_or(fallback);

        state.messages.push(Message::user(user_message));
        state.messages.push(Message::assistant(reply));
        state.context.extend(cache.to_fields());
        state.touch();
        self.sessions.put(state, self.config.session.ttl()).await?;
        Ok(())
    }

    fn agent_for(&self, persona: &PersonaConfig, tools: ToolCatalog) -> AgentLoop {
        let completion = &self.config.completion;
        let max_iterations = persona
            .max_iterations
            .unwrap_or(self.config.agent.max_iterations)
            .clamp(1, MAX_ITERATION_CAP);

        AgentLoop::new(
            self.client.clone(),
            persona.model.clone().unwrap_or_else(|| completion.model.clone()),
            tools,
            self.event_bus.clone(),
        )
        .with_max_iterations(max_iterations)
        .with_temperature(persona.temperature.unwrap_or(completion.temperature))
        .with_max_tokens(persona.max_tokens.unwrap_or(completion.max_tokens))
        .with_completion_timeout(completion.timeout())
        .with_tool_timeout(self.config.agent.tool_timeout())
        .with_session_store(self.sessions.clone())
    }
}
