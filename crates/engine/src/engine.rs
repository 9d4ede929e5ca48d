//! The conversation engine: per-request orchestration and the response
//! path that closes every dispatched task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use carelink_bus::{BusClient, BusHandler, Record};
use carelink_common::{
    CarelinkError, ConversationMessage, MessageRole, MessageStatus, PendingTask,
    PendingTaskStatus, Result, Session, TaskPayload, TaskRequest, TaskResponse,
    TaskResponseStatus, TaskResult, UserContext,
};
use carelink_llm::{GenerateRequest, PromptRegistry, ProviderRegistry};
use carelink_session::{SessionStore, StoreError};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::{ClassificationSource, IntentClassifier, INTENT_GENERAL_INFO};
use crate::correlation::{CorrelationEntry, CorrelationRegistry};
use crate::hub::{PushEnvelope, PushHub, PushKind};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::router::AgentRouter;

const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Turns of history forwarded to agents with each task request.
const PAYLOAD_HISTORY_TURNS: usize = 3;

/// Messages of history rendered into the classification prompt.
const CLASSIFY_HISTORY_MESSAGES: usize = 5;

const APPEND_SEQUENCE_ATTEMPTS: u32 = 3;

pub const MAX_USER_ID_CHARS: usize = 100;

const EMERGENCY_RESPONSE: &str = "MEDICAL EMERGENCY DETECTED\n\n\
If this is a life-threatening emergency, please:\n\
1. Call emergency services immediately (911/999/112)\n\
2. Go to the nearest emergency room\n\n\
For urgent but non-life-threatening issues:\n\
- Contact our emergency hotline\n\
- Visit our urgent care center\n\n\
I'm flagging this for immediate human review.";

const DISPATCH_FAILED_RESPONSE: &str = "I encountered an issue trying to send your request. \
Please try again or contact support.";

const AGENT_TIMEOUT_RESPONSE: &str = "I'm sorry, our team could not complete your request in \
time. Please try again, or contact our support staff if this keeps happening.";

const STILL_WORKING_DETAIL: &str = "The agent is still working on your request.";

const LLM_TROUBLE_RESPONSE: &str = "I'm sorry, I'm having trouble processing your question \
right now. Please try again later.";

/// Fixed text the knowledge-base agent returns when retrieval found
/// nothing; triggers the direct-LLM re-answer.
const KNOWLEDGE_BASE_NO_ANSWER: &str =
    "I could not find relevant information in the documents to answer your question.";

const GENERAL_FALLBACK_SYSTEM_PROMPT: &str = "You are a helpful healthcare assistant. The \
attempt to find specific information in the hospital's knowledge base has failed. Answer the \
user's question from general knowledge, and start your response by stating that you could not \
find specific information. Do not give medical advice.";

/// The synchronous reply to one chat request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub response: String,
    pub session_id: Uuid,
    pub intent: String,
    pub requires_human_handoff: bool,
    pub suggested_actions: Vec<String>,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub degraded: bool,
}

pub struct ConversationEngine {
    store: Arc<dyn SessionStore>,
    providers: Arc<ProviderRegistry>,
    prompts: Arc<PromptRegistry>,
    classifier: IntentClassifier,
    router: AgentRouter,
    bus: Arc<dyn BusClient>,
    correlations: Arc<CorrelationRegistry>,
    hub: Arc<PushHub>,
    metrics: Arc<Metrics>,
    max_message_chars: usize,
}

impl ConversationEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        providers: Arc<ProviderRegistry>,
        prompts: Arc<PromptRegistry>,
        classifier: IntentClassifier,
        router: AgentRouter,
        bus: Arc<dyn BusClient>,
    ) -> Self {
        Self {
            store,
            providers,
            prompts,
            classifier,
            router,
            bus,
            correlations: Arc::new(CorrelationRegistry::new()),
            hub: Arc::new(PushHub::new()),
            metrics: Arc::new(Metrics::new()),
            max_message_chars: 2000,
        }
    }

    pub fn with_max_message_chars(mut self, max_message_chars: usize) -> Self {
        self.max_message_chars = max_message_chars;
        self
    }

    pub fn hub(&self) -> &Arc<PushHub> {
        &self.hub
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn correlations(&self) -> &Arc<CorrelationRegistry> {
        &self.correlations
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn prompts(&self) -> &Arc<PromptRegistry> {
        &self.prompts
    }

    /// Subscribe the response-topic consumers and start the timeout
    /// sweeper. Call once after construction.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for topic in self.router.response_topics() {
            let engine = Arc::clone(self);
            let handler: BusHandler = Arc::new(move |record: Record| {
                let engine = Arc::clone(&engine);
                Box::pin(async move {
                    engine.consume_record(record).await;
                })
            });
            self.bus
                .subscribe(&topic, handler)
                .await
                .map_err(|e| CarelinkError::Config(format!("cannot subscribe to {topic}: {e}")))?;
            info!(topic, "listening for agent responses");
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                engine.sweep(Instant::now()).await;
            }
        });

        Ok(())
    }

    /// Process one user message end to end, returning the provisional
    /// (or, for short-circuited paths, final) reply.
    pub async fn process(
        &self,
        user_id: &str,
        message: &str,
        session_id: Option<Uuid>,
        context: Option<UserContext>,
    ) -> Result<ChatOutcome> {
        self.metrics.record_message();
        self.validate(user_id, message)?;

        let session_id = session_id.unwrap_or_else(Uuid::new_v4);
        let (mut session, mut degraded) = self.load_or_create(session_id, user_id, &context).await?;
        if let Some(context) = context {
            session.context = context;
        }

        let history_text = classification_history(&session);
        let context_json = serde_json::to_string(&session.context).unwrap_or_default();
        let classification = self
            .classifier
            .classify(message, &history_text, &context_json, &self.prompts, &self.providers)
            .await;
        self.metrics.record_intent(&classification.intent);
        if classification.source == ClassificationSource::LlmFallback {
            self.metrics.record_llm_fallback();
        }

        if classification.is_emergency() {
            return self
                .handle_emergency(session_id, message, &classification.intent, classification.confidence, degraded)
                .await;
        }

        let descriptor = self.router.route(&classification.intent).clone();
        let correlation_id = Uuid::new_v4();

        // History for the agent includes the turn being processed.
        session.push_message(ConversationMessage::user(message), usize::MAX);
        let payload = TaskPayload {
            message: message.to_string(),
            session_id,
            user_context: session.context.clone(),
            conversation_history: session.recent_turns(PAYLOAD_HISTORY_TURNS),
            correlation_id,
        };
        let request = TaskRequest::new(correlation_id, descriptor.task_type.clone(), payload);

        // The user turn and its provisional reply land in one atomic write.
        if !degraded {
            let now = Utc::now();
            let task = PendingTask {
                task_id: correlation_id,
                task_type: descriptor.task_type.clone(),
                status: PendingTaskStatus::Pending,
                created_at: now,
                deadline: now
                    + chrono::Duration::from_std(descriptor.hard_deadline)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30)),
            };
            let mut provisional = ConversationMessage::pending_assistant(
                descriptor.placeholder.as_str(),
                correlation_id,
            );
            provisional.metadata.intent = Some(classification.intent.clone());
            provisional.metadata.confidence = Some(classification.confidence);

            degraded = self
                .persist_dispatch(
                    session_id,
                    vec![ConversationMessage::user(message), provisional],
                    task,
                    &classification.intent,
                )
                .await?;
        }

        let now = Instant::now();
        self.correlations.register(
            correlation_id,
            CorrelationEntry::new(
                session_id,
                user_id,
                classification.intent.clone(),
                message,
                descriptor.response_topic.clone(),
                now + descriptor.soft_deadline,
                now + descriptor.hard_deadline,
            ),
        );

        let raw = serde_json::to_vec(&request)?;
        match self
            .bus
            .dispatch(&descriptor.request_topic, &session_id.to_string(), raw)
            .await
        {
            Ok(()) => {
                info!(
                    %correlation_id,
                    %session_id,
                    intent = %classification.intent,
                    topic = %descriptor.request_topic,
                    "task dispatched"
                );
                Ok(ChatOutcome {
                    response: descriptor.placeholder.clone(),
                    session_id,
                    intent: classification.intent,
                    requires_human_handoff: false,
                    suggested_actions: vec!["wait_for_agent_response".to_string()],
                    confidence: classification.confidence,
                    correlation_id: Some(correlation_id),
                    degraded,
                })
            }
            Err(e) => {
                // The dispatch never left the producer; close out inline so
                // the transcript stays coherent and no sweeper entry lingers.
                warn!(%correlation_id, error = %e, "dispatch failed, completing inline");
                self.correlations.cancel(correlation_id);
                self.metrics.record_dispatch_timeout();
                self.metrics.record_error();
                if !degraded {
                    let _ = self
                        .store
                        .update_by_correlation(
                            session_id,
                            correlation_id,
                            DISPATCH_FAILED_RESPONSE,
                            MessageStatus::Error,
                            Some(&classification.intent),
                        )
                        .await;
                }
                Ok(ChatOutcome {
                    response: DISPATCH_FAILED_RESPONSE.to_string(),
                    session_id,
                    intent: classification.intent,
                    requires_human_handoff: true,
                    suggested_actions: vec!["contact_support".to_string()],
                    confidence: classification.confidence,
                    correlation_id: Some(correlation_id),
                    degraded,
                })
            }
        }
    }

    fn validate(&self, user_id: &str, message: &str) -> Result<()> {
        let user_len = user_id.chars().count();
        if user_len == 0 || user_len > MAX_USER_ID_CHARS {
            return Err(CarelinkError::Validation(format!(
                "user_id must be 1-{MAX_USER_ID_CHARS} characters"
            )));
        }
        let message_len = message.chars().count();
        if message_len == 0 {
            return Err(CarelinkError::Validation("message must not be empty".into()));
        }
        if message_len > self.max_message_chars {
            return Err(CarelinkError::Validation(format!(
                "message exceeds {} characters",
                self.max_message_chars
            )));
        }
        Ok(())
    }

    /// Resolve the session, creating transparently for unknown ids. A
    /// store outage degrades to a transient, unpersisted session.
    async fn load_or_create(
        &self,
        session_id: Uuid,
        user_id: &str,
        context: &Option<UserContext>,
    ) -> Result<(Session, bool)> {
        match self.store.get(session_id).await {
            Ok(Some(session)) => Ok((session, false)),
            Ok(None) => {
                let session =
                    Session::new(session_id, user_id, context.clone().unwrap_or_default());
                match self.store.put(session.clone()).await {
                    Ok(()) => {
                        info!(%session_id, user_id, "session created");
                        Ok((session, false))
                    }
                    Err(e) if e.is_outage() => {
                        warn!(%session_id, error = %e, "store outage, continuing stateless");
                        Ok((session, true))
                    }
                    Err(e) => Err(map_store_error(e)),
                }
            }
            Err(e) if e.is_outage() => {
                warn!(%session_id, error = %e, "store outage, continuing stateless");
                Ok((
                    Session::new(session_id, user_id, context.clone().unwrap_or_default()),
                    true,
                ))
            }
            Err(e) => Err(map_store_error(e)),
        }
    }

    async fn persist_dispatch(
        &self,
        session_id: Uuid,
        messages: Vec<ConversationMessage>,
        task: PendingTask,
        intent: &str,
    ) -> Result<bool> {
        for attempt in 0..APPEND_SEQUENCE_ATTEMPTS {
            match self
                .store
                .append_with_task(session_id, messages.clone(), task.clone(), intent)
                .await
            {
                Ok(()) => return Ok(false),
                Err(StoreError::Conflict(_)) if attempt + 1 < APPEND_SEQUENCE_ATTEMPTS => {
                    debug!(%session_id, attempt, "append pair raced, retrying sequence");
                }
                Err(e) if e.is_outage() => {
                    warn!(%session_id, error = %e, "store outage while appending, degrading");
                    return Ok(true);
                }
                Err(e) => return Err(map_store_error(e)),
            }
        }
        Err(CarelinkError::StoreOutage(format!(
            "could not append exchange for session {session_id} after {APPEND_SEQUENCE_ATTEMPTS} attempts"
        )))
    }

    async fn handle_emergency(
        &self,
        session_id: Uuid,
        message: &str,
        intent: &str,
        confidence: f32,
        degraded: bool,
    ) -> Result<ChatOutcome> {
        error!(%session_id, "medical emergency detected");

        if !degraded {
            let mut assistant = ConversationMessage::assistant(EMERGENCY_RESPONSE);
            assistant.metadata.intent = Some(intent.to_string());
            assistant.metadata.confidence = Some(confidence);
            let messages = vec![ConversationMessage::user(message), assistant];

            for attempt in 0..APPEND_SEQUENCE_ATTEMPTS {
                match self.store.append_messages(session_id, messages.clone()).await {
                    Ok(()) => break,
                    Err(StoreError::Conflict(_)) if attempt + 1 < APPEND_SEQUENCE_ATTEMPTS => {}
                    Err(e) => {
                        warn!(%session_id, error = %e, "could not record emergency exchange");
                        break;
                    }
                }
            }
        }

        Ok(ChatOutcome {
            response: EMERGENCY_RESPONSE.to_string(),
            session_id,
            intent: intent.to_string(),
            requires_human_handoff: true,
            suggested_actions: vec![
                "emergency_escalation".to_string(),
                "call_emergency_services".to_string(),
            ],
            confidence,
            correlation_id: None,
            degraded,
        })
    }

    async fn consume_record(&self, record: Record) {
        match TaskResponse::from_slice(&record.payload) {
            Ok(response) => self.handle_response(response).await,
            Err(e) => {
                self.metrics.record_protocol_error();
                warn!(key = %record.key, error = %e, "dropping malformed bus frame");
            }
        }
    }

    /// Resolve one task response. The correlation registry is the
    /// deduplication point: whoever takes the entry owns the resolution.
    pub async fn handle_response(&self, response: TaskResponse) {
        let correlation_id = response.correlation_id;
        match self.correlations.take(correlation_id) {
            Some(entry) => self.complete(correlation_id, entry, response).await,
            None => {
                self.metrics.record_duplicate_response();
                debug!(%correlation_id, "no pending correlation, dropping response");
            }
        }
    }

    async fn complete(
        &self,
        correlation_id: Uuid,
        entry: CorrelationEntry,
        response: TaskResponse,
    ) {
        let session_id = entry.session_id;
        let mut result = response.result;

        if response.status == TaskResponseStatus::Success
            && entry.intent == INTENT_GENERAL_INFO
            && result.response.trim() == KNOWLEDGE_BASE_NO_ANSWER
        {
            info!(%correlation_id, "knowledge base had no answer, re-answering directly");
            match self.general_info_fallback(&entry).await {
                Some(text) => {
                    result.response = text;
                    result.sources.clear();
                }
                None => {
                    result.response = LLM_TROUBLE_RESPONSE.to_string();
                    result.suggested_actions = vec!["try_again_later".to_string()];
                }
            }
        }

        let message_status = match response.status {
            TaskResponseStatus::Success => MessageStatus::Completed,
            TaskResponseStatus::Error => MessageStatus::Error,
        };
        if message_status == MessageStatus::Error {
            self.metrics.record_error();
        }

        match self
            .store
            .update_by_correlation(
                session_id,
                correlation_id,
                &result.response,
                message_status,
                Some(&entry.intent),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(%correlation_id, %session_id, "no provisional message matched correlation")
            }
            Err(e) => warn!(%correlation_id, error = %e, "could not apply final response"),
        }

        let envelope = PushEnvelope::new(
            PushKind::FinalResponse,
            json!({
                "session_id": session_id,
                "response": result.response,
                "intent": entry.intent,
                "requires_human_handoff": result.requires_human_handoff,
                "suggested_actions": result.suggested_actions,
                "correlation_id": correlation_id,
            }),
            Some(correlation_id),
        );
        let delivered = self.hub.send(session_id, envelope);
        info!(
            %correlation_id,
            %session_id,
            delivered,
            status = ?message_status,
            elapsed_ms = entry.registered_at.elapsed().as_millis() as u64,
            "final response resolved"
        );
    }

    /// Direct LLM answer for a knowledge-base miss.
    async fn general_info_fallback(&self, entry: &CorrelationEntry) -> Option<String> {
        let (history_text, context_json) = match self.store.get(entry.session_id).await {
            Ok(Some(session)) => (
                classification_history(&session),
                serde_json::to_string(&session.context).unwrap_or_default(),
            ),
            _ => (String::new(), "{}".to_string()),
        };

        let mut vars = HashMap::new();
        vars.insert("message".to_string(), entry.message.clone());
        vars.insert("conversation_history".to_string(), history_text);
        vars.insert("user_context".to_string(), context_json);

        let prompt = match self.prompts.render("general_info_response", &vars) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(error = %e, "general_info_response template unavailable");
                return None;
            }
        };

        let request = GenerateRequest {
            prompt,
            system_prompt: Some(GENERAL_FALLBACK_SYSTEM_PROMPT.to_string()),
            temperature: Some(0.7),
            max_tokens: Some(1000),
            ..Default::default()
        };

        match self.providers.generate(request).await {
            Ok(outcome) => {
                if outcome.used_fallback() {
                    self.metrics.record_llm_fallback();
                }
                Some(outcome.response.content)
            }
            Err(e) => {
                warn!(error = %e, "direct LLM fallback failed");
                None
            }
        }
    }

    /// One sweeper pass: notify on soft deadlines, close out entries past
    /// their hard deadline as synthesized errors.
    pub async fn sweep(&self, now: Instant) {
        for (correlation_id, session_id) in self.correlations.take_soft_expired(now) {
            self.hub.send(
                session_id,
                PushEnvelope::status(session_id, STILL_WORKING_DETAIL, Some(correlation_id)),
            );
        }

        for (correlation_id, entry) in self.correlations.take_expired(now) {
            self.metrics.record_agent_timeout();
            warn!(
                %correlation_id,
                session_id = %entry.session_id,
                intent = %entry.intent,
                "agent deadline passed, synthesizing timeout"
            );
            let session_id = entry.session_id;
            let response = TaskResponse::error(
                correlation_id,
                TaskResult {
                    response: AGENT_TIMEOUT_RESPONSE.to_string(),
                    sources: vec![],
                    requires_human_handoff: true,
                    suggested_actions: vec!["contact_support".to_string()],
                    session_id: Some(session_id),
                    error_code: Some("AGENT_TIMEOUT".to_string()),
                },
            );
            self.complete(correlation_id, entry, response).await;
        }
    }

    pub async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        self.store.get(session_id).await.map_err(map_store_error)
    }

    /// Delete a session and cancel its in-flight work; cancelled tasks
    /// produce no push. Returns whether the session existed.
    pub async fn delete_session(&self, session_id: Uuid) -> Result<bool> {
        let existed = self
            .store
            .get(session_id)
            .await
            .map_err(map_store_error)?
            .is_some();
        self.store.delete(session_id).await.map_err(map_store_error)?;
        let cancelled = self.correlations.cancel_by_session(session_id);
        if !cancelled.is_empty() {
            info!(%session_id, count = cancelled.len(), "cancelled pending work");
        }
        Ok(existed)
    }

    pub async fn store_healthy(&self) -> bool {
        self.store.count().await.is_ok()
    }

    pub fn providers_configured(&self) -> bool {
        !self.providers.is_empty()
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let active_sessions = self.store.count().await.unwrap_or(0);
        self.metrics.snapshot(
            active_sessions,
            self.hub.connection_count(),
            self.hub.dropped_count(),
            self.providers.timeout_count(),
            self.providers.primary_name(),
            self.providers.fallback_name(),
        )
    }
}

fn map_store_error(e: StoreError) -> CarelinkError {
    match e {
        StoreError::Conflict(msg) => CarelinkError::StoreOutage(msg),
        StoreError::Missing(id) => CarelinkError::SessionMissing(id.to_string()),
        StoreError::Unavailable(msg) => CarelinkError::StoreOutage(msg),
        StoreError::Corrupt(msg) => CarelinkError::Protocol(msg),
    }
}

/// Render recent history as `role: content` lines for prompts.
fn classification_history(session: &Session) -> String {
    let history = &session.conversation_history;
    let start = history.len().saturating_sub(CLASSIFY_HISTORY_MESSAGES);
    history[start..]
        .iter()
        .map(|m| format!("{}: {}", role_str(m.role), m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_history_renders_roles() {
        let mut session = Session::new(Uuid::new_v4(), "u1", UserContext::default());
        session.push_message(ConversationMessage::user("hello"), 50);
        let text = classification_history(&session);
        assert!(text.contains("assistant: Hello! I am your healthcare assistant."));
        assert!(text.ends_with("user: hello"));
    }

    #[test]
    fn classification_history_is_bounded() {
        let mut session = Session::new(Uuid::new_v4(), "u1", UserContext::default());
        for i in 0..20 {
            session.push_message(ConversationMessage::user(format!("m{i}")), 50);
        }
        let text = classification_history(&session);
        assert_eq!(text.lines().count(), CLASSIFY_HISTORY_MESSAGES);
        assert!(text.starts_with("user: m15"));
    }
}
