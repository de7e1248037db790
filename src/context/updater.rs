// src/context/updater.rs
// Debounced, threshold-gated background maintenance of conversation and
// project context
//
// The updater reacts to MessageSent on the event bus. Each conversation
// and each project has its own debounce timer: a new event resets the
// timer, so a burst of traffic produces exactly one refresh after the
// burst goes quiet. Threshold gating then decides whether a summary is
// actually recomputed.

use crate::context::window::{build_context_window, summary_is_meaningful};
use crate::db::types::{ChatConversation, ProjectContext};
use crate::db::{count_project_messages_since_sync, list_project_conversations_sync};
use crate::error::Result;
use crate::events::{EventBus, VaultEvent};
use crate::llm::prompts::PROJECT_SUMMARY;
use crate::llm::{ChatRequest, LlmProvider, RequestMessage};
use crate::store::VaultStore;
use crate::utils::now_ms;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CONVERSATION_SUMMARY_UPDATE_THRESHOLD: i64 = 5;
pub const PROJECT_SUMMARY_UPDATE_THRESHOLD: i64 = 10;
pub const SUMMARY_UPDATE_DEBOUNCE_MS: u64 = 3000;
pub const MIN_MESSAGES_FOR_TITLE_GENERATION: i64 = 3;

/// Background context maintainer. Construct once, call `run` with the bus.
pub struct ContextUpdater {
    store: Arc<VaultStore>,
    provider: Arc<dyn LlmProvider>,
    bus: EventBus,
    debounce_ms: u64,
    conversation_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    project_timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ContextUpdater {
    pub fn new(store: Arc<VaultStore>, provider: Arc<dyn LlmProvider>, bus: EventBus) -> Self {
        Self::with_debounce(store, provider, bus, SUMMARY_UPDATE_DEBOUNCE_MS)
    }

    /// Debounce override for tests.
    pub fn with_debounce(
        store: Arc<VaultStore>,
        provider: Arc<dyn LlmProvider>,
        bus: EventBus,
        debounce_ms: u64,
    ) -> Self {
        Self {
            store,
            provider,
            bus,
            debounce_ms,
            conversation_timers: Mutex::new(HashMap::new()),
            project_timers: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the bus and react to MessageSent until the bus closes.
    pub fn run(self: Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(VaultEvent::MessageSent { conversation_id, project_id }) => {
                        self.clone().schedule_conversation(conversation_id).await;
                        if let Some(project_id) = project_id {
                            self.clone().schedule_project(project_id).await;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Context updater lagged {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Reset the conversation's debounce timer.
    async fn schedule_conversation(self: Arc<Self>, conversation_id: String) {
        let mut timers = self.conversation_timers.lock().await;
        if let Some(existing) = timers.remove(&conversation_id) {
            existing.abort();
        }
        let updater = self.clone();
        let id = conversation_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(updater.debounce_ms)).await;
            if let Err(e) = updater.refresh_conversation(&id).await {
                if e.is_background_degradation() {
                    warn!("Conversation context refresh skipped for {}: {}", id, e);
                } else {
                    warn!("Conversation context refresh failed for {}: {}", id, e);
                }
            }
        });
        timers.insert(conversation_id, handle);
    }

    /// Reset the project's debounce timer.
    async fn schedule_project(self: Arc<Self>, project_id: String) {
        let mut timers = self.project_timers.lock().await;
        if let Some(existing) = timers.remove(&project_id) {
            existing.abort();
        }
        let updater = self.clone();
        let id = project_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(updater.debounce_ms)).await;
            if let Err(e) = updater.refresh_project(&id).await {
                warn!("Project context refresh failed for {}: {}", id, e);
            }
        });
        timers.insert(project_id, handle);
    }

    /// The conversation timer body: threshold-gated summary rebuild with
    /// optimistic persistence, then the auto-title pass.
    pub async fn refresh_conversation(&self, conversation_id: &str) -> Result<()> {
        let Some(conv) = self
            .store
            .get_conversation(conversation_id.to_string())
            .await?
        else {
            debug!("Conversation {} vanished before refresh", conversation_id);
            return Ok(());
        };

        let current = self.store.count_messages(conv.id.clone()).await?;
        let delta = current - conv.context_last_message_index;

        let conv = if delta >= CONVERSATION_SUMMARY_UPDATE_THRESHOLD {
            self.rebuild_summary(conv, current).await?
        } else {
            debug!(
                "Conversation {} below threshold ({} new messages)",
                conv.id, delta
            );
            conv
        };

        self.maybe_auto_title(&conv, current).await
    }

    /// Rebuild the context window and persist it, keyed on the updated_at
    /// observed before the build. A conflict discards the work; the next
    /// MessageSent reschedules it.
    async fn rebuild_summary(
        &self,
        conv: ChatConversation,
        current_count: i64,
    ) -> Result<ChatConversation> {
        let observed_updated_at = conv.updated_at;
        let target = self.target(&conv);
        let messages = self.store.load_messages(conv.id.clone()).await?;
        let context = build_context_window(
            self.provider.as_ref(),
            (&target.0, &target.1),
            &messages,
        )
        .await;

        let persisted = self
            .store
            .update_conversation_context(
                conv.id.clone(),
                context.clone(),
                current_count,
                observed_updated_at,
            )
            .await?;
        if !persisted {
            warn!(
                "Context for {} went stale while summarizing, discarding",
                conv.id
            );
            return Err(crate::error::VellumError::ContextStaleConflict);
        }
        info!(
            "Context window for {} updated at message index {}",
            conv.id, current_count
        );

        let mut conv = conv;
        conv.context = Some(context);
        conv.context_last_message_index = current_count;
        Ok(conv)
    }

    /// Auto-title pass: only for conversations whose title was never
    /// touched (manually or by us), with a meaningful summary and enough
    /// messages. A regenerated title that only differs in case is ignored.
    async fn maybe_auto_title(&self, conv: &ChatConversation, current_count: i64) -> Result<()> {
        if conv.title_manually_edited || conv.title_auto_updated {
            return Ok(());
        }
        if current_count < MIN_MESSAGES_FOR_TITLE_GENERATION {
            return Ok(());
        }
        let Some(summary) = conv.context.as_ref().map(|c| c.short_summary.as_str()) else {
            return Ok(());
        };
        if !summary_is_meaningful(summary) {
            return Ok(());
        }

        let target = self.target(conv);
        let messages = self.store.load_messages(conv.id.clone()).await?;
        let new_title = crate::chat::generate_title(
            self.provider.as_ref(),
            (&target.0, &target.1),
            &messages,
            Some(summary),
        )
        .await?;

        if new_title.is_empty() || new_title.to_lowercase() == conv.title.to_lowercase() {
            return Ok(());
        }

        info!("Auto-titling conversation {}: {:?}", conv.id, new_title);
        self.store
            .rename_conversation(conv.id.clone(), new_title, false, true)
            .await?;
        self.bus.publish(VaultEvent::ConversationUpdated {
            conversation_id: conv.id.clone(),
        });
        Ok(())
    }

    /// The project timer body: aggregate conversation summaries into the
    /// project summary once enough new messages accumulated.
    pub async fn refresh_project(&self, project_id: &str) -> Result<()> {
        let Some(project) = self.store.get_project(project_id.to_string()).await? else {
            debug!("Project {} vanished before refresh", project_id);
            return Ok(());
        };
        let since = project
            .context
            .as_ref()
            .map(|c| c.last_updated_ts)
            .unwrap_or(0);

        let pid = project.id.clone();
        let (new_messages, conversations) = self
            .store
            .pool()
            .run(move |conn| {
                let count = count_project_messages_since_sync(conn, &pid, since)?;
                let convs = list_project_conversations_sync(conn, &pid)?;
                Ok::<_, rusqlite::Error>((count, convs))
            })
            .await?;

        if new_messages < PROJECT_SUMMARY_UPDATE_THRESHOLD {
            debug!(
                "Project {} below threshold ({} new messages)",
                project.id, new_messages
            );
            return Ok(());
        }

        let mut sections: Vec<String> = Vec::new();
        let mut resource_ids: Vec<String> = Vec::new();
        for conv in &conversations {
            if let Some(context) = &conv.context {
                if summary_is_meaningful(&context.short_summary) {
                    let mut section = format!("{}: {}", conv.title, context.short_summary);
                    if let Some(full) = &context.full_summary {
                        section.push_str(&format!("\n{}", full));
                    }
                    sections.push(section);
                }
                for id in &context.resource_ids {
                    if !resource_ids.contains(id) {
                        resource_ids.push(id.clone());
                    }
                }
            }
        }
        if sections.is_empty() {
            debug!("Project {} has no conversation summaries yet", project.id);
            return Ok(());
        }

        let default_model = &self.store.config().default_model;
        let summary = self
            .provider
            .complete(ChatRequest {
                provider: default_model.provider.clone(),
                model: default_model.model_id.clone(),
                messages: vec![
                    RequestMessage::system(PROJECT_SUMMARY),
                    RequestMessage::user(sections.join("\n\n")),
                ],
                output_control: None,
            })
            .await
            .map_err(|e| crate::error::VellumError::ContextSummaryFailed(e.to_string()))?;

        let context = ProjectContext {
            short_summary: summary.trim().to_string(),
            full_summary: None,
            resource_ids,
            last_updated_ts: now_ms(),
        };
        self.store
            .update_project_context(project.id.clone(), context)
            .await?;
        info!("Project context for {} updated", project.id);
        Ok(())
    }

    fn target(&self, conv: &ChatConversation) -> (String, String) {
        let config = self.store.config();
        (
            conv.active_provider
                .clone()
                .unwrap_or_else(|| config.default_model.provider.clone()),
            conv.active_model
                .clone()
                .unwrap_or_else(|| config.default_model.model_id.clone()),
        )
    }
}
