// src/chat/service.rs
// Conversation lifecycle and the chat turn orchestration

use crate::chat::assembler::{self, AssembleRequest, DEFAULT_RECENT_LIMIT};
use crate::chat::stream::{ChatOutcome, ChatStreamEvent, TurnTarget, dispatch};
use crate::chat::title;
use crate::config::AttachmentHandling;
use crate::db::types::{ChatConversation, ChatMessage, ChatProject, MessageRow, ResourceRef, Role};
use crate::db::ConversationMetaPatch;
use crate::error::{Result, VellumError};
use crate::events::{EventBus, VaultEvent};
use crate::ids::{content_hash, file_stamp, new_id};
use crate::llm::LlmProvider;
use crate::llm::capabilities::capabilities_for;
use crate::profile::{self, ProfileStore};
use crate::resources::{Mention, ResourceStore, VaultLoader, ensure_resource_summary};
use crate::store::VaultStore;
use crate::utils::{normalize_whitespace, now_ms, truncate_chars};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PREVIEW_CHARS: usize = 200;

/// Per-turn options supplied by the caller.
#[derive(Debug, Default, Clone)]
pub struct ChatOptions {
    pub system_prompt: Option<String>,
    /// Override of the recent-message window (default 10).
    pub recent_limit: usize,
    /// Model context window in tokens (0 disables truncation).
    pub context_window_tokens: usize,
}

/// Conversation service: owns the chat flow end to end.
pub struct ConversationService {
    store: Arc<VaultStore>,
    provider: Arc<dyn LlmProvider>,
    bus: EventBus,
    loader: Arc<VaultLoader>,
    resources: Arc<ResourceStore>,
    profile: Arc<ProfileStore>,
    /// Serializes concurrent sends to the same conversation.
    send_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationService {
    pub fn new(
        store: Arc<VaultStore>,
        provider: Arc<dyn LlmProvider>,
        bus: EventBus,
        loader: Arc<VaultLoader>,
        resources: Arc<ResourceStore>,
        profile: Arc<ProfileStore>,
    ) -> Self {
        Self {
            store,
            provider,
            bus,
            loader,
            resources,
            profile,
            send_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<VaultStore> {
        &self.store
    }

    async fn send_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.send_locks.lock().await;
        locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Provider/model routing for a conversation: its own overrides, else
    /// the configured default.
    fn turn_target(&self, conv: &ChatConversation) -> TurnTarget {
        let config = self.store.config();
        TurnTarget {
            provider_name: conv
                .active_provider
                .clone()
                .unwrap_or_else(|| config.default_model.provider.clone()),
            model: conv
                .active_model
                .clone()
                .unwrap_or_else(|| config.default_model.model_id.clone()),
            output_control: conv
                .output_control
                .clone()
                .or_else(|| Some(config.default_output_control.clone())),
        }
    }

    fn attachment_handling(&self, conv: &ChatConversation) -> AttachmentHandling {
        conv.attachment_handling
            .unwrap_or(self.store.config().attachment_handling_default)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a conversation, write its note file, seed any initial
    /// messages, publish the event.
    pub async fn create_conversation(
        &self,
        title: impl Into<String>,
        project: Option<&ChatProject>,
        initial_messages: Vec<(Role, String)>,
        model: Option<String>,
        provider: Option<String>,
    ) -> Result<ChatConversation> {
        let title = title.into();
        let id = new_id();
        let now = now_ms();
        let file_rel_path = match project {
            Some(p) => format!("{}/{}.md", p.folder_rel_path, file_stamp(&title, now, &id)),
            None => format!("{}.md", file_stamp(&title, now, &id)),
        };
        let conv = ChatConversation {
            id: id.clone(),
            title,
            project_id: project.map(|p| p.id.clone()),
            created_at: now,
            updated_at: now,
            active_model: model,
            active_provider: provider,
            token_usage_total: 0,
            title_manually_edited: false,
            title_auto_updated: false,
            attachment_handling: None,
            output_control: None,
            context_last_updated_ts: None,
            context_last_message_index: 0,
            file_rel_path,
            context: None,
            archived: false,
        };
        self.store.create_conversation(conv.clone()).await?;

        for (offset, (role, content)) in initial_messages.into_iter().enumerate() {
            let message = ChatMessage {
                row: MessageRow {
                    id: new_id(),
                    conversation_id: conv.id.clone(),
                    role,
                    content_hash: content_hash(&content),
                    created_at: now + offset as i64,
                    timezone: "UTC".into(),
                    model: None,
                    provider: None,
                    starred: false,
                    is_error: false,
                    is_visible: true,
                    gen_time_ms: None,
                    token_usage: None,
                    reasoning: None,
                    tool_calls: Vec::new(),
                },
                content,
                resources: Vec::new(),
            };
            self.store.save_new_message(conv.id.clone(), message).await?;
        }

        self.bus.publish(VaultEvent::ConversationCreated {
            conversation_id: id,
        });
        Ok(conv)
    }

    /// Write user-uploaded files into the upload folder and hand back the
    /// resource refs a message can attach. Name collisions get the content
    /// id as a suffix.
    pub async fn upload_files_and_create_resources(
        &self,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<ResourceRef>> {
        let upload_root = self
            .store
            .vault_root()
            .join(&self.store.config().upload_folder);
        std::fs::create_dir_all(&upload_root)?;

        let mut refs = Vec::with_capacity(files.len());
        for (name, bytes) in files {
            let mut rel = format!("{}/{}", self.store.config().upload_folder, name);
            if upload_root.join(&name).exists() {
                let suffix = crate::ids::resource_id(&format!("{}:{}", name, bytes.len()));
                rel = match name.rsplit_once('.') {
                    Some((stem, ext)) => format!(
                        "{}/{}-{}.{}",
                        self.store.config().upload_folder, stem, suffix, ext
                    ),
                    None => format!("{}/{}-{}", self.store.config().upload_folder, name, suffix),
                };
            }
            let path = self.store.vault_root().join(&rel);
            std::fs::write(&path, &bytes)?;
            refs.push(ResourceRef::new(rel));
        }
        Ok(refs)
    }

    /// Rename a conversation (file move included) and publish the update.
    pub async fn update_conversation_title(
        &self,
        conversation_id: &str,
        new_title: &str,
        manually_edited: bool,
        auto_updated: bool,
    ) -> Result<()> {
        self.store
            .rename_conversation(
                conversation_id.to_string(),
                new_title.to_string(),
                manually_edited,
                auto_updated,
            )
            .await?;
        self.bus.publish(VaultEvent::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// Delete a conversation through the store's single transactional path.
    /// Publishes exactly one ConversationDeleted event.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        match self.store.delete_conversation(conversation_id.to_string()).await? {
            Some(project_id) => {
                self.bus.publish(VaultEvent::ConversationDeleted {
                    conversation_id: conversation_id.to_string(),
                    project_id,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // -----------------------------------------------------------------------
    // Starred messages
    // -----------------------------------------------------------------------

    /// Star or unstar a message. Starring computes the content preview
    /// (first 200 chars, whitespace-normalized) and the attachment summary
    /// (comma-joined resource labels); unstarring nulls both.
    pub async fn toggle_star(
        &self,
        message_id: &str,
        conversation_id: &str,
        starred: bool,
    ) -> Result<bool> {
        if !starred {
            return self
                .store
                .update_message_starred(message_id.to_string(), false, None, None, None)
                .await;
        }

        let conv = self
            .store
            .get_conversation(conversation_id.to_string())
            .await?
            .ok_or_else(|| VellumError::InvalidInput("unknown conversation".into()))?;
        let messages = self.store.load_messages(conversation_id.to_string()).await?;
        let Some(msg) = messages.iter().find(|m| m.id() == message_id) else {
            return Ok(false);
        };

        let preview = truncate_chars(&normalize_whitespace(&msg.content), PREVIEW_CHARS);
        let attachment_summary = if msg.resources.is_empty() {
            None
        } else {
            Some(
                msg.resources
                    .iter()
                    .map(|r| r.label())
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        };
        self.store
            .update_message_starred(
                message_id.to_string(),
                true,
                Some(preview),
                attachment_summary,
                conv.project_id.clone(),
            )
            .await
    }

    // -----------------------------------------------------------------------
    // The chat turn
    // -----------------------------------------------------------------------

    /// Stream one chat turn: persist the user message, assemble the prompt,
    /// drive the LLM, persist the final assistant message, publish
    /// MessageSent. Concurrent sends to the same conversation serialize on
    /// a per-conversation lock held for the life of the stream.
    pub async fn stream_chat(
        self: &Arc<Self>,
        conversation_id: &str,
        user_content: String,
        attachments: Vec<String>,
        options: ChatOptions,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, ChatStreamEvent>> {
        let lock = self.send_lock(conversation_id).await;
        let guard = lock.lock_owned().await;

        let conv = self
            .store
            .get_conversation(conversation_id.to_string())
            .await?
            .ok_or_else(|| VellumError::InvalidInput("unknown conversation".into()))?;
        let project = match &conv.project_id {
            Some(project_id) => self.store.get_project(project_id.clone()).await?,
            None => None,
        };

        let target = self.turn_target(&conv);
        let handling = self.attachment_handling(&conv);

        // Materialize resources for the user message; prepare summaries for
        // everything that will not be attached directly.
        let resources: Vec<ResourceRef> =
            attachments.iter().map(|s| ResourceRef::new(s.as_str())).collect();
        let caps = capabilities_for(&target.model);
        for resource in &resources {
            let degraded = handling != AttachmentHandling::Direct || !caps.permits(resource.kind);
            if degraded {
                if let Err(e) = ensure_resource_summary(
                    &self.resources,
                    self.loader.as_ref(),
                    self.provider.as_ref(),
                    (&target.provider_name, &target.model),
                    &resource.source,
                    Mention::Conversation(conv.id.clone()),
                )
                .await
                {
                    warn!("Resource summary preparation failed for {}: {}", resource.source, e);
                }
            }
        }

        // Persist the user message
        let user_message = ChatMessage {
            row: MessageRow {
                id: new_id(),
                conversation_id: conv.id.clone(),
                role: Role::User,
                content_hash: content_hash(&user_content),
                created_at: now_ms(),
                timezone: "UTC".into(),
                model: None,
                provider: None,
                starred: false,
                is_error: false,
                is_visible: true,
                gen_time_ms: None,
                token_usage: None,
                reasoning: None,
                tool_calls: Vec::new(),
            },
            content: user_content,
            resources,
        };
        self.store
            .save_new_message(conv.id.clone(), user_message)
            .await?;

        // Assemble and dispatch
        let messages = self.store.load_messages(conv.id.clone()).await?;
        let config = self.store.config();
        let profile = if config.profile_is_enabled() {
            Some(self.profile.load().await?)
        } else {
            None
        };
        let assemble = AssembleRequest {
            conversation: conv.clone(),
            project,
            messages,
            system_prompt: options.system_prompt.clone(),
            profile,
            model: target.model.clone(),
            attachment_handling: handling,
            context_window_tokens: options.context_window_tokens,
            recent_limit: if options.recent_limit == 0 {
                DEFAULT_RECENT_LIMIT
            } else {
                options.recent_limit
            },
        };
        let assembler_stream = assembler::build_prompt(self.loader.clone(), assemble);
        let inner = dispatch(self.provider.clone(), assembler_stream, target.clone(), cancel);

        // Wrap the dispatcher stream: on a clean Done, persist the assistant
        // message before handing the event to the consumer. Cancelled turns
        // surface their partial content but persist nothing.
        let service = self.clone();
        let conv_id = conv.id.clone();
        let stream = async_stream::stream! {
            let _guard = guard;
            futures::pin_mut!(inner);
            while let Some(event) = inner.next().await {
                match event {
                    ChatStreamEvent::Done(outcome) => {
                        if !outcome.cancelled && !outcome.content.is_empty() {
                            if let Err(e) = service
                                .add_assistant_message(&conv_id, &outcome, &target)
                                .await
                            {
                                warn!("Failed to persist assistant message: {}", e);
                                yield ChatStreamEvent::Error { message: e.to_string() };
                                return;
                            }
                        } else {
                            debug!(
                                "Turn ended without persistence (cancelled={} empty={})",
                                outcome.cancelled,
                                outcome.content.is_empty()
                            );
                        }
                        yield ChatStreamEvent::Done(outcome);
                    }
                    other => yield other,
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Persist an assistant message, update the conversation meta in one
    /// patch, publish MessageSent, and kick profile extraction.
    pub async fn add_assistant_message(
        &self,
        conversation_id: &str,
        outcome: &ChatOutcome,
        target: &TurnTarget,
    ) -> Result<()> {
        let conv = self
            .store
            .get_conversation(conversation_id.to_string())
            .await?
            .ok_or_else(|| VellumError::InvalidInput("unknown conversation".into()))?;

        let message = ChatMessage {
            row: MessageRow {
                id: new_id(),
                conversation_id: conv.id.clone(),
                role: Role::Assistant,
                content_hash: content_hash(&outcome.content),
                created_at: now_ms(),
                timezone: "UTC".into(),
                model: Some(target.model.clone()),
                provider: Some(target.provider_name.clone()),
                starred: false,
                is_error: false,
                is_visible: true,
                gen_time_ms: Some(outcome.gen_time_ms as i64),
                token_usage: outcome.usage,
                reasoning: outcome.reasoning.clone(),
                tool_calls: Vec::new(),
            },
            content: outcome.content.clone(),
            resources: Vec::new(),
        };
        self.store.save_new_message(conv.id.clone(), message).await?;

        let usage_total = conv.token_usage_total
            + outcome.usage.map(|u| u.total_tokens as i64).unwrap_or(0);
        let patch = ConversationMetaPatch::new()
            .model_provider(target.model.clone(), target.provider_name.clone())
            .token_usage_total(usage_total);
        self.store.upsert_conversation_meta(conv.id.clone(), patch).await?;

        // MessageSent always carries the conversation's own project id, so
        // both the conversation and project summarizers fire.
        self.bus.publish(VaultEvent::MessageSent {
            conversation_id: conv.id.clone(),
            project_id: conv.project_id.clone(),
        });

        self.spawn_profile_extraction(&conv).await;
        Ok(())
    }

    /// After a completed assistant turn, extract profile facts from the
    /// final exchange in the background.
    async fn spawn_profile_extraction(&self, conv: &ChatConversation) {
        if !self.store.config().profile_is_enabled() {
            return;
        }
        let messages = match self.store.load_messages(conv.id.clone()).await {
            Ok(m) => m,
            Err(e) => {
                warn!("Profile extraction skipped, cannot load messages: {}", e);
                return;
            }
        };
        let assistant = messages.iter().rev().find(|m| m.role() == Role::Assistant);
        let user = messages.iter().rev().find(|m| m.role() == Role::User);
        let (Some(user), Some(assistant)) = (user, assistant) else {
            return;
        };

        let provider = self.provider.clone();
        let profile_store = self.profile.clone();
        let target = self.turn_target(conv);
        let context = conv.context.as_ref().map(|c| c.short_summary.clone());
        let user_text = user.content.clone();
        let assistant_text = assistant.content.clone();

        tokio::spawn(async move {
            let extracted = match profile::extract_profile_facts(
                provider.as_ref(),
                (&target.provider_name, &target.model),
                &user_text,
                &assistant_text,
                context.as_deref(),
            )
            .await
            {
                Ok(items) => items,
                Err(e) => {
                    warn!("Profile extraction failed: {}", e);
                    return;
                }
            };
            if extracted.is_empty() {
                return;
            }
            if let Err(e) = profile::merge_into_profile(
                &profile_store,
                provider.as_ref(),
                (&target.provider_name, &target.model),
                extracted,
            )
            .await
            {
                warn!("Profile merge failed: {}", e);
            }
        });
    }

    /// Generate a (cleaned, capped) title for a conversation's opening
    /// messages.
    pub async fn generate_title(
        &self,
        conv: &ChatConversation,
        messages: &[ChatMessage],
    ) -> Result<String> {
        let target = self.turn_target(conv);
        let short_summary = conv
            .context
            .as_ref()
            .map(|c| c.short_summary.as_str())
            .filter(|s| !s.is_empty() && *s != crate::llm::prompts::DEFAULT_SUMMARY);
        title::generate_title(
            self.provider.as_ref(),
            (&target.provider_name, &target.model),
            messages,
            short_summary,
        )
        .await
    }
}
