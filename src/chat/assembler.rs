// src/chat/assembler.rs
// Context assembler: builds the LLM request sequence under a token budget,
// emitting typed progress events along the way

use crate::config::AttachmentHandling;
use crate::db::types::{ChatConversation, ChatMessage, ChatProject, ResourceKind};
use crate::llm::capabilities::{capabilities_for, media_type_for};
use crate::llm::prompts::{render_context_memory, render_resource_reference, render_user_profile};
use crate::llm::{ContentPart, RequestMessage};
use crate::profile::UserProfile;
use crate::resources::VaultLoader;
use base64::Engine as _;
use futures::Stream;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Default number of recent messages carried verbatim.
pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// Progress events emitted while the prompt is being assembled, in a fixed
/// order. The host surfaces these as build status.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildProgress {
    BuildContextMessagesStart,
    LoadSystemPromptStart,
    LoadSystemPromptResult { present: bool },
    LoadUserProfileStart,
    LoadUserProfileResult { items: usize },
    BuildContextMemoryStart,
    BuildContextMemoryResult { present: bool },
    CollectRecentMessagesStart,
    CollectRecentMessagesResult { count: usize },
    BuildContextMessagesResult { message_count: usize, duration_ms: u64 },
}

/// Items yielded by the assembler stream: progress, then exactly one Final.
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerEvent {
    Progress(BuildProgress),
    Final(Vec<RequestMessage>),
}

/// Everything the assembler needs for one prompt build.
pub struct AssembleRequest {
    pub conversation: ChatConversation,
    pub project: Option<ChatProject>,
    /// Chronological history including the new user message.
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    /// Loaded profile, present only when profile injection is enabled.
    pub profile: Option<UserProfile>,
    pub model: String,
    pub attachment_handling: AttachmentHandling,
    /// Model context window in tokens; 0 disables truncation.
    pub context_window_tokens: usize,
    pub recent_limit: usize,
}

/// Build the prompt as a stream: progress events in order, then the final
/// message sequence.
pub fn build_prompt(
    loader: Arc<VaultLoader>,
    request: AssembleRequest,
) -> impl Stream<Item = AssemblerEvent> {
    async_stream::stream! {
        let started = Instant::now();
        yield AssemblerEvent::Progress(BuildProgress::BuildContextMessagesStart);

        let mut output: Vec<RequestMessage> = Vec::new();

        // 1. System instructions, always first when present
        yield AssemblerEvent::Progress(BuildProgress::LoadSystemPromptStart);
        let system_present = match &request.system_prompt {
            Some(prompt) if !prompt.trim().is_empty() => {
                output.push(RequestMessage::system(prompt.clone()));
                true
            }
            _ => false,
        };
        yield AssemblerEvent::Progress(BuildProgress::LoadSystemPromptResult {
            present: system_present,
        });

        // 2. User profile
        yield AssemblerEvent::Progress(BuildProgress::LoadUserProfileStart);
        let profile_items = match &request.profile {
            Some(profile) if !profile.is_empty() => {
                let rendered = render_user_profile(&profile.sections());
                if !rendered.is_empty() {
                    output.push(RequestMessage::system(rendered));
                }
                profile.items.len()
            }
            _ => 0,
        };
        yield AssemblerEvent::Progress(BuildProgress::LoadUserProfileResult {
            items: profile_items,
        });

        // 3. Context memory (project + conversation summaries)
        yield AssemblerEvent::Progress(BuildProgress::BuildContextMemoryStart);
        let memory = build_context_memory(&request.conversation, request.project.as_ref());
        let memory_present = memory.is_some();
        if let Some(memory) = memory {
            output.push(RequestMessage::system(memory));
        }
        yield AssemblerEvent::Progress(BuildProgress::BuildContextMemoryResult {
            present: memory_present,
        });

        // 4. Recent messages, multi-part content
        yield AssemblerEvent::Progress(BuildProgress::CollectRecentMessagesStart);
        let recent_limit = if request.recent_limit == 0 {
            DEFAULT_RECENT_LIMIT
        } else {
            request.recent_limit
        };
        let recent_start = request.messages.len().saturating_sub(recent_limit);
        let recent = &request.messages[recent_start..];
        let latest_id = recent.last().map(|m| m.id().to_string());

        let head_count = output.len();
        for msg in recent {
            let is_latest = latest_id.as_deref() == Some(msg.id());
            let parts = build_message_parts(
                &loader,
                msg,
                is_latest,
                request.attachment_handling,
                &request.model,
            )
            .await;
            // Messages that produce no content are omitted
            if parts.is_empty() {
                continue;
            }
            output.push(RequestMessage {
                role: msg.role(),
                content: parts,
            });
        }
        let collected = output.len() - head_count;
        yield AssemblerEvent::Progress(BuildProgress::CollectRecentMessagesResult {
            count: collected,
        });

        // 5. Token budget: drop from the oldest recent message forward,
        //    never the system/profile/memory head
        if request.context_window_tokens > 0 {
            truncate_to_budget(&mut output, head_count, request.context_window_tokens);
        }

        yield AssemblerEvent::Progress(BuildProgress::BuildContextMessagesResult {
            message_count: output.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        yield AssemblerEvent::Final(output);
    }
}

/// Render the context-memory block for a conversation/project pair.
fn build_context_memory(
    conversation: &ChatConversation,
    project: Option<&ChatProject>,
) -> Option<String> {
    let project_block = project.and_then(|p| {
        p.context
            .as_ref()
            .map(|c| (p.name.as_str(), c.short_summary.as_str(), c.resource_ids.as_slice()))
    });
    let conv_context = conversation.context.as_ref();
    render_context_memory(
        project_block.map(|(name, summary, res)| (name, summary, res)),
        conv_context.map(|c| c.short_summary.as_str()),
        conv_context.map(|c| c.topics.as_slice()).unwrap_or(&[]),
        conv_context.map(|c| c.resource_ids.as_slice()).unwrap_or(&[]),
    )
}

/// Build the multi-part content for one recent message: raw text first,
/// then one part per attached resource. Only the latest message may inline
/// bytes, and only under `direct` handling when the model's capabilities
/// permit the kind; everything else degrades to a templated reference.
async fn build_message_parts(
    loader: &VaultLoader,
    msg: &ChatMessage,
    is_latest: bool,
    handling: AttachmentHandling,
    model: &str,
) -> Vec<ContentPart> {
    let mut parts: Vec<ContentPart> = Vec::new();
    if !msg.content.trim().is_empty() {
        parts.push(ContentPart::text(msg.content.clone()));
    }
    if msg.resources.is_empty() {
        return parts;
    }

    let caps = capabilities_for(model);
    let mut degraded: Vec<(String, String)> = Vec::new();

    for resource in &msg.resources {
        let direct_eligible = is_latest
            && handling == AttachmentHandling::Direct
            && caps.permits(resource.kind);
        if direct_eligible {
            match loader.fetch_bytes(&resource.source).await {
                Ok(bytes) => {
                    let data = base64::engine::general_purpose::STANDARD.encode(bytes);
                    let media_type = media_type_for(&resource.source).to_string();
                    let part = match resource.kind {
                        ResourceKind::Image => ContentPart::Image { media_type, data },
                        _ => ContentPart::File {
                            media_type,
                            data,
                            name: resource.label(),
                        },
                    };
                    parts.push(part);
                    continue;
                }
                Err(e) => {
                    warn!(
                        "Direct attach failed for {}, degrading to reference: {}",
                        resource.source, e
                    );
                }
            }
        }
        degraded.push((resource.label(), resource.id.clone()));
    }

    if !degraded.is_empty() {
        parts.push(ContentPart::text(render_resource_reference(&degraded)));
    }
    parts
}

/// Drop the oldest recent messages until the estimated token total fits the
/// window. The head (system/profile/memory) is never dropped, and the
/// newest message always survives.
fn truncate_to_budget(output: &mut Vec<RequestMessage>, head_count: usize, budget_tokens: usize) {
    let estimate = |messages: &[RequestMessage]| -> usize {
        messages.iter().map(|m| (m.estimated_chars() / 4).max(1)).sum()
    };
    while estimate(output) > budget_tokens && output.len() > head_count + 1 {
        debug!("Context over budget, dropping oldest recent message");
        output.remove(head_count);
    }
}
