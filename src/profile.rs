// src/profile.rs
// Persistent user profile: bounded categorized facts extracted from chats
//
// The profile file holds a fenced JSON block (the machine-readable truth)
// and a mirrored bullet list for human reading. Writes go through a coarse
// mutex; last writer wins inside the worker's critical section.

use crate::error::{Result, VellumError};
use crate::llm::prompts::{PROFILE_CATEGORIES, PROFILE_EXTRACTION_PROMPT, PROFILE_MERGE_PROMPT};
use crate::llm::{ChatRequest, LlmProvider, RequestMessage};
use crate::notes::write_atomic;
use crate::utils::truncate_chars;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Accepted items must clear this confidence bar.
pub const USER_PROFILE_MIN_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Hard cap on stored facts; oldest beyond the cap are dropped at save.
pub const MAX_PROFILE_ITEMS: usize = 100;

/// One profile fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileItem {
    pub category: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// The user's profile: an ordered bag of validated facts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub items: Vec<ProfileItem>,
}

impl UserProfile {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Facts grouped by category in the canonical category order, for the
    /// assembler's profile block.
    pub fn sections(&self) -> Vec<(&'static str, Vec<String>)> {
        PROFILE_CATEGORIES
            .iter()
            .map(|category| {
                let texts = self
                    .items
                    .iter()
                    .filter(|item| item.category == *category)
                    .map(|item| item.text.clone())
                    .collect();
                (*category, texts)
            })
            .collect()
    }
}

/// Validate one extracted item against the closed category set and the
/// confidence bar. Returns why the item was rejected, or None if accepted.
pub fn validate_item(item: &ProfileItem) -> Option<&'static str> {
    if item.text.trim().is_empty() {
        return Some("empty text");
    }
    if !PROFILE_CATEGORIES.contains(&item.category.as_str()) {
        return Some("unknown category");
    }
    if let Some(confidence) = item.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Some("confidence out of range");
        }
        if confidence < USER_PROFILE_MIN_CONFIDENCE_THRESHOLD {
            return Some("below confidence threshold");
        }
    }
    None
}

/// Render the profile document: fenced JSON block plus bullet mirror.
pub fn render_profile(profile: &UserProfile) -> String {
    let json =
        serde_json::to_string_pretty(&profile.items).unwrap_or_else(|_| "[]".to_string());
    let mut out = String::from("# User Profile\n\n```json\n");
    out.push_str(&json);
    out.push_str("\n```\n");
    if !profile.items.is_empty() {
        out.push_str("\n## Profile\n\n");
        for item in &profile.items {
            out.push_str(&format!("- {}: {}\n", item.category, item.text));
        }
    }
    out
}

/// Parse the profile document. The JSON block is authoritative; the bullet
/// list is ignored (it is regenerated on every save).
pub fn parse_profile(text: &str) -> UserProfile {
    let Some(start) = text.find("```json") else {
        return UserProfile::default();
    };
    let after = &text[start + "```json".len()..];
    let Some(end) = after.find("```") else {
        return UserProfile::default();
    };
    let items: Vec<ProfileItem> = serde_json::from_str(after[..end].trim()).unwrap_or_default();
    UserProfile { items }
}

/// Parse the merge prompt's bullet output (`- category: text` lines) back
/// into items. Lines with unknown categories are dropped.
fn parse_merged_bullets(text: &str) -> Vec<ProfileItem> {
    let mut items = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("- ") else {
            continue;
        };
        let Some((category, fact)) = rest.split_once(':') else {
            continue;
        };
        let item = ProfileItem {
            category: category.trim().to_lowercase(),
            text: fact.trim().to_string(),
            confidence: None,
        };
        if validate_item(&item).is_none() {
            items.push(item);
        }
    }
    items
}

/// File-backed profile store with a coarse write mutex.
pub struct ProfileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<UserProfile> {
        let _guard = self.lock.lock().await;
        self.load_unlocked()
    }

    fn load_unlocked(&self) -> Result<UserProfile> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_profile(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UserProfile::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, mut profile: UserProfile) -> Result<()> {
        let _guard = self.lock.lock().await;
        if profile.items.len() > MAX_PROFILE_ITEMS {
            let overflow = profile.items.len() - MAX_PROFILE_ITEMS;
            profile.items.drain(..overflow);
        }
        write_atomic(&self.path, &render_profile(&profile))
    }
}

/// Run the extraction prompt over one completed exchange and return the
/// validated items. Unparseable output means "nothing extracted", not an
/// error.
pub async fn extract_profile_facts(
    provider: &dyn LlmProvider,
    (provider_name, model): (&str, &str),
    user_message: &str,
    assistant_reply: &str,
    context: Option<&str>,
) -> Result<Vec<ProfileItem>> {
    let mut exchange = format!(
        "User: {}\n\nAssistant: {}",
        truncate_chars(user_message, 4000),
        truncate_chars(assistant_reply, 4000),
    );
    if let Some(context) = context {
        exchange = format!("Context: {}\n\n{}", truncate_chars(context, 2000), exchange);
    }

    let response = provider
        .complete(ChatRequest {
            provider: provider_name.into(),
            model: model.into(),
            messages: vec![
                RequestMessage::system(PROFILE_EXTRACTION_PROMPT),
                RequestMessage::user(exchange),
            ],
            output_control: None,
        })
        .await?;

    let parsed: Vec<ProfileItem> = match serde_json::from_str(response.trim()) {
        Ok(items) => items,
        Err(e) => {
            debug!("Profile extraction output not JSON ({}): {}", e, response);
            return Ok(Vec::new());
        }
    };

    let mut accepted = Vec::new();
    for item in parsed {
        match validate_item(&item) {
            None => accepted.push(item),
            Some(reason) => debug!("Rejected profile item ({}): {:?}", reason, item.text),
        }
    }
    Ok(accepted)
}

/// Merge accepted facts into the stored profile via the memory-update
/// prompt, then replace the file contents. Returns the merged profile.
pub async fn merge_into_profile(
    store: &ProfileStore,
    provider: &dyn LlmProvider,
    (provider_name, model): (&str, &str),
    new_items: Vec<ProfileItem>,
) -> Result<UserProfile> {
    if new_items.is_empty() {
        return store.load().await;
    }
    let existing = store.load().await?;

    let existing_bullets: String = existing
        .items
        .iter()
        .map(|i| format!("- {}: {}", i.category, i.text))
        .collect::<Vec<_>>()
        .join("\n");
    let new_bullets: String = new_items
        .iter()
        .map(|i| format!("- {}: {}", i.category, i.text))
        .collect::<Vec<_>>()
        .join("\n");

    let response = provider
        .complete(ChatRequest {
            provider: provider_name.into(),
            model: model.into(),
            messages: vec![
                RequestMessage::system(PROFILE_MERGE_PROMPT),
                RequestMessage::user(format!(
                    "Existing profile:\n{}\n\nNew facts:\n{}",
                    existing_bullets, new_bullets
                )),
            ],
            output_control: None,
        })
        .await;

    let merged = match response {
        Ok(text) => {
            let items = parse_merged_bullets(&text);
            if items.is_empty() && !existing.items.is_empty() {
                // The merge prompt produced nothing usable; appending is
                // safer than wiping the profile.
                warn!("Profile merge returned no parseable bullets, appending instead");
                append_merge(existing, new_items)
            } else {
                UserProfile { items }
            }
        }
        Err(e) => {
            warn!("Profile merge call failed ({}), appending instead", e);
            append_merge(existing, new_items)
        }
    };

    store.save(merged.clone()).await?;
    Ok(merged)
}

/// Fallback merge without the LLM: append items whose exact text is new.
fn append_merge(mut existing: UserProfile, new_items: Vec<ProfileItem>) -> UserProfile {
    for item in new_items {
        if !existing.items.iter().any(|i| i.text == item.text) {
            existing.items.push(item);
        }
    }
    existing
}

/// Invariant check used by tests and the updater's debug assertions: every
/// stored item has a known category and an in-range confidence.
pub fn profile_is_valid(profile: &UserProfile) -> bool {
    profile.items.iter().all(|item| {
        PROFILE_CATEGORIES.contains(&item.category.as_str())
            && item
                .confidence
                .map(|c| (0.0..=1.0).contains(&c))
                .unwrap_or(true)
            && !item.text.trim().is_empty()
    })
}
