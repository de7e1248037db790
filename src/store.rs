// src/store.rs
// Vault store facade: pooled database + note files under one roof
//
// The database is the index; conversation note files are the canonical
// body store. Every mutation that touches both goes through here so the
// two stay consistent (db row first, then the file rewrite, both on the
// store's write path).

use crate::config::VaultConfig;
use crate::db::vec_index::VecIndex;
use crate::db::{
    self, ChatConversation, ChatMessage, ChatProject, ConversationContext, ConversationMetaPatch,
    DatabasePool, EmbeddingRecord, ProjectContext, StarredMessage,
};
use crate::error::{Result, VellumError};
use crate::llm::LlmProvider;
use crate::notes;
use crate::scope::SearchScope;
use crate::search::{self, RerankOptions, SearchHit};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Default cap on conversation listings handed to the host UI.
pub const MAX_CONVERSATIONS_DISPLAY: usize = 100;
/// Default cap on project listings handed to the host UI.
pub const MAX_PROJECTS_DISPLAY: usize = 50;

/// Options for one retrieval call.
#[derive(Debug, Default)]
pub struct SearchOptions {
    pub limit: usize,
    /// Anchor for graph-proximity boosts.
    pub anchor_path: Option<String>,
    /// Whether the remote LLM reranker may run.
    pub enable_llm_rerank: bool,
}

/// The embedded store. One instance per vault; services share it via Arc.
pub struct VaultStore {
    pool: DatabasePool,
    vec_index: Arc<VecIndex>,
    vault_root: PathBuf,
    config: VaultConfig,
}

impl VaultStore {
    /// Open the vault's database (at `<vault>/.vellum/index.db`).
    pub async fn open(vault_root: impl Into<PathBuf>, config: VaultConfig) -> Result<Self> {
        let vault_root = vault_root.into();
        let db_path = vault_root.join(".vellum/index.db");
        let pool = DatabasePool::open(&db_path).await.map_err(VellumError::Anyhow)?;
        Ok(Self {
            pool,
            vec_index: Arc::new(VecIndex::new()),
            vault_root,
            config,
        })
    }

    /// In-memory database over a caller-supplied root (tests).
    pub async fn open_in_memory(vault_root: impl Into<PathBuf>, config: VaultConfig) -> Result<Self> {
        let pool = DatabasePool::open_in_memory().await.map_err(VellumError::Anyhow)?;
        Ok(Self {
            pool,
            vec_index: Arc::new(VecIndex::new()),
            vault_root: vault_root.into(),
            config,
        })
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn vault_root(&self) -> &Path {
        &self.vault_root
    }

    pub fn chat_root(&self) -> PathBuf {
        self.config.chat_root(&self.vault_root)
    }

    /// Absolute path of a conversation's note file.
    pub fn conversation_path(&self, file_rel_path: &str) -> PathBuf {
        self.chat_root().join(file_rel_path)
    }

    // -----------------------------------------------------------------------
    // Embeddings & documents
    // -----------------------------------------------------------------------

    /// Insert or update an embedding, keeping the vector index in sync.
    pub async fn upsert_embedding(&self, rec: EmbeddingRecord) -> Result<i64> {
        let index = self.vec_index.clone();
        self.pool
            .run(move |conn| db::upsert_embedding_sync(conn, &index, &rec))
            .await
    }

    /// Remove all embeddings (and vector rows) for a document.
    pub async fn delete_embeddings_by_doc(&self, doc_id: String) -> Result<usize> {
        let index = self.vec_index.clone();
        self.pool
            .run(move |conn| db::delete_embeddings_by_doc_sync(conn, &index, &doc_id))
            .await
    }

    /// Drop a document: embeddings, vector rows, full-text row, meta row.
    pub async fn delete_doc(&self, doc_id: String) -> Result<()> {
        let index = self.vec_index.clone();
        self.pool
            .run(move |conn| -> Result<()> {
                db::delete_embeddings_by_doc_sync(conn, &index, &doc_id)?;
                db::delete_doc_meta_sync(conn, &doc_id)?;
                Ok(())
            })
            .await
    }

    /// Bump the open counter for a document (best effort).
    pub async fn record_doc_open(&self, path: String) {
        let ts = crate::utils::now_ms();
        self.pool
            .try_interact("record_doc_open", move |conn| {
                db::record_doc_open_sync(conn, &path, ts).map_err(Into::into)
            })
            .await;
    }

    // -----------------------------------------------------------------------
    // Retrieval
    // -----------------------------------------------------------------------

    /// Hybrid search + rerank. The query embedding comes from the provider
    /// when one is supplied and an embedding model is configured; otherwise
    /// the keyword branch carries the search alone.
    pub async fn search(
        &self,
        provider: Option<&dyn LlmProvider>,
        query: &str,
        scope: SearchScope,
        opts: SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let limit = if opts.limit == 0 { 20 } else { opts.limit };

        let embedding_model = self
            .config
            .llm_provider_configs
            .get(&self.config.default_model.provider)
            .and_then(|p| p.embedding_model.clone());
        let query_embedding = match (provider, &embedding_model) {
            (Some(provider), Some(model)) => {
                match provider.generate_embedding(query, model).await {
                    Ok(embedding) => Some(embedding),
                    Err(e) => {
                        warn!("Query embedding failed, keyword-only search: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        let index = self.vec_index.clone();
        let query_owned = query.to_string();
        let hits = self
            .pool
            .run(move |conn| {
                search::hybrid_search_sync(
                    conn,
                    &index,
                    &query_owned,
                    query_embedding.as_deref(),
                    &scope,
                    limit,
                )
            })
            .await?;

        let rerank_model = self.config.rerank_model_for(&self.config.default_model.provider);
        search::rerank(
            &self.pool,
            provider,
            hits,
            query,
            RerankOptions {
                anchor_path: opts.anchor_path.as_deref(),
                enable_llm: opts.enable_llm_rerank,
                rerank_model: rerank_model.as_deref(),
            },
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn create_project(&self, project: ChatProject) -> Result<()> {
        let folder = self.chat_root().join(&project.folder_rel_path);
        std::fs::create_dir_all(&folder)?;
        self.pool
            .run(move |conn| db::create_project_sync(conn, &project))
            .await
    }

    pub async fn get_project(&self, id: String) -> Result<Option<ChatProject>> {
        self.pool.run(move |conn| db::get_project_sync(conn, &id)).await
    }

    pub async fn update_project_context(&self, id: String, context: ProjectContext) -> Result<bool> {
        self.pool
            .run(move |conn| db::update_project_context_sync(conn, &id, &context))
            .await
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Insert a conversation row and write its (empty) note file.
    pub async fn create_conversation(&self, conv: ChatConversation) -> Result<()> {
        let note = notes::render_conversation_note(&conv, &[]);
        let path = self.conversation_path(&conv.file_rel_path);
        self.pool
            .run(move |conn| db::create_conversation_sync(conn, &conv))
            .await?;
        notes::write_atomic(&path, &note)?;
        Ok(())
    }

    pub async fn get_conversation(&self, id: String) -> Result<Option<ChatConversation>> {
        self.pool
            .run(move |conn| db::get_conversation_sync(conn, &id))
            .await
    }

    /// Non-archived conversations, newest activity first. A zero limit
    /// falls back to the display cap.
    pub async fn list_conversations(
        &self,
        project_id: Option<String>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChatConversation>> {
        let limit = if limit == 0 { MAX_CONVERSATIONS_DISPLAY } else { limit };
        self.pool
            .run(move |conn| {
                db::list_conversations_sync(conn, project_id.as_deref(), limit, offset)
            })
            .await
    }

    /// Non-archived projects, newest activity first. A zero limit falls
    /// back to the display cap.
    pub async fn list_projects(&self, limit: usize, offset: usize) -> Result<Vec<ChatProject>> {
        let limit = if limit == 0 { MAX_PROJECTS_DISPLAY } else { limit };
        self.pool
            .run(move |conn| db::list_projects_sync(conn, limit, offset))
            .await
    }

    pub async fn count_messages(&self, conversation_id: String) -> Result<i64> {
        self.pool
            .run(move |conn| db::count_messages_sync(conn, &conversation_id))
            .await
    }

    /// Load the full messages of a conversation: rows from the database,
    /// bodies parsed out of the note file, resources joined per message.
    pub async fn load_messages(&self, conversation_id: String) -> Result<Vec<ChatMessage>> {
        let conv_id = conversation_id.clone();
        let (conv, rows, resources) = self
            .pool
            .run(move |conn| {
                let conv = db::get_conversation_sync(conn, &conv_id)?;
                let rows = db::list_message_rows_sync(conn, &conv_id)?;
                let mut resources = HashMap::new();
                for row in &rows {
                    resources.insert(row.id.clone(), db::resources_for_message_sync(conn, &row.id)?);
                }
                Ok::<_, rusqlite::Error>((conv, rows, resources))
            })
            .await?;

        let Some(conv) = conv else {
            return Ok(Vec::new());
        };

        let bodies = match std::fs::read_to_string(self.conversation_path(&conv.file_rel_path)) {
            Ok(text) => notes::parse_note_bodies(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let mut resources = resources;
        Ok(rows
            .into_iter()
            .map(|row| {
                let content = bodies.get(&row.id).cloned().unwrap_or_default();
                let resources = resources.remove(&row.id).unwrap_or_default();
                ChatMessage { row, content, resources }
            })
            .collect())
    }

    /// Append a message and rewrite the conversation note (the note is the
    /// canonical rendered form; the database row carries hash + metadata).
    pub async fn save_new_message(&self, conversation_id: String, message: ChatMessage) -> Result<()> {
        let row = message.row.clone();
        let resources = message.resources.clone();
        if row.conversation_id != conversation_id {
            return Err(VellumError::InvalidInput(
                "message conversation_id mismatch".into(),
            ));
        }
        self.pool
            .run(move |conn| db::insert_message_sync(conn, &row, &resources))
            .await?;
        self.rewrite_conversation_note(&conversation_id).await
    }

    /// Re-render the note file from the database rows plus parsed bodies.
    async fn rewrite_conversation_note(&self, conversation_id: &str) -> Result<()> {
        let conv = self
            .get_conversation(conversation_id.to_string())
            .await?
            .ok_or_else(|| VellumError::InvalidInput("unknown conversation".into()))?;
        let messages = self.load_messages(conversation_id.to_string()).await?;
        let note = notes::render_conversation_note(&conv, &messages);
        notes::write_atomic(&self.conversation_path(&conv.file_rel_path), &note)
    }

    pub async fn upsert_conversation_meta(
        &self,
        conversation_id: String,
        patch: ConversationMetaPatch,
    ) -> Result<bool> {
        self.pool
            .run(move |conn| db::upsert_conversation_meta_sync(conn, &conversation_id, &patch))
            .await
    }

    /// Optimistically persist a context window (see
    /// `db::update_conversation_context_sync` for the conflict rule).
    pub async fn update_conversation_context(
        &self,
        conversation_id: String,
        context: ConversationContext,
        message_index: i64,
        expected_updated_at: i64,
    ) -> Result<bool> {
        self.pool
            .run(move |conn| {
                db::update_conversation_context_sync(
                    conn,
                    &conversation_id,
                    &context,
                    message_index,
                    expected_updated_at,
                )
            })
            .await
    }

    /// Rename a conversation: new title, new file name, file moved on disk.
    pub async fn rename_conversation(
        &self,
        conversation_id: String,
        new_title: String,
        manually_edited: bool,
        auto_updated: bool,
    ) -> Result<()> {
        let conv = self
            .get_conversation(conversation_id.clone())
            .await?
            .ok_or_else(|| VellumError::InvalidInput("unknown conversation".into()))?;

        let old_path = self.conversation_path(&conv.file_rel_path);
        let new_rel = conversation_file_name(&new_title, conv.created_at, &conv.id, &conv.file_rel_path);
        let new_path = self.conversation_path(&new_rel);

        let patch = ConversationMetaPatch::new()
            .title(new_title, manually_edited, auto_updated)
            .file_rel_path(new_rel.clone());
        self.upsert_conversation_meta(conversation_id.clone(), patch).await?;

        if old_path != new_path && old_path.exists() {
            if let Some(parent) = new_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&old_path, &new_path)?;
        }
        // Note content embeds the title; refresh it.
        self.rewrite_conversation_note(&conversation_id).await
    }

    /// Transactional conversation delete: database cascade plus the note
    /// file. Returns the project id for the deletion event, or None if the
    /// conversation did not exist.
    pub async fn delete_conversation(&self, conversation_id: String) -> Result<Option<Option<String>>> {
        let deleted = self
            .pool
            .run(move |conn| db::delete_conversation_db_sync(conn, &conversation_id))
            .await?;
        let Some((project_id, file_rel_path)) = deleted else {
            return Ok(None);
        };
        let path = self.conversation_path(&file_rel_path);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove conversation note {}: {}", path.display(), e);
            }
        }
        Ok(Some(project_id))
    }

    // -----------------------------------------------------------------------
    // Starred messages
    // -----------------------------------------------------------------------

    pub async fn update_message_starred(
        &self,
        message_id: String,
        starred: bool,
        content_preview: Option<String>,
        attachment_summary: Option<String>,
        project_id: Option<String>,
    ) -> Result<bool> {
        self.pool
            .run(move |conn| {
                db::update_message_starred_sync(
                    conn,
                    &message_id,
                    starred,
                    content_preview.as_deref(),
                    attachment_summary.as_deref(),
                    project_id.as_deref(),
                )
            })
            .await
    }

    pub async fn list_starred(&self, conversation_id: Option<String>) -> Result<Vec<StarredMessage>> {
        self.pool
            .run(move |conn| db::list_starred_sync(conn, conversation_id.as_deref()))
            .await
    }

    // -----------------------------------------------------------------------
    // Durable counters
    // -----------------------------------------------------------------------

    pub async fn get_index_state(&self, key: String) -> Result<Option<String>> {
        self.pool
            .run(move |conn| db::get_index_state_sync(conn, &key))
            .await
    }

    pub async fn set_index_state(&self, key: String, value: String) -> Result<()> {
        self.pool
            .run(move |conn| db::set_index_state_sync(conn, &key, &value))
            .await
    }
}

/// Conversation file name `<title>-<timestamp>-<id>.md`, kept inside the
/// same directory as the previous name (project conversations live in the
/// project folder).
fn conversation_file_name(title: &str, created_at: i64, id: &str, old_rel_path: &str) -> String {
    let stem = crate::ids::file_stamp(title, created_at, id);
    match Path::new(old_rel_path).parent() {
        Some(parent) if parent != Path::new("") => {
            format!("{}/{}.md", parent.to_string_lossy(), stem)
        }
        _ => format!("{}.md", stem),
    }
}

#[cfg(test)]
pub mod test_support {
    //! Shared helpers for store-level tests.

    use super::*;
    use crate::db::types::{MessageRow, ResourceRef, Role};

    pub struct TestVault {
        pub store: Arc<VaultStore>,
        // Held for its Drop: deletes the temp vault
        _dir: tempfile::TempDir,
    }

    pub async fn setup_vault() -> TestVault {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = VaultStore::open_in_memory(dir.path(), VaultConfig::default())
            .await
            .expect("open store");
        TestVault {
            store: Arc::new(store),
            _dir: dir,
        }
    }

    pub fn conversation(id: &str, project_id: Option<&str>) -> ChatConversation {
        let now = crate::utils::now_ms();
        ChatConversation {
            id: id.into(),
            title: "New chat".into(),
            project_id: project_id.map(Into::into),
            created_at: now,
            updated_at: now,
            active_model: None,
            active_provider: None,
            token_usage_total: 0,
            title_manually_edited: false,
            title_auto_updated: false,
            attachment_handling: None,
            output_control: None,
            context_last_updated_ts: None,
            context_last_message_index: 0,
            file_rel_path: format!("New-chat-{}-{}.md", now, id),
            context: None,
            archived: false,
        }
    }

    pub fn message(
        id: &str,
        conversation_id: &str,
        role: Role,
        created_at: i64,
        content: &str,
    ) -> ChatMessage {
        ChatMessage {
            row: MessageRow {
                id: id.into(),
                conversation_id: conversation_id.into(),
                role,
                content_hash: crate::ids::content_hash(content),
                created_at,
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
            content: content.into(),
            resources: Vec::new(),
        }
    }

    pub fn message_with_resources(
        id: &str,
        conversation_id: &str,
        role: Role,
        created_at: i64,
        content: &str,
        sources: &[&str],
    ) -> ChatMessage {
        let mut msg = message(id, conversation_id, role, created_at, content);
        msg.resources = sources.iter().map(|s| ResourceRef::new(*s)).collect();
        msg
    }
}
