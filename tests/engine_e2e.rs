// tests/engine_e2e.rs
//
// End-to-end tests of the engine through its public API: ingestion and
// KNN, dimension switches, the debounced context updater, and the hard
// conversation delete.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

use vellum::chat::{ChatOptions, ChatStreamEvent, ConversationService};
use vellum::config::VaultConfig;
use vellum::context::ContextUpdater;
use vellum::db::types::{EmbeddingRecord, TokenUsage};
use vellum::db::vec_index::VecIndex;
use vellum::db::{self, DatabasePool};
use vellum::events::{EventBus, VaultEvent};
use vellum::llm::{ChatRequest, LlmProvider, LlmStreamEvent};
use vellum::profile::ProfileStore;
use vellum::resources::{ResourceStore, VaultLoader};
use vellum::scope::SearchScope;
use vellum::store::VaultStore;

/// Provider that answers by inspecting the system prompt, so chat turns and
/// the various background prompts can interleave in any order.
struct RoutingProvider {
    short_summary_calls: AtomicUsize,
    full_summary_calls: AtomicUsize,
    title_calls: AtomicUsize,
}

impl RoutingProvider {
    fn new() -> Self {
        Self {
            short_summary_calls: AtomicUsize::new(0),
            full_summary_calls: AtomicUsize::new(0),
            title_calls: AtomicUsize::new(0),
        }
    }

    fn route(&self, request: &ChatRequest) -> String {
        let system = request
            .messages
            .first()
            .map(|m| m.text())
            .unwrap_or_default();
        if system.contains("Summarize this conversation in 1-2 sentences") {
            self.short_summary_calls.fetch_add(1, Ordering::SeqCst);
            "Talked through six questions.\nTopics: testing".to_string()
        } else if system.contains("detailed summary") {
            self.full_summary_calls.fetch_add(1, Ordering::SeqCst);
            "A long account of six questions.".to_string()
        } else if system.contains("Generate a short title") {
            self.title_calls.fetch_add(1, Ordering::SeqCst);
            "Six Questions".to_string()
        } else {
            "assistant reply".to_string()
        }
    }
}

#[async_trait]
impl LlmProvider for RoutingProvider {
    async fn stream_chat(
        &self,
        request: ChatRequest,
    ) -> vellum::Result<BoxStream<'static, LlmStreamEvent>> {
        let text = self.route(&request);
        Ok(Box::pin(futures::stream::iter(vec![
            LlmStreamEvent::TextDelta(text),
            LlmStreamEvent::Done {
                usage: Some(TokenUsage::new(10, 5)),
            },
        ])))
    }

    async fn generate_embedding(&self, _text: &str, _model: &str) -> vellum::Result<Vec<f32>> {
        Ok(vec![0.1, 0.2, 0.3, 0.4])
    }
}

struct Rig {
    service: Arc<ConversationService>,
    store: Arc<VaultStore>,
    bus: EventBus,
    provider: Arc<RoutingProvider>,
    _dir: tempfile::TempDir,
}

async fn setup_rig() -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = VaultConfig::default();
    config.profile_enabled = false;
    let store = Arc::new(
        VaultStore::open_in_memory(dir.path(), config)
            .await
            .expect("open store"),
    );
    let provider = Arc::new(RoutingProvider::new());
    let bus = EventBus::new();
    let service = Arc::new(ConversationService::new(
        store.clone(),
        provider.clone(),
        bus.clone(),
        Arc::new(VaultLoader::new(dir.path())),
        Arc::new(ResourceStore::new(dir.path().join("Chats/Resources"))),
        Arc::new(ProfileStore::new(dir.path().join("User-Profile.md"))),
    ));
    Rig {
        service,
        store,
        bus,
        provider,
        _dir: dir,
    }
}

async fn run_turn(rig: &Rig, conv_id: &str, text: &str) {
    let stream = rig
        .service
        .stream_chat(
            conv_id,
            text.to_string(),
            vec![],
            ChatOptions::default(),
            CancellationToken::new(),
        )
        .await
        .expect("stream_chat");
    let events: Vec<ChatStreamEvent> = stream.collect().await;
    assert!(
        matches!(events.last(), Some(ChatStreamEvent::Done(_))),
        "turn did not complete cleanly: {:?}",
        events.last()
    );
}

// ===========================================================================
// Storage & vector index
// ===========================================================================

fn embedding(id: &str, doc_id: &str, vector: Vec<f32>) -> EmbeddingRecord {
    EmbeddingRecord {
        id: id.into(),
        doc_id: doc_id.into(),
        chunk_id: Some(format!("{id}-c0")),
        chunk_index: Some(0),
        content_hash: "hash".into(),
        ctime: 0,
        mtime: 0,
        embedding: vector,
        embedding_model: "test-embed".into(),
    }
}

fn seed_doc(conn: &rusqlite::Connection, doc_id: &str, path: &str) {
    db::upsert_doc_meta_sync(
        conn,
        &vellum::db::DocMeta {
            id: doc_id.into(),
            path: path.into(),
            mtime: 0,
            ctime: 0,
            content_hash: "h".into(),
            word_count: 0,
            link_count: 0,
            tags: vec![],
        },
    )
    .expect("doc meta");
}

#[tokio::test]
async fn first_ingestion_knn_returns_exact_match() {
    let pool = DatabasePool::open_in_memory().await.expect("pool");
    let index = Arc::new(VecIndex::new());

    let index_for_write = index.clone();
    pool.interact(move |conn| {
        seed_doc(conn, "d1", "notes/a.md");
        db::upsert_embedding_sync(conn, &index_for_write, &embedding("e1", "d1", vec![0.1, 0.2, 0.3, 0.4]))?;
        db::upsert_embedding_sync(conn, &index_for_write, &embedding("e2", "d1", vec![0.5, 0.5, 0.5, 0.5]))?;
        Ok(())
    })
    .await
    .expect("ingest");

    let index_for_query = index.clone();
    let hits = pool
        .interact(move |conn| {
            index_for_query
                .knn(conn, &[0.1, 0.2, 0.3, 0.4], 1, &SearchScope::Vault)
                .map_err(Into::into)
        })
        .await
        .expect("knn");

    assert_eq!(hits.len(), 1);
    assert!(hits[0].1 < 1e-6, "distance was {}", hits[0].1);

    let (rowid, _) = hits[0];
    let id = pool
        .interact(move |conn| {
            let ids = db::identities_for_rowids_sync(conn, &[rowid])?;
            Ok(ids[0].id.clone())
        })
        .await
        .expect("identity");
    assert_eq!(id, "e1");
}

#[tokio::test]
async fn dimension_switch_rebuilds_index_and_keeps_primary() {
    let pool = DatabasePool::open_in_memory().await.expect("pool");
    let index = Arc::new(VecIndex::new());

    let idx = index.clone();
    pool.interact(move |conn| {
        seed_doc(conn, "d1", "notes/a.md");
        db::upsert_embedding_sync(conn, &idx, &embedding("e1", "d1", vec![0.1, 0.2, 0.3, 0.4]))?;
        db::upsert_embedding_sync(conn, &idx, &embedding("e2", "d1", vec![0.5, 0.5, 0.5, 0.5]))?;
        // The embedding model changed: 6 dimensions now
        db::upsert_embedding_sync(conn, &idx, &embedding("e3", "d1", vec![0.1; 6]))?;
        Ok(())
    })
    .await
    .expect("ingest");

    // Primary table kept all three rows
    let count = pool
        .interact(|conn| Ok(db::count_embeddings_sync(conn)))
        .await
        .expect("count");
    assert_eq!(count, 3);

    // Old 4-dim vectors are gone from the rebuilt index
    let idx = index.clone();
    let old_hits = pool
        .interact(move |conn| {
            idx.knn(conn, &[0.1, 0.2, 0.3, 0.4], 5, &SearchScope::Vault)
                .map_err(Into::into)
        })
        .await
        .expect("knn old");
    assert!(old_hits.is_empty());

    // The 6-dim vector is searchable
    let idx = index.clone();
    let new_hits = pool
        .interact(move |conn| {
            idx.knn(conn, &[0.1; 6], 5, &SearchScope::Vault).map_err(Into::into)
        })
        .await
        .expect("knn new");
    assert_eq!(new_hits.len(), 1);

    // Re-inserting a 4-dim embedding now triggers another rebuild back to 4
    let idx = index.clone();
    pool.interact(move |conn| {
        db::upsert_embedding_sync(conn, &idx, &embedding("e1", "d1", vec![0.1, 0.2, 0.3, 0.4]))
            .map(|_| ())
            .map_err(Into::into)
    })
    .await
    .expect("reinsert");
    let idx = index.clone();
    let back = pool
        .interact(move |conn| {
            idx.knn(conn, &[0.1, 0.2, 0.3, 0.4], 5, &SearchScope::Vault)
                .map_err(Into::into)
        })
        .await
        .expect("knn back");
    assert_eq!(back.len(), 1);
}

// ===========================================================================
// Conversation runtime
// ===========================================================================

#[tokio::test]
async fn debounced_summary_runs_once_and_titles() {
    let rig = setup_rig().await;
    let updater = Arc::new(ContextUpdater::with_debounce(
        rig.store.clone(),
        rig.provider.clone(),
        rig.bus.clone(),
        500,
    ));
    let _worker = updater.clone().run();

    let conv = rig
        .service
        .create_conversation("New chat", None, vec![], None, None)
        .await
        .expect("create");

    // Six quick turns: 12 messages total
    for i in 0..6 {
        run_turn(&rig, &conv.id, &format!("question {i}")).await;
    }

    // Wait for the debounce to fire and the summary to land
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let conv = rig
            .store
            .get_conversation(conv.id.clone())
            .await
            .expect("get")
            .expect("exists");
        if conv.context_last_message_index == 12 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "summary never landed; index = {}",
            conv.context_last_message_index
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    // Let any stragglers fire before counting
    tokio::time::sleep(std::time::Duration::from_millis(800)).await;

    assert_eq!(rig.provider.short_summary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.provider.full_summary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.provider.title_calls.load(Ordering::SeqCst), 1);

    let conv = rig
        .store
        .get_conversation(conv.id.clone())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(conv.context_last_message_index, 12);
    assert_eq!(conv.title, "Six Questions");
    assert!(conv.title_auto_updated);
    assert!(!conv.title_manually_edited);
    let context = conv.context.expect("context");
    assert_eq!(context.short_summary, "Talked through six questions.");
    assert_eq!(context.topics, vec!["testing"]);

    // Further traffic below the threshold does not re-summarize or re-title
    run_turn(&rig, &conv.id, "one more").await;
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    assert_eq!(rig.provider.short_summary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(rig.provider.title_calls.load(Ordering::SeqCst), 1);
    let conv = rig
        .store
        .get_conversation(conv.id.clone())
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(conv.title, "Six Questions");
}

#[tokio::test]
async fn hard_delete_leaves_no_rows_and_one_event() {
    let rig = setup_rig().await;
    rig.store
        .create_project(vellum::db::ChatProject {
            id: "p1".into(),
            name: "Research".into(),
            folder_rel_path: "Projects/Research".into(),
            created_at: 0,
            updated_at: 0,
            context: None,
            archived: false,
        })
        .await
        .expect("project");

    let project = rig
        .store
        .get_project("p1".into())
        .await
        .expect("get project")
        .expect("exists");
    let conv = rig
        .service
        .create_conversation("Doomed", Some(&project), vec![], None, None)
        .await
        .expect("create");

    // Four messages, two starred with one resource each
    for i in 0..2 {
        run_turn(&rig, &conv.id, &format!("question {i}")).await;
    }
    let messages = rig.store.load_messages(conv.id.clone()).await.expect("load");
    assert_eq!(messages.len(), 4);
    // Attach resources by direct row insert (the ingest path is external)
    for (n, msg) in messages.iter().take(2).enumerate() {
        let msg_id = msg.id().to_string();
        let conv_id = conv.id.clone();
        rig.store
            .pool()
            .interact(move |conn| {
                conn.execute(
                    "INSERT INTO message_resource (message_id, conversation_id, resource_id, source, kind)
                     VALUES (?, ?, ?, ?, 'markdown')",
                    rusqlite::params![msg_id, conv_id, format!("res{n}"), format!("notes/{n}.md")],
                )?;
                Ok(())
            })
            .await
            .expect("link resource");
        rig.service
            .toggle_star(msg.id(), &conv.id, true)
            .await
            .expect("star");
    }
    assert_eq!(
        rig.store.list_starred(Some(conv.id.clone())).await.expect("starred").len(),
        2
    );

    let note_path = rig.store.conversation_path(&conv.file_rel_path);
    assert!(note_path.exists());

    let mut rx = rig.bus.subscribe();
    assert!(rig.service.delete_conversation(&conv.id).await.expect("delete"));

    // Zero rows remain anywhere for this conversation
    let conv_id = conv.id.clone();
    let counts = rig
        .store
        .pool()
        .interact(move |conn| {
            let mut counts = Vec::new();
            for table in [
                "chat_message",
                "message_resource",
                "starred_message",
            ] {
                let n: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE conversation_id = ?"),
                    [conv_id.as_str()],
                    |r| r.get(0),
                )?;
                counts.push(n);
            }
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chat_conversation WHERE id = ?",
                [conv_id.as_str()],
                |r| r.get(0),
            )?;
            counts.push(n);
            Ok(counts)
        })
        .await
        .expect("counts");
    assert_eq!(counts, vec![0, 0, 0, 0]);
    assert!(!note_path.exists());

    // Exactly one ConversationDeleted with the project id
    match rx.recv().await.expect("event") {
        VaultEvent::ConversationDeleted { conversation_id, project_id } => {
            assert_eq!(conversation_id, conv.id);
            assert_eq!(project_id.as_deref(), Some("p1"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn hybrid_search_end_to_end() {
    let rig = setup_rig().await;
    rig.store
        .pool()
        .interact(|conn| {
            seed_doc(conn, "d1", "notes/a.md");
            db::upsert_doc_fts_sync(conn, "d1", "notes/a.md", "A", "vector search with sqlite")?;
            Ok(())
        })
        .await
        .expect("seed");

    let hits = rig
        .store
        .search(
            Some(rig.provider.as_ref() as &dyn LlmProvider),
            "vector",
            SearchScope::Vault,
            vellum::store::SearchOptions::default(),
        )
        .await
        .expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, "notes/a.md");
}
