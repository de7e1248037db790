// src/db/mod.rs
// Unified database layer with rusqlite + sqlite-vec
//
// Free `_sync` functions take a borrowed connection and run inside
// `DatabasePool::interact` closures; the store facade in src/store.rs wraps
// them with the file-system side effects (note files, resource notes).

mod conversations;
mod docs;
mod embeddings;
mod messages;
pub mod pool;
pub mod schema;
pub mod types;
pub mod vec_index;

pub use conversations::{
    ConversationMetaPatch, archive_conversation_sync, archive_project_cascade_sync,
    create_conversation_sync, create_project_sync, delete_conversation_db_sync,
    delete_project_row_sync, get_conversation_sync, get_project_sync,
    list_conversations_sync, list_project_conversations_sync, list_projects_sync,
    list_root_conversations_sync, mark_project_archived_sync,
    update_conversation_context_sync, update_project_context_sync,
    upsert_conversation_meta_sync,
};
pub use docs::{
    delete_doc_meta_sync, get_doc_by_id_sync, get_doc_by_path_sync, get_doc_stats_sync,
    get_index_state_sync, paths_within_hops_sync, record_doc_open_sync, replace_doc_edges_sync,
    set_index_state_sync, stats_for_paths_sync, upsert_doc_fts_sync, upsert_doc_meta_sync,
};
pub use embeddings::{
    EmbeddingIdentity, count_embeddings_sync, delete_embedding_sync,
    delete_embeddings_by_doc_sync, get_embedding_sync, identities_for_rowids_sync,
    upsert_embedding_sync,
};
pub use messages::{
    count_messages_sync, count_project_messages_since_sync, get_message_row_sync,
    get_starred_sync, insert_message_sync, list_message_rows_sync, list_starred_sync,
    resources_for_message_sync, update_message_starred_sync,
};
pub use pool::DatabasePool;
pub use types::*;
pub use vec_index::{IndexState, VecIndex};
