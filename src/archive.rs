// src/archive.rs
// Throttled archiving of old conversations and projects into
// Archive/<YYYY>/<MM>/ buckets
//
// The archiver throttles (bounds how often it runs); the context updater
// debounces. The throttle is enforced twice: an in-memory timestamp for
// the common case and a persisted index_state entry that survives
// restarts.

use crate::db::types::{ChatConversation, ChatProject};
use crate::db::{
    archive_conversation_sync, archive_project_cascade_sync, list_projects_sync,
    list_root_conversations_sync,
};
use crate::error::Result;
use crate::store::VaultStore;
use crate::utils::now_ms;
use chrono::{TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const ARCHIVE_THROTTLE_MS: i64 = 10 * 60 * 1000;
pub const CONVERSATION_MAX_AGE_DAYS: i64 = 90;
pub const PROJECT_MAX_AGE_DAYS: i64 = 180;
pub const MAX_ROOT_CONVERSATIONS: usize = 50;
pub const MAX_PROJECTS: usize = 20;

const LAST_RUN_KEY: &str = "archiver.last_run";
const MS_PER_DAY: i64 = 86_400_000;

/// What one archiver pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveStats {
    pub conversations_moved: usize,
    pub projects_moved: usize,
    pub errors: usize,
    /// True when the throttle suppressed the run entirely.
    pub throttled: bool,
}

/// Age/count-based archiver over the chat root.
pub struct Archiver {
    store: Arc<VaultStore>,
    last_run: Mutex<Option<i64>>,
}

impl Archiver {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self {
            store,
            last_run: Mutex::new(None),
        }
    }

    /// Run at most once per throttle window. Per-item failures are logged
    /// and counted; the pass continues.
    pub async fn maybe_run(&self) -> Result<ArchiveStats> {
        let now = now_ms();

        let mut last_run = self.last_run.lock().await;
        if let Some(last) = *last_run {
            if now - last < ARCHIVE_THROTTLE_MS {
                debug!("Archiver throttled (in-memory)");
                return Ok(ArchiveStats { throttled: true, ..Default::default() });
            }
        }
        if let Some(persisted) = self.store.get_index_state(LAST_RUN_KEY.into()).await? {
            if let Ok(last) = persisted.parse::<i64>() {
                if now - last < ARCHIVE_THROTTLE_MS {
                    debug!("Archiver throttled (persisted)");
                    *last_run = Some(last);
                    return Ok(ArchiveStats { throttled: true, ..Default::default() });
                }
            }
        }
        *last_run = Some(now);
        drop(last_run);
        self.store
            .set_index_state(LAST_RUN_KEY.into(), now.to_string())
            .await?;

        let mut stats = ArchiveStats::default();
        self.archive_conversations(now, &mut stats).await?;
        self.archive_projects(now, &mut stats).await?;
        if stats.conversations_moved + stats.projects_moved > 0 {
            info!(
                "Archiver moved {} conversations, {} projects ({} errors)",
                stats.conversations_moved, stats.projects_moved, stats.errors
            );
        }
        Ok(stats)
    }

    async fn archive_conversations(&self, now: i64, stats: &mut ArchiveStats) -> Result<()> {
        let roots = self
            .store
            .pool()
            .run(|conn| list_root_conversations_sync(conn))
            .await?;

        // Oldest-first list: age-based eligibility, plus the oldest surplus
        // when the root count exceeds the cap.
        let surplus = roots.len().saturating_sub(MAX_ROOT_CONVERSATIONS);
        for (index, conv) in roots.iter().enumerate() {
            let too_old = now - conv.updated_at > CONVERSATION_MAX_AGE_DAYS * MS_PER_DAY;
            let forced = index < surplus;
            if !too_old && !forced {
                continue;
            }
            if let Err(e) = self.move_conversation(conv).await {
                warn!("Failed to archive conversation {}: {}", conv.id, e);
                stats.errors += 1;
            } else {
                stats.conversations_moved += 1;
            }
        }
        Ok(())
    }

    async fn archive_projects(&self, now: i64, stats: &mut ArchiveStats) -> Result<()> {
        // Newest-first from the store; work on an oldest-first view
        let mut projects = self
            .store
            .pool()
            .run(|conn| list_projects_sync(conn, usize::MAX >> 1, 0))
            .await?;
        projects.reverse();

        let surplus = projects.len().saturating_sub(MAX_PROJECTS);
        for (index, project) in projects.iter().enumerate() {
            let too_old = now - project.updated_at > PROJECT_MAX_AGE_DAYS * MS_PER_DAY;
            let forced = index < surplus;
            if !too_old && !forced {
                continue;
            }
            if let Err(e) = self.move_project(project).await {
                warn!("Failed to archive project {}: {}", project.id, e);
                stats.errors += 1;
            } else {
                stats.projects_moved += 1;
            }
        }
        Ok(())
    }

    /// Year/month bucket for an item, from its last activity.
    fn bucket(updated_at: i64) -> String {
        let when = Utc
            .timestamp_millis_opt(updated_at)
            .single()
            .unwrap_or_else(Utc::now);
        format!("Archive/{}", when.format("%Y/%m"))
    }

    async fn move_conversation(&self, conv: &ChatConversation) -> Result<()> {
        let bucket = Self::bucket(conv.updated_at);
        let file_name = Path::new(&conv.file_rel_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.md", conv.id));
        let new_rel = format!("{}/{}", bucket, file_name);

        let old_path = self.store.conversation_path(&conv.file_rel_path);
        let new_path = self.store.conversation_path(&new_rel);
        if let Some(parent) = new_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if old_path.exists() {
            std::fs::rename(&old_path, &new_path)?;
        }

        let id = conv.id.clone();
        let rel = new_rel.clone();
        self.store
            .pool()
            .run(move |conn| archive_conversation_sync(conn, &id, &rel))
            .await?;
        debug!("Archived conversation {} to {}", conv.id, new_rel);
        Ok(())
    }

    async fn move_project(&self, project: &ChatProject) -> Result<()> {
        let bucket = Self::bucket(project.updated_at);
        let folder_name = Path::new(&project.folder_rel_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| project.id.clone());
        let new_folder = format!("{}/{}", bucket, folder_name);

        let old_path = self.store.chat_root().join(&project.folder_rel_path);
        let new_path = self.store.chat_root().join(&new_folder);
        if let Some(parent) = new_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if old_path.exists() {
            std::fs::rename(&old_path, &new_path)?;
        }

        let id = project.id.clone();
        let old_folder = project.folder_rel_path.clone();
        let new_folder_db = new_folder.clone();
        self.store
            .pool()
            .run(move |conn| archive_project_cascade_sync(conn, &id, &old_folder, &new_folder_db))
            .await?;
        debug!("Archived project {} to {}", project.id, new_folder);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::db::ConversationMetaPatch;
    use crate::store::test_support::conversation;

    struct Rig {
        store: Arc<VaultStore>,
        _dir: tempfile::TempDir,
    }

    async fn setup() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            VaultStore::open_in_memory(dir.path(), VaultConfig::default())
                .await
                .unwrap(),
        );
        Rig { store, _dir: dir }
    }

    /// Create a conversation whose updated_at lies `age_days` in the past.
    async fn old_conversation(rig: &Rig, id: &str, age_days: i64) {
        let mut conv = conversation(id, None);
        let ts = now_ms() - age_days * MS_PER_DAY;
        conv.created_at = ts;
        conv.updated_at = ts;
        conv.file_rel_path = format!("{id}.md");
        rig.store.create_conversation(conv).await.unwrap();
        // create_conversation leaves updated_at as given; no patch needed
    }

    #[tokio::test]
    async fn test_old_conversations_move_into_buckets() {
        let rig = setup().await;
        old_conversation(&rig, "old1", 120).await;
        old_conversation(&rig, "new1", 5).await;

        let archiver = Archiver::new(rig.store.clone());
        let stats = archiver.maybe_run().await.unwrap();
        assert_eq!(stats.conversations_moved, 1);
        assert!(!stats.throttled);

        let old = rig.store.get_conversation("old1".into()).await.unwrap().unwrap();
        assert!(old.archived);
        assert!(old.file_rel_path.starts_with("Archive/"));
        assert!(rig.store.conversation_path(&old.file_rel_path).exists());

        let fresh = rig.store.get_conversation("new1".into()).await.unwrap().unwrap();
        assert!(!fresh.archived);

        // Archived conversations leave the listing
        let listed = rig.store.list_conversations(None, 50, 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "new1");
    }

    #[tokio::test]
    async fn test_throttle_suppresses_second_run() {
        let rig = setup().await;
        old_conversation(&rig, "old1", 120).await;

        let archiver = Archiver::new(rig.store.clone());
        let first = archiver.maybe_run().await.unwrap();
        assert_eq!(first.conversations_moved, 1);

        let second = archiver.maybe_run().await.unwrap();
        assert!(second.throttled);
        assert_eq!(second.conversations_moved, 0);
    }

    #[tokio::test]
    async fn test_persisted_throttle_survives_new_instance() {
        let rig = setup().await;
        old_conversation(&rig, "old1", 120).await;

        let first = Archiver::new(rig.store.clone());
        first.maybe_run().await.unwrap();

        // A fresh archiver (fresh in-memory state) still honors the
        // persisted timestamp
        let second = Archiver::new(rig.store.clone());
        let stats = second.maybe_run().await.unwrap();
        assert!(stats.throttled);
    }

    #[tokio::test]
    async fn test_count_cap_forces_oldest_surplus() {
        let rig = setup().await;
        // 52 fresh root conversations: none age-eligible, 2 beyond the cap
        for i in 0..(MAX_ROOT_CONVERSATIONS + 2) {
            let mut conv = conversation(&format!("c{i}"), None);
            let ts = now_ms() - (i as i64) * 1000; // c0 newest ... c51 oldest
            conv.created_at = ts;
            conv.updated_at = ts;
            conv.file_rel_path = format!("c{i}.md");
            rig.store.create_conversation(conv).await.unwrap();
        }

        let archiver = Archiver::new(rig.store.clone());
        let stats = archiver.maybe_run().await.unwrap();
        assert_eq!(stats.conversations_moved, 2);

        // The two oldest were the ones forced out
        for id in ["c51", "c50"] {
            let conv = rig.store.get_conversation(id.into()).await.unwrap().unwrap();
            assert!(conv.archived, "{id} should be archived");
        }
        let newest = rig.store.get_conversation("c0".into()).await.unwrap().unwrap();
        assert!(!newest.archived);
    }

    #[tokio::test]
    async fn test_project_archive_cascades_paths() {
        let rig = setup().await;
        let ts = now_ms() - 200 * MS_PER_DAY;
        rig.store
            .create_project(crate::db::ChatProject {
                id: "p1".into(),
                name: "Old Research".into(),
                folder_rel_path: "Projects/Old-Research".into(),
                created_at: ts,
                updated_at: ts,
                context: None,
                archived: false,
            })
            .await
            .unwrap();
        let mut conv = conversation("c1", Some("p1"));
        conv.created_at = ts;
        conv.updated_at = ts;
        conv.file_rel_path = "Projects/Old-Research/chat-1.md".into();
        rig.store.create_conversation(conv).await.unwrap();

        let archiver = Archiver::new(rig.store.clone());
        let stats = archiver.maybe_run().await.unwrap();
        // The conversation belongs to the project: moved by the cascade,
        // not by the root pass
        assert_eq!(stats.projects_moved, 1);
        assert_eq!(stats.conversations_moved, 0);

        let project = rig.store.get_project("p1".into()).await.unwrap().unwrap();
        assert!(project.archived);
        assert!(project.folder_rel_path.starts_with("Archive/"));
        assert!(project.folder_rel_path.ends_with("Old-Research"));

        let conv = rig.store.get_conversation("c1".into()).await.unwrap().unwrap();
        assert!(conv.archived);
        assert!(conv.file_rel_path.starts_with(&project.folder_rel_path));
        assert!(conv.file_rel_path.ends_with("chat-1.md"));
        assert!(rig.store.conversation_path(&conv.file_rel_path).exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_per_item_tolerant() {
        let rig = setup().await;
        old_conversation(&rig, "old1", 120).await;
        // Remove the note behind the store's back
        let conv = rig.store.get_conversation("old1".into()).await.unwrap().unwrap();
        std::fs::remove_file(rig.store.conversation_path(&conv.file_rel_path)).unwrap();

        let archiver = Archiver::new(rig.store.clone());
        let stats = archiver.maybe_run().await.unwrap();
        // Path columns still updated; no error counted
        assert_eq!(stats.conversations_moved, 1);
        assert_eq!(stats.errors, 0);
        let conv = rig.store.get_conversation("old1".into()).await.unwrap().unwrap();
        assert!(conv.archived);
    }

    #[tokio::test]
    async fn test_meta_patch_keeps_conversation_fresh() {
        let rig = setup().await;
        old_conversation(&rig, "old1", 120).await;
        // Recent activity bumps updated_at; no longer eligible
        rig.store
            .upsert_conversation_meta(
                "old1".into(),
                ConversationMetaPatch::new().token_usage_total(1),
            )
            .await
            .unwrap();

        let archiver = Archiver::new(rig.store.clone());
        let stats = archiver.maybe_run().await.unwrap();
        assert_eq!(stats.conversations_moved, 0);
    }
}
