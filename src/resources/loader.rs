// src/resources/loader.rs
// Loaders fetch resource content for summarization

use crate::db::types::ResourceKind;
use crate::error::{Result, VellumError};
use async_trait::async_trait;
use std::path::PathBuf;

/// Fetches the text (or a text rendering) of a resource so the summarizer
/// can work on it. Kind-specific loaders for binary formats live behind
/// this same interface on the host side.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn fetch_text(&self, source: &str, kind: ResourceKind) -> Result<String>;
}

/// Loader over the vault file system. Handles text-like files; binary kinds
/// are passed through base64-less (images are summarized by the vision
/// path, which reads bytes itself).
pub struct VaultLoader {
    vault_root: PathBuf,
}

impl VaultLoader {
    pub fn new(vault_root: impl Into<PathBuf>) -> Self {
        Self {
            vault_root: vault_root.into(),
        }
    }

    /// Read raw bytes of a vault-relative source (for direct attachment
    /// encoding).
    pub async fn fetch_bytes(&self, source: &str) -> Result<Vec<u8>> {
        let path = self.vault_root.join(source);
        tokio::fs::read(&path)
            .await
            .map_err(|e| VellumError::ResourceLoaderFailed(format!("{}: {}", source, e)))
    }
}

#[async_trait]
impl ResourceLoader for VaultLoader {
    async fn fetch_text(&self, source: &str, kind: ResourceKind) -> Result<String> {
        match kind {
            ResourceKind::Markdown | ResourceKind::Attachment | ResourceKind::Other => {
                let path = self.vault_root.join(source);
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| VellumError::ResourceLoaderFailed(format!("{}: {}", source, e)))
            }
            ResourceKind::Folder => {
                let path = self.vault_root.join(source);
                let mut entries = tokio::fs::read_dir(&path)
                    .await
                    .map_err(|e| VellumError::ResourceLoaderFailed(format!("{}: {}", source, e)))?;
                let mut names = Vec::new();
                while let Ok(Some(entry)) = entries.next_entry().await {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                names.sort();
                Ok(format!("Folder {} contains: {}", source, names.join(", ")))
            }
            ResourceKind::Tag => Ok(format!("Vault tag {}", source)),
            ResourceKind::Url => Err(VellumError::ResourceLoaderFailed(format!(
                "no web loader configured for {}",
                source
            ))),
            ResourceKind::Image | ResourceKind::Pdf => Err(VellumError::ResourceLoaderFailed(
                format!("binary resource {} needs a kind-specific loader", source),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_text_markdown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "# Title\nbody").unwrap();
        let loader = VaultLoader::new(dir.path());
        let text = loader.fetch_text("a.md", ResourceKind::Markdown).await.unwrap();
        assert!(text.contains("body"));
    }

    #[tokio::test]
    async fn test_fetch_text_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let loader = VaultLoader::new(dir.path());
        let err = loader.fetch_text("ghost.md", ResourceKind::Markdown).await;
        assert!(matches!(err, Err(VellumError::ResourceLoaderFailed(_))));
    }

    #[tokio::test]
    async fn test_fetch_text_folder_lists_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("notes")).unwrap();
        std::fs::write(dir.path().join("notes/a.md"), "").unwrap();
        std::fs::write(dir.path().join("notes/b.md"), "").unwrap();
        let loader = VaultLoader::new(dir.path());
        let text = loader.fetch_text("notes", ResourceKind::Folder).await.unwrap();
        assert!(text.contains("a.md, b.md"));
    }

    #[tokio::test]
    async fn test_binary_kinds_need_specific_loader() {
        let dir = tempfile::tempdir().unwrap();
        let loader = VaultLoader::new(dir.path());
        assert!(loader.fetch_text("x.png", ResourceKind::Image).await.is_err());
        assert!(loader.fetch_text("x.pdf", ResourceKind::Pdf).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.bin"), [1u8, 2, 3]).unwrap();
        let loader = VaultLoader::new(dir.path());
        assert_eq!(loader.fetch_bytes("blob.bin").await.unwrap(), vec![1, 2, 3]);
    }
}
