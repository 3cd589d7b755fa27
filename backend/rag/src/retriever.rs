use anyhow::{Context, Result};
use async_trait::async_trait;
use localrag_core::{RagConfig, RagError, Retriever};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Knowledge bases stored as plain directories of `.txt` files.
///
/// No similarity search: the first few documents of the knowledge base are
/// returned whole, whatever the query.
#[derive(Debug, Clone)]
pub struct DirectoryRetriever {
    root: PathBuf,
    max_files: usize,
}

impl DirectoryRetriever {
    pub fn new(root: impl Into<PathBuf>, max_files: usize) -> Self {
        Self {
            root: root.into(),
            max_files,
        }
    }

    pub fn from_config(config: &RagConfig) -> Self {
        Self::new(config.knowledge_base_dir(), config.max_context_files)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the available knowledge bases, sorted.
    pub async fn list_knowledge_bases(&self) -> Result<Vec<String>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to read {}", self.root.display()))?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_documents(&self, dir: &Path) -> Result<String> {
        let mut entries = fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to read {}", dir.display()))?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            paths.push(entry.path());
        }
        paths.sort();

        // Only the first few entries are considered; non-text ones among them
        // are skipped, not replaced.
        let mut content = String::new();
        for path in paths.into_iter().take(self.max_files) {
            let is_text = path.extension().is_some_and(|ext| ext == "txt");
            if !is_text || !fs::metadata(&path).await?.is_file() {
                continue;
            }
            debug!("Reading knowledge base file: {}", path.display());
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let text = String::from_utf8_lossy(&bytes);
            for line in text.lines() {
                content.push_str(line);
                content.push('\n');
            }
        }
        Ok(content)
    }
}

/// A single normal path component, so the id always resolves inside the root.
fn is_plain_name(knowledge_base: &str) -> bool {
    let mut components = Path::new(knowledge_base).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[async_trait]
impl Retriever for DirectoryRetriever {
    async fn retrieve(&self, knowledge_base: &str, _query: &str) -> Result<String, RagError> {
        let not_found = || {
            RagError::ResourceNotFound(format!(
                "knowledge base '{}' does not exist",
                knowledge_base
            ))
        };
        if !is_plain_name(knowledge_base) {
            debug!("Rejected knowledge base id: {:?}", knowledge_base);
            return Err(not_found());
        }
        let dir = self.root.join(knowledge_base);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(not_found());
        }

        info!("Starting knowledge base query: {}", knowledge_base);
        Ok(self.read_documents(&dir).await?)
    }
}
