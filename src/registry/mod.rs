//! Model Registry & Scanner
//!
//! Maintains the in-memory set of known `.gguf` models plus a persistent
//! JSON snapshot under the data directory. A scan walks the configured
//! roots lock-free and takes the write lock only for the final swap,
//! preserving user-mutable fields (favourite, alias) across rescans.

pub mod metadata;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::supervisor::{ModelState, ModelStatus};

use metadata::MetadataProvider;

/// Errors from the model registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Model '{0}' not found")]
    NotFound(String),

    #[error("Failed to persist registry: {0}")]
    PersistError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A model discovered on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    /// Stable ID derived from the absolute path
    pub id: String,

    /// File stem
    pub name: String,

    /// Name shown in UIs; defaults to the file stem
    #[serde(rename = "displayName")]
    pub display_name: String,

    /// Optional user-assigned alias
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// Absolute file path
    pub path: PathBuf,

    /// The configured root this model was found under
    #[serde(rename = "pathPrefix")]
    pub path_prefix: PathBuf,

    /// File size in bytes
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,

    /// User-toggled favourite flag, preserved across rescans
    #[serde(default)]
    pub favourite: bool,

    /// Opaque metadata from the provider
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// API-facing projection of a model with live status overlaid
#[derive(Debug, Clone, Serialize)]
pub struct ModelDto {
    pub id: String,
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub path: String,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    pub favourite: bool,
    pub metadata: HashMap<String, Value>,
    pub state: ModelState,
    #[serde(rename = "isLoaded")]
    pub is_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl Model {
    /// Project into the API DTO, overlaying live supervisor status
    pub fn to_dto(&self, status: Option<&ModelStatus>) -> ModelDto {
        let state = status.map(|s| s.state).unwrap_or(ModelState::Stopped);
        ModelDto {
            id: self.id.clone(),
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            alias: self.alias.clone(),
            path: self.path.display().to_string(),
            size_bytes: self.size_bytes,
            favourite: self.favourite,
            metadata: self.metadata.clone(),
            state,
            is_loaded: matches!(state, ModelState::Loaded | ModelState::Running),
            port: status.and_then(|s| s.port),
        }
    }
}

/// Stable model ID: truncated SHA-256 of the absolute path
pub fn stable_model_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    hash[..16].to_string()
}

/// One scan root with its recursion flag
#[derive(Debug, Clone)]
pub struct ScanRoot {
    pub path: PathBuf,
    pub recursive: bool,
}

/// Outcome of one scan
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    /// Files inspected
    #[serde(rename = "scannedFiles")]
    pub scanned_files: usize,

    /// Models in the registry after the scan
    #[serde(rename = "modelCount")]
    pub model_count: usize,

    /// Newly discovered models
    pub added: usize,

    /// Models removed because their file disappeared
    pub removed: usize,

    /// Scan duration
    #[serde(rename = "durationMillis")]
    pub duration_millis: u64,
}

/// Persistent snapshot format
#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    models: Vec<Model>,
    #[serde(rename = "savedAt")]
    saved_at: DateTime<Utc>,
}

/// The model registry
pub struct ModelRegistry {
    roots: Vec<ScanRoot>,
    snapshot_path: PathBuf,
    provider: Arc<dyn MetadataProvider>,
    models: RwLock<HashMap<String, Model>>,
}

impl ModelRegistry {
    /// Create a registry persisting under `data_dir`
    pub fn new(
        roots: Vec<ScanRoot>,
        data_dir: PathBuf,
        provider: Arc<dyn MetadataProvider>,
    ) -> Self {
        Self {
            roots,
            snapshot_path: data_dir.join("models.json"),
            provider,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Load the persisted snapshot, if one exists
    pub async fn load_snapshot(&self) -> Result<usize, RegistryError> {
        if !self.snapshot_path.exists() {
            return Ok(0);
        }
        let content = tokio::fs::read_to_string(&self.snapshot_path).await?;
        let snapshot: RegistrySnapshot = serde_json::from_str(&content)
            .map_err(|e| RegistryError::PersistError(e.to_string()))?;

        let mut models = self.models.write().await;
        *models = snapshot
            .models
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        Ok(models.len())
    }

    /// Walk the configured roots and merge the result into the registry
    ///
    /// Existing entries not seen in this scan are removed only when their
    /// path lies under a root that was actually walked; entries under a
    /// missing root (temporarily unmounted) survive.
    pub async fn scan(&self) -> Result<ScanSummary, RegistryError> {
        let started = Instant::now();

        let mut discovered: HashMap<String, Model> = HashMap::new();
        let mut scanned_files = 0usize;
        let mut walked_roots: Vec<PathBuf> = Vec::new();

        for root in &self.roots {
            if !root.path.is_dir() {
                warn!(root = %root.path.display(), "Scan root missing, keeping its entries");
                continue;
            }
            walked_roots.push(root.path.clone());

            let files = walk_gguf_files(&root.path, root.recursive).await;
            for path in files {
                scanned_files += 1;
                match self.inspect_file(&path, &root.path).await {
                    Ok(model) => {
                        discovered.insert(model.id.clone(), model);
                    }
                    Err(e) => {
                        // One bad file never fails the scan.
                        warn!(file = %path.display(), "Skipping model file: {}", e);
                    }
                }
            }
        }

        // Merge with the current set; the walk above ran without the lock.
        let (added, removed, model_count) = {
            let mut models = self.models.write().await;
            let mut added = 0usize;
            let mut removed = 0usize;

            for (id, model) in &mut discovered {
                match models.get(id) {
                    Some(existing) => {
                        // User-mutable fields survive the rescan.
                        model.favourite = existing.favourite;
                        model.alias = existing.alias.clone();
                        if existing.display_name != existing.name {
                            model.display_name = existing.display_name.clone();
                        }
                    }
                    None => added += 1,
                }
            }

            let mut next: HashMap<String, Model> = discovered;
            for (id, old) in models.iter() {
                if next.contains_key(id) {
                    continue;
                }
                let under_walked_root = walked_roots.iter().any(|r| old.path.starts_with(r));
                if under_walked_root {
                    removed += 1;
                    debug!(model = %old.name, "Removed from registry, file gone");
                } else {
                    next.insert(id.clone(), old.clone());
                }
            }

            let count = next.len();
            *models = next;
            (added, removed, count)
        };

        self.persist().await?;

        let summary = ScanSummary {
            scanned_files,
            model_count,
            added,
            removed,
            duration_millis: started.elapsed().as_millis() as u64,
        };
        info!(
            files = summary.scanned_files,
            models = summary.model_count,
            added = summary.added,
            removed = summary.removed,
            "Model scan complete"
        );
        Ok(summary)
    }

    async fn inspect_file(&self, path: &Path, root: &Path) -> Result<Model, RegistryError> {
        let meta = tokio::fs::metadata(path).await?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        // Metadata extraction failures downgrade to an empty map.
        let metadata = match self.provider.extract(path).await {
            Ok(m) => m.into_map(),
            Err(e) => {
                warn!(file = %path.display(), "Metadata extraction failed: {}", e);
                HashMap::new()
            }
        };

        Ok(Model {
            id: stable_model_id(path),
            display_name: name.clone(),
            name,
            alias: None,
            path: path.to_path_buf(),
            path_prefix: root.to_path_buf(),
            size_bytes: meta.len(),
            favourite: false,
            metadata,
        })
    }

    /// All models, sorted by name
    pub async fn list_models(&self) -> Vec<Model> {
        let models = self.models.read().await;
        let mut list: Vec<Model> = models.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Look up one model by ID
    pub async fn get(&self, id: &str) -> Option<Model> {
        self.models.read().await.get(id).cloned()
    }

    /// Look up one model by ID, alias, name or file name
    ///
    /// Stable IDs are path-derived and differ across nodes; the file name
    /// is the handle a master can address any node with.
    pub async fn resolve(&self, key: &str) -> Option<Model> {
        let models = self.models.read().await;
        if let Some(m) = models.get(key) {
            return Some(m.clone());
        }
        models
            .values()
            .find(|m| {
                m.alias.as_deref() == Some(key)
                    || m.name == key
                    || m.path.file_name().and_then(|f| f.to_str()) == Some(key)
            })
            .cloned()
    }

    /// Number of known models
    pub async fn count(&self) -> usize {
        self.models.read().await.len()
    }

    /// Whether a model file is present on this node's disk
    pub async fn has_file(&self, file_name: &str) -> bool {
        let models = self.models.read().await;
        models.values().any(|m| {
            m.path
                .file_name()
                .and_then(|f| f.to_str())
                .map(|f| f == file_name)
                .unwrap_or(false)
        })
    }

    /// Toggle the favourite flag
    pub async fn set_favourite(&self, id: &str, favourite: bool) -> Result<(), RegistryError> {
        {
            let mut models = self.models.write().await;
            let model = models
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            model.favourite = favourite;
        }
        self.persist().await
    }

    /// Set or clear the alias
    pub async fn set_alias(&self, id: &str, alias: Option<String>) -> Result<(), RegistryError> {
        {
            let mut models = self.models.write().await;
            let model = models
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            model.alias = alias;
        }
        self.persist().await
    }

    /// Write the JSON snapshot
    async fn persist(&self) -> Result<(), RegistryError> {
        let snapshot = {
            let models = self.models.read().await;
            RegistrySnapshot {
                models: models.values().cloned().collect(),
                saved_at: Utc::now(),
            }
        };

        if let Some(parent) = self.snapshot_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| RegistryError::PersistError(e.to_string()))?;
        tokio::fs::write(&self.snapshot_path, content).await?;
        Ok(())
    }
}

/// Collect `.gguf` files under a root
async fn walk_gguf_files(root: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) => {
                warn!(dir = %dir.display(), "Cannot read directory: {}", e);
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                if recursive {
                    stack.push(path);
                }
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("gguf"))
                .unwrap_or(false)
            {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}
