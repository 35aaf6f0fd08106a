//! Model metadata extraction
//!
//! The GGUF container format is treated as a black box behind the
//! `MetadataProvider` trait. The default provider validates the file header
//! and infers quantization and parameter-count hints from the file name;
//! a richer parser can be plugged in without touching the registry.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// GGUF container magic, little-endian "GGUF"
const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Errors from metadata extraction
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Not a GGUF file: {0}")]
    NotGguf(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Extracted model metadata, flattened for the API projection
#[derive(Debug, Clone, Default)]
pub struct ModelMetadata {
    pub architecture: Option<String>,
    pub quantization: Option<String>,
    pub parameter_count: Option<String>,
    pub context_length: Option<u64>,
    pub embedding_length: Option<u64>,
    pub layer_count: Option<u64>,
    pub attention_heads: Option<u64>,
    pub gguf_version: Option<u32>,
}

impl ModelMetadata {
    /// Flatten into the opaque string -> value map stored on the model
    pub fn into_map(self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        if let Some(v) = self.architecture {
            map.insert("architecture".to_string(), Value::String(v));
        }
        if let Some(v) = self.quantization {
            map.insert("quantization".to_string(), Value::String(v));
        }
        if let Some(v) = self.parameter_count {
            map.insert("parameterCount".to_string(), Value::String(v));
        }
        if let Some(v) = self.context_length {
            map.insert("contextLength".to_string(), Value::from(v));
        }
        if let Some(v) = self.embedding_length {
            map.insert("embeddingLength".to_string(), Value::from(v));
        }
        if let Some(v) = self.layer_count {
            map.insert("layerCount".to_string(), Value::from(v));
        }
        if let Some(v) = self.attention_heads {
            map.insert("attentionHeads".to_string(), Value::from(v));
        }
        if let Some(v) = self.gguf_version {
            map.insert("ggufVersion".to_string(), Value::from(v));
        }
        map
    }
}

/// A pluggable metadata extraction backend
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Extract metadata for one model file
    async fn extract(&self, path: &Path) -> Result<ModelMetadata, MetadataError>;
}

/// Default provider: header validation plus filename inference
pub struct GgufFileProvider;

#[async_trait]
impl MetadataProvider for GgufFileProvider {
    async fn extract(&self, path: &Path) -> Result<ModelMetadata, MetadataError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut header = [0u8; 8];
        file.read_exact(&mut header).await.map_err(|_| {
            MetadataError::NotGguf(format!("{}: file shorter than header", path.display()))
        })?;

        if header[0..4] != GGUF_MAGIC {
            return Err(MetadataError::NotGguf(format!(
                "{}: bad magic",
                path.display()
            )));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let filename = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();

        Ok(ModelMetadata {
            quantization: infer_quantization(filename),
            parameter_count: infer_parameter_count(filename),
            gguf_version: Some(version),
            ..Default::default()
        })
    }
}

/// Infer a quantization label like `Q4_K_M` or `F16` from a file name
pub fn infer_quantization(filename: &str) -> Option<String> {
    let upper = filename.to_uppercase();
    let re = regex::Regex::new(r"(IQ\d+_[A-Z0-9_]+|Q\d+_[A-Z0-9_]+|Q\d+|F16|F32|BF16)").ok()?;
    re.find(&upper).map(|m| m.as_str().to_string())
}

/// Infer a parameter-count hint like `7B` from a file name
pub fn infer_parameter_count(filename: &str) -> Option<String> {
    let upper = filename.to_uppercase();
    let re = regex::Regex::new(r"(\d+(?:\.\d+)?)B\b").ok()?;
    re.captures(&upper).map(|c| format!("{}B", &c[1]))
}
