use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use crate::error::AppError;

pub const DEFAULT_FORMAT_VERSION: &str = "1.0";

/// Where a draft was created from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "draft_origin", rename_all = "lowercase"))]
#[serde(rename_all = "lowercase")]
pub enum DraftOrigin {
    Api,
    Mcp,
}

impl Display for DraftOrigin {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DraftOrigin::Api => write!(f, "api"),
            DraftOrigin::Mcp => write!(f, "mcp"),
        }
    }
}

impl FromStr for DraftOrigin {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(DraftOrigin::Api),
            "mcp" => Ok(DraftOrigin::Mcp),
            _ => Err(anyhow::anyhow!("Invalid draft origin: {}", s)),
        }
    }
}

/// An editable draft as the store caches it.
///
/// The projected fields are what the durable tier indexes; every other key of
/// the document (tracks, materials, ...) is carried verbatim in `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DraftDocument {
    pub width: i32,
    pub height: i32,
    /// Total length in microseconds.
    pub duration: i64,
    pub fps: f64,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

impl Default for DraftDocument {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            duration: 0,
            fps: 30.0,
            version: DEFAULT_FORMAT_VERSION.to_string(),
            name: None,
            content: Map::new(),
        }
    }
}

impl DraftDocument {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(self)
            .map_err(|e| AppError::Internal(format!("Failed to serialize draft: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AppError> {
        serde_json::from_slice(bytes)
            .map_err(|e| AppError::Internal(format!("Failed to decode draft payload: {}", e)))
    }

    /// JSON object handed to the render chain. `name_override` replaces the
    /// document name when given.
    pub fn to_render_content(&self, name_override: Option<&str>) -> Result<Value, AppError> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| AppError::Internal(format!("Failed to serialize draft: {}", e)))?;
        if let (Some(name), Value::Object(map)) = (name_override, &mut value) {
            map.insert("name".to_string(), Value::String(name.to_string()));
        }
        Ok(value)
    }
}

/// Everything the durable tier writes for one save.
#[derive(Debug, Clone)]
pub struct DraftSnapshot {
    pub draft_id: String,
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub duration: i64,
    pub fps: f64,
    pub version: String,
    pub size_bytes: i64,
    pub name: Option<String>,
    /// `None` keeps whatever origin the row already has.
    pub origin: Option<DraftOrigin>,
}

impl DraftSnapshot {
    pub fn from_document(
        draft_id: &str,
        document: &DraftDocument,
        origin: Option<DraftOrigin>,
    ) -> Result<Self, AppError> {
        let data = document.to_bytes()?;
        Ok(Self {
            draft_id: draft_id.to_string(),
            size_bytes: data.len() as i64,
            data,
            width: document.width,
            height: document.height,
            duration: document.duration,
            fps: document.fps,
            version: document.version.clone(),
            name: document.name.clone(),
            origin,
        })
    }
}

/// Draft row without its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftMetadata {
    pub draft_id: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub duration: Option<i64>,
    pub fps: Option<f64>,
    pub version: Option<String>,
    pub size_bytes: Option<i64>,
    pub name: Option<String>,
    pub origin: Option<DraftOrigin>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accessed_at: Option<DateTime<Utc>>,
}

impl DraftMetadata {
    pub fn from_snapshot(snapshot: &DraftSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            draft_id: snapshot.draft_id.clone(),
            width: Some(snapshot.width),
            height: Some(snapshot.height),
            duration: Some(snapshot.duration),
            fps: Some(snapshot.fps),
            version: Some(snapshot.version.clone()),
            size_bytes: Some(snapshot.size_bytes),
            name: snapshot.name.clone(),
            origin: snapshot.origin,
            created_at: now,
            updated_at: now,
            accessed_at: Some(now),
        }
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for DraftMetadata {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(DraftMetadata {
            draft_id: row.try_get("draft_id")?,
            width: row.try_get("width")?,
            height: row.try_get("height")?,
            duration: row.try_get("duration")?,
            fps: row.try_get("fps")?,
            version: row.try_get("version")?,
            size_bytes: row.try_get("size_bytes")?,
            name: row.try_get("draft_name")?,
            origin: row.try_get("resource")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            accessed_at: row.try_get("accessed_at")?,
        })
    }
}

/// Client-side filter applied by `search`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftSearch {
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub min_duration: Option<i64>,
    pub max_duration: Option<i64>,
}

impl DraftSearch {
    pub fn matches(&self, draft: &DraftMetadata) -> bool {
        if let Some(width) = self.width {
            if draft.width != Some(width) {
                return false;
            }
        }
        if let Some(height) = self.height {
            if draft.height != Some(height) {
                return false;
            }
        }
        // Unknown duration is treated as 0
        let duration = draft.duration.unwrap_or(0);
        if self.min_duration.is_some_and(|min| duration < min) {
            return false;
        }
        if self.max_duration.is_some_and(|max| duration > max) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftSearchResult {
    pub drafts: Vec<DraftMetadata>,
    /// Number of drafts scanned, not the number matched.
    pub total_drafts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub total_drafts: i64,
    pub backend: String,
}
