//! API client collaborator interface.
//!
//! The engine talks to a backend only through [`ResourceApi`]. Transport,
//! authentication and HTTP retry policy live behind the trait.

use crate::resource::{Resource, ResourceKey, ResourceKind};
use async_trait::async_trait;
use thiserror::Error;

/// Failure returned by a collaborator call.
///
/// The backend does not hand out structured error codes, so the rendered
/// text is what gets classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render(.status, .message))]
pub struct ApiError {
    /// HTTP-like status code, when known.
    pub status: Option<u16>,
    /// Error text as returned by the backend.
    pub message: String,
}

fn render(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("status {}: {}", code, message),
        None => message.to_string(),
    }
}

impl ApiError {
    /// An error carrying a status code.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// An error with no status code, e.g. a transport failure.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the error signals that the resource already exists.
    pub fn is_conflict(&self) -> bool {
        if self.status == Some(409) {
            return true;
        }
        let text = self.to_string().to_lowercase();
        ["409", "conflict", "already exists", "duplicate"]
            .iter()
            .any(|p| text.contains(p))
    }

    /// Whether the resource type is gone from the backend (410).
    pub fn is_gone(&self) -> bool {
        self.status == Some(410) || self.to_string().to_lowercase().contains("410 gone")
    }
}

/// Per-kind CRUD operations against a backend.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// List resources of a kind, optionally under a parent schema.
    async fn list(&self, kind: ResourceKind, parent: Option<&str>)
        -> Result<Vec<Resource>, ApiError>;

    /// Fetch a single resource.
    async fn get(&self, kind: ResourceKind, key: &ResourceKey) -> Result<Resource, ApiError>;

    /// Create a resource. Returns a conflict-class error when it exists.
    async fn create(&self, kind: ResourceKind, resource: &Resource) -> Result<Resource, ApiError>;

    /// Replace an existing resource.
    async fn update(
        &self,
        kind: ResourceKind,
        key: &ResourceKey,
        resource: &Resource,
    ) -> Result<Resource, ApiError>;

    /// Delete a resource.
    async fn delete(&self, kind: ResourceKind, key: &ResourceKey) -> Result<(), ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_status() {
        let err = ApiError::new(404, "blueprint 'x' was not found");
        assert_eq!(err.to_string(), "status 404: blueprint 'x' was not found");
        assert_eq!(ApiError::message("connection reset").to_string(), "connection reset");
    }

    #[test]
    fn test_conflict_detection() {
        assert!(ApiError::new(409, "nope").is_conflict());
        assert!(ApiError::message("Entity already exists").is_conflict());
        assert!(!ApiError::new(400, "bad payload").is_conflict());
    }

    #[test]
    fn test_gone_detection() {
        assert!(ApiError::new(410, "blueprint removed").is_gone());
        assert!(ApiError::message("request failed: 410 Gone").is_gone());
        assert!(ApiError::message("HTTP 410 GONE").is_gone());
        assert!(ApiError::message("upstream said 410 gone").is_gone());
        assert!(!ApiError::new(404, "missing").is_gone());
    }
}
