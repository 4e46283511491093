use async_trait::async_trait;
use serde_json::Value;

use super::descriptor::{MediaType, RequestDescriptor};
use crate::error::ApiError;

/// Provider-specific half of the facade: knows how to talk to one service
/// and how to map its payloads into the normalized shape.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderBackend: Send + Sync {
    /// Provider id, also used as the cache scope prefix.
    fn id(&self) -> &'static str;

    /// Raw response for a read request.
    async fn fetch(&self, request: &RequestDescriptor) -> Result<Value, ApiError>;

    /// Applies `updates` to the viewer's entry for `media_id`.
    async fn mutate(&self, media_id: u64, updates: &Value) -> Result<Value, ApiError>;

    /// Maps a raw response into the normalized shape stored in the cache.
    fn normalize(&self, request: &RequestDescriptor, raw: Value) -> Result<Value, ApiError>;

    fn media_url(&self, media_id: u64, media_type: MediaType) -> String;

    /// Authenticated viewer, when known.
    fn current_user(&self) -> Option<String>;
}
