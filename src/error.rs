use thiserror::Error;

/// Error types for the LTI platform core
#[derive(Debug, Error)]
pub enum LtiError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid signature")]
    SignatureInvalid,
    #[error("claim mismatch: {0}")]
    ClaimMismatch(String),
    #[error("nonce already used")]
    NonceReused,
    #[error("unexpected message type: {0}")]
    MessageTypeInvalid(String),
    #[error("expected exactly one content item, got {0}")]
    ContentItemCountInvalid(usize),
    #[error("unsupported content item type: {0}")]
    ContentItemTypeInvalid(String),
    #[error("content item has no url")]
    ContentItemUrlMissing,
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported grant type")]
    UnsupportedGrantType,
    #[error("invalid client credentials")]
    InvalidClient,
    #[error("token is missing required scope: {0}")]
    InsufficientScope(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("key material error: {0}")]
    KeyMaterial(#[from] josekit::JoseError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}
