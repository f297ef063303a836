use std::sync::Arc;

/// Errors returned by [`ResourceCache`](crate::cache::ResourceCache) loads.
///
/// Every waiter of a shared load observes the same error, so the type is
/// cheap to clone.
#[derive(thiserror::Error, Debug, Clone)]
pub enum CacheError {
    /// The loader returned an error.
    #[error("failed to load {identity}: {error:#}")]
    Load {
        identity: Arc<str>,
        error: Arc<anyhow::Error>,
    },

    /// The loader panicked.
    #[error("loader for {identity} panicked: {}", message.as_deref().unwrap_or("<non-string payload>"))]
    Panicked {
        identity: Arc<str>,
        message: Option<String>,
    },

    /// Two descriptors of the same type produced the same fingerprint for
    /// different resources.
    #[error("fingerprint {fingerprint:#018x} of {requested} collides with cached {cached}")]
    FingerprintCollision {
        fingerprint: u64,
        cached: Arc<str>,
        requested: Arc<str>,
    },

    /// The cached value is not of the type the descriptor loads.
    #[error("cached value for {identity} is not a {expected}")]
    TypeMismatch {
        identity: Arc<str>,
        expected: &'static str,
    },

    /// The loader was dropped before finishing, because the runtime shut down.
    #[error("load of {identity} was cancelled")]
    Cancelled { identity: Arc<str> },
}

impl CacheError {
    /// The identity of the resource the failed load was for.
    pub fn identity(&self) -> &str {
        match self {
            CacheError::Load { identity, .. }
            | CacheError::Panicked { identity, .. }
            | CacheError::TypeMismatch { identity, .. }
            | CacheError::Cancelled { identity } => identity,
            CacheError::FingerprintCollision { requested, .. } => requested,
        }
    }

    /// The loader's own error, if it returned one.
    pub fn load_error(&self) -> Option<&anyhow::Error> {
        match self {
            CacheError::Load { error, .. } => Some(error),
            _ => None,
        }
    }
}
