use crate::task::Task;
use std::borrow::Cow;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

/// Describes how to load one resource.
///
/// Two descriptors of the same type with equal fingerprints name the same
/// resource: the cache loads it once and hands out the same `Arc` to both.
/// The fingerprint must cover every parameter that changes the loaded value.
pub trait LoadDescriptor: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    /// Content fingerprint: the resource identity plus load parameters.
    fn fingerprint(&self) -> u64;

    /// Human readable identity, usually a path. Used in errors and to detect
    /// fingerprint collisions.
    fn identity(&self) -> Cow<'_, str>;

    fn load(&self) -> Task<anyhow::Result<Arc<Self::Output>>>;
}

/// Hashes `value` with the standard library's default hasher, a convenient
/// [`LoadDescriptor::fingerprint`].
pub fn fingerprint_of<H: Hash + ?Sized>(value: &H) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
