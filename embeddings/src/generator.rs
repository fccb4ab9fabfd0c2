//! The generation contract the cache sits in front of.

use std::hash::Hash;

use async_trait::async_trait;

use crate::error::Result;

/// Something that turns a batch of keys into one output per key.
///
/// Implementations must return outputs positionally aligned with `keys`. A
/// returned error covers the whole batch; partial success is not expressible.
/// Generators are called concurrently for disjoint batches.
#[async_trait]
pub trait Generator: Send + Sync + 'static {
    /// Unit of memoization.
    type Key: Clone + Eq + Hash + Send + Sync + 'static;

    /// Output computed for one key.
    type Output: Clone + Send + Sync + 'static;

    /// Get the name of this generator, used in logs.
    fn name(&self) -> &str;

    /// Generate outputs for `keys`, in order.
    async fn generate(&self, keys: &[Self::Key]) -> Result<Vec<Self::Output>>;
}
