//! Upstream sources whose responses the cache shields.

use super::key::generate_key;
use super::manager::CacheManager;
use super::size::EstimateSize;
use crate::context::Context;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A remote source queried by kind and a parameter bag.
///
/// Implementations must honour `ctx`: once it ends, `fetch` should return
/// promptly.
#[async_trait]
pub trait Upstream<V>: Send + Sync {
    /// Query discriminator, used as the cache key prefix
    fn kind(&self) -> &str;

    async fn fetch(&self, ctx: Context, params: &HashMap<String, String>) -> anyhow::Result<V>;
}

impl<V> CacheManager<V>
where
    V: Clone + EstimateSize + Send + Sync + 'static,
{
    /// Cached `upstream.fetch`, coalesced per canonical key
    pub async fn get_or_fetch<U>(
        &self,
        ctx: &Context,
        upstream: Arc<U>,
        params: HashMap<String, String>,
    ) -> Result<V>
    where
        U: Upstream<V> + ?Sized + 'static,
    {
        let key = generate_key(upstream.kind(), &params, &[]);
        self.get_or_set(ctx, &key, move |compute_ctx| async move {
            upstream.fetch(compute_ctx, &params).await
        })
        .await
    }
}
