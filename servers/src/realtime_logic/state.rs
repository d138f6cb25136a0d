use std::sync::Arc;

use anyhow::{Context, Result};
use lib_realtime::connections::{RedisBroker, RedisBucketStore, RedisHandle};
use lib_realtime::fanout::ChannelBroker;
use lib_realtime::limiter::{BucketStore, MemoryBucketStore};
use lib_realtime::ports::{
    IdentityValidator, MemoryBlobStore, MemoryPersister, SignedTokenValidator,
};
use lib_realtime::{Collaborators, ConnectionGateway, ItemActions, MemoryBroker, RateLimiter};
use tracing::{info, warn};

use super::config::Config;

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub gateway: ConnectionGateway,
    pub actions: ItemActions,
    pub http_limiter: Arc<RateLimiter>,
    pub identities: Arc<dyn IdentityValidator>,
}

impl AppState {
    /// Wires collaborators from `config`: Redis when a URL is configured,
    /// in-process adapters otherwise.
    pub async fn build(config: &Config) -> Result<Self> {
        let secret = config
            .token_secret
            .clone()
            .context("a token secret is required (--token-secret or RT_TOKEN_SECRET)")?;
        let identities: Arc<dyn IdentityValidator> = Arc::new(SignedTokenValidator::new(secret));

        let backends: (Arc<dyn ChannelBroker>, Arc<dyn BucketStore>) = match &config.redis_url {
            Some(url) => {
                let handle = RedisHandle::connect(url)
                    .await
                    .with_context(|| format!("failed to connect to redis at {}", url))?;
                handle.ping().await.context("redis did not answer PING")?;
                info!("fan-out and rate limits shared through redis");
                (
                    Arc::new(RedisBroker::new(&handle, config.redis_broker())),
                    Arc::new(RedisBucketStore::new(&handle)),
                )
            }
            None => {
                warn!("no redis url configured, fan-out and rate limits stay in this instance");
                (Arc::new(MemoryBroker::new()), Arc::new(MemoryBucketStore::new()))
            }
        };
        let (broker, buckets) = backends;

        let blob_base_url = config.blob_base_url.clone().unwrap_or_else(|| "/files".to_string());
        let collaborators = Collaborators {
            persister: Arc::new(MemoryPersister::new()),
            blobs: Arc::new(MemoryBlobStore::new(blob_base_url)),
            identities: Arc::clone(&identities),
            broker,
        };

        Ok(Self::from_parts(collaborators, buckets, config))
    }

    pub fn from_parts(
        collaborators: Collaborators,
        buckets: Arc<dyn BucketStore>,
        config: &Config,
    ) -> Self {
        let ws_limiter =
            Arc::new(RateLimiter::new(Arc::clone(&buckets), config.ws_policy(), "ws_write"));
        let http_limiter = Arc::new(RateLimiter::new(buckets, config.http_policy(), "http"));
        Self {
            gateway: ConnectionGateway::new(collaborators.clone(), config.gateway())
                .with_write_limiter(ws_limiter),
            actions: ItemActions::new(&collaborators),
            http_limiter,
            identities: collaborators.identities,
        }
    }
}
