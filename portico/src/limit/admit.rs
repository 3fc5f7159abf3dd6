//! Admission-control seam between endpoints and rate limiting.

use async_trait::async_trait;

use super::bucket::TokenBucket;

/// Decides whether an endpoint may accept a connection or dispatch a
/// request.
///
/// Implementations must be cheap to call and must never block the
/// accept loop for longer than the admission decision itself.
#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Admit or refuse a newly-accepted connection.
    async fn admit_connection(&self) -> bool;

    /// Admit or refuse a parsed request.
    async fn admit_request(&self) -> bool;
}

/// A [`RateLimiter`] backed by token buckets, one token per admission.
///
/// Either bucket may be omitted, in which case that class of admission
/// is unlimited.
#[derive(Debug, Clone, Default)]
pub struct BucketRateLimiter {
    connections: Option<TokenBucket>,
    requests: Option<TokenBucket>,
}

impl BucketRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(mut self, bucket: TokenBucket) -> Self {
        self.connections = Some(bucket);
        self
    }

    pub fn requests(mut self, bucket: TokenBucket) -> Self {
        self.requests = Some(bucket);
        self
    }

    /// Release every queued admission with a stopping denial, for use
    /// when the owning service shuts down.
    pub async fn deny_all(&self) {
        if let Some(bucket) = &self.connections {
            bucket.deny_all_requests().await;
        }
        if let Some(bucket) = &self.requests {
            bucket.deny_all_requests().await;
        }
    }

    async fn admit(bucket: &Option<TokenBucket>) -> bool {
        match bucket {
            None => true,
            Some(bucket) => bucket.request_grant(1u32).await.granted,
        }
    }
}

#[async_trait]
impl RateLimiter for BucketRateLimiter {
    async fn admit_connection(&self) -> bool {
        Self::admit(&self.connections).await
    }

    async fn admit_request(&self) -> bool {
        Self::admit(&self.requests).await
    }
}
