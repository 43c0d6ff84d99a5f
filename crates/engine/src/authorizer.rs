use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use partway_protocol::{PartAuthorization, UploadSession};
use tracing::debug;

use crate::backend::SessionBackend;
use crate::config::AuthorizerConfig;
use crate::error::UploadError;

/// Cache of presigned part URLs with batched refresh.
///
/// Authorizations expire server-side, so a cached entry is only served
/// while it has at least the safety margin left. A miss fetches a whole
/// batch starting at the requested part, on the assumption that the pump
/// walks parts in ascending order.
pub struct PartAuthorizer {
    backend: Arc<dyn SessionBackend>,
    session_id: String,
    total_parts: u32,
    config: AuthorizerConfig,
    cache: Mutex<HashMap<u32, PartAuthorization>>,
    /// Serializes refresh round trips. Taken only while `cache` is
    /// unlocked, so lookups and invalidation never wait on backend I/O.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl PartAuthorizer {
    /// Build an authorizer seeded with whatever authorizations the backend
    /// attached to the session descriptor.
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        session: &UploadSession,
        config: AuthorizerConfig,
    ) -> Self {
        let seeded: HashMap<u32, PartAuthorization> = session
            .presigned_parts
            .iter()
            .map(|auth| (auth.part_number, auth.clone()))
            .collect();
        Self {
            backend,
            session_id: session.id.clone(),
            total_parts: session.total_parts(),
            config,
            cache: Mutex::new(seeded),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// A usable authorization for `part`, refreshed from the backend when
    /// the cached one is missing or about to expire.
    ///
    /// Concurrent misses queue on one round trip instead of each issuing
    /// their own; cached hits bypass the queue entirely.
    pub async fn authorize(&self, part: u32) -> Result<PartAuthorization, UploadError> {
        if let Some(auth) = self.fresh_entry(part) {
            return Ok(auth);
        }

        let _refresh = self.refresh_gate.lock().await;
        // The round trip we queued behind may have covered this part.
        if let Some(auth) = self.fresh_entry(part) {
            return Ok(auth);
        }

        let last = part
            .saturating_add(self.config.batch_size.saturating_sub(1))
            .min(self.total_parts);
        let wanted: Vec<u32> = (part..=last).collect();
        debug!(
            session = %self.session_id,
            from = part,
            to = last,
            "refreshing part authorizations"
        );

        let fresh = self
            .backend
            .presign_parts(self.session_id.clone(), wanted)
            .await?;

        let mut cache = self.cache.lock().unwrap();
        for auth in fresh {
            cache.insert(auth.part_number, auth);
        }
        // Freshly minted URLs are trusted as-is, without the margin check.
        cache.get(&part).cloned().ok_or_else(|| {
            UploadError::Backend(format!("presign response missing part {part}"))
        })
    }

    /// Drop the cached authorization for `part`, forcing a refresh on the
    /// next request. Called when storage rejects a URL we thought was good.
    pub fn invalidate(&self, part: u32) {
        self.cache.lock().unwrap().remove(&part);
    }

    fn fresh_entry(&self, part: u32) -> Option<PartAuthorization> {
        self.cache
            .lock()
            .unwrap()
            .get(&part)
            .filter(|auth| auth.usable_within(self.config.safety_margin))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use partway_protocol::{
        CompletedUpload, CreateSessionRequest, PartOutcome, SessionStatus,
    };
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::Instant;

    struct ScriptedBackend {
        presign_calls: StdMutex<Vec<Vec<u32>>>,
        ttl_seconds: i64,
        delay: Option<Duration>,
    }

    impl ScriptedBackend {
        fn new(ttl_seconds: i64) -> Self {
            Self {
                presign_calls: StdMutex::new(Vec::new()),
                ttl_seconds,
                delay: None,
            }
        }

        fn slow(ttl_seconds: i64, delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(ttl_seconds)
            }
        }

        fn batches(&self) -> Vec<Vec<u32>> {
            self.presign_calls.lock().unwrap().clone()
        }
    }

    impl SessionBackend for ScriptedBackend {
        fn create_session(
            &self,
            _request: CreateSessionRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UploadSession, UploadError>> + Send + '_>>
        {
            Box::pin(async { Err(UploadError::Backend("not scripted".into())) })
        }

        fn presign_parts(
            &self,
            _session_id: String,
            part_numbers: Vec<u32>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<PartAuthorization>, UploadError>> + Send + '_>>
        {
            self.presign_calls
                .lock()
                .unwrap()
                .push(part_numbers.clone());
            let ttl = chrono::Duration::seconds(self.ttl_seconds);
            let delay = self.delay;
            let fresh: Vec<PartAuthorization> = part_numbers
                .iter()
                .map(|part| PartAuthorization {
                    part_number: *part,
                    url: format!("https://store.test/fresh/{part}"),
                    expires_at: Utc::now() + ttl,
                })
                .collect();
            Box::pin(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(fresh)
            })
        }

        fn complete(
            &self,
            _session_id: String,
            _parts: Vec<PartOutcome>,
        ) -> Pin<Box<dyn Future<Output = Result<CompletedUpload, UploadError>> + Send + '_>>
        {
            Box::pin(async { Err(UploadError::Backend("not scripted".into())) })
        }

        fn status(
            &self,
            _session_id: String,
        ) -> Pin<Box<dyn Future<Output = Result<SessionStatus, UploadError>> + Send + '_>>
        {
            Box::pin(async { Err(UploadError::Backend("not scripted".into())) })
        }
    }

    fn session_with_parts(size: u64, part_size: u64, seeded: Vec<PartAuthorization>) -> UploadSession {
        UploadSession {
            id: "sess-1".into(),
            bucket: "uploads".into(),
            key: "files/demo.bin".into(),
            upload_id: "mp-1".into(),
            size,
            part_size,
            created_at: Utc::now(),
            presigned_parts: seeded,
            filename: None,
        }
    }

    fn seeded_auth(part: u32, ttl_seconds: i64) -> PartAuthorization {
        PartAuthorization {
            part_number: part,
            url: format!("https://store.test/seeded/{part}"),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_seconds),
        }
    }

    #[tokio::test]
    async fn seeded_urls_served_without_refresh() {
        let backend = Arc::new(ScriptedBackend::new(3600));
        let session = session_with_parts(
            100 * 1024 * 1024,
            8 * 1024 * 1024,
            vec![seeded_auth(1, 3600), seeded_auth(2, 3600)],
        );
        let authorizer = PartAuthorizer::new(backend.clone(), &session, AuthorizerConfig::default());

        let auth = authorizer.authorize(1).await.unwrap();
        assert_eq!(auth.url, "https://store.test/seeded/1");
        assert!(backend.batches().is_empty());
    }

    #[tokio::test]
    async fn near_expiry_entry_is_refreshed_in_a_batch() {
        let backend = Arc::new(ScriptedBackend::new(3600));
        // 10s left is inside the 60s safety margin.
        let session = session_with_parts(
            400 * 1024 * 1024,
            8 * 1024 * 1024,
            vec![seeded_auth(1, 10)],
        );
        let authorizer = PartAuthorizer::new(backend.clone(), &session, AuthorizerConfig::default());

        let auth = authorizer.authorize(1).await.unwrap();
        assert_eq!(auth.url, "https://store.test/fresh/1");

        let batches = backend.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], (1..=20).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn batch_clamped_to_last_part() {
        let backend = Arc::new(ScriptedBackend::new(3600));
        let session = session_with_parts(40 * 1024 * 1024, 8 * 1024 * 1024, Vec::new());
        let authorizer = PartAuthorizer::new(backend.clone(), &session, AuthorizerConfig::default());

        authorizer.authorize(4).await.unwrap();
        assert_eq!(backend.batches(), vec![vec![4, 5]]);
    }

    #[tokio::test]
    async fn missing_part_in_response_is_an_error() {
        struct EmptyBackend;
        impl SessionBackend for EmptyBackend {
            fn create_session(
                &self,
                _request: CreateSessionRequest,
            ) -> Pin<Box<dyn Future<Output = Result<UploadSession, UploadError>> + Send + '_>>
            {
                Box::pin(async { Err(UploadError::Backend("not scripted".into())) })
            }
            fn presign_parts(
                &self,
                _session_id: String,
                _part_numbers: Vec<u32>,
            ) -> Pin<
                Box<dyn Future<Output = Result<Vec<PartAuthorization>, UploadError>> + Send + '_>,
            > {
                Box::pin(async { Ok(Vec::new()) })
            }
            fn complete(
                &self,
                _session_id: String,
                _parts: Vec<PartOutcome>,
            ) -> Pin<Box<dyn Future<Output = Result<CompletedUpload, UploadError>> + Send + '_>>
            {
                Box::pin(async { Err(UploadError::Backend("not scripted".into())) })
            }
            fn status(
                &self,
                _session_id: String,
            ) -> Pin<Box<dyn Future<Output = Result<SessionStatus, UploadError>> + Send + '_>>
            {
                Box::pin(async { Err(UploadError::Backend("not scripted".into())) })
            }
        }

        let session = session_with_parts(16 * 1024 * 1024, 8 * 1024 * 1024, Vec::new());
        let authorizer =
            PartAuthorizer::new(Arc::new(EmptyBackend), &session, AuthorizerConfig::default());

        let err = authorizer.authorize(1).await.unwrap_err();
        assert!(matches!(err, UploadError::Backend(_)));
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let backend = Arc::new(ScriptedBackend::new(3600));
        let session = session_with_parts(
            40 * 1024 * 1024,
            8 * 1024 * 1024,
            vec![seeded_auth(2, 3600)],
        );
        let authorizer = PartAuthorizer::new(backend.clone(), &session, AuthorizerConfig::default());

        assert_eq!(
            authorizer.authorize(2).await.unwrap().url,
            "https://store.test/seeded/2"
        );

        authorizer.invalidate(2);
        assert_eq!(
            authorizer.authorize(2).await.unwrap().url,
            "https://store.test/fresh/2"
        );
        assert_eq!(backend.batches().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_refresh() {
        let backend = Arc::new(ScriptedBackend::new(3600));
        let session = session_with_parts(400 * 1024 * 1024, 8 * 1024 * 1024, Vec::new());
        let authorizer = Arc::new(PartAuthorizer::new(
            backend.clone(),
            &session,
            AuthorizerConfig::default(),
        ));

        let a = tokio::spawn({
            let authorizer = authorizer.clone();
            async move { authorizer.authorize(1).await }
        });
        let b = tokio::spawn({
            let authorizer = authorizer.clone();
            async move { authorizer.authorize(1).await }
        });

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(backend.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_refresh_does_not_block_cache_access() {
        let backend = Arc::new(ScriptedBackend::slow(3600, Duration::from_secs(30)));
        let session = session_with_parts(
            400 * 1024 * 1024,
            8 * 1024 * 1024,
            vec![seeded_auth(5, 3600), seeded_auth(40, 3600)],
        );
        let authorizer = Arc::new(PartAuthorizer::new(
            backend.clone(),
            &session,
            AuthorizerConfig::default(),
        ));

        // Park a refresh for part 1 inside the backend round trip.
        let refresh = tokio::spawn({
            let authorizer = authorizer.clone();
            async move { authorizer.authorize(1).await }
        });
        while backend.batches().is_empty() {
            tokio::task::yield_now().await;
        }

        // Lookups and invalidation finish while that round trip is still
        // pending; on the paused clock, waiting for it would show up as
        // elapsed time.
        let before = Instant::now();
        authorizer.invalidate(40);
        let auth = authorizer.authorize(5).await.unwrap();
        assert_eq!(auth.url, "https://store.test/seeded/5");
        assert_eq!(Instant::now(), before);

        assert_eq!(
            refresh.await.unwrap().unwrap().url,
            "https://store.test/fresh/1"
        );

        // The invalidated entry stays gone; parts 1..=20 came back fresh
        // but 40 needs its own fetch.
        let auth = authorizer.authorize(40).await.unwrap();
        assert_eq!(auth.url, "https://store.test/fresh/40");
        assert_eq!(backend.batches().len(), 2);
    }
}
