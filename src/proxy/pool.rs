//! Bounded pool of reusable upstream sessions, keyed by session fingerprint.
//!
//! `acquire` hands out an idle Healthy session with a matching fingerprint
//! when one exists; otherwise it mints a fresh ephemeral credential and
//! opens a new session, up to capacity. At capacity it parks until a
//! release. `release` requeues Healthy sessions and closes everything else.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::Notify;

use crate::config::Config;
use crate::errors::RelayError;
use crate::models::session_config::{SessionConfig, SessionFingerprint};
use crate::proxy::minter::TokenMinter;
use crate::proxy::upstream::UpstreamSession;

pub struct Acquired {
    pub session: Arc<UpstreamSession>,
    /// True when the session came off the idle list. The frontend sends a
    /// late `session.update` for the non-fingerprint fields in that case.
    pub reused: bool,
}

impl std::fmt::Debug for Acquired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquired")
            .field("reused", &self.reused)
            .finish()
    }
}

struct PoolInner {
    idle: HashMap<SessionFingerprint, VecDeque<Arc<UpstreamSession>>>,
    /// Sessions alive (idle + leased). Bounded by capacity.
    total: usize,
    /// Every session ever opened, for /health queue and drop stats.
    /// Leased sessions are visible here even though the pool holds no
    /// strong reference to them.
    tracked: Vec<Weak<UpstreamSession>>,
    /// Drop counters carried over from sessions that have been closed.
    retired_dropped: u64,
}

pub struct SessionPool {
    inner: Mutex<PoolInner>,
    released: Notify,
    capacity: usize,
    minter: TokenMinter,
    config: Config,
}

#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub total: usize,
    pub idle: usize,
    pub queued_events: usize,
    pub dropped_events: u64,
}

impl SessionPool {
    pub fn new(capacity: usize, minter: TokenMinter, config: Config) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: HashMap::new(),
                total: 0,
                tracked: Vec::new(),
                retired_dropped: 0,
            }),
            released: Notify::new(),
            capacity,
            minter,
            config,
        }
    }

    /// Acquire a session matching the config's fingerprint.
    ///
    /// Blocks (cooperatively) while the pool is at capacity with nothing
    /// idle. Mint/open failures surface to the caller; capacity reserved for
    /// the attempt is returned first.
    pub async fn acquire(&self, session_config: &SessionConfig) -> Result<Acquired, RelayError> {
        let fingerprint = session_config.fingerprint();

        loop {
            {
                let mut inner = self.inner.lock().unwrap();

                // Reuse an idle session if one is still healthy. Unhealthy
                // idlers are closed and their slot reclaimed on the spot.
                let mut reclaimed = 0;
                let mut retired_drops = 0;
                let mut reusable = None;
                if let Some(bucket) = inner.idle.get_mut(&fingerprint) {
                    while let Some(candidate) = bucket.pop_front() {
                        if candidate.is_healthy() {
                            reusable = Some(candidate);
                            break;
                        }
                        tracing::info!(
                            session_id = %candidate.id(),
                            "discarding unhealthy idle session"
                        );
                        candidate.close();
                        retired_drops += candidate.dropped_events();
                        reclaimed += 1;
                    }
                }
                inner.total -= reclaimed;
                inner.retired_dropped += retired_drops;
                if let Some(session) = reusable {
                    tracing::debug!(session_id = %session.id(), "reusing pooled session");
                    return Ok(Acquired {
                        session,
                        reused: true,
                    });
                }

                if inner.total < self.capacity {
                    // Reserve the slot before the await points below.
                    inner.total += 1;
                    break;
                }
            }
            // Pool exhausted: wait for a release, then retry.
            self.released.notified().await;
        }

        match self.open_fresh(session_config, fingerprint).await {
            Ok(session) => {
                self.inner
                    .lock()
                    .unwrap()
                    .tracked
                    .push(Arc::downgrade(&session));
                Ok(Acquired {
                    session,
                    reused: false,
                })
            }
            Err(e) => {
                self.inner.lock().unwrap().total -= 1;
                self.released.notify_one();
                Err(e)
            }
        }
    }

    async fn open_fresh(
        &self,
        session_config: &SessionConfig,
        fingerprint: SessionFingerprint,
    ) -> Result<Arc<UpstreamSession>, RelayError> {
        let credential = self.minter.mint(session_config).await?;
        let ws_url = self.config.ws_url(session_config.model.as_deref());
        UpstreamSession::open(&ws_url, credential, fingerprint).await
    }

    /// Return a leased session. Healthy sessions go back on the idle list;
    /// anything else is closed and its slot freed.
    pub fn release(&self, session: Arc<UpstreamSession>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if session.is_healthy() {
                tracing::debug!(session_id = %session.id(), "session returned to pool");
                inner
                    .idle
                    .entry(session.fingerprint().clone())
                    .or_default()
                    .push_back(session);
            } else {
                tracing::info!(session_id = %session.id(), "closing unhealthy session on release");
                session.close();
                inner.retired_dropped += session.dropped_events();
                inner.total -= 1;
            }
        }
        self.released.notify_one();
    }

    pub fn stats(&self) -> PoolStats {
        let mut inner = self.inner.lock().unwrap();
        inner.tracked.retain(|weak| weak.strong_count() > 0);

        let live: Vec<Arc<UpstreamSession>> =
            inner.tracked.iter().filter_map(Weak::upgrade).collect();
        let idle: usize = inner.idle.values().map(VecDeque::len).sum();
        PoolStats {
            capacity: self.capacity,
            total: inner.total,
            idle,
            queued_events: live.iter().map(|s| s.queue_depth()).sum(),
            dropped_events: inner.retired_dropped
                + live.iter().map(|s| s.dropped_events()).sum::<u64>(),
        }
    }
}
