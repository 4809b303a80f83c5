// ABOUTME: One authenticated connection to the chat platform for one identity.
// ABOUTME: Owns the update ingestion path, the dispatcher, and a TTL cache for relay request dedup.

use crate::cache::TtlCache;
use crate::config::{AccountConfig, PoolConfig};
use crate::creds::CredentialStore;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::relay::RelayResponse;
use crate::transport::{AuthMaterial, ChatTransport, Identity, LoginInfo};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Upper bound on a single login attempt; a hung connect counts as transient.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(120);

/// A live, authenticated connection plus its dispatcher and request cache.
///
/// Created by the pool on first checkout for an identity; torn down by the
/// pool watchdog once the refcount has stayed at zero past the grace period.
pub struct Session {
    identity: Identity,
    transport: Arc<dyn ChatTransport>,
    dispatcher: Arc<Dispatcher>,
    cache: TtlCache<RelayResponse>,
    creds: CredentialStore,
    user: LoginInfo,
    login_time: DateTime<Utc>,
    last_activity: Arc<std::sync::Mutex<Instant>>,
    ingest: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Authenticate and bring up the ingestion path.
    ///
    /// Transient transport failures are retried up to `cfg.login_attempts`
    /// with doubling backoff plus jitter. A revoked credential is terminal:
    /// the stale persisted material is deleted so the next process run can
    /// re-login, and the error is surfaced unchanged. Rate-limit signals
    /// sleep the carried wait and do not consume an attempt.
    pub async fn connect(
        account: &AccountConfig,
        transport: Arc<dyn ChatTransport>,
        creds: CredentialStore,
        cfg: &PoolConfig,
    ) -> Result<Arc<Session>, Error> {
        let identity = account.identity.clone();
        let persisted = creds.load(&identity);
        let had_material = account.session.is_some() || persisted.is_some();
        let auth = AuthMaterial {
            identity: identity.clone(),
            token: account.token.clone(),
            session: account.session.clone().or(persisted),
        };
        tracing::info!(identity = %identity, "logging in");

        let mut attempt = 0u32;
        let user = loop {
            let result = tokio::time::timeout(LOGIN_TIMEOUT, transport.login(&auth))
                .await
                .unwrap_or_else(|_| Err(Error::Transport("login timed out".into())));
            match result {
                Ok(user) => break user,
                Err(Error::AuthRevoked(reason)) => {
                    creds.delete(&identity);
                    tracing::error!(identity = %identity, %reason, "credential revoked, not retrying");
                    return Err(Error::AuthRevoked(reason));
                }
                Err(Error::RateLimited(wait)) => {
                    tracing::info!(identity = %identity, wait_secs = wait.as_secs(), "login rate limited, waiting");
                    tokio::time::sleep(wait).await;
                }
                Err(Error::Transport(reason)) => {
                    attempt += 1;
                    if attempt >= cfg.login_attempts {
                        tracing::error!(identity = %identity, %reason, "login retry budget exhausted");
                        return Err(Error::Transport(reason));
                    }
                    let backoff = login_backoff(cfg.login_backoff(), attempt);
                    tracing::warn!(
                        identity = %identity,
                        %reason,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient login failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(other) => return Err(other),
            }
        };

        // Persist fresh material only when this login started from nothing
        if !had_material {
            if let Some(material) = transport.export_credentials().await {
                if let Err(e) = creds.save(&identity, &material) {
                    tracing::warn!(identity = %identity, error = %e, "failed to persist credentials");
                }
            }
        }

        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.start(cfg.workers);

        let last_activity = Arc::new(std::sync::Mutex::new(Instant::now()));
        let stream = transport.event_stream().await?;
        let ingest = {
            let dispatcher = Arc::clone(&dispatcher);
            let last_activity = Arc::clone(&last_activity);
            tokio::spawn(async move {
                use futures_util::StreamExt;
                let mut stream = stream;
                while let Some(update) = stream.next().await {
                    *last_activity.lock().unwrap() = Instant::now();
                    dispatcher.enqueue(update);
                }
                tracing::debug!("update stream ended");
            })
        };

        tracing::info!(identity = %identity, user = %user.user_id, "login succeeded");
        Ok(Arc::new(Session {
            identity,
            transport,
            dispatcher,
            cache: TtlCache::default(),
            creds,
            user,
            login_time: Utc::now(),
            last_activity,
            ingest: std::sync::Mutex::new(Some(ingest)),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn user(&self) -> &LoginInfo {
        &self.user
    }

    pub fn login_time(&self) -> DateTime<Utc> {
        self.login_time
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn transport(&self) -> Arc<dyn ChatTransport> {
        Arc::clone(&self.transport)
    }

    pub fn cache(&self) -> &TtlCache<RelayResponse> {
        &self.cache
    }

    /// Time since the last inbound update or outbound send.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send a message through this session's transport, refreshing the
    /// activity timestamp.
    pub async fn send(
        &self,
        chat_id: &str,
        body: &str,
        attachment: Option<Vec<u8>>,
    ) -> Result<i64, Error> {
        *self.last_activity.lock().unwrap() = Instant::now();
        self.transport.send(chat_id, body, attachment).await
    }

    /// Graceful teardown: stop ingesting, drain in-flight handler work,
    /// persist reusable credentials, close the transport. Idempotent; the
    /// second and later calls return immediately.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.ingest.lock().unwrap().take() {
            handle.abort();
        }
        self.dispatcher.stop().await;
        if let Some(material) = self.transport.export_credentials().await {
            if let Err(e) = self.creds.save(&self.identity, &material) {
                tracing::warn!(identity = %self.identity, error = %e, "failed to persist credentials on shutdown");
            }
        }
        if let Err(e) = self.transport.close().await {
            tracing::warn!(identity = %self.identity, error = %e, "transport close failed");
        }
        tracing::debug!(identity = %self.identity, "session closed");
    }
}

/// Doubling backoff with up to 500ms of jitter, in the spirit of the login
/// retry loop this replaces.
fn login_backoff(base: Duration, attempt: u32) -> Duration {
    let doubled = base.saturating_mul(1 << (attempt - 1).min(4));
    let jitter = rand::thread_rng().gen_range(0..500);
    doubled + Duration::from_millis(jitter)
}
