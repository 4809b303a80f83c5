// ABOUTME: Process-wide refcounted registry of live sessions keyed by identity.
// ABOUTME: Concurrent checkouts join one in-flight login; a watchdog evicts entries idle past the grace period.

use crate::config::{AccountConfig, Config, PoolConfig};
use crate::creds::CredentialStore;
use crate::error::Error;
use crate::session::Session;
use crate::transport::{ChatTransport, Identity};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Builds a transport for an account. Injected so tests and alternative
/// platforms can supply their own connections.
pub type TransportFactory = dyn Fn(&AccountConfig) -> Arc<dyn ChatTransport> + Send + Sync;

type LoginFuture = Shared<BoxFuture<'static, Result<Arc<Session>, Error>>>;

/// A pool slot: either a live session with its borrow count, or a login in
/// flight that concurrent checkouts await instead of racing a second login.
enum PoolEntry {
    Ready {
        session: Arc<Session>,
        refcount: i32,
    },
    Pending(LoginFuture),
}

struct PoolInner {
    entries: Mutex<HashMap<Identity, PoolEntry>>,
    accounts: HashMap<Identity, AccountConfig>,
    creds: CredentialStore,
    cfg: PoolConfig,
    factory: Box<TransportFactory>,
    closed: AtomicBool,
}

/// Refcounted, concurrency-safe registry of live sessions.
///
/// The entries mutex is held only for map and refcount bookkeeping; logins
/// and teardowns always run outside it.
pub struct SessionPool {
    inner: Arc<PoolInner>,
    watchdog: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// In-progress checkout. Sessions arrive in whichever order their logins
/// finish, not in request order; slots left unconsumed stay checked out
/// until released.
pub struct Checkout {
    rx: mpsc::UnboundedReceiver<(Identity, Result<Arc<Session>, Error>)>,
    remaining: usize,
}

impl Checkout {
    /// Next session (or per-identity failure) as it becomes ready.
    pub async fn next(&mut self) -> Option<(Identity, Result<Arc<Session>, Error>)> {
        if self.remaining == 0 {
            return None;
        }
        let item = self.rx.recv().await;
        if item.is_some() {
            self.remaining -= 1;
        }
        item
    }

    /// Drain every slot. Failed identities appear as `Err` entries; they do
    /// not abort the others.
    pub async fn collect(mut self) -> Vec<(Identity, Result<Arc<Session>, Error>)> {
        let mut results = Vec::new();
        while let Some(item) = self.next().await {
            results.push(item);
        }
        results
    }
}

impl SessionPool {
    /// Build the pool and start its watchdog.
    pub fn new<F>(config: &Config, creds: CredentialStore, factory: F) -> Self
    where
        F: Fn(&AccountConfig) -> Arc<dyn ChatTransport> + Send + Sync + 'static,
    {
        let accounts = config
            .accounts
            .iter()
            .map(|a| (a.identity.clone(), a.clone()))
            .collect();
        let pool = Self {
            inner: Arc::new(PoolInner {
                entries: Mutex::new(HashMap::new()),
                accounts,
                creds,
                cfg: config.pool.clone(),
                factory: Box::new(factory),
                closed: AtomicBool::new(false),
            }),
            watchdog: std::sync::Mutex::new(None),
        };
        pool.spawn_watchdog();
        pool
    }

    /// Check out sessions for a set of identities. Existing entries get their
    /// refcount bumped; missing ones trigger (or join) a login. Each slot
    /// fails independently.
    pub async fn acquire<I>(&self, identities: I) -> Checkout
    where
        I: IntoIterator<Item = Identity>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut remaining = 0;
        for identity in identities {
            remaining += 1;
            let inner = Arc::clone(&self.inner);
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = checkout_one(inner, identity.clone()).await;
                let _ = tx.send((identity, result));
            });
        }
        Checkout { rx, remaining }
    }

    /// Drop one borrow per identity. Never tears a session down; the
    /// watchdog handles that after the grace period, so an immediate
    /// re-acquire reuses the live session.
    pub async fn release<I>(&self, identities: I)
    where
        I: IntoIterator<Item = Identity>,
    {
        let mut entries = self.inner.entries.lock().await;
        for identity in identities {
            if let Some(PoolEntry::Ready { refcount, .. }) = entries.get_mut(&identity) {
                *refcount -= 1;
                tracing::debug!(identity = %identity, refcount = *refcount, "pool refcount decreased");
            }
        }
    }

    /// Current refcount for an identity, if a live entry exists.
    pub async fn refcount(&self, identity: &str) -> Option<i32> {
        match self.inner.entries.lock().await.get(identity) {
            Some(PoolEntry::Ready { refcount, .. }) => Some(*refcount),
            _ => None,
        }
    }

    /// Cancel the watchdog and tear down every session: stop dispatchers,
    /// drain in-flight handler work, persist credentials, close transports.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.watchdog.lock().unwrap().take() {
            handle.abort();
        }
        let drained: Vec<PoolEntry> = {
            let mut entries = self.inner.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            match entry {
                PoolEntry::Ready { session, .. } => session.shutdown().await,
                PoolEntry::Pending(login) => {
                    // An in-flight login observes the closed flag and shuts
                    // its session down itself; awaiting keeps teardown ordered
                    let _ = login.await;
                }
            }
        }
        tracing::debug!("session pool stopped");
    }

    fn spawn_watchdog(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tracing::debug!("session pool watchdog started");
            let interval = inner.cfg.watchdog_interval();
            let scans_required = (inner.cfg.eviction_grace().as_secs() / interval.as_secs())
                .max(1) as u32;
            let mut idle_scans: HashMap<Identity, u32> = HashMap::new();
            loop {
                tokio::time::sleep(interval).await;
                let mut evicted = Vec::new();
                {
                    let mut entries = inner.entries.lock().await;
                    let idle: Vec<Identity> = entries
                        .iter()
                        .filter_map(|(identity, entry)| match entry {
                            PoolEntry::Ready { refcount, .. } if *refcount <= 0 => {
                                Some(identity.clone())
                            }
                            _ => None,
                        })
                        .collect();
                    // A re-acquire between scans resets the countdown
                    idle_scans.retain(|identity, _| idle.contains(identity));
                    for identity in idle {
                        let scans = idle_scans.entry(identity.clone()).or_insert(0);
                        *scans += 1;
                        if *scans >= scans_required {
                            if let Some(PoolEntry::Ready { session, .. }) =
                                entries.remove(&identity)
                            {
                                evicted.push((identity.clone(), session));
                            }
                            idle_scans.remove(&identity);
                        }
                    }
                }
                for (identity, session) in evicted {
                    tracing::debug!(identity = %identity, "evicting idle session");
                    session.shutdown().await;
                }
            }
        });
        *self.watchdog.lock().unwrap() = Some(handle);
    }
}

async fn checkout_one(inner: Arc<PoolInner>, identity: Identity) -> Result<Arc<Session>, Error> {
    loop {
        let login = {
            let mut entries = inner.entries.lock().await;
            match entries.get_mut(&identity) {
                Some(PoolEntry::Ready { session, refcount }) => {
                    *refcount += 1;
                    tracing::debug!(identity = %identity, refcount = *refcount, "pool refcount increased");
                    return Ok(Arc::clone(session));
                }
                Some(PoolEntry::Pending(login)) => login.clone(),
                None => {
                    let Some(account) = inner.accounts.get(&identity).cloned() else {
                        return Err(Error::UnknownIdentity(identity));
                    };
                    let login = login_entry(Arc::clone(&inner), identity.clone(), account)
                        .boxed()
                        .shared();
                    entries.insert(identity.clone(), PoolEntry::Pending(login.clone()));
                    // Drive the login even if every waiter is dropped
                    tokio::spawn(login.clone().map(|_| ()));
                    login
                }
            }
        };
        // Await outside the lock; loop back to take the refcount once ready
        login.await?;
    }
}

/// The single login behind a `Pending` placeholder. On success the entry
/// becomes `Ready` at refcount zero and every waiter loops back to take its
/// borrow; on failure the placeholder is removed so a later acquire can
/// retry from scratch.
async fn login_entry(
    inner: Arc<PoolInner>,
    identity: Identity,
    account: AccountConfig,
) -> Result<Arc<Session>, Error> {
    let transport = (inner.factory)(&account);
    let result = Session::connect(&account, transport, inner.creds.clone(), &inner.cfg).await;
    let mut entries = inner.entries.lock().await;
    match result {
        Ok(session) => {
            if inner.closed.load(Ordering::SeqCst) {
                drop(entries);
                session.shutdown().await;
                return Err(Error::Transport("pool is shutting down".into()));
            }
            entries.insert(
                identity.clone(),
                PoolEntry::Ready {
                    session: Arc::clone(&session),
                    refcount: 0,
                },
            );
            Ok(session)
        }
        Err(e) => {
            entries.remove(&identity);
            tracing::warn!(identity = %identity, error = %e, "login failed, slot surfaced as error");
            Err(e)
        }
    }
}
