// ABOUTME: Correlated request/response exchanges with the single trusted relay peer over the chat transport.
// ABOUTME: One-shot reply handlers, timeout/retry with flood-control backoff, response caching, transcript cleanup.

use crate::dispatcher::{Callback, HandlerHandle, Predicate};
use crate::error::Error;
use crate::session::Session;
use crate::transport::{ChatTransport, Update};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

/// Default TTL for successful relay responses.
const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Authorization results are stable for a session's lifetime.
const AUTH_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Captcha tokens are per-challenge; keep them barely long enough to dedup
/// a burst of identical requests, never long enough to reuse stale tokens.
const CAPTCHA_CACHE_TTL: Duration = Duration::from_secs(300);
const ANSWER_CACHE_TTL: Duration = Duration::from_secs(3600);

const AUTH_TIMEOUT: Duration = Duration::from_secs(20);
const CAPTCHA_TIMEOUT: Duration = Duration::from_secs(240);
const ANSWER_TIMEOUT: Duration = Duration::from_secs(20);

/// Shown in debug logs when a deleted transcript message is previewed.
const PREVIEW_LEN: usize = 30;

/// Caller-supplied acceptance test for a decoded reply.
pub type ResponseMatcher = Arc<dyn Fn(&RelayResponse) -> bool + Send + Sync>;

/// Process-scoped relay registry: the stable instance identifier used in
/// correlation keys, plus memoized authorization results.
///
/// Owned explicitly by whoever wires the process together and shared between
/// relays, instead of living in ambient global state.
pub struct RelayState {
    instance: Uuid,
    authorized: Mutex<HashMap<String, bool>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            instance: Uuid::new_v4(),
            authorized: Mutex::new(HashMap::new()),
        }
    }

    /// Identifier embedded in every relay command and correlation key.
    pub fn instance(&self) -> Uuid {
        self.instance
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded relay reply: a TOML key/value document with at least `command`
/// and `status` fields, plus command-specific extras (token, answer,
/// provenance).
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub command: String,
    pub status: String,
    pub fields: toml::Table,
}

impl RelayResponse {
    /// Decode the wire form. Missing `command` or `status` is a decode
    /// error; the exchange treats those as non-matches and keeps waiting.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let fields: toml::Table = text
            .parse()
            .map_err(|e: toml::de::Error| Error::Decode(e.to_string()))?;
        let command = fields
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Decode("missing command field".into()))?
            .to_string();
        let status = fields
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Decode("missing status field".into()))?
            .to_string();
        Ok(Self {
            command,
            status,
            fields,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Command-specific string field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}

/// Outcome of one wait on the reply future. Timeouts and retries are
/// ordinary branches on this, not exception-driven control flow.
enum WaitOutcome {
    Matched(RelayResponse),
    TimedOut,
}

/// Conducts correlated request/response exchanges with one fixed trusted
/// peer over a session's transport.
///
/// The transport is a one-way rate-limited message stream; this layers a
/// call/response primitive on top with timeout, retry, flood-control
/// backoff, response caching, and transcript cleanup.
pub struct Relay {
    session: Arc<Session>,
    state: Arc<RelayState>,
    peer: String,
    retry_delay: Duration,
}

impl Relay {
    pub fn new(session: Arc<Session>, state: Arc<RelayState>, peer: impl Into<String>) -> Self {
        Self {
            session,
            state,
            peer: peer.into(),
            retry_delay: Duration::from_secs(3),
        }
    }

    /// Build from the `[relay]` config section.
    pub fn from_config(
        session: Arc<Session>,
        state: Arc<RelayState>,
        cfg: &crate::config::RelayConfig,
    ) -> Self {
        Self {
            session,
            state,
            peer: cfg.peer.clone(),
            retry_delay: cfg.retry_delay(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// One reliable exchange: send `command` (optionally with an attachment)
    /// and wait for a reply whose decoded `command` matches and that the
    /// caller's `matcher` accepts. Successful results are cached for an hour
    /// under the command plus the process instance id.
    ///
    /// Exchanges on one session must be serialized. The reply handler deletes
    /// every inbound peer message after inspection, so a concurrent exchange
    /// whose handler sits earlier in the dispatch pass will consume this
    /// exchange's reply and time it out.
    pub async fn request(
        &self,
        command: &str,
        attachment: Option<Vec<u8>>,
        matcher: Option<ResponseMatcher>,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<RelayResponse, Error> {
        self.request_with_ttl(command, attachment, matcher, timeout, max_retries, RESPONSE_CACHE_TTL)
            .await
    }

    async fn request_with_ttl(
        &self,
        command: &str,
        attachment: Option<Vec<u8>>,
        matcher: Option<ResponseMatcher>,
        timeout: Duration,
        max_retries: usize,
        cache_ttl: Duration,
    ) -> Result<RelayResponse, Error> {
        let cache_key = format!("{}_{}", command, self.state.instance());
        if !cache_ttl.is_zero() {
            if let Some(hit) = self.session.cache().get(&cache_key).await {
                tracing::debug!(command, "relay cache hit");
                return Ok(hit);
            }
        }

        let max_retries = max_retries.max(1);
        let mut attempt = 0;
        // Rate-limit waits retry for free; this only bounds pathological
        // flood loops
        let mut spins = 0;
        let spin_cap = max_retries * 3;

        loop {
            spins += 1;
            if spins > spin_cap {
                return Err(Error::Timeout);
            }

            let (reply_tx, reply_rx) = oneshot::channel();
            let slot = Arc::new(std::sync::Mutex::new(Some(reply_tx)));
            let handle = self.register_reply_handler(command, matcher.clone(), slot).await;

            let sent = self.session.send(&self.peer, command, attachment.clone()).await;
            let message_id = match sent {
                Ok(id) => {
                    tracing::debug!(command, "-> relay peer");
                    id
                }
                Err(Error::RateLimited(wait)) => {
                    self.session.dispatcher().remove_handler(handle).await;
                    tracing::info!(wait_secs = wait.as_secs(), "relay rate limited, waiting");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(Error::PeerBlocked) => {
                    self.session.dispatcher().remove_handler(handle).await;
                    tracing::error!(peer = %self.peer, "relay peer has blocked this account");
                    return Err(Error::PeerBlocked);
                }
                Err(e @ Error::AuthRevoked(_)) => {
                    self.session.dispatcher().remove_handler(handle).await;
                    tracing::error!(error = %e, "credential revoked during relay exchange");
                    return Err(e);
                }
                Err(e) => {
                    self.session.dispatcher().remove_handler(handle).await;
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(e);
                    }
                    tracing::warn!(error = %e, attempt, "relay send failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            let outcome = match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(response)) => WaitOutcome::Matched(response),
                Ok(Err(_)) | Err(_) => WaitOutcome::TimedOut,
            };

            // Cleanup runs whichever way the wait ended: no leaked handler
            // registration, no outbound message left in the transcript
            self.session.dispatcher().remove_handler(handle).await;
            self.delete_transcript(&[message_id]).await;

            match outcome {
                WaitOutcome::Matched(response) => {
                    if response.is_ok() {
                        self.session
                            .cache()
                            .insert(cache_key, response.clone(), cache_ttl)
                            .await;
                    }
                    return Ok(response);
                }
                WaitOutcome::TimedOut => {
                    attempt += 1;
                    if attempt >= max_retries {
                        tracing::warn!(command, attempt, "relay request timed out");
                        return Err(Error::Timeout);
                    }
                    tracing::info!(command, attempt, max_retries, "relay timeout, retrying shortly");
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Register the one-shot reply handler on the peer chat. Every inbound
    /// peer message is deleted after inspection, matched or not, so
    /// automation traffic never lingers in visible history.
    async fn register_reply_handler(
        &self,
        command: &str,
        matcher: Option<ResponseMatcher>,
        slot: Arc<std::sync::Mutex<Option<oneshot::Sender<RelayResponse>>>>,
    ) -> HandlerHandle {
        let peer = self.peer.clone();
        let predicate: Predicate = {
            let peer = peer.clone();
            Arc::new(move |update: &Update| update.chat_id == peer && !update.outgoing)
        };
        let transport = self.session.transport();
        let command = command.to_string();
        let callback: Callback = Arc::new(move |update: Update| {
            let transport = Arc::clone(&transport);
            let peer = peer.clone();
            let command = command.clone();
            let matcher = matcher.clone();
            let slot = Arc::clone(&slot);
            async move {
                match RelayResponse::parse(&update.body) {
                    Ok(response) if response.command == command => {
                        let accepted = matcher.as_ref().map_or(true, |m| m(&response));
                        if accepted {
                            // First matching reply wins; later ones only get
                            // their transcript cleanup
                            if let Some(tx) = slot.lock().unwrap().take() {
                                let _ = tx.send(response);
                            }
                        }
                    }
                    Ok(response) => {
                        tracing::debug!(got = %response.command, want = %command, "reply for a different command");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "undecodable relay message");
                    }
                }
                delete_one(&transport, &peer, update.message_id, &update.body).await;
                Ok(())
            }
            .boxed()
        });
        self.session.dispatcher().add_handler(predicate, callback, 0).await
    }

    async fn delete_transcript(&self, message_ids: &[i64]) {
        if message_ids.is_empty() {
            return;
        }
        if let Err(e) = self
            .session
            .transport()
            .delete_messages(&self.peer, message_ids)
            .await
        {
            tracing::debug!(error = %e, "failed to delete relay transcript messages");
        }
    }

    /// Check whether this account is authorized for `capability`. The first
    /// confirmed result is memoized for the process lifetime; the underlying
    /// exchange is additionally cached for an hour. A timeout reads as "not
    /// authorized" without memoizing, so a flaky exchange can be retried.
    pub async fn authorize(&self, capability: &str) -> Result<bool, Error> {
        let auth_key = format!("{}:{}", self.session.user().user_id, capability);
        {
            let authorized = self.state.authorized.lock().await;
            if let Some(&ok) = authorized.get(&auth_key) {
                return Ok(ok);
            }
        }
        let command = format!("/auth {} {}", capability, self.state.instance());
        match self
            .request_with_ttl(&command, None, None, AUTH_TIMEOUT, 3, AUTH_CACHE_TTL)
            .await
        {
            Ok(response) => {
                let ok = response.is_ok();
                self.state.authorized.lock().await.insert(auth_key, ok);
                Ok(ok)
            }
            Err(Error::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ask the relay peer to solve a captcha for `site`, optionally scoped
    /// by a context string (usually a URL). Returns the token, if the peer
    /// produced one.
    pub async fn solve_captcha(
        &self,
        site: &str,
        context: Option<&str>,
    ) -> Result<Option<String>, Error> {
        let mut command = format!("/captcha {} {}", self.state.instance(), site);
        if let Some(context) = context {
            command.push(' ');
            command.push_str(context);
        }
        let matcher: ResponseMatcher = Arc::new(|r: &RelayResponse| r.field("token").is_some());
        match self
            .request_with_ttl(&command, None, Some(matcher), CAPTCHA_TIMEOUT, 3, CAPTCHA_CACHE_TTL)
            .await
        {
            Ok(response) => Ok(response.field("token").map(str::to_string)),
            Err(Error::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Look up the answer to a quiz question. Returns the answer text and
    /// the provenance reported by the peer.
    pub async fn lookup_answer(
        &self,
        question: &str,
    ) -> Result<Option<(String, Option<String>)>, Error> {
        let command = format!("/answer {} {}", self.state.instance(), question);
        let matcher: ResponseMatcher = Arc::new(|r: &RelayResponse| r.field("answer").is_some());
        match self
            .request_with_ttl(&command, None, Some(matcher), ANSWER_TIMEOUT, 3, ANSWER_CACHE_TTL)
            .await
        {
            Ok(response) => Ok(response.field("answer").map(|answer| {
                (
                    answer.to_string(),
                    response.field("by").map(str::to_string),
                )
            })),
            Err(Error::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deliver a log line to the operator through the relay peer. Never
    /// cached; returns whether the peer acknowledged it.
    pub async fn send_log(&self, text: &str) -> Result<bool, Error> {
        let command = format!("/log {} {}", self.state.instance(), text);
        match self
            .request_with_ttl(&command, None, None, ANSWER_TIMEOUT, 3, Duration::ZERO)
            .await
        {
            Ok(response) => Ok(response.is_ok()),
            Err(Error::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

async fn delete_one(transport: &Arc<dyn ChatTransport>, chat_id: &str, message_id: i64, body: &str) {
    match transport.delete_messages(chat_id, &[message_id]).await {
        Ok(()) => {
            tracing::debug!(preview = %truncate(body, PREVIEW_LEN), "deleted relay transcript message");
        }
        Err(e) => {
            tracing::debug!(error = %e, "failed to delete relay transcript message");
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= limit {
        flat
    } else {
        let mut out: String = flat.chars().take(limit).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_response() {
        let response = RelayResponse::parse("command = \"/auth\"\nstatus = \"ok\"\n").unwrap();
        assert_eq!(response.command, "/auth");
        assert!(response.is_ok());
    }

    #[test]
    fn test_parse_extra_fields() {
        let text = "command = \"/captcha\"\nstatus = \"ok\"\ntoken = \"tok-123\"\nby = \"solver\"\n";
        let response = RelayResponse::parse(text).unwrap();
        assert_eq!(response.field("token"), Some("tok-123"));
        assert_eq!(response.field("by"), Some("solver"));
        assert_eq!(response.field("missing"), None);
    }

    #[test]
    fn test_parse_rejects_missing_status() {
        let err = RelayResponse::parse("command = \"/auth\"\n").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_parse_rejects_plain_text() {
        let err = RelayResponse::parse("hello there, not a document").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_error_status_is_not_ok() {
        let response =
            RelayResponse::parse("command = \"/auth\"\nstatus = \"low_permission\"\n").unwrap();
        assert!(!response.is_ok());
        assert_eq!(response.status, "low_permission");
    }

    #[test]
    fn test_truncate_preview() {
        assert_eq!(truncate("short", 30), "short");
        let long = "x".repeat(40);
        let preview = truncate(&long, 30);
        assert_eq!(preview.chars().count(), 31);
        assert!(preview.ends_with('…'));
        assert_eq!(truncate("line\nbreak", 30), "line break");
    }

    #[test]
    fn test_relay_state_instance_is_stable() {
        let state = RelayState::new();
        assert_eq!(state.instance(), state.instance());
    }
}
