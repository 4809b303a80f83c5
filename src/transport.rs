// ABOUTME: Transport abstraction over a chat platform connection for one identity.
// ABOUTME: The platform's binary protocol lives behind ChatTransport; the pool and relay only see this trait.

use crate::error::Error;
use async_trait::async_trait;
use std::pin::Pin;
use tokio_stream::Stream;

/// Stable external account reference (phone number, bot token hash, etc.).
/// Unique key into the session pool.
pub type Identity = String;

/// One platform-pushed event, already normalized to a flat message view.
#[derive(Debug, Clone)]
pub struct Update {
    /// Platform message ID, used for transcript deletion
    pub message_id: i64,
    /// Chat / channel the message arrived in
    pub chat_id: String,
    /// Sender identifier
    pub sender_id: String,
    /// Text content
    pub body: String,
    /// Seconds since Unix epoch
    pub timestamp: i64,
    /// Whether this account sent the message itself
    pub outgoing: bool,
}

/// Credentials handed to a transport login attempt.
///
/// `session` carries reusable material from a previous login (config-provided
/// or loaded from the credential store); `token` is the out-of-band secret
/// used for a fresh login when no session material exists.
#[derive(Debug, Clone)]
pub struct AuthMaterial {
    pub identity: Identity,
    pub token: Option<String>,
    pub session: Option<String>,
}

/// Who the transport authenticated as.
#[derive(Debug, Clone)]
pub struct LoginInfo {
    pub user_id: String,
    pub display_name: String,
}

/// Boxed stream of platform-pushed updates for one connection.
pub type UpdateStream = Pin<Box<dyn Stream<Item = Update> + Send>>;

/// One live connection to the chat platform for one identity.
///
/// Implementations own reconnection and wire-level concerns. Errors use the
/// crate taxonomy so callers can branch: `Transport` is retryable,
/// `AuthRevoked` and `PeerBlocked` are terminal, `RateLimited` carries the
/// wait the platform demanded.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Authenticate the connection. Returns the logged-in user on success.
    async fn login(&self, auth: &AuthMaterial) -> Result<LoginInfo, Error>;

    /// Stream of server-pushed updates, in platform delivery order.
    async fn event_stream(&self) -> Result<UpdateStream, Error>;

    /// Send a message, optionally with an attachment. Returns the sent
    /// message ID so the caller can delete it from the transcript later.
    async fn send(
        &self,
        chat_id: &str,
        body: &str,
        attachment: Option<Vec<u8>>,
    ) -> Result<i64, Error>;

    /// Delete messages from a chat's transcript (both sides where supported).
    async fn delete_messages(&self, chat_id: &str, message_ids: &[i64]) -> Result<(), Error>;

    /// Reusable credential material to persist for the next process run,
    /// if the platform supports exporting it.
    async fn export_credentials(&self) -> Option<String>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&self) -> Result<(), Error>;
}
