// ABOUTME: In-memory ChatTransport fake for exercising pool, dispatcher, and relay behavior.
// ABOUTME: Scriptable fault injection, canned responders, and full recording of sends and deletions.

use crate::error::Error;
use crate::transport::{AuthMaterial, ChatTransport, Identity, LoginInfo, Update, UpdateStream};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A message recorded by [`MockTransport::send`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: i64,
    pub chat_id: String,
    pub body: String,
    pub attachment: Option<Vec<u8>>,
}

type Responder = Box<dyn Fn(&SentMessage) -> Option<String> + Send + Sync>;

/// Scriptable in-memory transport.
///
/// Faults queued with `fail_next_login` / `fail_next_send` are consumed one
/// per call, then the transport behaves normally. Responders registered with
/// `on_send` see every outbound message and may push a reply back through the
/// update stream, which is how relay exchanges are simulated.
pub struct MockTransport {
    identity: Identity,
    updates_tx: Mutex<Option<mpsc::UnboundedSender<Update>>>,
    sent: Mutex<Vec<SentMessage>>,
    deleted: Mutex<Vec<i64>>,
    login_faults: Mutex<VecDeque<Error>>,
    send_faults: Mutex<VecDeque<Error>>,
    responders: Mutex<Vec<Responder>>,
    login_count: AtomicUsize,
    close_count: AtomicUsize,
    login_delay: Mutex<Duration>,
    next_id: AtomicI64,
    credentials: Mutex<Option<String>>,
}

impl MockTransport {
    pub fn new(identity: impl Into<Identity>) -> Self {
        Self {
            identity: identity.into(),
            updates_tx: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            login_faults: Mutex::new(VecDeque::new()),
            send_faults: Mutex::new(VecDeque::new()),
            responders: Mutex::new(Vec::new()),
            login_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            login_delay: Mutex::new(Duration::ZERO),
            next_id: AtomicI64::new(1),
            credentials: Mutex::new(None),
        }
    }

    /// Queue an error for the next login attempt.
    pub fn fail_next_login(&self, error: Error) {
        self.login_faults.lock().unwrap().push_back(error);
    }

    /// Queue an error for the next send.
    pub fn fail_next_send(&self, error: Error) {
        self.send_faults.lock().unwrap().push_back(error);
    }

    /// Make every login take this long before completing. Used to widen the
    /// window in which concurrent checkouts must share one login.
    pub fn set_login_delay(&self, delay: Duration) {
        *self.login_delay.lock().unwrap() = delay;
    }

    /// Register a responder consulted on every send. Returning `Some(body)`
    /// pushes that body back as an inbound update in the same chat.
    pub fn on_send<F>(&self, responder: F)
    where
        F: Fn(&SentMessage) -> Option<String> + Send + Sync + 'static,
    {
        self.responders.lock().unwrap().push(Box::new(responder));
    }

    /// Inject an inbound update as if the platform pushed it.
    pub fn push_update(&self, update: Update) {
        if let Some(tx) = self.updates_tx.lock().unwrap().as_ref() {
            let _ = tx.send(update);
        }
    }

    pub fn set_credentials(&self, material: impl Into<String>) {
        *self.credentials.lock().unwrap() = Some(material.into());
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.body.clone()).collect()
    }

    pub fn deleted_ids(&self) -> Vec<i64> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn login_count(&self) -> usize {
        self.login_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn login(&self, _auth: &AuthMaterial) -> Result<LoginInfo, Error> {
        self.login_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.login_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(fault) = self.login_faults.lock().unwrap().pop_front() {
            return Err(fault);
        }
        Ok(LoginInfo {
            user_id: format!("user-{}", self.identity),
            display_name: format!("Mock {}", self.identity),
        })
    }

    async fn event_stream(&self) -> Result<UpdateStream, Error> {
        // A fresh channel per call, so an evicted and re-created session gets
        // a working stream
        let (tx, rx) = mpsc::unbounded_channel();
        *self.updates_tx.lock().unwrap() = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn send(
        &self,
        chat_id: &str,
        body: &str,
        attachment: Option<Vec<u8>>,
    ) -> Result<i64, Error> {
        if let Some(fault) = self.send_faults.lock().unwrap().pop_front() {
            return Err(fault);
        }
        let message = SentMessage {
            id: self.allocate_id(),
            chat_id: chat_id.to_string(),
            body: body.to_string(),
            attachment,
        };
        self.sent.lock().unwrap().push(message.clone());
        let replies: Vec<String> = self
            .responders
            .lock()
            .unwrap()
            .iter()
            .filter_map(|responder| responder(&message))
            .collect();
        for reply in replies {
            self.push_update(Update {
                message_id: self.allocate_id(),
                chat_id: chat_id.to_string(),
                sender_id: chat_id.to_string(),
                body: reply,
                timestamp: chrono::Utc::now().timestamp(),
                outgoing: false,
            });
        }
        Ok(message.id)
    }

    async fn delete_messages(&self, _chat_id: &str, message_ids: &[i64]) -> Result<(), Error> {
        self.deleted.lock().unwrap().extend_from_slice(message_ids);
        Ok(())
    }

    async fn export_credentials(&self) -> Option<String> {
        self.credentials.lock().unwrap().clone()
    }

    async fn close(&self) -> Result<(), Error> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Inbound update in `chat` with default metadata, for dispatcher tests.
pub fn inbound(chat: &str, body: &str) -> Update {
    Update {
        message_id: 0,
        chat_id: chat.to_string(),
        sender_id: chat.to_string(),
        body: body.to_string(),
        timestamp: 0,
        outgoing: false,
    }
}
