// ABOUTME: Session pooling, priority update dispatch, and relay request/response over chat transports.
// ABOUTME: Library crate; platform transports implement ChatTransport and everything else is generic.

pub mod cache;
pub mod config;
pub mod creds;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod relay;
pub mod session;
pub mod testing;
pub mod transport;

pub use cache::TtlCache;
pub use config::{AccountConfig, Config, PoolConfig, RelayConfig};
pub use creds::CredentialStore;
pub use dispatcher::{Callback, Dispatcher, DispatcherState, HandlerHandle, Predicate};
pub use error::Error;
pub use pool::{Checkout, SessionPool};
pub use relay::{Relay, RelayResponse, RelayState, ResponseMatcher};
pub use session::Session;
pub use transport::{AuthMaterial, ChatTransport, Identity, LoginInfo, Update, UpdateStream};
