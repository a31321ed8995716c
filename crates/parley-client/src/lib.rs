//! Client core for Parley chats: a durable local cache, background sync,
//! realtime message/presence/typing channels and the optimistic timeline.

pub mod backoff;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod presence;
pub mod realtime;
pub mod remote;
pub mod scheduler;
pub mod session;
pub mod timeline;
pub mod transport;
pub mod typing;

pub use cache::MessageCache;
pub use channel::ConnectionState;
pub use config::ClientConfig;
pub use error::{CacheError, ClientError};
pub use session::ChatSession;
