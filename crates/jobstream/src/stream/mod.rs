//! Event stream client.
//!
//! Holds one long-lived connection to the job event feed, reconnecting with
//! exponential backoff and declaring the connection dead when the server goes
//! quiet for longer than the heartbeat timeout.

mod backoff;
mod handle;
mod manager;
mod observers;
mod sse;
mod state;
mod task;
mod transport;
mod watchdog;

// Re-export public types
pub use backoff::{BackoffPolicy, should_reconnect};
pub use handle::SubscriptionHandle;
pub use manager::ConnectionManager;
pub use observers::{JobCallback, StateCallback};
pub use sse::{DEFAULT_MAX_EVENT_BYTES, RawEvent, SseCodec};
pub use state::{ConnectionState, ConnectionStatus, StateChange};
pub use transport::{
    BoxFuture, CredentialProvider, Credentials, EventStream, OpenRequest, ProviderFn,
    SseTransport, Transport,
};
pub use watchdog::Watchdog;
