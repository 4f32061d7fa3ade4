//! Client side of the archive coordination protocol.
//!
//! A [`Connection`] owns one socket to the archive server and multiplexes every
//! logical caller over it: file transfer, range locks, intents, notifications and
//! transactions. Requests are served strictly in submission order with at most one
//! response outstanding; unsolicited notifications and intent hits are delivered to
//! registered listeners on their own tasks.

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod intent;
pub mod listener;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod transaction;
pub mod watchdog;

pub use backoff::LockBackoff;
pub use config::{ClientConfig, ServerAddress};
pub use connection::{Connection, ConnectionOptions};
pub use error::{ConnectionError, ConnectionResult};
pub use intent::IntentHandle;
pub use listener::{IntentHit, IntentListener, Notification, NotificationListener};
pub use transaction::Transaction;
pub use watchdog::{Watchdog, WatchdogTick};
