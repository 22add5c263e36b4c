//! vigil-notify — outbound alerts for the Vigil engine.
//!
//! The `Dispatcher` turns incident lifecycle events into notifications:
//! it picks a channel from the service's escalation policy, suppresses
//! anything whose dedup key was already recorded, persists the record
//! *before* sending, and then delivers through a [`Notifier`] with bounded
//! retries. Sends to a single channel are paced by a minimum interval.
//!
//! # Delivery guarantees
//!
//! - A crash between persist and send leaves a `pending` record that
//!   `Dispatcher::resend_pending` delivers on the next startup.
//! - A crash after the send but before the delivery marker is written may
//!   produce one duplicate. Alerts are never silently lost.

pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod pacer;

pub use channel::{ChannelRouter, Notifier, SendFuture};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use error::{NotifyError, NotifyResult};
pub use message::{AlertKind, AlertMessage};
pub use pacer::Pacer;
