//! # Telecast Core
//!
//! Shared foundation for the Telecast workspace: configuration, the common
//! error type, the schedule/ledger data model, and the messaging-gateway
//! trait every channel implementation plugs into.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::TelecastConfig;
pub use error::{Result, TelecastError};
pub use traits::MessagingGateway;
pub use types::{
    AttemptStatus, DeliveryAttempt, DeliveryKey, Destination, MediaItem, MediaKind,
    MessageContent, MessageStatus, ScheduledMessage, SendError, SendErrorKind, SendReceipt,
};
