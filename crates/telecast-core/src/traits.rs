//! Trait seams consumed across the workspace.

use async_trait::async_trait;

use crate::types::{MessageContent, SendError, SendReceipt};

/// A downstream messaging platform the delivery worker posts to.
///
/// Implementations classify their failures as transient or terminal via
/// [`SendError`]; the worker's retry policy is driven entirely by that
/// classification.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Platform name, used in logs.
    fn name(&self) -> &str;

    /// Deliver `content` to the platform handle of one destination.
    ///
    /// The call itself may be retried by the worker; gateways must treat a
    /// repeat of the same content as a fresh send (duplicate external sends
    /// are accepted and logged, per the at-most-once-successful-log model).
    async fn send(
        &self,
        channel_handle: &str,
        content: &MessageContent,
    ) -> std::result::Result<SendReceipt, SendError>;
}
