//! Point-to-point message delivery between members
//!
//! Implementations must deliver messages from one sender to one receiver in
//! the order they were sent (FIFO per link). Loss is allowed: the failure
//! detector and call timeouts deal with members that stop answering.
//! Messages sent to the local member loop back through the inbox so they are
//! ordered with everything else the member receives.

use crate::common::Result;
use crate::group::view::MemberId;
use crate::transport::message::{Envelope, Message};
use tokio::sync::mpsc;

/// Receiving side of a member's network endpoint
pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

pub trait Network: Send + Sync + 'static {
    /// Identity of the local member on this network.
    fn local(&self) -> &MemberId;

    /// Queue `message` for delivery to `to` (routed by address).
    fn send(&self, to: &MemberId, message: Message) -> Result<()>;

    /// Stop accepting and sending traffic.
    fn shutdown(&self) {}
}

/// Send and log failures instead of propagating them.
///
/// Used for protocol traffic where a lost message is handled by timeouts.
pub fn send_or_log(network: &dyn Network, to: &MemberId, message: Message) {
    let kind = message.kind();
    if let Err(e) = network.send(to, message) {
        tracing::debug!("Dropped {} to {}: {}", kind, to, e);
    }
}
