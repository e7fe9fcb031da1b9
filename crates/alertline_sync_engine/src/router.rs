//! Inbound frame classification.

use alertline_protocol::{
    decode_inbound, ChannelId, EventEnvelope, InboundFrame, ProtocolError, SubscriptionAck,
};

/// Where an inbound frame should go.
#[derive(Debug)]
pub enum Routed {
    /// A data event for the coordinator.
    Event(EventEnvelope),
    /// An explicit completion signal for one channel.
    Completion(ChannelId),
    /// Backlog counts following a subscription.
    SubscriptionAck(SubscriptionAck),
    /// The frame could not be decoded and was dropped.
    Malformed(ProtocolError),
    /// A valid frame with nothing to do.
    Ignored,
}

/// Classifies raw text frames.
///
/// Decoding failures never escape the router: a bad frame is logged and
/// reported as [`Routed::Malformed`] so the caller can count it and move on.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameRouter;

impl FrameRouter {
    /// Creates a router.
    pub fn new() -> Self {
        Self
    }

    /// Decodes and classifies one frame.
    pub fn route(&self, text: &str) -> Routed {
        match decode_inbound(text) {
            Ok(InboundFrame::Event(event)) => Routed::Event(event),
            Ok(InboundFrame::SyncComplete(signal)) if signal.catch_up_complete => {
                Routed::Completion(signal.channel_id)
            }
            Ok(InboundFrame::SyncComplete(signal)) => {
                tracing::debug!(channel = %signal.channel_id, "sync_complete with catchUpComplete false ignored");
                Routed::Ignored
            }
            Ok(InboundFrame::SubscriptionAck(ack)) => Routed::SubscriptionAck(ack),
            Ok(InboundFrame::Error(notice)) => {
                tracing::warn!(message = %notice.message, "server reported an error");
                Routed::Ignored
            }
            Ok(InboundFrame::Unknown(kind)) => {
                tracing::debug!(kind = %kind, "unknown control frame ignored");
                Routed::Ignored
            }
            Err(e) => {
                tracing::warn!(error = %e, len = text.len(), "dropping malformed frame");
                Routed::Malformed(e)
            }
        }
    }
}
