//! Frame <-> message conversion
//!
//! Every rule that matches fires, in table order, so one input may fan out
//! to several outputs.

use tracing::{error, warn};

use crate::can::{CanFrame, MAX_DATA_LEN};
use crate::mapping::RoutingTable;

use super::message::{BridgeFrame, BridgeMessage, InboundMessage};

/// A payload was cut to fit a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    /// Payload length as delivered
    pub original: usize,
    /// Bytes kept
    pub kept: usize,
}

/// Messages to publish for a received frame.
///
/// Remote request frames produce an empty payload whatever data bytes they
/// carry.
pub fn frame_to_messages(table: &RoutingTable, frame: &CanFrame) -> Vec<BridgeMessage> {
    let payload: &[u8] = if frame.is_remote() { &[] } else { frame.data() };

    table
        .match_frame(frame.kind(), frame.id())
        .filter_map(|rule| match BridgeMessage::new(rule.topic(), payload) {
            Ok(message) => Some(message),
            Err(e) => {
                error!("Rule for {}: {}", rule.topic(), e);
                None
            }
        })
        .collect()
}

/// Frames to transmit for a broker delivery.
///
/// Payloads longer than a frame are cut to 8 bytes; the cut is logged and
/// reported once per delivery.
pub fn message_to_frames(
    table: &RoutingTable,
    message: &InboundMessage,
) -> (Vec<BridgeFrame>, Option<Truncation>) {
    let payload = message.payload();
    let kept = payload.len().min(MAX_DATA_LEN);

    let mut frames = Vec::new();
    let mut truncation = None;

    for rule in table.match_topic(message.topic()) {
        if kept < payload.len() && truncation.is_none() {
            warn!(
                "Data length is reduced to {} bytes ({} received on {})",
                kept,
                payload.len(),
                message.topic()
            );
            truncation = Some(Truncation {
                original: payload.len(),
                kept,
            });
        }

        match BridgeFrame::new(rule.kind(), rule.id(), &payload[..kept]) {
            Ok(frame) => frames.push(frame),
            Err(e) => error!("Rule for {}: {}", rule.topic(), e),
        }
    }

    (frames, truncation)
}
