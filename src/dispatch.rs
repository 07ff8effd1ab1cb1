//! C4 (inbound queue) + C5 (dispatcher), §4.5.
//!
//! A bounded `tokio::sync::mpsc` channel plays the role of the teacher's
//! `to_handle`/`handler` unbounded channel in `ws/backend.rs`, except bounded:
//! the spec calls for a "bounded producer/consumer queue" rather than the
//! unbounded one the teacher uses for JSON-RPC subscriptions, so a slow
//! application callback applies backpressure to the protocol reader instead
//! of buffering without limit.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::Message;
use crate::options::AckMode;
use crate::protocol::AckFrame;
use crate::registry::DispatchDecision;
use crate::session::Shared;

pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// A decoded MESSAGE frame queued for dispatch, with its subscription
/// already resolved from the wire `id` string.
pub struct InboundDelivery {
    pub subscription_id: Option<u64>,
    pub message: Message,
}

pub fn inbound_channel(capacity: usize) -> (mpsc::Sender<InboundDelivery>, mpsc::Receiver<InboundDelivery>) {
    mpsc::channel(capacity)
}

/// C5: drains the inbound queue until it is closed (§4.5: "blocks on a
/// semaphore for the next item until the queue is closed, at which point it
/// drains and exits" — `mpsc::Receiver::recv` already has that property).
pub async fn run_dispatcher(shared: Arc<Shared>, mut inbound: mpsc::Receiver<InboundDelivery>) {
    while let Some(delivery) = inbound.recv().await {
        let Some(sub_id) = delivery.subscription_id else {
            trace!("message without a resolvable subscription id reached the dispatcher; dropping");
            continue;
        };

        let seq = delivery.message.receipt.seq.unwrap_or(0);

        let decision = {
            let mut state = shared.state.lock().await;
            state.registry.dispatch_decision(sub_id, seq)
        };

        let DispatchDecision::Deliver { ack_mode, callback } = decision else {
            continue;
        };

        callback(delivery.message);

        if ack_mode == AckMode::Auto && seq != 0 {
            match serde_json::to_string(&AckFrame::new(seq)) {
                Ok(text) => {
                    let _ = shared.send_text(text).await;
                }
                Err(e) => debug!(seq, err = %e, "failed to encode auto-ack frame"),
            }
        }
    }
}
