//! Consumer-facing framing of hub subscriptions
//!
//! The request-handling layer owns the connection; this module only turns a
//! [`Subscription`] into the text frames it writes, one per message.

use crate::{config::Transport, hub::Subscription};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;

/// Renders one server-sent event
pub fn sse_frame(event: &str, data: &str) -> String {
    let mut frame = format!("event: {event}\n");
    for line in data.lines() {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

/// Converts a subscription into a stream of frames for `transport`
///
/// Returns `None` for [`Transport::None`]. The stream ends when the
/// subscription is closed; messages that fail to serialize are skipped.
pub fn frames<M>(transport: Transport, subscription: Subscription<M>) -> Option<BoxStream<'static, String>>
where
    M: Clone + Serialize + Send + Sync + 'static,
{
    let channel = subscription.channel().to_string();
    let encoded = subscription
        .into_stream()
        .filter_map(move |message| {
            let channel = channel.clone();
            async move {
                match serde_json::to_string(&message) {
                    Ok(json) => Some((channel, json)),
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Dropping unserializable message");
                        None
                    }
                }
            }
        });

    match transport {
        Transport::Sse => Some(
            encoded
                .map(|(channel, json)| sse_frame(&channel, &json))
                .boxed(),
        ),
        Transport::Socket => Some(encoded.map(|(_, json)| json).boxed()),
        Transport::None => None,
    }
}
