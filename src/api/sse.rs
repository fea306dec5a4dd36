//! SSE envelope shared by every stream endpoint.
//!
//! Each stream follows the same shape: a `ready` event, optionally a
//! `snapshot`, then tail events from the Event Bus until the client
//! disconnects. A 15 second heartbeat keeps intermediaries from reaping
//! idle connections; a failed send means the client went away and the
//! driving task unwinds, dropping its bus subscription.

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::Response;
use hyper::body::Frame;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE, HeaderValue};
use serde::Serialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

use super::ApiBody;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const CHANNEL_DEPTH: usize = 64;

#[derive(Clone)]
pub struct SseSender {
    tx: mpsc::Sender<Frame<Bytes>>,
}

impl SseSender {
    /// Sends one named event. Returns `false` once the client is gone.
    pub async fn send(&self, event: &str, data: &impl Serialize) -> bool {
        let payload = serde_json::to_string(data).unwrap_or_else(|_| "null".to_string());
        let frame = format!("event: {event}\ndata: {payload}\n\n");
        self.tx
            .send(Frame::data(Bytes::from(frame)))
            .await
            .is_ok()
    }

    pub async fn heartbeat(&self) -> bool {
        self.send("heartbeat", &serde_json::json!({})).await
    }
}

struct ChannelBody {
    rx: mpsc::Receiver<Frame<Bytes>>,
}

impl hyper::body::Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.get_mut().rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

/// Builds the response half and the sender half of one SSE connection.
pub fn channel() -> (SseSender, Response<ApiBody>) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let mut response = Response::new(ChannelBody { rx }.boxed());
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    (SseSender { tx }, response)
}

/// Interval that does not fire immediately and tolerates missed ticks.
pub fn heartbeat_interval() -> tokio::time::Interval {
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_frame(body: &mut ApiBody) -> Option<String> {
        body.frame().await.map(|frame| {
            let data = frame.unwrap().into_data().unwrap();
            String::from_utf8(data.to_vec()).unwrap()
        })
    }

    #[tokio::test]
    async fn frames_follow_the_sse_wire_format() {
        let (tx, response) = channel();
        let mut body = response.into_body();

        assert!(tx.send("ready", &serde_json::json!({"ok": true})).await);
        let frame = read_frame(&mut body).await.unwrap();
        assert_eq!(frame, "event: ready\ndata: {\"ok\":true}\n\n");

        assert!(tx.heartbeat().await);
        let frame = read_frame(&mut body).await.unwrap();
        assert!(frame.starts_with("event: heartbeat\n"));
    }

    #[tokio::test]
    async fn dropped_client_fails_the_next_send() {
        let (tx, response) = channel();
        drop(response);
        assert!(!tx.send("ready", &serde_json::json!({})).await);
    }
}
