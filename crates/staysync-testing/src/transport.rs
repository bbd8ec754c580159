//! Scripted outbound transport.
//!
//! Replies are queued per URL prefix and consumed in order. When a prefix has
//! no queued reply the transport answers `200 OK`. Every request is recorded
//! so tests can assert on what was sent.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use staysync_delivery::{
    client::{OutboundRequest, OutboundResponse, Transport},
    DeliveryError, Result,
};

/// Scripted reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Response with status and body.
    Status(u16, String),
    /// HTTP 429 with an optional `Retry-After` header.
    TooManyRequests {
        /// Header value in seconds.
        retry_after: Option<u64>,
    },
    /// Connection failure.
    NetworkError,
    /// Request timeout.
    Timeout,
}

impl Reply {
    /// 200 with an empty JSON body.
    pub fn ok() -> Self {
        Self::Status(200, "{}".to_string())
    }

    /// 200 with a JSON body.
    pub fn json(body: &serde_json::Value) -> Self {
        Self::Status(200, body.to_string())
    }

    /// Bare status.
    pub fn status(code: u16) -> Self {
        Self::Status(code, String::new())
    }
}

#[derive(Default)]
struct State {
    scripts: Vec<(String, VecDeque<Reply>)>,
    fallbacks: HashMap<String, Reply>,
    requests: Vec<OutboundRequest>,
    latency: Duration,
}

/// [`Transport`] answering from scripted replies.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport").finish_non_exhaustive()
    }
}

impl ScriptedTransport {
    /// Creates a transport that answers 200 to everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues replies for URLs starting with `prefix`.
    pub fn enqueue(&self, prefix: impl Into<String>, replies: impl IntoIterator<Item = Reply>) {
        let prefix = prefix.into();
        let mut state = self.lock();
        if let Some((_, queue)) = state.scripts.iter_mut().find(|(p, _)| *p == prefix) {
            queue.extend(replies);
        } else {
            state.scripts.push((prefix, replies.into_iter().collect()));
        }
    }

    /// Answers `reply` for `prefix` whenever its queue is empty.
    pub fn always(&self, prefix: impl Into<String>, reply: Reply) {
        self.lock().fallbacks.insert(prefix.into(), reply);
    }

    /// Delays every reply, so concurrent runs interleave inside the
    /// outbound call.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Removes every scripted reply and fallback.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.scripts.clear();
        state.fallbacks.clear();
    }

    /// Every request sent so far.
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.lock().requests.clone()
    }

    /// Requests sent to URLs starting with `prefix`.
    pub fn requests_to(&self, prefix: &str) -> Vec<OutboundRequest> {
        self.lock().requests.iter().filter(|r| r.url.starts_with(prefix)).cloned().collect()
    }

    /// Number of requests sent to URLs starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.requests_to(prefix).len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_reply(&self, request: &OutboundRequest) -> Reply {
        let mut state = self.lock();
        state.requests.push(request.clone());

        let scripted = state
            .scripts
            .iter_mut()
            .filter(|(prefix, _)| request.url.starts_with(prefix.as_str()))
            .find_map(|(_, queue)| queue.pop_front());
        if let Some(reply) = scripted {
            return reply;
        }

        state
            .fallbacks
            .iter()
            .find(|(prefix, _)| request.url.starts_with(prefix.as_str()))
            .map_or_else(Reply::ok, |(_, reply)| reply.clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut headers = HashMap::new();
        let (status_code, body) = match self.next_reply(request) {
            Reply::Status(code, body) => (code, body),
            Reply::TooManyRequests { retry_after } => {
                if let Some(seconds) = retry_after {
                    headers.insert("retry-after".to_string(), seconds.to_string());
                }
                (429, String::new())
            },
            Reply::NetworkError => {
                return Err(DeliveryError::network(format!("connection refused: {}", request.url)))
            },
            Reply::Timeout => return Err(DeliveryError::timeout(10)),
        };

        Ok(OutboundResponse { status_code, headers, body, duration: Duration::from_millis(5) })
    }
}

#[cfg(test)]
mod tests {
    use staysync_delivery::client;

    use super::*;

    fn post(url: &str) -> OutboundRequest {
        OutboundRequest::post_json(url, &serde_json::json!({"code": "R1"}))
    }

    #[tokio::test]
    async fn replies_are_consumed_in_order_then_fall_back() {
        let transport = ScriptedTransport::new();
        transport.enqueue("https://a.test", [Reply::status(503), Reply::NetworkError]);
        transport.always("https://a.test", Reply::status(400));

        let first = client::execute(&transport, &post("https://a.test/events")).await.unwrap_err();
        let second = client::execute(&transport, &post("https://a.test/events")).await.unwrap_err();
        let third = client::execute(&transport, &post("https://a.test/events")).await.unwrap_err();

        assert!(matches!(first, DeliveryError::ServerError { status_code: 503, .. }));
        assert!(matches!(second, DeliveryError::NetworkError { .. }));
        assert!(matches!(third, DeliveryError::ClientError { status_code: 400, .. }));
        assert_eq!(transport.count("https://a.test"), 3);
    }

    #[tokio::test]
    async fn unscripted_urls_succeed() {
        let transport = ScriptedTransport::new();

        let response = client::execute(&transport, &post("https://b.test/events")).await.unwrap();

        assert_eq!(response.status_code, 200);
    }
}
