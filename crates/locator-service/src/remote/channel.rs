//! Lookups answered by another task over channels.
//!
//! Each request gets a fresh id. The answering side reports back through the
//! [`ResponseHandle`] with that id, and the id is matched to the waiting request. An id is
//! forgotten as soon as it is answered, or when the waiting request is dropped (for example
//! because it timed out), so unanswered requests do not accumulate.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::utils::defer::defer;

use super::{LookupResponse, RemoteError, RemoteLookup};

type Responders = Arc<Mutex<HashMap<u64, oneshot::Sender<LookupResponse>>>>;

/// A lookup handed to the answering side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRequest {
    /// The id to answer with.
    pub id: u64,
    /// The key to look up.
    pub key: String,
}

/// Used by the answering side to settle requests.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    responders: Responders,
}

impl ResponseHandle {
    /// Settles the request with the given `id`.
    ///
    /// Returns `false` if no request with this id is waiting anymore, in which case the
    /// response is discarded.
    pub fn complete(&self, id: u64, response: LookupResponse) -> bool {
        let Some(responder) = self.responders.lock().remove(&id) else {
            tracing::trace!(id, "Discarding response for unknown request");
            return false;
        };
        responder.send(response).is_ok()
    }

    /// The number of requests waiting for a response.
    pub fn pending(&self) -> usize {
        self.responders.lock().len()
    }
}

/// Lookup implementation that correlates requests and responses by id.
#[derive(Debug)]
pub struct ChannelLookup {
    outbound: mpsc::UnboundedSender<LookupRequest>,
    responders: Responders,
    next_id: AtomicU64,
}

impl ChannelLookup {
    /// Creates the lookup, the receiving end of the requests and the handle to answer them.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LookupRequest>, ResponseHandle) {
        let (outbound, requests) = mpsc::unbounded_channel();
        let responders = Responders::default();
        let lookup = Self {
            outbound,
            responders: Arc::clone(&responders),
            next_id: AtomicU64::new(1),
        };
        (lookup, requests, ResponseHandle { responders })
    }
}

#[async_trait]
impl RemoteLookup for ChannelLookup {
    async fn request(&self, key: &str) -> Result<LookupResponse, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.responders.lock().insert(id, sender);

        let responders = Arc::clone(&self.responders);
        let _forget_request = defer(move || {
            responders.lock().remove(&id);
        });

        let request = LookupRequest {
            id,
            key: key.to_owned(),
        };
        self.outbound
            .send(request)
            .map_err(|_| RemoteError::Disconnected)?;

        receiver.await.map_err(|_| RemoteError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_correlates_out_of_order_responses() {
        let (lookup, mut requests, handle) = ChannelLookup::new();
        let lookup = Arc::new(lookup);

        let first = tokio::spawn({
            let lookup = Arc::clone(&lookup);
            async move { lookup.request("alice").await }
        });
        let second = tokio::spawn({
            let lookup = Arc::clone(&lookup);
            async move { lookup.request("bob").await }
        });

        let a = requests.recv().await.unwrap();
        let b = requests.recv().await.unwrap();
        assert_ne!(a.id, b.id);

        // answer in reverse order
        for request in [b, a] {
            let response = match request.key.as_str() {
                "alice" => LookupResponse::found("France"),
                _ => LookupResponse::missing(),
            };
            assert!(handle.complete(request.id, response));
        }

        assert_eq!(
            first.await.unwrap().unwrap(),
            LookupResponse::found("France")
        );
        assert_eq!(second.await.unwrap().unwrap(), LookupResponse::missing());
        assert_eq!(handle.pending(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_forgotten() {
        let (lookup, mut requests, handle) = ChannelLookup::new();

        let result =
            tokio::time::timeout(Duration::from_millis(10), lookup.request("alice")).await;
        assert!(result.is_err());
        assert_eq!(handle.pending(), 0);

        // a late answer is discarded
        let request = requests.recv().await.unwrap();
        assert!(!handle.complete(request.id, LookupResponse::found("France")));
    }

    #[tokio::test]
    async fn test_disconnected() {
        let (lookup, requests, handle) = ChannelLookup::new();
        drop(requests);

        let result = lookup.request("alice").await;
        assert!(matches!(result, Err(RemoteError::Disconnected)));
        assert_eq!(handle.pending(), 0);
    }
}
