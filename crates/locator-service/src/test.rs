//! Helpers for unit tests.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::remote::{LookupResponse, RemoteError, RemoteLookup};

/// A scripted answer of [`ScriptedLookup`].
#[derive(Clone, Debug)]
pub enum Reply {
    Value(Option<String>),
    Throttle(Option<SystemTime>),
    Fail,
    /// Never answers.
    Hang,
}

impl Reply {
    pub fn found(value: &str) -> Self {
        Self::Value(Some(value.to_owned()))
    }
}

/// A remote side that answers from a script and records every request.
///
/// Replies are consumed per key in the order they were added. Keys without a scripted reply
/// are answered with "no value".
#[derive(Debug, Default)]
pub struct ScriptedLookup {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    delay: Duration,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every answer by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn reply(&self, key: &str, reply: Reply) {
        self.replies
            .lock()
            .entry(key.to_owned())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(_, time)| *time).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RemoteLookup for ScriptedLookup {
    async fn request(&self, key: &str) -> Result<LookupResponse, RemoteError> {
        self.calls.lock().push((key.to_owned(), Instant::now()));
        let reply = self
            .replies
            .lock()
            .get_mut(key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Value(None));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match reply {
            Reply::Value(value) => Ok(LookupResponse {
                value,
                ..Default::default()
            }),
            Reply::Throttle(reset_at) => Ok(LookupResponse::throttled(reset_at)),
            Reply::Fail => Err(RemoteError::Malformed("scripted failure".into())),
            Reply::Hang => std::future::pending().await,
        }
    }
}
