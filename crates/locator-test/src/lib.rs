//! Helpers for testing the resolver.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Assign it to a variable in the test function
//!    (e.g. `let dir = locator_test::tempdir()`).
//!
//!  - When using [`lookup_server`], hold on to the server until all lookups have been made.
//!    Dropping it stops the server and further lookups fail to connect.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the resolver crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("locator_service=trace,locator=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server running on a random local port until dropped.
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    /// Serves `router`. Must be called from within a tokio runtime.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Default)]
struct LookupState {
    values: BTreeMap<String, Option<String>>,
    hits: BTreeMap<String, usize>,
    /// `Some` while throttling, optionally with the reset time in epoch seconds.
    throttle: Option<Option<u64>>,
    delay: Duration,
}

/// A lookup endpoint answering from a fixed table.
///
/// Serves `GET /lookup/:key`: known keys are answered with `{"value": ...}`, unknown keys
/// with `404`. While throttling, every request is answered with `429`.
pub struct LookupServer {
    server: Server,
    state: Arc<Mutex<LookupState>>,
}

impl LookupServer {
    /// The base URL to configure for lookups, with a trailing slash.
    pub fn url(&self) -> Url {
        self.server.url("lookup/")
    }

    /// Sets the value for `key`. `None` answers `{"value": null}`.
    pub fn set(&self, key: &str, value: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state
            .values
            .insert(key.to_owned(), value.map(str::to_owned));
    }

    /// Answers all further requests with `429`, announcing `reset_at` (epoch seconds).
    pub fn throttle(&self, reset_at: Option<u64>) {
        self.state.lock().unwrap().throttle = Some(reset_at);
    }

    pub fn stop_throttling(&self) {
        self.state.lock().unwrap().throttle = None;
    }

    /// Delays every answer by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// The number of requests for `key`.
    pub fn hits(&self, key: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.hits.get(key).copied().unwrap_or_default()
    }

    /// The total number of requests.
    pub fn accesses(&self) -> usize {
        self.state.lock().unwrap().hits.values().sum()
    }
}

async fn answer(state: Arc<Mutex<LookupState>>, key: String) -> Response {
    let (delay, throttle, value) = {
        let mut state = state.lock().unwrap();
        *state.hits.entry(key.clone()).or_default() += 1;
        (state.delay, state.throttle, state.values.get(&key).cloned())
    };

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    match (throttle, value) {
        (Some(Some(reset_at)), _) => (
            StatusCode::TOO_MANY_REQUESTS,
            [("x-rate-limit-reset", reset_at.to_string())],
        )
            .into_response(),
        (Some(None), _) => StatusCode::TOO_MANY_REQUESTS.into_response(),
        (None, Some(value)) => axum::Json(serde_json::json!({ "value": value })).into_response(),
        (None, None) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Spawns a [`LookupServer`] that knows the given `key => value` pairs.
pub fn lookup_server<'a>(values: impl IntoIterator<Item = (&'a str, &'a str)>) -> LookupServer {
    let state = LookupState {
        values: values
            .into_iter()
            .map(|(key, value)| (key.to_owned(), Some(value.to_owned())))
            .collect(),
        ..Default::default()
    };
    let state = Arc::new(Mutex::new(state));

    let router = Router::new().route(
        "/lookup/:key",
        get({
            let state = Arc::clone(&state);
            move |Path(key): Path<String>| answer(Arc::clone(&state), key)
        }),
    );

    LookupServer {
        server: Server::with_router(router),
        state,
    }
}
