//! Remote relay actuation over HTTP (Shelly-style API).
//!
//! Commands are plain GETs against `http://<endpoint>/relay/0?turn=on|off`
//! with an optional `&timer=N` auto-off; state is read from
//! `http://<endpoint>/rpc/Switch.GetStatus?id=0`, whose JSON `output` field
//! is the relay's physical state. Every request carries a fixed timeout and
//! commands are retried a bounded number of times.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::relay::RelayState;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("relay answered HTTP {0}")]
    Status(u16),

    #[error("malformed status body: {0}")]
    BadBody(String),
}

impl From<reqwest::Error> for ActuatorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Status(status.as_u16())
        } else if e.is_decode() {
            Self::BadBody(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub state: RelayState,
    /// Auto-off after this many seconds (only meaningful with `On`).
    pub timer_secs: Option<u64>,
}

impl Command {
    pub fn set(state: RelayState) -> Self {
        Self {
            state,
            timer_secs: None,
        }
    }

    pub fn timed_on(secs: u64) -> Self {
        Self {
            state: RelayState::On,
            timer_secs: Some(secs),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.timer_secs {
            Some(secs) => write!(f, "{} for {secs}s", self.state),
            None => write!(f, "{}", self.state),
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator interface
// ---------------------------------------------------------------------------

/// The only way the engine and the irrigation controller touch hardware.
pub trait Actuator: Send + Sync {
    /// Send a command, retrying per the implementation's policy.
    fn send(
        &self,
        endpoint: &str,
        cmd: Command,
    ) -> impl Future<Output = Result<(), ActuatorError>> + Send;

    /// Read the relay's physical state. An error means "unknown".
    fn query_state(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<RelayState, ActuatorError>> + Send;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Fixed-backoff retry: one initial attempt plus up to `retries` more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ActuatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActuatorError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt <= self.retries => {
                    warn!(
                        target_url = label,
                        attempt,
                        max_attempts = self.retries + 1,
                        "actuation attempt failed: {e}"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shelly HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SwitchStatus {
    output: bool,
}

#[derive(Clone)]
pub struct ShellyClient {
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl ShellyClient {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, retry })
    }

    pub fn command_url(endpoint: &str, cmd: Command) -> String {
        match cmd.timer_secs {
            Some(secs) => format!("http://{endpoint}/relay/0?turn={}&timer={secs}", cmd.state),
            None => format!("http://{endpoint}/relay/0?turn={}", cmd.state),
        }
    }

    pub fn status_url(endpoint: &str) -> String {
        format!("http://{endpoint}/rpc/Switch.GetStatus?id=0")
    }

    async fn get_ok(&self, url: &str) -> Result<(), ActuatorError> {
        let res = self.http.get(url).send().await?;
        if !res.status().is_success() {
            return Err(ActuatorError::Status(res.status().as_u16()));
        }
        Ok(())
    }
}

impl Actuator for ShellyClient {
    async fn send(&self, endpoint: &str, cmd: Command) -> Result<(), ActuatorError> {
        let url = Self::command_url(endpoint, cmd);
        self.retry.run(&url, || self.get_ok(&url)).await?;
        debug!(endpoint, %cmd, "relay command accepted");
        Ok(())
    }

    async fn query_state(&self, endpoint: &str) -> Result<RelayState, ActuatorError> {
        let res = self.http.get(Self::status_url(endpoint)).send().await?;
        if !res.status().is_success() {
            return Err(ActuatorError::Status(res.status().as_u16()));
        }
        let status: SwitchStatus = res
            .json()
            .await
            .map_err(|e| ActuatorError::BadBody(e.to_string()))?;
        Ok(if status.output {
            RelayState::On
        } else {
            RelayState::Off
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Json};
    use axum::routing::get;
    use axum::Router;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-process stand-in for a relay's HTTP API.
    #[derive(Default)]
    struct FakeRelay {
        output: AtomicBool,
        failures_left: AtomicUsize,
        calls: Mutex<Vec<HashMap<String, String>>>,
        status_body: Mutex<Option<String>>,
    }

    async fn relay_handler(
        State(fake): State<Arc<FakeRelay>>,
        Query(q): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        fake.calls.lock().unwrap().push(q.clone());
        if fake.failures_left.load(Ordering::SeqCst) > 0 {
            fake.failures_left.fetch_sub(1, Ordering::SeqCst);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        fake.output
            .store(q.get("turn").map(String::as_str) == Some("on"), Ordering::SeqCst);
        Json(serde_json::json!({ "ison": true })).into_response()
    }

    async fn status_handler(State(fake): State<Arc<FakeRelay>>) -> impl IntoResponse {
        if let Some(body) = fake.status_body.lock().unwrap().clone() {
            return body.into_response();
        }
        Json(serde_json::json!({ "id": 0, "output": fake.output.load(Ordering::SeqCst) }))
            .into_response()
    }

    async fn slow_handler() -> &'static str {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "{}"
    }

    async fn spawn_fake(fake: Arc<FakeRelay>) -> String {
        let app = Router::new()
            .route("/relay/0", get(relay_handler))
            .route("/rpc/Switch.GetStatus", get(status_handler))
            .with_state(fake);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    fn client(retries: u32) -> ShellyClient {
        ShellyClient::new(
            Duration::from_secs(2),
            RetryPolicy {
                retries,
                backoff: Duration::from_millis(10),
            },
        )
        .unwrap()
    }

    // -- URLs ----------------------------------------------------------------

    #[test]
    fn command_urls() {
        assert_eq!(
            ShellyClient::command_url("10.0.0.5", Command::set(RelayState::On)),
            "http://10.0.0.5/relay/0?turn=on"
        );
        assert_eq!(
            ShellyClient::command_url("10.0.0.5", Command::set(RelayState::Off)),
            "http://10.0.0.5/relay/0?turn=off"
        );
        assert_eq!(
            ShellyClient::command_url("10.0.0.5", Command::timed_on(120)),
            "http://10.0.0.5/relay/0?turn=on&timer=120"
        );
    }

    #[test]
    fn status_url() {
        assert_eq!(
            ShellyClient::status_url("10.0.0.5"),
            "http://10.0.0.5/rpc/Switch.GetStatus?id=0"
        );
    }

    // -- Retry policy --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            retries: 2,
            backoff: Duration::from_secs(1),
        };
        let attempts = AtomicUsize::new(0);
        let res = policy
            .run("test", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ActuatorError::Timeout)
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_bound() {
        let policy = RetryPolicy {
            retries: 2,
            backoff: Duration::from_secs(1),
        };
        let attempts = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();
        let res: Result<(), _> = policy
            .run("test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ActuatorError::Status(503))
            })
            .await;
        assert!(matches!(res, Err(ActuatorError::Status(503))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // two backoff sleeps between three attempts
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn retry_zero_means_single_attempt() {
        let policy = RetryPolicy {
            retries: 0,
            backoff: Duration::from_millis(1),
        };
        let attempts = AtomicUsize::new(0);
        let res: Result<(), _> = policy
            .run("test", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ActuatorError::Timeout)
            })
            .await;
        assert!(res.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    // -- HTTP client against a fake relay -------------------------------------

    #[tokio::test]
    async fn send_switches_fake_relay() {
        let fake = Arc::new(FakeRelay::default());
        let endpoint = spawn_fake(fake.clone()).await;
        let c = client(0);

        c.send(&endpoint, Command::set(RelayState::On)).await.unwrap();
        assert_eq!(c.query_state(&endpoint).await.unwrap(), RelayState::On);

        c.send(&endpoint, Command::set(RelayState::Off)).await.unwrap();
        assert_eq!(c.query_state(&endpoint).await.unwrap(), RelayState::Off);
    }

    #[tokio::test]
    async fn timed_on_passes_timer() {
        let fake = Arc::new(FakeRelay::default());
        let endpoint = spawn_fake(fake.clone()).await;

        client(0).send(&endpoint, Command::timed_on(90)).await.unwrap();

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].get("turn").map(String::as_str), Some("on"));
        assert_eq!(calls[0].get("timer").map(String::as_str), Some("90"));
    }

    #[tokio::test]
    async fn send_retries_non_2xx() {
        let fake = Arc::new(FakeRelay::default());
        fake.failures_left.store(2, Ordering::SeqCst);
        let endpoint = spawn_fake(fake.clone()).await;

        client(2)
            .send(&endpoint, Command::set(RelayState::On))
            .await
            .unwrap();
        assert_eq!(fake.calls.lock().unwrap().len(), 3);
        assert!(fake.output.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_surfaces_failure_after_retries() {
        let fake = Arc::new(FakeRelay::default());
        fake.failures_left.store(10, Ordering::SeqCst);
        let endpoint = spawn_fake(fake.clone()).await;

        let err = client(1)
            .send(&endpoint, Command::set(RelayState::On))
            .await
            .unwrap_err();
        assert!(matches!(err, ActuatorError::Status(500)));
        assert_eq!(fake.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn query_state_rejects_malformed_body() {
        let fake = Arc::new(FakeRelay::default());
        *fake.status_body.lock().unwrap() = Some("not json".to_string());
        let endpoint = spawn_fake(fake).await;

        let err = client(0).query_state(&endpoint).await.unwrap_err();
        assert!(matches!(err, ActuatorError::BadBody(_)));
    }

    #[tokio::test]
    async fn query_state_unreachable_is_error() {
        // Bind and drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(client(0).query_state(&endpoint).await.is_err());
    }

    #[tokio::test]
    async fn slow_relay_times_out() {
        let app = Router::new().route("/rpc/Switch.GetStatus", get(slow_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let c = ShellyClient::new(Duration::from_millis(200), RetryPolicy::default()).unwrap();
        let err = c.query_state(&endpoint).await.unwrap_err();
        assert!(matches!(err, ActuatorError::Timeout));
    }
}
