//! Daemon request protocol.
//!
//! Every instrument daemon is driven the same way: post a request tagged with a
//! unique `request_id`, then poll the daemon's status document until it reports
//! success, `request_finished == true` and echoes the same id. A non-success
//! `error` field ends the wait immediately with the daemon's message.
//!
//! Passive waits (such as "acquisition done") carry no request id; they
//! poll on a slower interval until the `status` field reads `"Done"`.
//!
//! Every transport call and both kinds of wait are bounded by an optional
//! timeout and interrupted by the client's cancellation token. Without a timeout
//! a call lasts until the daemon answers or the token fires.
//!
//! # Simulation
//!
//! [`DaemonMode::Simulated`] short-circuits every request to succeed after a
//! fixed delay, so the whole controller can run without instruments.

use crate::config::{HardwareConfig, MotorSlot};
use crate::error::{HardwareError, HardwareResult};
use crate::hardware::transport::DaemonTransport;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Histogram length reported by simulated acquisition daemons.
pub const SIMULATED_HISTOGRAM_BINS: usize = 1024;

/// Literal a passive wait compares the `status` field against.
const STATUS_DONE: &str = "Done";

/// How waits poll the daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Interval between status polls while waiting for a request id.
    pub request_interval: Duration,
    /// Interval between status polls for passive "Done" waits.
    pub counting_interval: Duration,
    /// Bound on a single wait. `None` waits until completion or cancellation.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            request_interval: Duration::from_millis(200),
            counting_interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// Whether requests reach real daemons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonMode {
    /// Requests go to the daemons over the transport.
    Live,
    /// Every request succeeds after `delay`.
    Simulated {
        /// Time each simulated request takes.
        delay: Duration,
    },
}

/// Status document served by `GET <daemon_url>`.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonStatus {
    /// `"Success"` / `"No error"` or a failure message.
    pub error: String,
    /// Whether the last request has been handled.
    #[serde(default)]
    pub request_finished: bool,
    /// Id of the last request the daemon handled.
    #[serde(default, deserialize_with = "id_as_string")]
    pub request_id: String,
    /// Free-form state, compared against `"Done"` by passive waits.
    #[serde(default)]
    pub status: Option<String>,
}

impl DaemonStatus {
    /// True when the `error` field carries one of the success markers.
    pub fn is_ok(&self) -> bool {
        self.error == "Success" || self.error == "No error"
    }

    /// True when the daemon finished the request with the given id.
    pub fn completes(&self, request_id: &str) -> bool {
        self.request_finished && self.request_id == request_id
    }
}

fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Fresh correlation id of the form `<prefix>_<uuid>`.
pub fn new_request_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4())
}

/// A request body: a correlation id plus operation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonRequest {
    request_id: String,
    params: Map<String, Value>,
}

impl DaemonRequest {
    /// Start a request with an explicit id.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            params: Map::new(),
        }
    }

    /// Start a request with a fresh id of the form `<prefix>_<uuid>`.
    pub fn generate(prefix: &str) -> Self {
        Self::new(new_request_id(prefix))
    }

    /// Add an operation parameter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// The correlation id.
    pub fn id(&self) -> &str {
        &self.request_id
    }

    /// JSON body as posted to the daemon.
    pub fn to_json(&self) -> Value {
        let mut body = self.params.clone();
        body.insert("request_id".to_string(), json!(self.request_id));
        Value::Object(body)
    }
}

/// Client for the send-and-confirm protocol shared by all daemons.
#[derive(Clone)]
pub struct DaemonClient {
    transport: Arc<dyn DaemonTransport>,
    mode: DaemonMode,
    policy: PollPolicy,
    cancel: CancellationToken,
}

impl DaemonClient {
    /// Live client with the default poll policy.
    pub fn new(transport: Arc<dyn DaemonTransport>) -> Self {
        Self {
            transport,
            mode: DaemonMode::Live,
            policy: PollPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Client configured from the `[hardware]` section.
    pub fn from_config(transport: Arc<dyn DaemonTransport>, config: &HardwareConfig) -> Self {
        let mode = if config.simulate {
            DaemonMode::Simulated {
                delay: config.simulate_delay,
            }
        } else {
            DaemonMode::Live
        };
        Self::new(transport)
            .with_mode(mode)
            .with_policy(PollPolicy {
                request_interval: config.poll_interval,
                counting_interval: config.counting_poll_interval,
                timeout: config.request_timeout,
            })
    }

    /// Replace the mode.
    pub fn with_mode(mut self, mode: DaemonMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the poll policy.
    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Interrupt every wait when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current mode.
    pub fn mode(&self) -> DaemonMode {
        self.mode
    }

    /// Post `request` and wait until the daemon confirms it.
    pub async fn send(&self, url: &str, request: &DaemonRequest) -> HardwareResult<()> {
        info!(url, request_id = request.id(), body = %request.to_json(), "posting daemon request");
        if let DaemonMode::Simulated { delay } = self.mode {
            return self.simulate(url, delay).await;
        }
        let body = request.to_json();
        self.supervise(url, self.transport.post_json(url, &body))
            .await?;
        self.wait_for_request_done(url, request.id()).await
    }

    /// Post `request` without waiting for confirmation.
    pub async fn post(&self, url: &str, request: &DaemonRequest) -> HardwareResult<()> {
        info!(url, request_id = request.id(), body = %request.to_json(), "posting daemon request (no wait)");
        if let DaemonMode::Simulated { delay } = self.mode {
            return self.simulate(url, delay).await;
        }
        let body = request.to_json();
        self.supervise(url, self.transport.post_json(url, &body))
            .await
    }

    /// Poll `url` until it reports the request with `request_id` as finished.
    pub async fn wait_for_request_done(&self, url: &str, request_id: &str) -> HardwareResult<()> {
        if let DaemonMode::Simulated { delay } = self.mode {
            return self.simulate(url, delay).await;
        }
        self.supervise(url, self.poll_request(url, request_id)).await
    }

    /// Poll `url` until its `status` field reads `"Done"`.
    pub async fn wait_for_status_done(&self, url: &str) -> HardwareResult<()> {
        if let DaemonMode::Simulated { delay } = self.mode {
            return self.simulate(url, delay).await;
        }
        self.supervise(url, self.poll_done(url)).await
    }

    /// Fetch and decode the daemon's status document.
    async fn status(&self, url: &str) -> HardwareResult<DaemonStatus> {
        let value = self.transport.get_json(url).await?;
        serde_json::from_value(value).map_err(|e| HardwareError::InvalidResponse {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    // ------------------------------------------------------------------------
    // Motion controllers (two motors per daemon)
    // ------------------------------------------------------------------------

    /// Move one motor of a two-motor controller.
    pub async fn move_motor(
        &self,
        url: &str,
        request_id: &str,
        slot: MotorSlot,
        position: f64,
    ) -> HardwareResult<()> {
        let field = match slot {
            MotorSlot::First => "set_m1_target_position",
            MotorSlot::Second => "set_m2_target_position",
        };
        self.send(url, &DaemonRequest::new(request_id).with(field, position))
            .await
    }

    /// Move both motors of a two-motor controller in one request.
    pub async fn move_both_motors(
        &self,
        url: &str,
        request_id: &str,
        first: f64,
        second: f64,
    ) -> HardwareResult<()> {
        let request = DaemonRequest::new(request_id)
            .with("set_m1_target_position", first)
            .with("set_m2_target_position", second);
        self.send(url, &request).await
    }

    // ------------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------------

    /// Stop an acquisition.
    pub async fn stop_acquisition(&self, url: &str, request_id: &str) -> HardwareResult<()> {
        let request = DaemonRequest::new(request_id).with("stop_acquisition", true);
        self.send(url, &request).await
    }

    /// Fetch the histogram of one board channel from `<url>/histogram/<board>-<channel>`.
    pub async fn histogram(&self, url: &str, board: &str, channel: u32) -> HardwareResult<Vec<u64>> {
        let histogram_url = format!("{}/histogram/{}-{}", url, board, channel);
        if let DaemonMode::Simulated { delay } = self.mode {
            self.simulate(&histogram_url, delay).await?;
            return Ok(vec![0; SIMULATED_HISTOGRAM_BINS]);
        }
        let text = self
            .supervise(&histogram_url, self.transport.get_text(&histogram_url))
            .await?;
        parse_histogram(&histogram_url, &text)
    }

    async fn poll_request(&self, url: &str, request_id: &str) -> HardwareResult<()> {
        loop {
            tokio::time::sleep(self.policy.request_interval).await;
            let status = self.status(url).await?;
            if !status.is_ok() {
                return Err(HardwareError::Daemon {
                    url: url.to_string(),
                    message: status.error,
                });
            }
            if status.completes(request_id) {
                debug!(url, request_id, "daemon request finished");
                return Ok(());
            }
        }
    }

    async fn poll_done(&self, url: &str) -> HardwareResult<()> {
        loop {
            tokio::time::sleep(self.policy.counting_interval).await;
            let status = self.status(url).await?;
            if status.status.as_deref() == Some(STATUS_DONE) {
                info!(url, "daemon reports done");
                return Ok(());
            }
        }
    }

    async fn simulate(&self, url: &str, delay: Duration) -> HardwareResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(HardwareError::Cancelled { url: url.to_string() }),
        }
    }

    /// Bound `wait` by the policy timeout and interrupt it on cancellation.
    async fn supervise<F, T>(&self, url: &str, wait: F) -> HardwareResult<T>
    where
        F: Future<Output = HardwareResult<T>>,
    {
        let bounded = async {
            match self.policy.timeout {
                Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                    HardwareError::Timeout {
                        url: url.to_string(),
                        after: limit,
                    }
                })?,
                None => wait.await,
            }
        };
        tokio::select! {
            result = bounded => result,
            _ = self.cancel.cancelled() => Err(HardwareError::Cancelled { url: url.to_string() }),
        }
    }
}

/// Decode `;`-separated histogram counts. One trailing separator is ignored.
pub fn parse_histogram(url: &str, text: &str) -> HardwareResult<Vec<u64>> {
    let trimmed = text.trim();
    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
    if body.is_empty() {
        return Ok(Vec::new());
    }
    body.split(';')
        .map(|token| {
            token
                .trim()
                .parse::<u64>()
                .map_err(|_| HardwareError::InvalidResponse {
                    url: url.to_string(),
                    message: format!("bad histogram count '{}'", token),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// In-memory daemon: replays queued status documents, repeating the last one.
    #[derive(Default)]
    struct ScriptedDaemon {
        statuses: Mutex<VecDeque<Value>>,
        posted: Mutex<Vec<(String, Value)>>,
        polls: Mutex<usize>,
        text: Mutex<String>,
    }

    impl ScriptedDaemon {
        fn with_statuses(statuses: Vec<Value>) -> Arc<Self> {
            let daemon = Self::default();
            *daemon.statuses.lock() = statuses.into();
            Arc::new(daemon)
        }
    }

    #[async_trait]
    impl DaemonTransport for ScriptedDaemon {
        async fn get_json(&self, _url: &str) -> HardwareResult<Value> {
            *self.polls.lock() += 1;
            let mut statuses = self.statuses.lock();
            if statuses.len() > 1 {
                Ok(statuses.pop_front().unwrap_or(Value::Null))
            } else {
                Ok(statuses.front().cloned().unwrap_or(Value::Null))
            }
        }

        async fn post_json(&self, url: &str, body: &Value) -> HardwareResult<()> {
            self.posted.lock().push((url.to_string(), body.clone()));
            Ok(())
        }

        async fn get_text(&self, _url: &str) -> HardwareResult<String> {
            Ok(self.text.lock().clone())
        }
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            request_interval: Duration::from_millis(200),
            counting_interval: Duration::from_secs(1),
            timeout: None,
        }
    }

    fn status(error: &str, finished: bool, id: Value) -> Value {
        json!({"error": error, "request_finished": finished, "request_id": id})
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_waits_for_matching_request_id() {
        let daemon = ScriptedDaemon::with_statuses(vec![
            status("Success", true, json!("older")),
            status("No error", false, json!("move_1")),
            status("Success", true, json!("move_1")),
        ]);
        let client = DaemonClient::new(daemon.clone()).with_policy(fast_policy());

        client
            .move_motor("http://aml", "move_1", MotorSlot::First, 12.5)
            .await
            .unwrap();

        assert_eq!(*daemon.polls.lock(), 3);
        let posted = daemon.posted.lock();
        assert_eq!(posted.len(), 1);
        assert_eq!(
            posted[0].1,
            json!({"request_id": "move_1", "set_m1_target_position": 12.5})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_numeric_request_id_is_matched_as_string() {
        let daemon = ScriptedDaemon::with_statuses(vec![status("Success", true, json!(42))]);
        let client = DaemonClient::new(daemon).with_policy(fast_policy());
        client.wait_for_request_done("http://aml", "42").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_error_aborts_wait_with_message() {
        let daemon = ScriptedDaemon::with_statuses(vec![
            status("No error", false, json!("old")),
            status("Motor 1 limit switch", false, json!("old")),
        ]);
        let client = DaemonClient::new(daemon).with_policy(fast_policy());

        let err = client
            .send("http://aml", &DaemonRequest::new("r1").with("set_m2_target_position", 1.0))
            .await
            .unwrap_err();
        match err {
            HardwareError::Daemon { url, message } => {
                assert_eq!(url, "http://aml");
                assert_eq!(message, "Motor 1 limit switch");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_wait_never_completes_without_match() {
        let daemon = ScriptedDaemon::with_statuses(vec![status("Success", true, json!("other"))]);
        let client = DaemonClient::new(daemon.clone()).with_policy(fast_policy());

        let pending = tokio::time::timeout(
            Duration::from_secs(3600),
            client.wait_for_request_done("http://aml", "mine"),
        )
        .await;
        assert!(pending.is_err(), "wait must still be pending");
        assert!(*daemon.polls.lock() > 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_times_out() {
        let daemon = ScriptedDaemon::with_statuses(vec![status("Success", false, json!("mine"))]);
        let client = DaemonClient::new(daemon).with_policy(PollPolicy {
            timeout: Some(Duration::from_secs(5)),
            ..fast_policy()
        });

        let err = client
            .wait_for_request_done("http://aml", "mine")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HardwareError::Timeout { after, .. } if after == Duration::from_secs(5)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let daemon = ScriptedDaemon::with_statuses(vec![status("Success", false, json!("x"))]);
        let cancel = CancellationToken::new();
        let client = DaemonClient::new(daemon)
            .with_policy(fast_policy())
            .with_cancellation(cancel.clone());

        let waiter = tokio::spawn(async move { client.wait_for_request_done("http://aml", "x").await });
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, HardwareError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_done_polls_status_field() {
        let daemon = ScriptedDaemon::with_statuses(vec![
            json!({"error": "Success", "status": "Counting"}),
            json!({"error": "Success", "status": "Counting"}),
            json!({"error": "Success", "status": "Done"}),
        ]);
        let client = DaemonClient::new(daemon.clone()).with_policy(fast_policy());

        let started = tokio::time::Instant::now();
        client.wait_for_status_done("http://mpa3").await.unwrap();
        assert_eq!(*daemon.polls.lock(), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_mode_skips_transport() {
        let daemon = ScriptedDaemon::with_statuses(vec![status("Broken", false, json!(""))]);
        let client = DaemonClient::new(daemon.clone()).with_mode(DaemonMode::Simulated {
            delay: Duration::from_millis(200),
        });

        client.stop_acquisition("http://caen", "stop").await.unwrap();
        client.wait_for_status_done("http://caen").await.unwrap();
        let histogram = client.histogram("http://caen", "0", 1).await.unwrap();

        assert_eq!(histogram.len(), SIMULATED_HISTOGRAM_BINS);
        assert!(daemon.posted.lock().is_empty());
        assert_eq!(*daemon.polls.lock(), 0);
    }

    #[tokio::test]
    async fn test_histogram_fetch_parses_text() {
        let daemon = ScriptedDaemon::default();
        *daemon.text.lock() = "3;0;17;".to_string();
        let client = DaemonClient::new(Arc::new(daemon));
        assert_eq!(client.histogram("http://caen", "0", 2).await.unwrap(), vec![3, 0, 17]);
    }

    #[test]
    fn test_parse_histogram_edge_cases() {
        assert_eq!(parse_histogram("u", "").unwrap(), Vec::<u64>::new());
        assert_eq!(parse_histogram("u", "5").unwrap(), vec![5]);
        assert_eq!(parse_histogram("u", "1;2;3").unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            parse_histogram("u", "1;x;3;"),
            Err(HardwareError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_generated_request_ids_are_unique() {
        let a = DaemonRequest::generate("move");
        let b = DaemonRequest::generate("move");
        assert!(a.id().starts_with("move_"));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.to_json()["request_id"], json!(a.id()));
    }

    /// Daemon that accepts connections but never answers.
    struct SilentDaemon;

    #[async_trait]
    impl DaemonTransport for SilentDaemon {
        async fn get_json(&self, _url: &str) -> HardwareResult<Value> {
            std::future::pending().await
        }

        async fn post_json(&self, _url: &str, _body: &Value) -> HardwareResult<()> {
            std::future::pending().await
        }

        async fn get_text(&self, _url: &str) -> HardwareResult<String> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_exchanges_time_out() {
        let client = DaemonClient::new(Arc::new(SilentDaemon)).with_policy(PollPolicy {
            timeout: Some(Duration::from_secs(1)),
            ..fast_policy()
        });

        let send = client
            .send("http://aml", &DaemonRequest::new("r1").with("set_m1_target_position", 1.0))
            .await;
        assert!(matches!(send, Err(HardwareError::Timeout { .. })));

        let post = client.post("http://aml", &DaemonRequest::new("r2").with("abort", true)).await;
        assert!(matches!(post, Err(HardwareError::Timeout { .. })));

        let histogram = client.histogram("http://caen", "0", 1).await;
        assert!(matches!(
            histogram,
            Err(HardwareError::Timeout { url, .. }) if url == "http://caen/histogram/0-1"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_unanswered_post() {
        let cancel = CancellationToken::new();
        let client = DaemonClient::new(Arc::new(SilentDaemon))
            .with_policy(fast_policy())
            .with_cancellation(cancel.clone());

        let poster = tokio::spawn(async move {
            client
                .post("http://aml", &DaemonRequest::new("r1").with("resume", true))
                .await
        });
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!poster.is_finished());
        cancel.cancel();

        let err = poster.await.unwrap().unwrap_err();
        assert!(matches!(err, HardwareError::Cancelled { .. }));
    }
}
