//! Mock Hardware Setup
//!
//! Simulated measurement setup for testing the run controller without daemons.
//! All operations use async-safe timing (`tokio::time::sleep`, never
//! `std::thread::sleep`), so tests may run on a paused clock.
//!
//! # Behaviour
//!
//! - Every call is recorded, in order, as a [`SetupCall`].
//! - `abort()` latches the setup the way a real daemon does: every later
//!   operation fails with a daemon error until `resume()` is called.
//! - A single operation kind can be made to fail with [`MockSetup::fail_on`].
//! - [`MockSetup::with_stalled_abort`] makes `abort()` latch and then never
//!   return, like a daemon that drops the connection.
//!
//! # Example
//!
//! ```rust,ignore
//! let setup = MockSetup::new().with_delay(Duration::from_millis(10));
//! setup.move_to(&PositionCoordinates::z(2.0)).await?;
//! assert_eq!(setup.moves(), vec![PositionCoordinates::z(2.0)]);
//! ```

use crate::error::{HardwareError, HardwareResult};
use crate::experiment::recipe::PositionCoordinates;
use crate::hardware::setup::HardwareSetup;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{sleep, Duration};

/// URL reported in errors raised by the mock.
pub const MOCK_URL: &str = "mock://setup";

/// Kinds of setup operations, used for failure injection. One variant per
/// failable [`HardwareSetup`] method.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOp {
    Move,
    WaitForArrival,
    ConfigureAcquisition,
    StartAcquisition,
    WaitForAcquisitionStarted,
    WaitForAcquisitionDone,
    GetHistogram,
}

/// One recorded call, named after the [`HardwareSetup`] method.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum SetupCall {
    Move(PositionCoordinates),
    WaitForArrival,
    ConfigureAcquisition {
        measuring_time_sec: u64,
        file_stem: String,
    },
    StartAcquisition,
    WaitForAcquisitionStarted,
    WaitForAcquisitionDone,
    GetHistogram,
    Abort,
    Resume,
}

/// Recording, failure-injecting [`HardwareSetup`].
pub struct MockSetup {
    calls: Mutex<Vec<SetupCall>>,
    aborted: Mutex<bool>,
    failure: Mutex<Option<(SetupOp, String)>>,
    delay: Duration,
    histogram: Vec<u64>,
    stall_abort: bool,
}

impl MockSetup {
    /// Mock that confirms every call instantly.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            aborted: Mutex::new(false),
            failure: Mutex::new(None),
            delay: Duration::ZERO,
            histogram: vec![0, 4, 9, 4, 0],
            stall_abort: false,
        }
    }

    /// Confirm every operation after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Histogram returned by `get_histogram`.
    pub fn with_histogram(mut self, histogram: Vec<u64>) -> Self {
        self.histogram = histogram;
        self
    }

    /// Make every call of kind `op` fail with `message`.
    pub fn fail_on(&self, op: SetupOp, message: &str) {
        *self.failure.lock() = Some((op, message.to_string()));
    }

    /// Latch on `abort()` but never confirm it.
    pub fn with_stalled_abort(mut self) -> Self {
        self.stall_abort = true;
        self
    }

    /// All calls so far.
    pub fn calls(&self) -> Vec<SetupCall> {
        self.calls.lock().clone()
    }

    /// Positions of all move calls so far.
    pub fn moves(&self) -> Vec<PositionCoordinates> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                SetupCall::Move(position) => Some(position.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded calls equal to `call`.
    pub fn count(&self, call: &SetupCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    /// Whether the mock is latched in the aborted state.
    pub fn is_aborted(&self) -> bool {
        *self.aborted.lock()
    }

    async fn operate(&self, op: SetupOp, call: SetupCall) -> HardwareResult<()> {
        self.calls.lock().push(call);

        if *self.aborted.lock() {
            return Err(HardwareError::Daemon {
                url: MOCK_URL.to_string(),
                message: "Aborted".to_string(),
            });
        }
        if let Some((failing, message)) = self.failure.lock().clone() {
            if failing == op {
                return Err(HardwareError::Daemon {
                    url: MOCK_URL.to_string(),
                    message,
                });
            }
        }

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        Ok(())
    }
}

impl Default for MockSetup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareSetup for MockSetup {
    async fn move_to(&self, position: &PositionCoordinates) -> HardwareResult<()> {
        self.operate(SetupOp::Move, SetupCall::Move(position.clone()))
            .await
    }

    async fn wait_for_arrival(&self) -> HardwareResult<()> {
        self.operate(SetupOp::WaitForArrival, SetupCall::WaitForArrival)
            .await
    }

    async fn configure_acquisition(
        &self,
        measuring_time_sec: u64,
        file_stem: &str,
    ) -> HardwareResult<()> {
        self.operate(
            SetupOp::ConfigureAcquisition,
            SetupCall::ConfigureAcquisition {
                measuring_time_sec,
                file_stem: file_stem.to_string(),
            },
        )
        .await
    }

    async fn start_acquisition(&self) -> HardwareResult<()> {
        self.operate(SetupOp::StartAcquisition, SetupCall::StartAcquisition)
            .await
    }

    async fn wait_for_acquisition_started(&self) -> HardwareResult<()> {
        self.operate(
            SetupOp::WaitForAcquisitionStarted,
            SetupCall::WaitForAcquisitionStarted,
        )
        .await
    }

    async fn wait_for_acquisition_done(&self) -> HardwareResult<()> {
        self.operate(
            SetupOp::WaitForAcquisitionDone,
            SetupCall::WaitForAcquisitionDone,
        )
        .await
    }

    async fn get_histogram(&self) -> HardwareResult<Vec<u64>> {
        self.operate(SetupOp::GetHistogram, SetupCall::GetHistogram)
            .await?;
        Ok(self.histogram.clone())
    }

    async fn abort(&self) -> HardwareResult<()> {
        self.calls.lock().push(SetupCall::Abort);
        *self.aborted.lock() = true;
        if self.stall_abort {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn resume(&self) -> HardwareResult<()> {
        self.calls.lock().push(SetupCall::Resume);
        *self.aborted.lock() = false;
        Ok(())
    }
}
