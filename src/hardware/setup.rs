//! Measurement setup capability and the ERD implementation.
//!
//! [`HardwareSetup`] is everything the run controller needs from the instruments:
//! positioning, an acquisition lifecycle, and the operator abort/resume pair. The
//! controller never drives daemons directly.

use crate::config::{AcquisitionRoute, AxisRoute, HardwareConfig, MotorSlot};
use crate::error::{HardwareError, HardwareResult};
use crate::experiment::recipe::PositionCoordinates;
use crate::hardware::daemon::{new_request_id, DaemonClient, DaemonRequest};
use async_trait::async_trait;
use tracing::{info, warn};

/// Instrument operations used by the recipe executor.
///
/// Every method blocks (asynchronously) until the hardware confirms the step.
#[async_trait]
pub trait HardwareSetup: Send + Sync {
    /// Move the axes that are set in `position`.
    async fn move_to(&self, position: &PositionCoordinates) -> HardwareResult<()>;

    /// Wait until the last move has arrived.
    async fn wait_for_arrival(&self) -> HardwareResult<()>;

    /// Prepare an acquisition of `measuring_time_sec` seconds stored under `file_stem`.
    async fn configure_acquisition(
        &self,
        measuring_time_sec: u64,
        file_stem: &str,
    ) -> HardwareResult<()>;

    /// Start the configured acquisition.
    async fn start_acquisition(&self) -> HardwareResult<()>;

    /// Wait until the acquisition reports it is running.
    async fn wait_for_acquisition_started(&self) -> HardwareResult<()>;

    /// Wait until the acquisition finished on its own.
    async fn wait_for_acquisition_done(&self) -> HardwareResult<()>;

    /// Fetch the acquired histogram.
    async fn get_histogram(&self) -> HardwareResult<Vec<u64>>;

    /// Ask every daemon to stop what it is doing.
    async fn abort(&self) -> HardwareResult<()>;

    /// Release the aborted state so new requests are accepted again.
    async fn resume(&self) -> HardwareResult<()>;
}

/// Elastic recoil detection setup: a z/theta goniometer and one acquisition daemon.
pub struct ErdSetup {
    client: DaemonClient,
    z: AxisRoute,
    theta: AxisRoute,
    acquisition: AcquisitionRoute,
}

impl ErdSetup {
    /// Create a setup from explicit routes.
    pub fn new(
        client: DaemonClient,
        z: AxisRoute,
        theta: AxisRoute,
        acquisition: AcquisitionRoute,
    ) -> Self {
        Self {
            client,
            z,
            theta,
            acquisition,
        }
    }

    /// Create a setup from the `[hardware]` section.
    pub fn from_config(client: DaemonClient, config: &HardwareConfig) -> Self {
        Self::new(
            client,
            config.z.clone(),
            config.theta.clone(),
            config.acquisition.clone(),
        )
    }

    /// Distinct daemon URLs of this setup, in declaration order.
    fn daemon_urls(&self) -> Vec<&str> {
        let mut urls: Vec<&str> = Vec::new();
        for url in [
            self.z.url.as_str(),
            self.theta.url.as_str(),
            self.acquisition.url.as_str(),
        ] {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        urls
    }

    /// Post `flag = true` to every daemon; all are attempted, the first error wins.
    async fn broadcast_flag(&self, flag: &str) -> HardwareResult<()> {
        let mut first_error: Option<HardwareError> = None;
        for url in self.daemon_urls() {
            let request = DaemonRequest::generate(flag).with(flag, true);
            if let Err(e) = self.client.post(url, &request).await {
                warn!(url, error = %e, "failed to post '{}'", flag);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HardwareSetup for ErdSetup {
    async fn move_to(&self, position: &PositionCoordinates) -> HardwareResult<()> {
        info!(position = %position, "moving ERD setup");
        if let (Some(z), Some(theta)) = (position.z, position.theta) {
            let shared_controller =
                self.z.url == self.theta.url && self.z.motor != self.theta.motor;
            if shared_controller {
                let (first, second) = match self.z.motor {
                    MotorSlot::First => (z, theta),
                    MotorSlot::Second => (theta, z),
                };
                let id = new_request_id("move_z_theta");
                return self
                    .client
                    .move_both_motors(&self.z.url, &id, first, second)
                    .await;
            }
        }
        if let Some(z) = position.z {
            let id = new_request_id("move_z");
            self.client
                .move_motor(&self.z.url, &id, self.z.motor, z)
                .await?;
        }
        if let Some(theta) = position.theta {
            let id = new_request_id("move_theta");
            self.client
                .move_motor(&self.theta.url, &id, self.theta.motor, theta)
                .await?;
        }
        Ok(())
    }

    async fn wait_for_arrival(&self) -> HardwareResult<()> {
        // Move requests only finish once the motor is in position.
        Ok(())
    }

    async fn configure_acquisition(
        &self,
        measuring_time_sec: u64,
        file_stem: &str,
    ) -> HardwareResult<()> {
        self.client
            .stop_acquisition(&self.acquisition.url, &new_request_id("stop"))
            .await?;
        let request = DaemonRequest::generate("configure")
            .with("clear", true)
            .with("set_measuring_time_sec", measuring_time_sec)
            .with("set_file_stem", file_stem);
        self.client.send(&self.acquisition.url, &request).await
    }

    async fn start_acquisition(&self) -> HardwareResult<()> {
        let request = DaemonRequest::generate("start").with("start_acquisition", true);
        self.client.send(&self.acquisition.url, &request).await
    }

    async fn wait_for_acquisition_started(&self) -> HardwareResult<()> {
        // The start request is only confirmed once the acquisition runs.
        Ok(())
    }

    async fn wait_for_acquisition_done(&self) -> HardwareResult<()> {
        self.client.wait_for_status_done(&self.acquisition.url).await
    }

    async fn get_histogram(&self) -> HardwareResult<Vec<u64>> {
        self.client
            .histogram(
                &self.acquisition.url,
                &self.acquisition.board,
                self.acquisition.channel,
            )
            .await
    }

    async fn abort(&self) -> HardwareResult<()> {
        warn!("aborting ERD setup");
        self.broadcast_flag("abort").await
    }

    async fn resume(&self) -> HardwareResult<()> {
        info!("resuming ERD setup");
        self.broadcast_flag("resume").await
    }
}
