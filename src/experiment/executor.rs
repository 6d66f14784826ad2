//! Recipe execution.
//!
//! [`run_recipe`] drives one recipe through the measurement sequence:
//!
//! 1. move to `(z_start, theta)` and wait for arrival
//! 2. configure and start the acquisition, wait until it runs
//! 3. visit every z step, dwelling `measuring_time_sec / steps` at each
//! 4. wait for the acquisition to finish, fetch and persist the histogram
//!
//! A recipe that fails validation is refused before any hardware call. The first
//! failing step ends the recipe and its error is returned as a value.
//! [`spawn_recipe`] runs the sequence on its own task so the supervising loop keeps
//! ticking (and can forward an abort) while hardware waits are in flight.

use crate::data::storage::DataSerializer;
use crate::error::RunError;
use crate::experiment::recipe::{PositionCoordinates, Recipe};
use crate::hardware::setup::HardwareSetup;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Run `recipe` to completion on the current task.
pub async fn run_recipe(
    recipe: &Recipe,
    setup: &dyn HardwareSetup,
    serializer: &dyn DataSerializer,
) -> Result<(), RunError> {
    recipe.validate().map_err(RunError::InvalidRecipe)?;
    info!(sample_id = %recipe.sample_id, file_stem = %recipe.file_stem, "recipe started");

    setup.move_to(&recipe.start_position()).await?;
    setup.wait_for_arrival().await?;

    setup
        .configure_acquisition(recipe.measuring_time_sec, &recipe.file_stem)
        .await?;
    setup.start_acquisition().await?;
    setup.wait_for_acquisition_started().await?;

    let steps = recipe.z_steps();
    let dwell = recipe.wait_per_step().map_err(RunError::InvalidRecipe)?;
    debug!(
        sample_id = %recipe.sample_id,
        steps = steps.len(),
        dwell_ms = dwell.as_millis() as u64,
        "scanning z"
    );
    for z in steps {
        setup.move_to(&PositionCoordinates::z(z)).await?;
        setup.wait_for_arrival().await?;
        tokio::time::sleep(dwell).await;
    }

    setup.wait_for_acquisition_done().await?;
    let histogram = setup.get_histogram().await?;
    serializer
        .save_histogram(&histogram, &recipe.file_stem)
        .await?;

    info!(sample_id = %recipe.sample_id, bins = histogram.len(), "recipe finished");
    Ok(())
}

/// Run `recipe` on a new task.
pub fn spawn_recipe(
    recipe: Recipe,
    setup: Arc<dyn HardwareSetup>,
    serializer: Arc<dyn DataSerializer>,
) -> JoinHandle<Result<(), RunError>> {
    tokio::spawn(async move { run_recipe(&recipe, setup.as_ref(), serializer.as_ref()).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::MemorySerializer;
    use crate::hardware::mock::{MockSetup, SetupCall, SetupOp};
    use std::time::Duration;
    use tokio::time::Instant;

    fn recipe() -> Recipe {
        Recipe {
            sample_id: "AE007607".into(),
            file_stem: "AE007607_D01_A".into(),
            measuring_time_sec: 30,
            theta: 70.0,
            z_start: 0.0,
            z_end: 4.0,
            z_increment: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sequence_in_order() {
        let setup = MockSetup::new().with_histogram(vec![1, 2, 3]);
        let serializer = MemorySerializer::new();
        serializer.set_base_folder("rqm_1").await.unwrap();

        let start = Instant::now();
        run_recipe(&recipe(), &setup, &serializer).await.unwrap();

        assert_eq!(
            setup.calls(),
            vec![
                SetupCall::Move(PositionCoordinates {
                    z: Some(0.0),
                    theta: Some(70.0)
                }),
                SetupCall::WaitForArrival,
                SetupCall::ConfigureAcquisition {
                    measuring_time_sec: 30,
                    file_stem: "AE007607_D01_A".into()
                },
                SetupCall::StartAcquisition,
                SetupCall::WaitForAcquisitionStarted,
                SetupCall::Move(PositionCoordinates::z(0.0)),
                SetupCall::WaitForArrival,
                SetupCall::Move(PositionCoordinates::z(2.0)),
                SetupCall::WaitForArrival,
                SetupCall::Move(PositionCoordinates::z(4.0)),
                SetupCall::WaitForArrival,
                SetupCall::WaitForAcquisitionDone,
                SetupCall::GetHistogram,
            ]
        );
        // Three steps of ten seconds each.
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(
            serializer.histogram("rqm_1", "AE007607_D01_A"),
            Some(vec![1, 2, 3])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_short_circuits_remaining_steps() {
        let setup = MockSetup::new();
        setup.fail_on(SetupOp::StartAcquisition, "Acquisition card offline");
        let serializer = MemorySerializer::new();

        let err = run_recipe(&recipe(), &setup, &serializer)
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Hardware(_)));
        assert!(err.to_string().contains("Acquisition card offline"));
        assert_eq!(setup.count(&SetupCall::GetHistogram), 0);
        assert_eq!(setup.moves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexecutable_recipe_is_refused_before_hardware() {
        let setup = Arc::new(MockSetup::new());
        let serializer = Arc::new(MemorySerializer::new());

        let mut tiny_steps = recipe();
        tiny_steps.z_increment = 1e-300;
        let mut endless = recipe();
        endless.z_end = endless.z_start;
        endless.measuring_time_sec = u64::MAX;

        for bad in [tiny_steps, endless] {
            let err = spawn_recipe(bad, setup.clone(), serializer.clone())
                .await
                .expect("recipe task panicked")
                .unwrap_err();
            assert!(matches!(err, RunError::InvalidRecipe(_)));
        }
        assert!(setup.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_is_returned() {
        let setup = MockSetup::new();
        let serializer = MemorySerializer::new();
        serializer.fail_histograms("disk full");

        let err = spawn_recipe(recipe(), Arc::new(setup), Arc::new(serializer))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RunError::Serialization(_)));
    }
}
