//! Jobs and recipes.
//!
//! A [`Job`] is what an operator submits: an id (also the on-disk folder name) and
//! an ordered list of [`Recipe`]s. A recipe is one hardware sequence: move to the
//! start position, acquire for `measuring_time_sec` while stepping z over
//! `[z_start, z_end]` by `z_increment`, then store the histogram as `file_stem`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Most z positions a single recipe may visit.
pub const MAX_Z_STEPS: usize = 10_000;

/// Target position of the goniometer. Unset axes are left where they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionCoordinates {
    /// Sample height.
    #[serde(default)]
    pub z: Option<f64>,
    /// Tilt angle in degrees.
    #[serde(default)]
    pub theta: Option<f64>,
}

impl PositionCoordinates {
    /// Position that only moves z.
    pub fn z(z: f64) -> Self {
        Self {
            z: Some(z),
            theta: None,
        }
    }
}

impl fmt::Display for PositionCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn axis(value: Option<f64>) -> String {
            value.map_or_else(|| "None".to_string(), |v| v.to_string())
        }
        write!(f, "position_{}_{}", axis(self.z), axis(self.theta))
    }
}

/// One measurement sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    /// Sample under measurement, shown in the run status.
    pub sample_id: String,
    /// Name of the histogram file inside the job folder.
    pub file_stem: String,
    /// Total acquisition time, spread evenly over the z steps.
    pub measuring_time_sec: u64,
    /// Tilt held for the whole recipe.
    pub theta: f64,
    /// First z step.
    pub z_start: f64,
    /// Last z step, inclusive when the increment divides the span.
    pub z_end: f64,
    /// Distance between z steps.
    pub z_increment: f64,
}

impl Recipe {
    /// Where the recipe starts: `z_start` at the recipe's theta.
    pub fn start_position(&self) -> PositionCoordinates {
        PositionCoordinates {
            z: Some(self.z_start),
            theta: Some(self.theta),
        }
    }

    /// Ordered z positions visited during the acquisition.
    pub fn z_steps(&self) -> Vec<f64> {
        z_range(self.z_start, self.z_end, self.z_increment)
    }

    /// Time spent at each z position.
    pub fn wait_per_step(&self) -> Result<Duration, String> {
        let steps = self.z_steps().len().max(1);
        Duration::try_from_secs_f64(self.measuring_time_sec as f64 / steps as f64).map_err(|_| {
            format!(
                "recipe '{}': measuring_time_sec {} is out of range",
                self.sample_id, self.measuring_time_sec
            )
        })
    }

    /// Reject recipes the hardware sequence cannot execute.
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_id.trim().is_empty() {
            return Err("sample_id cannot be empty".to_string());
        }
        if self.file_stem.trim().is_empty() {
            return Err(format!("recipe '{}': file_stem cannot be empty", self.sample_id));
        }
        check_file_name("file_stem", &self.file_stem)
            .map_err(|e| format!("recipe '{}': {}", self.sample_id, e))?;
        if self.measuring_time_sec == 0 {
            return Err(format!(
                "recipe '{}': measuring_time_sec must be positive",
                self.sample_id
            ));
        }
        let values = [self.z_start, self.z_end, self.z_increment, self.theta];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(format!("recipe '{}': coordinates must be finite", self.sample_id));
        }
        if self.z_increment <= 0.0 {
            return Err(format!(
                "recipe '{}': z_increment must be positive",
                self.sample_id
            ));
        }
        if self.z_end < self.z_start {
            return Err(format!(
                "recipe '{}': z_end must be larger than or equal to z_start",
                self.sample_id
            ));
        }
        if step_count(self.z_start, self.z_end, self.z_increment) > MAX_Z_STEPS as f64 {
            return Err(format!(
                "recipe '{}': more than {} z steps",
                self.sample_id, MAX_Z_STEPS
            ));
        }
        self.wait_per_step()?;
        Ok(())
    }
}

/// Operator-submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Opaque id, used as the job's data folder name.
    pub id: String,
    /// Recipes, run in order.
    pub recipes: Vec<Recipe>,
}

impl Job {
    /// Create a job.
    pub fn new(id: impl Into<String>, recipes: Vec<Recipe>) -> Self {
        Self {
            id: id.into(),
            recipes,
        }
    }

    /// Reject jobs with no id, no recipes or an invalid recipe.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("job id cannot be empty".to_string());
        }
        check_file_name("job id", &self.id)?;
        if self.recipes.is_empty() {
            return Err(format!("job '{}' has no recipes", self.id));
        }
        for recipe in &self.recipes {
            recipe
                .validate()
                .map_err(|e| format!("job '{}': {}", self.id, e))?;
        }
        Ok(())
    }
}

/// Evenly spaced steps from `start` while below `end + increment`, rounded to 2 decimals.
///
/// The end point is included when the increment divides the span. Otherwise the
/// last step lands past `end` (by less than one increment). The result always
/// holds at least `start`.
pub fn z_range(start: f64, end: f64, increment: f64) -> Vec<f64> {
    let well_formed = increment > 0.0 && end >= start;
    if !well_formed {
        return vec![round2(start)];
    }
    let count = step_count(start, end, increment).min(MAX_Z_STEPS as f64) as usize;
    (0..count)
        .map(|i| round2(start + i as f64 * increment))
        .collect()
}

/// Number of steps `z_range` produces before clamping; NaN spans count as one.
fn step_count(start: f64, end: f64, increment: f64) -> f64 {
    let stop = end + increment;
    ((stop - start) / increment).ceil().max(1.0)
}

/// Ids and stems become path components below the data directory.
fn check_file_name(what: &str, value: &str) -> Result<(), String> {
    let escapes = value == "." || value == ".." || value.contains(['/', '\\', '\0']);
    if escapes {
        return Err(format!("{} '{}' must be a plain file name", what, value));
    }
    Ok(())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
