//! Serializable action descriptors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire value for "no expected duration" in seconds-based encodings.
pub const NO_EXPECTED_DURATION: f64 = -1.0;

/// Human-readable description of an action plus an optional time estimate.
///
/// The info is owned by its action. Setters exist for building and for leaves
/// that refine their own estimate while running; an [`ActionTree`](crate::action::ActionTree)
/// only hands out mutable access to the info of actions that have not started.
///
/// # Example
///
/// ```rust
/// use daq_actions::action::ActionInfo;
/// use std::time::Duration;
///
/// let info = ActionInfo::new("Move sample stage X to 12.5 mm")
///     .with_short_description("Stage X")
///     .with_expected_duration(Duration::from_secs(3));
/// assert_eq!(info.short_description(), "Stage X");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInfo {
    description: String,
    short_description: String,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    expected_duration: Option<Duration>,
}

impl ActionInfo {
    /// Create an info; the short description starts out equal to the description.
    pub fn new(description: impl Into<String>) -> Self {
        let description = description.into();
        Self {
            short_description: description.clone(),
            description,
            expected_duration: None,
        }
    }

    /// Set the short description used in step-by-step status text.
    pub fn with_short_description(mut self, short: impl Into<String>) -> Self {
        self.short_description = short.into();
        self
    }

    /// Set the expected duration.
    pub fn with_expected_duration(mut self, duration: Duration) -> Self {
        self.expected_duration = Some(duration);
        self
    }

    /// Full description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Short description.
    pub fn short_description(&self) -> &str {
        &self.short_description
    }

    /// Expected duration, if the author supplied one.
    pub fn expected_duration(&self) -> Option<Duration> {
        self.expected_duration
    }

    /// Expected duration in seconds, or [`NO_EXPECTED_DURATION`].
    pub fn expected_duration_secs(&self) -> f64 {
        self.expected_duration
            .map(|d| d.as_secs_f64())
            .unwrap_or(NO_EXPECTED_DURATION)
    }

    /// Replace the description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    /// Replace the short description.
    pub fn set_short_description(&mut self, short: impl Into<String>) {
        self.short_description = short.into();
    }

    /// Replace the expected duration.
    pub fn set_expected_duration(&mut self, duration: Option<Duration>) {
        self.expected_duration = duration;
    }
}
