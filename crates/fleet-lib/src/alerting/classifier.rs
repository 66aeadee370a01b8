//! Machine status classification with hysteresis
//!
//! A reading proposes a candidate status from instantaneous thresholds. The
//! committed status only moves once the same different candidate has been
//! proposed for `required_consecutive` ticks in a row.

use crate::models::{MachineStatus, SensorReading};

/// Consecutive ticks needed before a status change is committed
const DEFAULT_REQUIRED_CONSECUTIVE: u32 = 3;

/// Instantaneous status thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub temperature_critical: f64,
    pub vibration_critical: f64,
    pub temperature_warning: f64,
    pub vibration_warning: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature_critical: 85.0,
            vibration_critical: 7.0,
            temperature_warning: 75.0,
            vibration_warning: 5.0,
        }
    }
}

/// Classifier configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierConfig {
    pub thresholds: Thresholds,
    pub required_consecutive: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            required_consecutive: DEFAULT_REQUIRED_CONSECUTIVE,
        }
    }
}

/// Per-machine streak of proposals that differ from the committed status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HysteresisState {
    pub proposed: Option<MachineStatus>,
    pub count: u32,
}

/// A committed status change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: MachineStatus,
    pub to: MachineStatus,
}

impl Transition {
    /// Entering CRITICAL from anything else; the only alerting transition
    pub fn is_new_critical(&self) -> bool {
        self.to == MachineStatus::Critical && self.from != MachineStatus::Critical
    }
}

/// Result of evaluating one reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub candidate: MachineStatus,
    pub status: MachineStatus,
    pub state: HysteresisState,
    pub transition: Option<Transition>,
}

/// Pure status classifier
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusClassifier {
    config: ClassifierConfig,
}

impl StatusClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Instantaneous candidate status for a reading
    pub fn candidate(&self, reading: &SensorReading) -> MachineStatus {
        let t = &self.config.thresholds;
        if reading.temperature > t.temperature_critical || reading.vibration > t.vibration_critical
        {
            MachineStatus::Critical
        } else if reading.temperature > t.temperature_warning
            || reading.vibration > t.vibration_warning
        {
            MachineStatus::Warning
        } else {
            MachineStatus::Normal
        }
    }

    /// Feed one reading through the hysteresis rule
    pub fn evaluate(
        &self,
        committed: MachineStatus,
        state: HysteresisState,
        reading: &SensorReading,
    ) -> Classification {
        let candidate = self.candidate(reading);

        if candidate == committed {
            return Classification {
                candidate,
                status: committed,
                state: HysteresisState::default(),
                transition: None,
            };
        }

        let count = if state.proposed == Some(candidate) {
            state.count + 1
        } else {
            1
        };

        if count >= self.config.required_consecutive.max(1) {
            Classification {
                candidate,
                status: candidate,
                state: HysteresisState::default(),
                transition: Some(Transition {
                    from: committed,
                    to: candidate,
                }),
            }
        } else {
            Classification {
                candidate,
                status: committed,
                state: HysteresisState {
                    proposed: Some(candidate),
                    count,
                },
                transition: None,
            }
        }
    }

    /// Which sensor drove a reading over the critical line, with its value
    pub fn breaching_sensor(&self, reading: &SensorReading) -> Option<(&'static str, f64)> {
        let t = &self.config.thresholds;
        if reading.temperature > t.temperature_critical {
            Some(("temperature", reading.temperature))
        } else if reading.vibration > t.vibration_critical {
            Some(("vibration", reading.vibration))
        } else if reading.temperature > t.temperature_warning {
            Some(("temperature", reading.temperature))
        } else if reading.vibration > t.vibration_warning {
            Some(("vibration", reading.vibration))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp(t: f64) -> SensorReading {
        SensorReading {
            timestamp: 0,
            vibration: 2.0,
            temperature: t,
            noise: 70.0,
            rpm: 1500.0,
            power_usage: 10.0,
        }
    }

    fn run(classifier: &StatusClassifier, temps: &[f64]) -> Vec<Classification> {
        let mut status = MachineStatus::Normal;
        let mut state = HysteresisState::default();
        temps
            .iter()
            .map(|t| {
                let c = classifier.evaluate(status, state, &temp(*t));
                status = c.status;
                state = c.state;
                c
            })
            .collect()
    }

    #[test]
    fn test_candidate_thresholds() {
        let c = StatusClassifier::default();
        assert_eq!(c.candidate(&temp(70.0)), MachineStatus::Normal);
        assert_eq!(c.candidate(&temp(80.0)), MachineStatus::Warning);
        assert_eq!(c.candidate(&temp(90.0)), MachineStatus::Critical);

        let shaky = SensorReading {
            vibration: 7.5,
            ..temp(50.0)
        };
        assert_eq!(c.candidate(&shaky), MachineStatus::Critical);
    }

    #[test]
    fn test_commits_after_three_ticks() {
        let c = StatusClassifier::default();
        let results = run(&c, &[70.0, 90.0, 92.0, 91.0]);

        assert_eq!(results[1].status, MachineStatus::Normal);
        assert_eq!(results[1].state.count, 1);
        assert_eq!(results[2].status, MachineStatus::Normal);
        assert_eq!(results[2].state.count, 2);
        assert_eq!(results[3].status, MachineStatus::Critical);
        assert!(results[3].transition.unwrap().is_new_critical());
    }

    #[test]
    fn test_single_spike_does_not_flap() {
        let c = StatusClassifier::default();
        let results = run(&c, &[90.0, 60.0, 60.0, 60.0]);

        assert!(results.iter().all(|r| r.status == MachineStatus::Normal));
        assert!(results.iter().all(|r| r.transition.is_none()));
        assert_eq!(results[1].state, HysteresisState::default());
    }

    #[test]
    fn test_streak_resets_when_proposal_changes() {
        let c = StatusClassifier::default();
        // critical, critical, warning: the warning starts a fresh streak
        let results = run(&c, &[90.0, 90.0, 80.0, 80.0]);

        assert_eq!(results[2].state.proposed, Some(MachineStatus::Warning));
        assert_eq!(results[2].state.count, 1);
        assert_eq!(results[3].status, MachineStatus::Normal);
    }

    #[test]
    fn test_repeated_critical_transitions_once() {
        let c = StatusClassifier::default();
        let results = run(&c, &[90.0; 10]);
        let transitions = results.iter().filter(|r| r.transition.is_some()).count();

        assert_eq!(transitions, 1);
        assert_eq!(results[9].status, MachineStatus::Critical);
    }

    #[test]
    fn test_breaching_sensor() {
        let c = StatusClassifier::default();
        assert_eq!(c.breaching_sensor(&temp(90.0)), Some(("temperature", 90.0)));
        assert_eq!(c.breaching_sensor(&temp(20.0)), None);
    }
}
