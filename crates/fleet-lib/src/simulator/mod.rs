//! Fallback telemetry simulation
//!
//! When no live source is connected the pipeline keeps producing data from a
//! deterministic generator: every reading is a function of the machine's
//! committed status, its id and the wall clock. Two simulators looking at the
//! same clock produce the same numbers, which keeps tests reproducible and
//! lets several clients agree while offline.
//!
//! Each machine carries a slow periodic stress wave. Near the crest a healthy
//! machine heats past the warning and critical lines; once its committed
//! status has moved up, the status baseline is still below the critical line,
//! so it drifts back down through the hysteresis rule on its own.

mod ticker;

pub use ticker::{SimulatorTick, SimulatorTicker};

use crate::models::{Machine, MachineStatus, SensorReading};
use std::f64::consts::TAU;
use std::time::Duration;

/// Default tick period (2 seconds)
const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(2);

/// Configuration for the fallback simulator
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Interval between generated ticks
    pub tick_period: Duration,
    /// Shortest stress-wave period; machines spread over five steps above it
    pub base_stress_period: Duration,
    /// Seed the default fleet when no machines are known
    pub seed_default_fleet: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_period: DEFAULT_TICK_PERIOD,
            base_stress_period: Duration::from_secs(240),
            seed_default_fleet: true,
        }
    }
}

/// Status-dependent operating point
#[derive(Debug, Clone, Copy)]
struct Baseline {
    temperature: f64,
    vibration: f64,
    noise: f64,
    rpm: f64,
    power_usage: f64,
}

fn baseline(status: MachineStatus) -> Option<Baseline> {
    match status {
        MachineStatus::Normal => Some(Baseline {
            temperature: 62.0,
            vibration: 2.2,
            noise: 72.0,
            rpm: 1500.0,
            power_usage: 45.0,
        }),
        MachineStatus::Warning => Some(Baseline {
            temperature: 70.0,
            vibration: 3.2,
            noise: 79.0,
            rpm: 1440.0,
            power_usage: 50.0,
        }),
        MachineStatus::Critical => Some(Baseline {
            temperature: 78.0,
            vibration: 4.0,
            noise: 86.0,
            rpm: 1380.0,
            power_usage: 56.0,
        }),
        MachineStatus::Offline => None,
    }
}

/// Deterministic telemetry generator
#[derive(Debug, Clone, Default)]
pub struct FallbackSimulator {
    config: SimulatorConfig,
}

impl FallbackSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Reading for one machine at `now_ms`; `None` for offline machines
    pub fn generate(
        &self,
        machine_id: &str,
        status: MachineStatus,
        now_ms: i64,
    ) -> Option<SensorReading> {
        let base = baseline(status)?;
        let hash = stable_hash(machine_id);
        let phase = (hash % 3600) as f64 / 3600.0 * TAU;
        let period =
            self.config.base_stress_period.as_secs_f64().max(1.0) * (1.0 + (hash % 5) as f64 * 0.25);

        let t = now_ms as f64 / 1000.0;
        let wave = (TAU * t / period + phase).sin().max(0.0);
        let stress = wave.powi(8);
        let ripple = (t / 7.0 + phase).sin();
        let slow = (t / 31.0 + 2.0 * phase).sin();

        Some(SensorReading {
            timestamp: now_ms,
            temperature: round2(base.temperature + 26.0 * stress + 1.5 * slow + 0.6 * ripple),
            vibration: round2((base.vibration + 3.0 * stress + 0.3 * ripple).max(0.0)),
            noise: round2(base.noise + 10.0 * stress + 2.0 * ripple),
            rpm: round2(base.rpm - 120.0 * stress + 15.0 * slow),
            power_usage: round2(base.power_usage + 12.0 * stress + 1.2 * slow),
        })
    }

    /// Readings for every machine that is not offline
    pub fn tick<'a, I>(&self, machines: I, now_ms: i64) -> Vec<(String, SensorReading)>
    where
        I: IntoIterator<Item = &'a Machine>,
    {
        machines
            .into_iter()
            .filter_map(|m| {
                self.generate(&m.id, m.status, now_ms)
                    .map(|r| (m.id.clone(), r))
            })
            .collect()
    }

    /// Fleet used when the simulator starts with nothing to simulate
    pub fn default_fleet() -> Vec<Machine> {
        vec![
            Machine::new("sim-press-01", "Hydraulic Press 01", "Hydraulic Press", "Assembly Line A"),
            Machine::new("sim-cnc-02", "CNC Mill 02", "CNC Mill", "Machining Hall"),
            Machine::new("sim-conveyor-03", "Conveyor 03", "Conveyor", "Packaging"),
            Machine::new("sim-robot-04", "Welding Robot 04", "Robotic Arm", "Assembly Line B"),
        ]
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// FNV-1a; stable across processes, unlike the std hasher
fn stable_hash(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{HysteresisState, StatusClassifier};

    #[test]
    fn test_generation_is_deterministic() {
        let a = FallbackSimulator::default();
        let b = FallbackSimulator::default();

        for t in [0i64, 1_000, 123_456_789, 1_700_000_000_000] {
            assert_eq!(
                a.generate("m1", MachineStatus::Normal, t),
                b.generate("m1", MachineStatus::Normal, t)
            );
        }
    }

    #[test]
    fn test_machines_are_out_of_phase() {
        let sim = FallbackSimulator::default();
        let t = 1_700_000_000_000;
        assert_ne!(
            sim.generate("sim-press-01", MachineStatus::Normal, t),
            sim.generate("sim-cnc-02", MachineStatus::Normal, t)
        );
    }

    #[test]
    fn test_offline_machines_are_skipped() {
        let sim = FallbackSimulator::default();
        let mut offline = Machine::new("m2", "Idle", "Lathe", "Bay 2");
        offline.status = MachineStatus::Offline;
        let machines = vec![Machine::new("m1", "Press", "Press", "Bay 1"), offline];

        let readings = sim.tick(&machines, 10_000);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].0, "m1");
    }

    #[test]
    fn test_readings_are_finite() {
        let sim = FallbackSimulator::default();
        for step in 0..500 {
            let r = sim
                .generate("m1", MachineStatus::Critical, step * 2_000)
                .unwrap();
            assert!(r.temperature.is_finite() && r.vibration >= 0.0);
        }
    }

    #[test]
    fn test_simulated_machine_escalates_and_recovers() {
        let sim = FallbackSimulator::new(SimulatorConfig {
            base_stress_period: Duration::from_secs(120),
            ..Default::default()
        });
        let classifier = StatusClassifier::default();

        let mut status = MachineStatus::Normal;
        let mut state = HysteresisState::default();
        let mut seen_critical = false;
        let mut recovered = false;

        // two hours of 2s ticks covers many stress periods
        for step in 0..3_600i64 {
            let reading = sim.generate("sim-press-01", status, step * 2_000).unwrap();
            let c = classifier.evaluate(status, state, &reading);
            status = c.status;
            state = c.state;
            if status == MachineStatus::Critical {
                seen_critical = true;
            }
            if seen_critical && status == MachineStatus::Normal {
                recovered = true;
            }
        }

        assert!(seen_critical);
        assert!(recovered);
    }

    #[test]
    fn test_default_fleet_ids_unique() {
        let fleet = FallbackSimulator::default_fleet();
        let mut ids: Vec<&str> = fleet.iter().map(|m| m.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), fleet.len());
    }
}
