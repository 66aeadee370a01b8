//! Canonical fleet state and its reducers
//!
//! Owned by the event loop and never shared. Every change builds new
//! `Arc<Machine>` values instead of mutating old ones; snapshots are cheap
//! clones of the machine list.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::subscribers::FleetSnapshot;
use super::transport::ConnectionState;
use crate::alerting::{
    AlertConfig, AlertManager, ClassifierConfig, Diagnosis, HysteresisState, StatusClassifier,
    Suppression, Transition,
};
use crate::models::{now_millis, Alert, Machine, SensorReading};

/// What one reading did to its machine
#[derive(Debug, Clone)]
pub struct ReadingOutcome {
    pub machine: Arc<Machine>,
    pub transition: Option<Transition>,
    /// Set only when the reading committed a new CRITICAL status
    pub alert: Option<Result<Alert, Suppression>>,
}

/// What an INIT snapshot did to canonical state
#[derive(Debug, Clone, Default)]
pub struct InitOutcome {
    /// Offline registrations the server now knows about
    pub acknowledged: Vec<String>,
    /// Offline registrations still missing from the server, to forward again
    pub unsynced: Vec<Machine>,
    /// Relayed alerts admitted past dedup
    pub alerts: Vec<Alert>,
    pub suppressed: Vec<(String, Suppression)>,
}

/// Canonical machines and alerts
pub struct FleetState {
    machines: Vec<Arc<Machine>>,
    index: HashMap<String, usize>,
    hysteresis: HashMap<String, HysteresisState>,
    pending: HashSet<String>,
    alerts: AlertManager,
    classifier: StatusClassifier,
    history_cap: usize,
}

impl FleetState {
    pub fn new(classifier: ClassifierConfig, alerts: AlertConfig, history_cap: usize) -> Self {
        Self {
            machines: Vec::new(),
            index: HashMap::new(),
            hysteresis: HashMap::new(),
            pending: HashSet::new(),
            alerts: AlertManager::new(alerts),
            classifier: StatusClassifier::new(classifier),
            history_cap,
        }
    }

    pub fn machines(&self) -> &[Arc<Machine>] {
        &self.machines
    }

    pub fn machine(&self, id: &str) -> Option<&Arc<Machine>> {
        self.index.get(id).map(|&i| &self.machines[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.alerts()
    }

    pub fn pending(&self) -> &HashSet<String> {
        &self.pending
    }

    pub fn hysteresis(&self, id: &str) -> HysteresisState {
        self.hysteresis.get(id).copied().unwrap_or_default()
    }

    /// Load persisted state at startup
    pub fn hydrate(&mut self, machines: Vec<(Machine, bool)>, alerts: Vec<Alert>) {
        self.machines.clear();
        self.index.clear();
        self.hysteresis.clear();
        self.pending.clear();

        for (machine, pending) in machines {
            if pending {
                self.pending.insert(machine.id.clone());
            }
            self.insert(machine);
        }
        self.alerts.hydrate(alerts);
    }

    /// Seed machines when there are none
    pub fn seed(&mut self, machines: Vec<Machine>) -> Vec<Arc<Machine>> {
        if !self.machines.is_empty() {
            return Vec::new();
        }
        machines.into_iter().map(|m| self.insert(m)).collect()
    }

    /// Add an operator-registered machine. `None` if the id is taken.
    pub fn register(&mut self, machine: Machine, pending: bool) -> Option<Arc<Machine>> {
        if self.contains(&machine.id) {
            return None;
        }
        if pending {
            self.pending.insert(machine.id.clone());
        }
        Some(self.insert(machine))
    }

    /// Append a reading to a known machine and run it through the classifier
    ///
    /// Unknown machines are never created from a reading.
    pub fn apply_reading(&mut self, machine_id: &str, reading: SensorReading) -> Option<ReadingOutcome> {
        let &i = self.index.get(machine_id)?;
        let current = &self.machines[i];

        let classification =
            self.classifier
                .evaluate(current.status, self.hysteresis(machine_id), &reading);

        let mut next = current.with_reading(reading, self.history_cap);
        next.status = classification.status;
        let next = Arc::new(next);

        self.machines[i] = Arc::clone(&next);
        self.hysteresis
            .insert(machine_id.to_string(), classification.state);

        let alert = classification
            .transition
            .filter(Transition::is_new_critical)
            .map(|_| {
                let alert = AlertManager::critical_alert(
                    &next,
                    &reading,
                    self.classifier.breaching_sensor(&reading),
                );
                self.alerts.raise_local(alert)
            });

        Some(ReadingOutcome {
            machine: next,
            transition: classification.transition,
            alert,
        })
    }

    /// Merge an authoritative INIT snapshot
    ///
    /// Server metadata replaces local metadata. Machines already known keep
    /// their accumulated history, committed status and hysteresis. Offline
    /// registrations absent from the snapshot are kept when `keep_unsynced`.
    pub fn apply_init(
        &mut self,
        machines: Vec<Machine>,
        alerts: Vec<Alert>,
        keep_unsynced: bool,
    ) -> InitOutcome {
        let mut outcome = InitOutcome::default();
        let previous: HashMap<String, Arc<Machine>> = self
            .machines
            .drain(..)
            .map(|m| (m.id.clone(), m))
            .collect();
        self.index.clear();

        let mut seen = HashSet::new();
        for mut incoming in machines {
            if !seen.insert(incoming.id.clone()) {
                continue;
            }

            if let Some(local) = previous.get(&incoming.id) {
                if !local.history.is_empty() {
                    incoming.history = local.history.clone();
                }
                incoming.status = local.status;
            } else {
                self.hysteresis.remove(&incoming.id);
            }

            if self.pending.remove(&incoming.id) {
                outcome.acknowledged.push(incoming.id.clone());
            }
            self.insert(incoming);
        }

        let mut unsynced: Vec<&Arc<Machine>> = previous
            .values()
            .filter(|m| self.pending.contains(&m.id))
            .collect();
        unsynced.sort_by(|a, b| a.id.cmp(&b.id));

        let unsynced: Vec<Machine> = unsynced.into_iter().map(|m| m.as_ref().clone()).collect();
        if keep_unsynced {
            for machine in &unsynced {
                self.insert_arc(Arc::clone(&previous[&machine.id]));
            }
            outcome.unsynced = unsynced;
        } else {
            self.pending.clear();
        }

        let live: HashSet<&String> = self.index.keys().collect();
        self.hysteresis.retain(|id, _| live.contains(id));

        for alert in alerts {
            let machine_id = alert.machine_id.clone();
            match self.alerts.ingest_relayed(alert) {
                Ok(alert) => outcome.alerts.push(alert),
                Err(reason) => outcome.suppressed.push((machine_id, reason)),
            }
        }

        outcome
    }

    /// Admit an alert relayed from the live source
    pub fn ingest_alert(&mut self, alert: Alert) -> Result<Alert, Suppression> {
        self.alerts.ingest_relayed(alert)
    }

    /// Fold a diagnosis into an existing alert
    pub fn apply_diagnosis(&mut self, alert_id: &str, diagnosis: &Diagnosis) -> Option<Alert> {
        self.alerts.apply_diagnosis(alert_id, diagnosis)
    }

    pub fn snapshot(&self, connection_state: ConnectionState) -> FleetSnapshot {
        FleetSnapshot {
            machines: self.machines.clone(),
            alerts: self.alerts.alerts(),
            connected: connection_state == ConnectionState::Connected,
            connection_state,
            updated_at: now_millis(),
        }
    }

    /// Every machine enters canonical state through here, trimmed to the cap
    fn insert(&mut self, mut machine: Machine) -> Arc<Machine> {
        if machine.history.len() > self.history_cap {
            machine
                .history
                .drain(..machine.history.len() - self.history_cap);
        }
        let machine = Arc::new(machine);
        self.insert_arc(Arc::clone(&machine));
        machine
    }

    fn insert_arc(&mut self, machine: Arc<Machine>) {
        match self.index.get(&machine.id) {
            Some(&i) => self.machines[i] = machine,
            None => {
                self.index.insert(machine.id.clone(), self.machines.len());
                self.machines.push(machine);
            }
        }
    }
}
