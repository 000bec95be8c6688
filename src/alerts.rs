/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The alert bus: conditions a user should know about, raised and withdrawn by subsystems as they
//! come and go.
//!
//! Each subsystem (renter, contractor, host DB, workers) owns one [`Alerter`] labelled with its module
//! name. Registering an alert under an [`AlertID`] that is already registered replaces the old alert,
//! so a subsystem can re-raise the same condition on every loop iteration without flooding the bus.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::events::{Event, EventPublisher, RegisterAlertEvent, UnregisterAlertEvent};
use crate::types::crypto_primitives::hash_bytes;

/// How urgently a user should act on an alert.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AlertSeverity {
    /// Something may go wrong soon unless the user acts.
    Warning,
    /// Something went wrong and the renter is working around it.
    Error,
    /// Something went wrong that the renter cannot work around.
    Critical,
}

impl Display for AlertSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Warning => f.write_str("warning"),
            AlertSeverity::Error => f.write_str("error"),
            AlertSeverity::Critical => f.write_str("critical"),
        }
    }
}

/// Stable identifier of an alert condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AlertID([u8; 32]);

impl AlertID {
    /// Derive an ID from a name, e.g. `"contractor-low-funds"`.
    pub fn from_name(name: &str) -> AlertID {
        AlertID(hash_bytes(name.as_bytes()).bytes())
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub module: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub cause: String,
}

/// Alerts raised by one module.
pub struct Alerter {
    module: String,
    alerts: Mutex<BTreeMap<AlertID, Alert>>,
    event_publisher: EventPublisher,
}

impl Alerter {
    pub fn new(module: &str, event_publisher: EventPublisher) -> Alerter {
        Alerter {
            module: module.to_string(),
            alerts: Mutex::new(BTreeMap::new()),
            event_publisher,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Raise (or replace) the alert `id`.
    pub fn register_alert(&self, id: AlertID, message: impl Into<String>, cause: impl Into<String>, severity: AlertSeverity) {
        let alert = Alert {
            module: self.module.clone(),
            severity,
            message: message.into(),
            cause: cause.into(),
        };
        let is_new = {
            let mut alerts = self.lock();
            match alerts.insert(id, alert.clone()) {
                Some(previous) => previous != alert,
                None => true,
            }
        };
        if is_new {
            Event::publish(
                &self.event_publisher,
                Event::RegisterAlert(RegisterAlertEvent {
                    timestamp: SystemTime::now(),
                    id,
                    module: alert.module,
                    severity: alert.severity,
                    message: alert.message,
                }),
            );
        }
    }

    /// Withdraw the alert `id`. Withdrawing an alert that is not registered is a no-op.
    pub fn unregister_alert(&self, id: AlertID) {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            Event::publish(
                &self.event_publisher,
                Event::UnregisterAlert(UnregisterAlertEvent {
                    timestamp: SystemTime::now(),
                    id,
                }),
            );
        }
    }

    /// Every alert currently registered by this module.
    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<AlertID, Alert>> {
        // An alerter holds no invariants that a panicking holder could break.
        self.alerts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Merge the alerts of several modules, most severe first.
pub fn merge_alerts<'a>(alerters: impl IntoIterator<Item = &'a Alerter>) -> Vec<Alert> {
    let mut all: Vec<Alert> = alerters.into_iter().flat_map(|alerter| alerter.alerts()).collect();
    all.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.module.cmp(&b.module)));
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_twice_replaces_and_unregister_withdraws() {
        let alerter = Alerter::new("contractor", None);
        let id = AlertID::from_name("low-funds");
        alerter.register_alert(id, "funds low", "", AlertSeverity::Warning);
        alerter.register_alert(id, "funds very low", "", AlertSeverity::Error);
        let alerts = alerter.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Error);
        alerter.unregister_alert(id);
        assert!(alerter.alerts().is_empty());
    }

    #[test]
    fn merged_alerts_are_ordered_by_severity() {
        let hostdb = Alerter::new("hostdb", None);
        let renter = Alerter::new("renter", None);
        hostdb.register_alert(AlertID::from_name("a"), "a", "", AlertSeverity::Warning);
        renter.register_alert(AlertID::from_name("b"), "b", "", AlertSeverity::Critical);
        let merged = merge_alerts([&hostdb, &renter]);
        assert_eq!(merged[0].severity, AlertSeverity::Critical);
        assert_eq!(merged[1].module, "hostdb");
    }
}
