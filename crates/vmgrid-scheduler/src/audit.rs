//! Scheduling audit events.
//!
//! Every pipeline stage reports the candidate set it produced. Events go
//! to an [`AuditHook`]; the default hook logs them under the `audit`
//! tracing target.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::info;

/// Which object an audit event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditSubject {
    pub object_type: &'static str,
    pub object_uuid: String,
}

impl AuditSubject {
    pub fn instance(uuid: &str) -> Self {
        Self {
            object_type: "instance",
            object_uuid: uuid.to_string(),
        }
    }

    pub fn node(fqdn: &str) -> Self {
        Self {
            object_type: "node",
            object_uuid: fqdn.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// Identifies one scheduler instance across events.
    pub scheduler: String,
    pub subject: AuditSubject,
    pub message: String,
    pub extra: serde_json::Value,
}

pub type AuditHook = Arc<dyn Fn(&AuditEvent) + Send + Sync>;

/// Log events as structured tracing records.
pub fn tracing_hook() -> AuditHook {
    Arc::new(|event: &AuditEvent| {
        info!(
            target: "audit",
            scheduler = %event.scheduler,
            object_type = event.subject.object_type,
            object_uuid = %event.subject.object_uuid,
            extra = %event.extra,
            "{}",
            event.message
        );
    })
}

/// Collects events in memory; handy for inspecting a scheduling pass.
#[derive(Clone, Default)]
pub struct AuditLog {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self) -> AuditHook {
        let events = self.events.clone();
        Arc::new(move |event: &AuditEvent| {
            if let Ok(mut events) = events.lock() {
                events.push(event.clone());
            }
        })
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.message).collect()
    }
}
