//! Work item payloads.
//!
//! A work item is a JSON document `{"tasks": [...]}`. Each task carries a
//! `task` discriminator and a `version`; older versions are upgraded in
//! place when decoded.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{CoordError, CoordResult};

/// Version written into every encoded task.
pub const TASK_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    InstancePreflight {
        instance_uuid: String,
        #[serde(default)]
        network: Vec<Value>,
    },
    InstanceStart {
        instance_uuid: String,
        #[serde(default)]
        network: Vec<Value>,
    },
    InstanceDelete {
        instance_uuid: String,
        #[serde(default)]
        network: Vec<Value>,
    },
    NetworkDeploy {
        network_uuid: String,
    },
    NetworkDestroy {
        network_uuid: String,
    },
    HypervisorNetworkDestroy {
        network_uuid: String,
    },
    NetworkUpdateDhcp {
        network_uuid: String,
    },
    NetworkRemoveDhcp {
        network_uuid: String,
    },
    NetworkRemoveNat {
        network_uuid: String,
    },
    NetworkDeleteWhenClean {
        network_uuid: String,
        #[serde(default)]
        wait_interfaces: Vec<String>,
    },
    NetworkInterfaceFloat {
        network_uuid: String,
        interface_uuid: String,
    },
    NetworkInterfaceDefloat {
        network_uuid: String,
        interface_uuid: String,
    },
    ImageFetch {
        url: String,
        #[serde(default)]
        instance_uuid: Option<String>,
    },
    Snapshot {
        instance_uuid: String,
        disk: String,
        artifact_uuid: String,
        blob_uuid: String,
    },
    EventlogMessage {
        object_type: String,
        object_uuid: String,
        timestamp: f64,
        message: String,
    },
    EventlogDelete {
        object_type: String,
        object_uuid: String,
    },
}

/// The discriminator of a [`Task`], without its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    InstancePreflight,
    InstanceStart,
    InstanceDelete,
    NetworkDeploy,
    NetworkDestroy,
    HypervisorNetworkDestroy,
    NetworkUpdateDhcp,
    NetworkRemoveDhcp,
    NetworkRemoveNat,
    NetworkDeleteWhenClean,
    NetworkInterfaceFloat,
    NetworkInterfaceDefloat,
    ImageFetch,
    Snapshot,
    EventlogMessage,
    EventlogDelete,
}

impl TaskKind {
    pub fn name(self) -> &'static str {
        match self {
            TaskKind::InstancePreflight => "instance_preflight",
            TaskKind::InstanceStart => "instance_start",
            TaskKind::InstanceDelete => "instance_delete",
            TaskKind::NetworkDeploy => "network_deploy",
            TaskKind::NetworkDestroy => "network_destroy",
            TaskKind::HypervisorNetworkDestroy => "hypervisor_network_destroy",
            TaskKind::NetworkUpdateDhcp => "network_update_dhcp",
            TaskKind::NetworkRemoveDhcp => "network_remove_dhcp",
            TaskKind::NetworkRemoveNat => "network_remove_nat",
            TaskKind::NetworkDeleteWhenClean => "network_delete_when_clean",
            TaskKind::NetworkInterfaceFloat => "network_interface_float",
            TaskKind::NetworkInterfaceDefloat => "network_interface_defloat",
            TaskKind::ImageFetch => "image_fetch",
            TaskKind::Snapshot => "snapshot",
            TaskKind::EventlogMessage => "eventlog_message",
            TaskKind::EventlogDelete => "eventlog_delete",
        }
    }

    /// Look a discriminator up by its wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::InstancePreflight { .. } => TaskKind::InstancePreflight,
            Task::InstanceStart { .. } => TaskKind::InstanceStart,
            Task::InstanceDelete { .. } => TaskKind::InstanceDelete,
            Task::NetworkDeploy { .. } => TaskKind::NetworkDeploy,
            Task::NetworkDestroy { .. } => TaskKind::NetworkDestroy,
            Task::HypervisorNetworkDestroy { .. } => TaskKind::HypervisorNetworkDestroy,
            Task::NetworkUpdateDhcp { .. } => TaskKind::NetworkUpdateDhcp,
            Task::NetworkRemoveDhcp { .. } => TaskKind::NetworkRemoveDhcp,
            Task::NetworkRemoveNat { .. } => TaskKind::NetworkRemoveNat,
            Task::NetworkDeleteWhenClean { .. } => TaskKind::NetworkDeleteWhenClean,
            Task::NetworkInterfaceFloat { .. } => TaskKind::NetworkInterfaceFloat,
            Task::NetworkInterfaceDefloat { .. } => TaskKind::NetworkInterfaceDefloat,
            Task::ImageFetch { .. } => TaskKind::ImageFetch,
            Task::Snapshot { .. } => TaskKind::Snapshot,
            Task::EventlogMessage { .. } => TaskKind::EventlogMessage,
            Task::EventlogDelete { .. } => TaskKind::EventlogDelete,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Human readable name, for logs and events.
    pub fn pretty_name(&self) -> String {
        self.name().replace('_', " ")
    }

    pub fn instance_uuid(&self) -> Option<&str> {
        match self {
            Task::InstancePreflight { instance_uuid, .. }
            | Task::InstanceStart { instance_uuid, .. }
            | Task::InstanceDelete { instance_uuid, .. }
            | Task::Snapshot { instance_uuid, .. } => Some(instance_uuid),
            Task::ImageFetch { instance_uuid, .. } => instance_uuid.as_deref(),
            _ => None,
        }
    }

    pub fn network_uuid(&self) -> Option<&str> {
        match self {
            Task::NetworkDeploy { network_uuid }
            | Task::NetworkDestroy { network_uuid }
            | Task::HypervisorNetworkDestroy { network_uuid }
            | Task::NetworkUpdateDhcp { network_uuid }
            | Task::NetworkRemoveDhcp { network_uuid }
            | Task::NetworkRemoveNat { network_uuid }
            | Task::NetworkDeleteWhenClean { network_uuid, .. }
            | Task::NetworkInterfaceFloat { network_uuid, .. }
            | Task::NetworkInterfaceDefloat { network_uuid, .. } => Some(network_uuid),
            _ => None,
        }
    }

    /// Reject tasks missing the identifiers they act on.
    pub fn validate(&self) -> CoordResult<()> {
        let required: Vec<(&str, &str)> = match self {
            Task::InstancePreflight { instance_uuid, .. }
            | Task::InstanceStart { instance_uuid, .. }
            | Task::InstanceDelete { instance_uuid, .. } => vec![("instance_uuid", instance_uuid.as_str())],
            Task::NetworkInterfaceFloat {
                network_uuid,
                interface_uuid,
            }
            | Task::NetworkInterfaceDefloat {
                network_uuid,
                interface_uuid,
            } => vec![("network_uuid", network_uuid.as_str()), ("interface_uuid", interface_uuid.as_str())],
            Task::NetworkDeploy { network_uuid }
            | Task::NetworkDestroy { network_uuid }
            | Task::HypervisorNetworkDestroy { network_uuid }
            | Task::NetworkUpdateDhcp { network_uuid }
            | Task::NetworkRemoveDhcp { network_uuid }
            | Task::NetworkRemoveNat { network_uuid }
            | Task::NetworkDeleteWhenClean { network_uuid, .. } => vec![("network_uuid", network_uuid.as_str())],
            Task::ImageFetch { url, .. } => vec![("url", url.as_str())],
            Task::Snapshot {
                instance_uuid,
                disk,
                ..
            } => vec![("instance_uuid", instance_uuid.as_str()), ("disk", disk.as_str())],
            Task::EventlogMessage {
                object_type,
                object_uuid,
                ..
            }
            | Task::EventlogDelete {
                object_type,
                object_uuid,
            } => vec![("object_type", object_type.as_str()), ("object_uuid", object_uuid.as_str())],
        };

        for (field, value) in required {
            if value.is_empty() {
                return Err(CoordError::InvalidTask(format!(
                    "{} task has an empty {field}",
                    self.name()
                )));
            }
        }

        // JSON has no encoding for NaN or infinity.
        if let Task::EventlogMessage { timestamp, .. } = self {
            if !timestamp.is_finite() {
                return Err(CoordError::InvalidTask(format!(
                    "{} task has a non-finite timestamp",
                    self.name()
                )));
            }
        }
        Ok(())
    }
}

/// Decode one task document, upgrading older versions first.
pub fn decode_task(value: Value) -> CoordResult<Task> {
    let Value::Object(mut fields) = value else {
        return Err(CoordError::InvalidTask("task is not an object".to_string()));
    };

    let version = match fields.remove("version") {
        None | Some(Value::Null) => 0,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| CoordError::InvalidTask(format!("bad task version {v}")))?,
    };
    if version > TASK_VERSION {
        return Err(CoordError::InvalidTask(format!(
            "task version {version} is newer than supported version {TASK_VERSION}"
        )));
    }
    upgrade(&mut fields, version);

    let name = match fields.get("task") {
        Some(Value::String(name)) => name.clone(),
        _ => return Err(CoordError::InvalidTask("task has no name".to_string())),
    };
    if TaskKind::from_name(&name).is_none() {
        return Err(CoordError::UnknownTask(name));
    }

    let task: Task = serde_json::from_value(Value::Object(fields))
        .map_err(|e| CoordError::InvalidTask(format!("{name}: {e}")))?;
    task.validate()?;
    Ok(task)
}

/// Bring a task document from `version` up to [`TASK_VERSION`].
fn upgrade(fields: &mut Map<String, Value>, version: u64) {
    if version < 1 {
        // Version 0 wrote absent network lists as null.
        for key in ["network", "wait_interfaces", "instance_uuid"] {
            if fields.get(key) == Some(&Value::Null) {
                fields.remove(key);
            }
        }
    }
}

fn encode_task(task: &Task) -> CoordResult<Value> {
    task.validate()?;
    let mut value = serde_json::to_value(task).map_err(|e| CoordError::Serialize(e.to_string()))?;
    if let Value::Object(fields) = &mut value {
        fields.insert("version".to_string(), Value::from(TASK_VERSION));
    }
    Ok(value)
}

/// Wire form of a work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawWorkItem {
    #[serde(default)]
    tasks: Vec<Value>,
}

/// An ordered list of tasks handed to a queue as one unit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawWorkItem")]
pub struct WorkItem {
    pub tasks: Vec<Task>,
}

impl WorkItem {
    pub fn new(tasks: Vec<Task>) -> CoordResult<Self> {
        for task in &tasks {
            task.validate()?;
        }
        Ok(Self { tasks })
    }

    pub fn single(task: Task) -> CoordResult<Self> {
        Self::new(vec![task])
    }

    pub fn encode(&self) -> CoordResult<Vec<u8>> {
        let raw = RawWorkItem::try_from(self)?;
        serde_json::to_vec(&raw).map_err(|e| CoordError::Serialize(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> CoordResult<Self> {
        let raw: RawWorkItem = serde_json::from_slice(bytes)
            .map_err(|e| CoordError::InvalidTask(format!("work item is not valid JSON: {e}")))?;
        Self::try_from(raw)
    }

    /// Instance the first task acts on, if any.
    pub fn instance_uuid(&self) -> Option<&str> {
        self.tasks.iter().find_map(Task::instance_uuid)
    }
}

impl TryFrom<RawWorkItem> for WorkItem {
    type Error = CoordError;

    fn try_from(raw: RawWorkItem) -> Result<Self, Self::Error> {
        let tasks = raw
            .tasks
            .into_iter()
            .map(decode_task)
            .collect::<CoordResult<Vec<_>>>()?;
        Ok(Self { tasks })
    }
}

impl TryFrom<&WorkItem> for RawWorkItem {
    type Error = CoordError;

    fn try_from(item: &WorkItem) -> Result<Self, Self::Error> {
        let tasks = item.tasks.iter().map(encode_task).collect::<CoordResult<_>>()?;
        Ok(RawWorkItem { tasks })
    }
}

impl Serialize for WorkItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RawWorkItem::try_from(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}
