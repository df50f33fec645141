//! Container records - The persisted description of one VPS

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::catalog::{Plan, Processor};
use super::resource::ResourceSpec;

/// Last acknowledged runtime state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl ContainerStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Build the runtime name for an owner's n-th container
pub fn container_name(owner_id: &str, seq: usize) -> String {
    format!("vps-{}-{}", owner_id, seq)
}

/// A provisioned container and its ownership/sharing state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Runtime name, unique across all owners
    pub container_name: String,
    pub owner_id: String,
    /// `None` for custom containers created by an admin
    #[serde(default)]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub processor: Option<Processor>,
    pub ram_gb: u32,
    pub cpu_cores: u32,
    pub storage_gb: u32,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub shared_with: BTreeSet<String>,
}

impl ContainerRecord {
    pub fn new(container_name: String, owner_id: impl Into<String>, spec: ResourceSpec) -> Self {
        Self {
            container_name,
            owner_id: owner_id.into(),
            plan: None,
            processor: None,
            ram_gb: spec.ram_gb,
            cpu_cores: spec.cpu_cores,
            storage_gb: spec.storage_gb,
            status: ContainerStatus::Running,
            created_at: Utc::now(),
            shared_with: BTreeSet::new(),
        }
    }

    pub fn with_plan(mut self, plan: Plan, processor: Processor) -> Self {
        self.plan = Some(plan);
        self.processor = Some(processor);
        self
    }

    /// Resources currently recorded for this container
    pub fn spec(&self) -> ResourceSpec {
        ResourceSpec::new(self.ram_gb, self.cpu_cores, self.storage_gb)
    }

    /// Plan label, "Custom" for admin-created containers
    pub fn plan_label(&self) -> &'static str {
        self.plan.map(|p| p.label()).unwrap_or("Custom")
    }

    pub fn is_shared_with(&self, user_id: &str) -> bool {
        self.shared_with.contains(user_id)
    }

    pub fn mark_running(&mut self) {
        self.status = ContainerStatus::Running;
    }

    pub fn mark_stopped(&mut self) {
        self.status = ContainerStatus::Stopped;
    }

    /// Reset after a reinstall
    pub fn mark_reinstalled(&mut self) {
        self.status = ContainerStatus::Running;
        self.created_at = Utc::now();
    }
}

/// Credit balance of one user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub credits: u64,
}

/// Operators with admin rights, excluding the primary admin
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminRoster {
    #[serde(default)]
    pub admins: BTreeSet<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_follow_owner_and_sequence() {
        assert_eq!(container_name("42", 3), "vps-42-3");
    }

    #[test]
    fn new_records_start_running_and_unshared() {
        let record = ContainerRecord::new("vps-1-1".into(), "1", ResourceSpec::new(4, 1, 20));
        assert_eq!(record.status, ContainerStatus::Running);
        assert!(record.shared_with.is_empty());
        assert_eq!(record.plan_label(), "Custom");
        assert_eq!(record.spec(), ResourceSpec::new(4, 1, 20));
    }

    #[test]
    fn record_json_uses_lowercase_status() {
        let record = ContainerRecord::new("vps-1-1".into(), "1", ResourceSpec::new(4, 1, 20))
            .with_plan(Plan::Starter, Processor::Amd);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["plan"], "Starter");
        assert_eq!(json["processor"], "AMD");

        let back: ContainerRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn reinstall_resets_status_and_creation_time() {
        let mut record = ContainerRecord::new("vps-1-1".into(), "1", ResourceSpec::new(4, 1, 20));
        let before = record.created_at;
        record.mark_stopped();
        record.mark_reinstalled();
        assert!(record.status.is_running());
        assert!(record.created_at >= before);
    }
}
