//! On-disk schema of the project document
//!
//! One JSON file holds everything: features, tasks, the completed-task
//! ledger, agent records, and workflow configuration. Unknown keys at every
//! level ride along in `extra` maps so foreign writers' fields survive a
//! round-trip. Struct field order is the serialization order; all maps are
//! BTree-backed, which keeps output byte-stable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::constants;
use crate::models::{AgentRecord, Feature, Task};

/// Action recorded in the approval history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalAction {
    Approved,
    Rejected,
    Implemented,
}

/// One entry of `metadata.approval_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub feature_id: String,
    pub action: ApprovalAction,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Ledger entry appended when a task reaches `completed` or `recovered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedTaskRecord {
    pub task_id: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub feature_id: String,
}

/// Document bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub version: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub total_features: u64,
    #[serde(default)]
    pub approval_history: Vec<ApprovalRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Persisted feature-approval policy.
///
/// Intentionally not defaulted during deserialization: a document without a
/// `workflow_config` is treated as corrupt and refuses to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub require_approval: bool,
    pub auto_reject_timeout_hours: i64,
    pub allowed_statuses: Vec<String>,
    pub required_fields: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            require_approval: true,
            auto_reject_timeout_hours: constants::DEFAULT_AUTO_REJECT_TIMEOUT_HOURS,
            allowed_statuses: vec![
                "suggested".to_string(),
                "approved".to_string(),
                "rejected".to_string(),
                "implemented".to_string(),
            ],
            required_fields: vec![
                "title".to_string(),
                "description".to_string(),
                "business_value".to_string(),
                "category".to_string(),
            ],
            extra: Map::new(),
        }
    }
}

/// The whole project file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDocument {
    pub project: String,
    pub metadata: DocumentMetadata,
    pub workflow_config: WorkflowConfig,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub completed_tasks: Vec<CompletedTaskRecord>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectDocument {
    pub fn new(project: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project: project.into(),
            metadata: DocumentMetadata {
                version: constants::DOCUMENT_VERSION.to_string(),
                created: now,
                updated: now,
                total_features: 0,
                approval_history: Vec::new(),
                extra: Map::new(),
            },
            workflow_config: WorkflowConfig::default(),
            features: Vec::new(),
            tasks: Vec::new(),
            completed_tasks: Vec::new(),
            agents: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn find_feature(&self, id: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn find_feature_mut(&mut self, id: &str) -> Option<&mut Feature> {
        self.features.iter_mut().find(|f| f.id == id)
    }

    pub fn find_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn find_task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_deserialize_round_trip_is_byte_identical() {
        let mut doc = ProjectDocument::new("demo");
        doc.agents.insert(
            "agent-1".to_string(),
            AgentRecord::new("agent-1", vec!["general".to_string()], 1),
        );

        let first = serde_json::to_string_pretty(&doc).unwrap();
        let parsed: ProjectDocument = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string_pretty(&parsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_top_level_fields_survive() {
        let mut doc = ProjectDocument::new("demo");
        doc.extra
            .insert("budget_tracking".to_string(), serde_json::json!({"spent": 3}));

        let text = serde_json::to_string_pretty(&doc).unwrap();
        let parsed: ProjectDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.extra["budget_tracking"]["spent"], 3);
    }

    #[test]
    fn test_missing_workflow_config_is_an_error() {
        let raw = serde_json::json!({
            "project": "demo",
            "metadata": {
                "version": "1.0.0",
                "created": "2026-01-01T00:00:00Z",
                "updated": "2026-01-01T00:00:00Z"
            }
        });
        assert!(serde_json::from_value::<ProjectDocument>(raw).is_err());
    }
}
