// src/context/types.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::error::ContextError;

/// Free-form context payload. Conventional sub-objects (`task_data`,
/// `branch_settings`, `project_settings`, `autonomous_rules`) live inside it
/// as plain keys; the merge rules in `merge.rs` are what give them meaning.
pub type JsonMap = serde_json::Map<String, Value>;

/// The four levels of the context hierarchy, root first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContextLevel {
    Global,
    Project,
    Branch,
    Task,
}

impl ContextLevel {
    /// Distance from the root: GLOBAL is 0, TASK is 3.
    pub fn depth(&self) -> u8 {
        match self {
            ContextLevel::Global => 0,
            ContextLevel::Project => 1,
            ContextLevel::Branch => 2,
            ContextLevel::Task => 3,
        }
    }

    /// The level one step up the chain, None for GLOBAL.
    pub fn parent(&self) -> Option<ContextLevel> {
        match self {
            ContextLevel::Global => None,
            ContextLevel::Project => Some(ContextLevel::Global),
            ContextLevel::Branch => Some(ContextLevel::Project),
            ContextLevel::Task => Some(ContextLevel::Branch),
        }
    }

    /// True when `self` is a strict ancestor level of `other`.
    pub fn is_above(&self, other: ContextLevel) -> bool {
        self.depth() < other.depth()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextLevel::Global => "global",
            ContextLevel::Project => "project",
            ContextLevel::Branch => "branch",
            ContextLevel::Task => "task",
        }
    }
}

impl std::fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ContextLevel {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "global" => Ok(ContextLevel::Global),
            "project" => Ok(ContextLevel::Project),
            "branch" => Ok(ContextLevel::Branch),
            "task" => Ok(ContextLevel::Task),
            other => Err(ContextError::InvalidLevel(other.to_string())),
        }
    }
}

/// Isolation boundary for all store and cache access. Every operation is
/// scoped by the owning user; contexts of other users are invisible even on
/// context_id collision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserScope {
    user_id: String,
}

impl UserScope {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into() }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// One node of the hierarchy with its payload and append-only history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Context {
    pub level: ContextLevel,
    pub context_id: String,
    pub user_id: String,
    pub parent_id: Option<String>,
    pub data: JsonMap,
    pub insights: Vec<Insight>,
    pub progress: Vec<ProgressEntry>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    pub fn new(
        level: ContextLevel,
        context_id: impl Into<String>,
        user_id: impl Into<String>,
        data: JsonMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            level,
            context_id: context_id.into(),
            user_id: user_id.into(),
            parent_id: None,
            data,
            insights: Vec::new(),
            progress: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Reference to the parent context id: explicit `parent_id` wins, then
    /// the conventional data key for the level (`branch_id` for tasks,
    /// `project_id` for branches). GLOBAL has no parent; a PROJECT's parent
    /// is the owning user's GLOBAL context.
    pub fn parent_ref(&self) -> Option<String> {
        match self.level {
            ContextLevel::Global => None,
            ContextLevel::Project => Some(self.user_id.clone()),
            ContextLevel::Branch => self
                .parent_id
                .clone()
                .or_else(|| data_str(&self.data, "project_id")),
            ContextLevel::Task => self
                .parent_id
                .clone()
                .or_else(|| data_str(&self.data, "branch_id")),
        }
    }
}

/// Pull a string value out of a data mapping.
pub fn data_str(data: &JsonMap, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InsightCategory {
    Technical,
    Business,
    Performance,
    Risk,
    Discovery,
}

impl InsightCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightCategory::Technical => "technical",
            InsightCategory::Business => "business",
            InsightCategory::Performance => "performance",
            InsightCategory::Risk => "risk",
            InsightCategory::Discovery => "discovery",
        }
    }
}

impl std::str::FromStr for InsightCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "technical" => Ok(InsightCategory::Technical),
            "business" => Ok(InsightCategory::Business),
            "performance" => Ok(InsightCategory::Performance),
            "risk" => Ok(InsightCategory::Risk),
            "discovery" => Ok(InsightCategory::Discovery),
            _ => Err(format!("Unknown insight category: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InsightImportance {
    Low,
    Medium,
    High,
    Critical,
}

impl InsightImportance {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightImportance::Low => "low",
            InsightImportance::Medium => "medium",
            InsightImportance::High => "high",
            InsightImportance::Critical => "critical",
        }
    }
}

impl std::str::FromStr for InsightImportance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(InsightImportance::Low),
            "medium" => Ok(InsightImportance::Medium),
            "high" => Ok(InsightImportance::High),
            "critical" => Ok(InsightImportance::Critical),
            _ => Err(format!("Unknown insight importance: {s}")),
        }
    }
}

/// Append-only observation attached to a context. Not part of the
/// inheritance merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Insight {
    pub content: String,
    pub category: Option<InsightCategory>,
    pub importance: Option<InsightImportance>,
    pub agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only progress note attached to a context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEntry {
    pub content: String,
    pub agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DelegationStatus {
    Pending,
    Applied,
    Rejected,
}

impl DelegationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelegationStatus::Pending => "pending",
            DelegationStatus::Applied => "applied",
            DelegationStatus::Rejected => "rejected",
        }
    }
}

impl std::str::FromStr for DelegationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DelegationStatus::Pending),
            "applied" => Ok(DelegationStatus::Applied),
            "rejected" => Ok(DelegationStatus::Rejected),
            _ => Err(format!("Unknown delegation status: {s}")),
        }
    }
}

/// A value promoted from a lower-level context into an ancestor context.
/// Delegations are applied eagerly: the record is created and merged into
/// the target within the same operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Delegation {
    pub id: String,
    pub user_id: String,
    pub source_level: ContextLevel,
    pub source_context_id: String,
    pub target_level: ContextLevel,
    pub target_context_id: String,
    pub data: JsonMap,
    pub reason: Option<String>,
    pub status: DelegationStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Result of inheritance resolution: the merged view of a context and all
/// of its ancestors. Derived, cached, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedContext {
    pub level: ContextLevel,
    pub context_id: String,
    pub data: JsonMap,
    /// Levels that were actually found and merged, root first.
    pub inheritance_chain: Vec<ContextLevel>,
    pub resolved_at: DateTime<Utc>,
}

/// ANDed filters for `list`. `user_id` scoping is implicit and mandatory.
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
    pub project_id: Option<String>,
    pub git_branch_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
