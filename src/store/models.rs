//! Entity models.
//!
//! Plain structs mirroring the persisted rows; persistence itself lives in
//! the sqlite store. Task/Method/Link/InputSource rows are created once at
//! submission time; Execution/Result/ColorGroup/status-history rows appear
//! lazily as the compiled net runs and are removed only by cascading
//! workflow deletion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A submitted workflow with its compiled plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    /// Key assigned by the execution substrate once the plan is submitted
    pub net_key: Option<String>,
    /// Compiled plan, kept for the inspection view
    pub plan: Value,
    /// Next unallocated color; color 0 is the root instance
    pub next_color: i64,
    pub canceled: bool,
    pub created_at: DateTime<Utc>,
}

/// Task variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Leaf task holding an ordered list of alternative methods. Nested
    /// sub-workflows are MethodList tasks wrapping a Dag method, so the
    /// root and every nested DAG share one shape.
    MethodList,
    /// Synthetic entry node of a DAG scope
    InputConnector,
    /// Synthetic exit node of a DAG scope
    OutputConnector,
    /// Synthetic task holding workflow-level input values
    InputHolder,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MethodList => write!(f, "method_list"),
            Self::InputConnector => write!(f, "input_connector"),
            Self::OutputConnector => write!(f, "output_connector"),
            Self::InputHolder => write!(f, "input_holder"),
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "method_list" => Ok(Self::MethodList),
            "input_connector" => Ok(Self::InputConnector),
            "output_connector" => Ok(Self::OutputConnector),
            "input_holder" => Ok(Self::InputHolder),
            _ => Err(format!("unknown task kind: {}", s)),
        }
    }
}

/// A named node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workflow_id: String,
    /// Dag method this task belongs to; None for the root and input holder
    pub parent_method_id: Option<String>,
    pub name: String,
    pub kind: TaskKind,
    /// Position in the scope's topological order; −1 for the root,
    /// connectors and the input holder
    pub topological_index: i64,
    /// Input property split into data-parallel instances
    pub parallel_by: Option<String>,
    pub canceled: bool,
}

/// Method variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Delegates execution to an external job service
    Job,
    /// A nested sub-workflow
    Dag,
    /// Returns a fixed trivial result; barrier / no-op semantics
    Block,
    /// Collects a named, ordered set of inputs into one array output
    Converge,
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job => write!(f, "job"),
            Self::Dag => write!(f, "dag"),
            Self::Block => write!(f, "block"),
            Self::Converge => write!(f, "converge"),
        }
    }
}

impl std::str::FromStr for MethodKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job" => Ok(Self::Job),
            "dag" => Ok(Self::Dag),
            "block" => Ok(Self::Block),
            "converge" => Ok(Self::Converge),
            _ => Err(format!("unknown method kind: {}", s)),
        }
    }
}

/// One executable attempt belonging to a MethodList, ordered by `index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Method {
    pub id: String,
    pub workflow_id: String,
    pub task_id: String,
    pub name: String,
    pub index: i64,
    pub kind: MethodKind,
    pub parameters: Value,
    pub service_url: Option<String>,
}

/// A directed edge between two sibling tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub workflow_id: String,
    pub source_task_id: String,
    pub destination_task_id: String,
}

/// One property mapping within a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFlowEntry {
    pub id: String,
    pub link_id: String,
    pub source_property: String,
    pub destination_property: String,
}

/// Precomputed resolution of a task input to its ultimate producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSource {
    pub id: String,
    pub workflow_id: String,
    pub destination_task_id: String,
    pub destination_property: String,
    pub source_task_id: String,
    pub source_property: String,
    /// Lineage indices at which the fetched value must be indexed by the
    /// current color's position within its group, producer → consumer order
    pub parallel_depths: Vec<usize>,
}

/// Execution status. Transitions are monotonic; a terminal status is
/// immutable except that `canceled` may pre-empt new/scheduled/running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    New,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Errored,
    Canceled,
}

impl Status {
    fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Scheduled => 1,
            Self::Running => 2,
            Self::Succeeded | Self::Failed | Self::Errored | Self::Canceled => 3,
        }
    }

    /// True for succeeded/failed/errored/canceled.
    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Whether a transition from `self` to `to` is allowed. Repeating the
    /// current status is not an advance (duplicate deliveries are no-ops).
    pub fn can_advance_to(self, to: Status) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == Status::Canceled {
            return true;
        }
        to.rank() > self.rank()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Errored => write!(f, "errored"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "errored" => Ok(Self::Errored),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// Kind of entity owning an execution or webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    Workflow,
    Task,
    Method,
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Task => write!(f, "task"),
            Self::Method => write!(f, "method"),
        }
    }
}

impl std::str::FromStr for OwnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "task" => Ok(Self::Task),
            "method" => Ok(Self::Method),
            _ => Err(format!("unknown owner kind: {}", s)),
        }
    }
}

/// One attempt record for a task or method, keyed by (owner, color).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub owner_kind: OwnerKind,
    pub owner_id: String,
    pub color: i64,
    pub parent_color: Option<i64>,
    /// Colors of each enclosing parallel scope, root first, own color last
    pub colors: Vec<i64>,
    /// Group begin of each enclosing parallel scope, aligned with `colors`
    pub begins: Vec<i64>,
    pub status: Status,
    pub data: Value,
    pub outputs: Option<Value>,
    /// Job URL reported by the job service at submission; status callbacks
    /// must match it
    pub job_url: Option<String>,
    /// Net response links captured at the execute callback
    pub response_links: Value,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// True when no outputs were ever stored (absent or empty object).
    pub fn outputs_unset(&self) -> bool {
        match &self.outputs {
            None => true,
            Some(Value::Object(map)) => map.is_empty(),
            Some(Value::Null) => true,
            Some(_) => false,
        }
    }

    /// Position of this execution within its color group at lineage `depth`.
    pub fn position_at(&self, depth: usize) -> Option<i64> {
        let color = self.colors.get(depth)?;
        let begin = self.begins.get(depth)?;
        Some(color - begin)
    }
}

/// One append-only status history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: Status,
    pub created_at: DateTime<Utc>,
}

/// A named output value of a task at one color.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: String,
    pub workflow_id: String,
    pub task_id: String,
    pub name: String,
    pub color: i64,
    pub parent_color: Option<i64>,
    pub data: Value,
}

/// One fan-out instance: a contiguous half-open color range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorGroup {
    pub id: String,
    pub workflow_id: String,
    /// Task whose parallel_by split created the group
    pub task_id: String,
    /// Index of this group among siblings under the same parent group
    pub index: i64,
    pub begin: i64,
    pub end: i64,
    pub parent_color: Option<i64>,
    pub parent_color_group_id: Option<String>,
}

impl ColorGroup {
    pub fn size(&self) -> i64 {
        self.end - self.begin
    }

    pub fn contains(&self, color: i64) -> bool {
        (self.begin..self.end).contains(&color)
    }
}

/// A status-change subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub workflow_id: String,
    pub owner_kind: OwnerKind,
    pub owner_id: String,
    /// Status name, or "ended" matching any terminal status
    pub status_name: String,
    pub url: String,
}

/// Delivery state of an outbox notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Abandoned,
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "abandoned" => Ok(Self::Abandoned),
            _ => Err(format!("unknown notification status: {}", s)),
        }
    }
}

/// An outbound notification row, flushed by the dispatcher after commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub workflow_id: Option<String>,
    pub url: String,
    pub payload: Value,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_are_monotonic() {
        assert!(Status::New.can_advance_to(Status::Scheduled));
        assert!(Status::Scheduled.can_advance_to(Status::Running));
        assert!(Status::Running.can_advance_to(Status::Succeeded));
        assert!(Status::New.can_advance_to(Status::Errored));

        assert!(!Status::Running.can_advance_to(Status::Scheduled));
        assert!(!Status::Running.can_advance_to(Status::Running));
        assert!(!Status::Succeeded.can_advance_to(Status::Failed));
        assert!(!Status::Failed.can_advance_to(Status::Succeeded));
    }

    #[test]
    fn test_canceled_preempts_only_non_terminal() {
        assert!(Status::New.can_advance_to(Status::Canceled));
        assert!(Status::Scheduled.can_advance_to(Status::Canceled));
        assert!(Status::Running.can_advance_to(Status::Canceled));
        assert!(!Status::Succeeded.can_advance_to(Status::Canceled));
        assert!(!Status::Errored.can_advance_to(Status::Canceled));
    }

    #[test]
    fn test_outputs_unset_treats_empty_object_as_unset() {
        let mut execution = Execution {
            id: "e".into(),
            workflow_id: "w".into(),
            owner_kind: OwnerKind::Method,
            owner_id: "m".into(),
            color: 0,
            parent_color: None,
            colors: vec![0],
            begins: vec![0],
            status: Status::New,
            data: Value::Null,
            outputs: None,
            job_url: None,
            response_links: Value::Null,
            created_at: Utc::now(),
        };
        assert!(execution.outputs_unset());

        execution.outputs = Some(serde_json::json!({}));
        assert!(execution.outputs_unset());

        execution.outputs = Some(serde_json::json!({"a": 1}));
        assert!(!execution.outputs_unset());
    }

    #[test]
    fn test_group_position() {
        let execution = Execution {
            id: "e".into(),
            workflow_id: "w".into(),
            owner_kind: OwnerKind::Method,
            owner_id: "m".into(),
            color: 7,
            parent_color: Some(0),
            colors: vec![0, 7],
            begins: vec![0, 5],
            status: Status::Running,
            data: Value::Null,
            outputs: None,
            job_url: None,
            response_links: Value::Null,
            created_at: Utc::now(),
        };
        assert_eq!(execution.position_at(1), Some(2));
        assert_eq!(execution.position_at(2), None);
    }
}
