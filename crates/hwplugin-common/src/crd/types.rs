//! Shared types used across the hardware plugin CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Composite condition types tracked on requests and nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Hardware allocated and provisioned
    Provisioned,
    /// Current hardware profile applied
    Configured,
}

impl ConditionType {
    /// Wire name of the condition type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioned => "Provisioned",
            Self::Configured => "Configured",
        }
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable condition reasons
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionReason {
    /// Work is under way
    InProgress,
    /// Provisioning finished
    Completed,
    /// Operation failed
    Failed,
    /// Operation exceeded the hardware timeout
    TimedOut,
    /// The request cannot be satisfied as written
    InvalidInput,
    /// A profile update was requested
    ConfigUpdate,
    /// The requested profile is applied
    ConfigApplied,
}

impl ConditionReason {
    /// Wire name of the reason
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::TimedOut => "TimedOut",
            Self::InvalidInput => "InvalidInput",
            Self::ConfigUpdate => "ConfigUpdate",
            Self::ConfigApplied => "ConfigApplied",
        }
    }

    /// Parse a wire reason, `None` for reasons this plugin never writes
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "InProgress" => Some(Self::InProgress),
            "Completed" => Some(Self::Completed),
            "Failed" => Some(Self::Failed),
            "TimedOut" => Some(Self::TimedOut),
            "InvalidInput" => Some(Self::InvalidInput),
            "ConfigUpdate" => Some(Self::ConfigUpdate),
            "ConfigApplied" => Some(Self::ConfigApplied),
            _ => None,
        }
    }

    /// Reasons that end a cycle without success
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut | Self::InvalidInput)
    }
}

impl std::fmt::Display for ConditionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (Provisioned, Configured)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.as_str().to_string(),
            status,
            reason: reason.as_str().to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// True when the status is `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    /// True when the condition carries the given reason
    pub fn has_reason(&self, reason: ConditionReason) -> bool {
        self.reason == reason.as_str()
    }
}

/// Reference to a namespaced object by name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ObjectRef {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
