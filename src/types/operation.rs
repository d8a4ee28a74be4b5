use super::identifiers::{CampaignId, InstanceId, OperationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Provision,
    Deprovision,
    Update,
    UpgradeKyma,
    UpgradeCluster,
}

impl OperationType {
    pub const ALL: [Self; 5] = [
        Self::Provision,
        Self::Deprovision,
        Self::Update,
        Self::UpgradeKyma,
        Self::UpgradeCluster,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Deprovision => "deprovision",
            Self::Update => "update",
            Self::UpgradeKyma => "upgradeKyma",
            Self::UpgradeCluster => "upgradeCluster",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OperationType {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "provision" => Ok(Self::Provision),
            "deprovision" => Ok(Self::Deprovision),
            "update" => Ok(Self::Update),
            "upgradeKyma" => Ok(Self::UpgradeKyma),
            "upgradeCluster" => Ok(Self::UpgradeCluster),
            _ => Err(format!("Unknown operation type: {s}")),
        }
    }
}

/// Lifecycle state of an operation.
///
/// `Pending -> InProgress -> (Retrying <-> InProgress)* -> Succeeded | Failed`.
/// `Succeeded` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "retrying")]
    Retrying,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl OperationState {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Retrying,
        Self::Succeeded,
        Self::Failed,
    ];

    pub const NOT_FINISHED: [Self; 3] = [Self::Pending, Self::InProgress, Self::Retrying];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in progress",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OperationState {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "in progress" => Ok(Self::InProgress),
            "retrying" => Ok(Self::Retrying),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown operation state: {s}")),
        }
    }
}

/// Names of completed stages in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinishedStages(Vec<String>);

impl FinishedStages {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn contains(&self, stage: &str) -> bool {
        self.0.iter().any(|name| name == stage)
    }

    /// Records a completed stage. Already recorded stages are ignored.
    pub fn mark(&mut self, stage: impl Into<String>) {
        let stage = stage.into();
        if !self.contains(&stage) {
            self.0.push(stage);
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for FinishedStages {
    fn from(stages: Vec<String>) -> Self {
        stages.into_iter().fold(Self::new(), |mut acc, stage| {
            acc.mark(stage);
            acc
        })
    }
}

/// Persistent record of one lifecycle operation on one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub operation_type: OperationType,
    pub instance_id: InstanceId,
    pub state: OperationState,
    pub version: i64,
    pub finished_stages: FinishedStages,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub campaign_id: Option<CampaignId>,
    pub payload: Value,
    pub description: String,
}

impl Operation {
    /// New `Pending` record at version zero.
    #[must_use]
    pub fn new(
        id: OperationId,
        operation_type: OperationType,
        instance_id: InstanceId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            operation_type,
            instance_id,
            state: OperationState::Pending,
            version: 0,
            finished_stages: FinishedStages::new(),
            created_at: now,
            updated_at: now,
            campaign_id: None,
            payload: Value::Object(serde_json::Map::new()),
            description: String::new(),
        }
    }

    #[must_use]
    pub fn with_campaign(mut self, campaign_id: CampaignId) -> Self {
        self.campaign_id = Some(campaign_id);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Instant after which the operation must not continue.
    ///
    /// `None` when the timeout cannot be represented, which means no deadline.
    #[must_use]
    pub fn deadline(&self, operation_timeout: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(operation_timeout)
            .ok()
            .and_then(|timeout| self.created_at.checked_add_signed(timeout))
    }

    #[must_use]
    pub fn is_expired(&self, operation_timeout: Duration, now: DateTime<Utc>) -> bool {
        self.deadline(operation_timeout)
            .is_some_and(|deadline| now >= deadline)
    }
}
