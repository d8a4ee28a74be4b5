use crate::error::StorageError;
use crate::types::{
    CampaignId, FinishedStages, InstanceId, Operation, OperationId, OperationState,
    OperationType,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

/// Column list shared by every operation query.
pub const OPERATION_COLUMNS: &str = "id, type, instance_id, state, version, finished_stages, \
     created_at, updated_at, campaign_id, payload, description";

/// Raw column values of one `operations` row.
pub struct OperationFields {
    pub id: String,
    pub type_str: String,
    pub instance_id: String,
    pub state_str: String,
    pub version: i64,
    pub finished_stages: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub campaign_id: Option<String>,
    pub payload: Value,
    pub description: String,
}

impl OperationFields {
    /// # Errors
    /// Returns [`StorageError::InvalidData`] when a column is missing or has the wrong type.
    pub fn from_row(row: &PgRow) -> Result<Self, StorageError> {
        let column = |e: sqlx::Error| StorageError::InvalidData(format!("operation row: {e}"));
        Ok(Self {
            id: row.try_get("id").map_err(column)?,
            type_str: row.try_get("type").map_err(column)?,
            instance_id: row.try_get("instance_id").map_err(column)?,
            state_str: row.try_get("state").map_err(column)?,
            version: row.try_get("version").map_err(column)?,
            finished_stages: row.try_get("finished_stages").map_err(column)?,
            created_at: row.try_get("created_at").map_err(column)?,
            updated_at: row.try_get("updated_at").map_err(column)?,
            campaign_id: row.try_get("campaign_id").map_err(column)?,
            payload: row.try_get("payload").map_err(column)?,
            description: row.try_get("description").map_err(column)?,
        })
    }
}

/// # Errors
/// Returns [`StorageError::InvalidData`] for unknown state or type names.
pub fn parse_operation(fields: OperationFields) -> Result<Operation, StorageError> {
    let operation_type =
        OperationType::try_from(fields.type_str.as_str()).map_err(StorageError::InvalidData)?;
    let state =
        OperationState::try_from(fields.state_str.as_str()).map_err(StorageError::InvalidData)?;

    Ok(Operation {
        id: OperationId::new(fields.id),
        operation_type,
        instance_id: InstanceId::new(fields.instance_id),
        state,
        version: fields.version,
        finished_stages: FinishedStages::from(fields.finished_stages),
        created_at: fields.created_at,
        updated_at: fields.updated_at,
        campaign_id: fields.campaign_id.map(CampaignId::new),
        payload: fields.payload,
        description: fields.description,
    })
}

/// # Errors
/// Returns [`StorageError::InvalidData`] when the row cannot be decoded.
pub fn operation_from_row(row: &PgRow) -> Result<Operation, StorageError> {
    OperationFields::from_row(row).and_then(parse_operation)
}

/// # Errors
/// Returns the first row decoding failure.
pub fn operations_from_rows(rows: &[PgRow]) -> Result<Vec<Operation>, StorageError> {
    rows.iter().map(operation_from_row).collect()
}
