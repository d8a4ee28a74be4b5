#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::mappers::{operation_from_row, operations_from_rows, OPERATION_COLUMNS};
use super::{OperationStorage, StorageFuture};
use crate::error::{BrokerError, Result, StorageError};
use crate::types::{
    CampaignId, InstanceId, Operation, OperationFilter, OperationId, OperationState,
    OperationType, Page,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info};

pub const EMBEDDED_SCHEMA_SQL: &str = include_str!("../../schema.sql");

/// `operations` table driver. Every call is a single attempt.
#[derive(Clone)]
pub struct PgOperationStorage {
    pool: PgPool,
}

impl PgOperationStorage {
    /// # Errors
    /// Returns [`StorageError::Transient`] when the connection cannot be established.
    pub async fn connect(
        connection_string: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(connection_string)
            .await
            .map(Self::new_with_pool)
            .map_err(|error| {
                BrokerError::Storage(StorageError::Transient(format!(
                    "Failed to connect to database: {error}"
                )))
            })
    }

    #[must_use]
    pub const fn new_with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the `operations` table and its indexes when missing.
    ///
    /// # Errors
    /// Returns an error if the schema statements fail.
    pub async fn initialize_schema(&self) -> Result<()> {
        self.initialize_schema_from_sql(EMBEDDED_SCHEMA_SQL).await
    }

    /// # Errors
    /// Returns an error if the schema statements fail.
    pub async fn initialize_schema_from_sql(&self, schema_sql: &str) -> Result<()> {
        sqlx::raw_sql(schema_sql)
            .execute(self.pool())
            .await
            .map(|_result| info!("Operation schema initialized"))
            .map_err(|e| BrokerError::Storage(StorageError::from(e)))
    }

    async fn fetch_by_id(&self, id: &OperationId) -> std::result::Result<Operation, StorageError> {
        let sql = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = $1");
        sqlx::query(&sql)
            .bind(id.value())
            .fetch_optional(self.pool())
            .await
            .map_err(StorageError::from)?
            .ok_or_else(|| StorageError::NotFound(format!("operation {id}")))
            .and_then(|row| operation_from_row(&row))
    }

    /// Explains why a compare-and-swap touched no row.
    async fn diagnose_missed_update(&self, operation: &Operation) -> StorageError {
        match self.fetch_by_id(&operation.id).await {
            Ok(stored) => {
                debug!(
                    "Operation {} update based on version {} lost against version {}",
                    operation.id, operation.version, stored.version
                );
                StorageError::Conflict(format!(
                    "operation {} is at version {}, update was based on {}",
                    operation.id, stored.version, operation.version
                ))
            }
            Err(error) => error,
        }
    }

    async fn fetch_ordered(
        &self,
        mut query: QueryBuilder<'_, Postgres>,
    ) -> std::result::Result<Vec<Operation>, StorageError> {
        query.push(" ORDER BY created_at ASC, id ASC");
        let rows = query
            .build()
            .fetch_all(self.pool())
            .await
            .map_err(StorageError::from)?;
        operations_from_rows(&rows)
    }

    async fn fetch_latest(
        &self,
        query: QueryBuilder<'_, Postgres>,
        missing: impl FnOnce() -> String + Send,
    ) -> std::result::Result<Operation, StorageError> {
        let row = latest_only(query)
            .build()
            .fetch_optional(self.pool())
            .await
            .map_err(StorageError::from)?;
        match row {
            Some(row) => operation_from_row(&row),
            None => Err(StorageError::NotFound(missing())),
        }
    }
}

fn latest_only(mut query: QueryBuilder<'_, Postgres>) -> QueryBuilder<'_, Postgres> {
    query.push(" ORDER BY created_at DESC, id DESC LIMIT 1");
    query
}

fn select_where() -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE "))
}

fn by_instance(instance_id: &InstanceId) -> QueryBuilder<'static, Postgres> {
    let mut query = select_where();
    query
        .push("instance_id = ")
        .push_bind(instance_id.value().to_string());
    query
}

fn state_names(states: &[OperationState]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &OperationFilter) {
    builder.push(" WHERE TRUE");
    if !filter.states.is_empty() {
        builder
            .push(" AND state = ANY(")
            .push_bind(state_names(&filter.states))
            .push(")");
    }
    if !filter.types.is_empty() {
        let types: Vec<String> = filter
            .types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        builder.push(" AND type = ANY(").push_bind(types).push(")");
    }
    if !filter.instance_ids.is_empty() {
        let instances: Vec<String> = filter
            .instance_ids
            .iter()
            .map(|i| i.value().to_string())
            .collect();
        builder
            .push(" AND instance_id = ANY(")
            .push_bind(instances)
            .push(")");
    }
    if let Some(campaign_id) = &filter.campaign_id {
        builder
            .push(" AND campaign_id = ")
            .push_bind(campaign_id.value().to_string());
    }
}

fn to_count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

impl OperationStorage for PgOperationStorage {
    fn insert<'a>(&'a self, operation: &'a Operation) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO operations (id, type, instance_id, state, version, finished_stages, \
                 created_at, updated_at, campaign_id, payload, description) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(operation.id.value())
            .bind(operation.operation_type.as_str())
            .bind(operation.instance_id.value())
            .bind(operation.state.as_str())
            .bind(operation.version)
            .bind(operation.finished_stages.as_slice().to_vec())
            .bind(operation.created_at)
            .bind(operation.updated_at)
            .bind(operation.campaign_id.as_ref().map(|c| c.value().to_string()))
            .bind(Json(&operation.payload))
            .bind(&operation.description)
            .execute(self.pool())
            .await
            .map(|_result| ())
            .map_err(|e| match StorageError::from(e) {
                StorageError::AlreadyExists(_) => {
                    StorageError::AlreadyExists(format!("operation {}", operation.id))
                }
                other => other,
            })
        })
    }

    fn update<'a>(&'a self, operation: &'a Operation) -> StorageFuture<'a, Operation> {
        Box::pin(async move {
            let sql = format!(
                "UPDATE operations SET state = $3, finished_stages = $4, campaign_id = $5, \
                 payload = $6, description = $7, version = version + 1, updated_at = NOW() \
                 WHERE id = $1 AND version = $2 RETURNING {OPERATION_COLUMNS}"
            );
            let row = sqlx::query(&sql)
                .bind(operation.id.value())
                .bind(operation.version)
                .bind(operation.state.as_str())
                .bind(operation.finished_stages.as_slice().to_vec())
                .bind(operation.campaign_id.as_ref().map(|c| c.value().to_string()))
                .bind(Json(&operation.payload))
                .bind(&operation.description)
                .fetch_optional(self.pool())
                .await
                .map_err(StorageError::from)?;

            match row {
                Some(row) => operation_from_row(&row),
                None => Err(self.diagnose_missed_update(operation).await),
            }
        })
    }

    fn get_by_id<'a>(&'a self, id: &'a OperationId) -> StorageFuture<'a, Operation> {
        Box::pin(self.fetch_by_id(id))
    }

    fn get_by_instance_id<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Operation> {
        Box::pin(self.fetch_latest(by_instance(instance_id), move || {
            format!("operation for instance {instance_id}")
        }))
    }

    fn get_last_operation<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Operation> {
        Box::pin(async move {
            let mut query = by_instance(instance_id);
            query
                .push(" AND state <> ")
                .push_bind(OperationState::Pending.as_str());
            self.fetch_latest(query, || {
                format!("last operation for instance {instance_id}")
            })
            .await
        })
    }

    fn list_by_instance_id<'a>(
        &'a self,
        instance_id: &'a InstanceId,
    ) -> StorageFuture<'a, Vec<Operation>> {
        Box::pin(self.fetch_ordered(by_instance(instance_id)))
    }

    fn get_not_finished_by_type(
        &self,
        operation_type: OperationType,
    ) -> StorageFuture<'_, Vec<Operation>> {
        let mut query = select_where();
        query
            .push("type = ")
            .push_bind(operation_type.as_str())
            .push(" AND state = ANY(")
            .push_bind(state_names(&OperationState::NOT_FINISHED))
            .push(")");
        Box::pin(self.fetch_ordered(query))
    }

    fn get_for_ids<'a>(&'a self, ids: &'a [OperationId]) -> StorageFuture<'a, Vec<Operation>> {
        let ids: Vec<String> = ids.iter().map(|id| id.value().to_string()).collect();
        let mut query = select_where();
        query.push("id = ANY(").push_bind(ids).push(")");
        Box::pin(self.fetch_ordered(query))
    }

    fn list_in_time_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<Operation>> {
        let mut query = select_where();
        query
            .push("created_at BETWEEN ")
            .push_bind(from)
            .push(" AND ")
            .push_bind(to);
        Box::pin(self.fetch_ordered(query))
    }

    fn list<'a>(&'a self, filter: &'a OperationFilter) -> StorageFuture<'a, Page<Operation>> {
        Box::pin(async move {
            let mut count_query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM operations");
            push_filter(&mut count_query, filter);
            let total = count_query
                .build_query_scalar::<i64>()
                .fetch_one(self.pool())
                .await
                .map_err(StorageError::from)?;

            let mut page_query = QueryBuilder::<Postgres>::new(format!(
                "SELECT {OPERATION_COLUMNS} FROM operations"
            ));
            push_filter(&mut page_query, filter);
            page_query
                .push(" ORDER BY created_at ASC, id ASC LIMIT ")
                .push_bind(i64::from(filter.page_size))
                .push(" OFFSET ")
                .push_bind(i64::try_from(filter.offset()).unwrap_or(i64::MAX));
            let rows = page_query
                .build()
                .fetch_all(self.pool())
                .await
                .map_err(StorageError::from)?;
            let data = operations_from_rows(&rows)?;

            Ok(Page {
                count: data.len(),
                data,
                total_count: to_count(total),
            })
        })
    }

    fn list_by_campaign<'a>(
        &'a self,
        campaign_id: &'a CampaignId,
    ) -> StorageFuture<'a, Vec<Operation>> {
        let mut query = select_where();
        query
            .push("campaign_id = ")
            .push_bind(campaign_id.value().to_string());
        Box::pin(self.fetch_ordered(query))
    }
}
