use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use hcm_core::collaborators::{BatchContext, ErrorReport, ErrorSink};
use hcm_core::error::EntityError;

use crate::to_rfc3339;

/// Stores rejected bulk entities together with their payload and errors.
#[derive(Clone)]
pub struct ErrorDetailsRepository {
    pool: SqlitePool,
}

impl ErrorDetailsRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Writes every report of one batch in a single transaction.
    pub async fn insert(
        &self,
        context: &BatchContext,
        reports: &[ErrorReport],
    ) -> Result<usize, ErrorDetailsError> {
        let created_at = to_rfc3339(Utc::now());
        let mut tx = self.pool.begin().await?;
        for report in reports {
            let payload_json = serde_json::to_string(&report.payload)?;
            let errors_json = serde_json::to_string(&report.errors)?;
            sqlx::query(
                "INSERT INTO error_details \
                 (id, entity_type, operation, api_id, user_id, tenant_id, batch_index, entity_id, client_reference_id, payload_json, errors_json, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(context.entity_type)
            .bind(context.operation.as_str())
            .bind(context.request_info.api_id.as_deref())
            .bind(context.request_info.user_id())
            .bind(&report.tenant_id)
            .bind(report.index as i64)
            .bind(report.id.as_deref())
            .bind(report.client_reference_id.as_deref())
            .bind(payload_json)
            .bind(errors_json)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(reports.len())
    }

    /// Lists stored rejections for a tenant and entity type, oldest first.
    pub async fn list_for_tenant(
        &self,
        tenant_id: &str,
        entity_type: &str,
    ) -> Result<Vec<ErrorDetailRecord>, ErrorDetailsError> {
        let rows = sqlx::query_as::<_, ErrorDetailRecord>(
            "SELECT id, entity_type, operation, api_id, user_id, tenant_id, batch_index, entity_id, \
                    client_reference_id, payload_json, errors_json, created_at \
               FROM error_details \
              WHERE tenant_id = ? AND entity_type = ? \
              ORDER BY created_at ASC, batch_index ASC",
        )
        .bind(tenant_id)
        .bind(entity_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl ErrorSink for ErrorDetailsRepository {
    async fn report(&self, context: &BatchContext, reports: Vec<ErrorReport>) {
        match self.insert(context, &reports).await {
            Ok(stored) => tracing::debug!(
                stage = "errors",
                entity_type = context.entity_type,
                operation = context.operation.as_str(),
                stored,
                "stored rejected entities"
            ),
            Err(err) => {
                counter!("error_details_write_failures_total", "entity_type" => context.entity_type)
                    .increment(1);
                tracing::error!(
                    stage = "errors",
                    entity_type = context.entity_type,
                    operation = context.operation.as_str(),
                    dropped = reports.len(),
                    error = %err,
                    "failed to store rejected entities"
                );
            }
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ErrorDetailRecord {
    pub id: String,
    pub entity_type: String,
    pub operation: String,
    pub api_id: Option<String>,
    pub user_id: String,
    pub tenant_id: String,
    pub batch_index: i64,
    pub entity_id: Option<String>,
    pub client_reference_id: Option<String>,
    pub payload_json: String,
    pub errors_json: String,
    pub created_at: DateTime<Utc>,
}

impl ErrorDetailRecord {
    pub fn errors(&self) -> Result<Vec<EntityError>, serde_json::Error> {
        serde_json::from_str(&self.errors_json)
    }
}

#[derive(Debug, Error)]
pub enum ErrorDetailsError {
    #[error("failed to encode error details: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
