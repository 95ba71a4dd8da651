//! Relational persistence: live target schema discovery, the mapping store
//! (documents, mappings, execution log, reconciliation) and history queries.
//!
//! SQL is runtime-checked (`sqlx::query`), so building the crate never needs
//! a database.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use smap_core::{
    ApprovalStatus, CandidateFlag, CandidateMapping, DocumentFormat, DocumentStatus,
    ExecutionRecord, ExecutionStatus, HistoricalMapping, Mapping, ReconciliationResult,
    RowCounts, SourceDocument, TargetColumn, TargetSchema, UnknownVariant,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "smap-db";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn connect(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(database_url)
        .await
        .context("connecting to DATABASE_URL")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await.context("applying migrations")?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("target schema unavailable: {0}")]
    Unavailable(String),
}

/// Where the relational target schema comes from.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn fetch(&self) -> Result<TargetSchema, SchemaError>;
}

const SCHEMA_COLUMNS_SQL: &str = r#"
    SELECT c.table_name::text AS table_name,
           c.column_name::text AS column_name,
           c.data_type::text AS data_type,
           (c.is_nullable = 'YES') AS nullable,
           c.ordinal_position::int4 AS ordinal_position,
           col_description(
               format('%I.%I', c.table_schema, c.table_name)::regclass::oid,
               c.ordinal_position::int4
           ) AS description
      FROM information_schema.columns c
     WHERE lower(c.table_schema) = lower($1)
     ORDER BY c.table_name, c.ordinal_position
"#;

/// Reads `information_schema.columns` on every call; callers decide how
/// long a snapshot lives.
#[derive(Debug, Clone)]
pub struct PgSchemaFetcher {
    pool: PgPool,
    schema_name: String,
    timeout: Duration,
}

impl PgSchemaFetcher {
    pub fn new(pool: PgPool, schema_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            schema_name: schema_name.into(),
            timeout,
        }
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }
}

fn catalog_error(err: sqlx::Error) -> SchemaError {
    SchemaError::Unavailable(err.to_string())
}

#[async_trait]
impl SchemaSource for PgSchemaFetcher {
    async fn fetch(&self) -> Result<TargetSchema, SchemaError> {
        let query = sqlx::query(SCHEMA_COLUMNS_SQL)
            .bind(&self.schema_name)
            .fetch_all(&self.pool);
        let rows = tokio::time::timeout(self.timeout, query)
            .await
            .map_err(|_| {
                SchemaError::Unavailable(format!(
                    "catalog query timed out after {:?}",
                    self.timeout
                ))
            })?
            .map_err(catalog_error)?;

        if rows.is_empty() {
            return Err(SchemaError::Unavailable(format!(
                "no columns found in schema {}",
                self.schema_name
            )));
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(TargetColumn {
                table: row.try_get("table_name").map_err(catalog_error)?,
                column: row.try_get("column_name").map_err(catalog_error)?,
                data_type: row.try_get("data_type").map_err(catalog_error)?,
                nullable: row.try_get("nullable").map_err(catalog_error)?,
                ordinal_position: row.try_get("ordinal_position").map_err(catalog_error)?,
                description: row.try_get("description").map_err(catalog_error)?,
            });
        }
        let schema = TargetSchema::new(columns);
        info!(
            schema = %self.schema_name,
            tables = schema.tables().len(),
            columns = schema.len(),
            "target schema fetched"
        );
        Ok(schema)
    }
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    tables: Vec<TableSpec>,
}

#[derive(Debug, Deserialize)]
struct TableSpec {
    name: String,
    columns: Vec<ColumnSpec>,
}

#[derive(Debug, Deserialize)]
struct ColumnSpec {
    name: String,
    data_type: String,
    #[serde(default = "default_nullable")]
    nullable: bool,
    #[serde(default)]
    description: Option<String>,
}

fn default_nullable() -> bool {
    true
}

/// Fixed schema loaded from YAML, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaSource {
    schema: TargetSchema,
}

impl StaticSchemaSource {
    pub fn new(schema: TargetSchema) -> Self {
        Self { schema }
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let parsed: SchemaFile = serde_yaml::from_str(text).context("parsing schema yaml")?;
        let columns = parsed
            .tables
            .into_iter()
            .flat_map(|table| {
                let table_name = table.name;
                table
                    .columns
                    .into_iter()
                    .enumerate()
                    .map(move |(idx, column)| TargetColumn {
                        table: table_name.clone(),
                        column: column.name,
                        data_type: column.data_type,
                        nullable: column.nullable,
                        ordinal_position: i32::try_from(idx + 1).unwrap_or(i32::MAX),
                        description: column.description,
                    })
            })
            .collect::<Vec<_>>();
        Ok(Self::new(TargetSchema::new(columns)))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn fetch(&self) -> Result<TargetSchema, SchemaError> {
        if self.schema.is_empty() {
            return Err(SchemaError::Unavailable(
                "static schema has no columns".to_string(),
            ));
        }
        Ok(self.schema.clone())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// Partial update of a staged document. `metadata` is merged key by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentUpdate {
    pub status: Option<DocumentStatus>,
    pub format: Option<DocumentFormat>,
    pub product_code: Option<String>,
    pub product_confidence: Option<f64>,
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingFilter {
    pub document_id: Option<Uuid>,
    pub approval_status: Option<ApprovalStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalDecision {
    pub status: ApprovalStatus,
    pub approver: String,
    pub notes: Option<String>,
    pub decided_at: chrono::DateTime<chrono::Utc>,
}

/// Decided mappings, preferring those recorded against `schema_signature`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub schema_signature: Option<String>,
    pub limit: usize,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            schema_signature: None,
            limit: 500,
        }
    }
}

/// Persistence port for the mapping lifecycle. Status changes are
/// compare-and-set: they report whether the expected state was still current.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn insert_document(&self, document: &SourceDocument) -> Result<(), StoreError>;
    async fn update_document(&self, id: Uuid, update: &DocumentUpdate) -> Result<(), StoreError>;
    async fn get_document(&self, id: Uuid) -> Result<Option<SourceDocument>, StoreError>;

    /// All-or-nothing insert of new Pending mappings.
    async fn insert_mappings(&self, mappings: &[Mapping]) -> Result<(), StoreError>;
    async fn get_mapping(&self, id: Uuid) -> Result<Option<Mapping>, StoreError>;
    async fn list_mappings(&self, filter: &MappingFilter) -> Result<Vec<Mapping>, StoreError>;
    async fn transition_approval(
        &self,
        id: Uuid,
        expected: ApprovalStatus,
        decision: &ApprovalDecision,
    ) -> Result<Option<Mapping>, StoreError>;

    /// Moves an Approved mapping from `expected` to Running and appends the
    /// Running record.
    async fn begin_execution(
        &self,
        record: &ExecutionRecord,
        expected: ExecutionStatus,
    ) -> Result<bool, StoreError>;
    /// Appends a terminal record superseding the mapping's latest Running
    /// record and moves the mapping to the record's status.
    async fn complete_execution(&self, record: &ExecutionRecord) -> Result<bool, StoreError>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, StoreError>;
    async fn list_executions(&self, mapping_id: Uuid) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn insert_reconciliation(&self, result: &ReconciliationResult) -> Result<(), StoreError>;
    async fn list_reconciliations(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ReconciliationResult>, StoreError>;

    async fn relevant_history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<HistoricalMapping>, StoreError>;
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

fn count_to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_from_db(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = UnknownVariant>,
{
    let text: String = row.try_get(column)?;
    Ok(text.parse::<T>()?)
}

const DOCUMENT_COLUMNS: &str = "document_id, filename, product_code, product_confidence, content, \
     content_hash, format, status, metadata, uploaded_at";

const MAPPING_COLUMNS: &str = "mapping_id, candidate_id, document_id, source_node, target_table, \
     target_column, transformation_logic, confidence_score, flags, reasoning, schema_signature, \
     generated_at, approval_status, approved_by, reviewer_notes, decided_at, execution_status, \
     supersedes_mapping_id, created_at";

const EXECUTION_COLUMNS: &str = "execution_id, mapping_id, target_table, attempt, execution_start, \
     execution_end, records_processed, records_inserted, records_updated, records_failed, \
     execution_status, error_message, executed_by, supersedes_execution_id";

const RECONCILIATION_COLUMNS: &str = "recon_id, execution_id, source_count, target_count, \
     match_count, mismatch_count, missing_in_target, extra_in_target, reconciliation_status, \
     details, created_at";

fn document_from_row(row: &PgRow) -> Result<SourceDocument, StoreError> {
    let format: Option<String> = row.try_get("format")?;
    Ok(SourceDocument {
        id: row.try_get("document_id")?,
        filename: row.try_get("filename")?,
        format: format.map(|f| f.parse::<DocumentFormat>()).transpose()?,
        product_code: row.try_get("product_code")?,
        product_confidence: row.try_get("product_confidence")?,
        content: row.try_get("content")?,
        content_hash: row.try_get("content_hash")?,
        uploaded_at: row.try_get("uploaded_at")?,
        status: parse_column(row, "status")?,
        metadata: row.try_get("metadata")?,
    })
}

fn mapping_from_row(row: &PgRow) -> Result<Mapping, StoreError> {
    let flags: JsonValue = row.try_get("flags")?;
    let flags: Vec<CandidateFlag> = serde_json::from_value(flags)
        .map_err(|err| StoreError::Corrupt(format!("flags: {err}")))?;
    let generated_at = row.try_get("generated_at")?;
    Ok(Mapping {
        id: row.try_get("mapping_id")?,
        candidate: CandidateMapping {
            id: row.try_get("candidate_id")?,
            document_id: row.try_get("document_id")?,
            source_path: row.try_get("source_node")?,
            target_table: row.try_get("target_table")?,
            target_column: row.try_get("target_column")?,
            transformation: row.try_get("transformation_logic")?,
            confidence: row.try_get("confidence_score")?,
            rationale: row.try_get("reasoning")?,
            generated_at,
            flags,
        },
        schema_signature: row.try_get("schema_signature")?,
        approval_status: parse_column(row, "approval_status")?,
        approver: row.try_get("approved_by")?,
        decided_at: row.try_get("decided_at")?,
        reviewer_notes: row.try_get("reviewer_notes")?,
        execution_status: parse_column(row, "execution_status")?,
        supersedes: row.try_get("supersedes_mapping_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRecord, StoreError> {
    let attempt: i32 = row.try_get("attempt")?;
    Ok(ExecutionRecord {
        id: row.try_get("execution_id")?,
        mapping_id: row.try_get("mapping_id")?,
        target_table: row.try_get("target_table")?,
        attempt: u32::try_from(attempt)
            .map_err(|_| StoreError::Corrupt(format!("attempt: {attempt}")))?,
        counts: RowCounts {
            processed: count_from_db(row, "records_processed")?,
            inserted: count_from_db(row, "records_inserted")?,
            updated: count_from_db(row, "records_updated")?,
            failed: count_from_db(row, "records_failed")?,
        },
        started_at: row.try_get("execution_start")?,
        finished_at: row.try_get("execution_end")?,
        status: parse_column(row, "execution_status")?,
        error: row.try_get("error_message")?,
        executor: row.try_get("executed_by")?,
        supersedes: row.try_get("supersedes_execution_id")?,
    })
}

fn reconciliation_from_row(row: &PgRow) -> Result<ReconciliationResult, StoreError> {
    Ok(ReconciliationResult {
        id: row.try_get("recon_id")?,
        execution_id: row.try_get("execution_id")?,
        source_count: count_from_db(row, "source_count")?,
        target_count: count_from_db(row, "target_count")?,
        match_count: count_from_db(row, "match_count")?,
        mismatch_count: count_from_db(row, "mismatch_count")?,
        missing_in_target: count_from_db(row, "missing_in_target")?,
        extra_in_target: count_from_db(row, "extra_in_target")?,
        status: parse_column(row, "reconciliation_status")?,
        details: row.try_get("details")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Postgres adapter for [`MappingStore`]. Every call is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct PgMappingStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgMappingStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_execution_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        record: &ExecutionRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO etl_execution_log (
                execution_id, mapping_id, target_table, attempt, execution_start,
                execution_end, records_processed, records_inserted, records_updated,
                records_failed, execution_status, error_message, executed_by,
                supersedes_execution_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record.id)
        .bind(record.mapping_id)
        .bind(&record.target_table)
        .bind(i32::try_from(record.attempt).unwrap_or(i32::MAX))
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(count_to_db(record.counts.processed))
        .bind(count_to_db(record.counts.inserted))
        .bind(count_to_db(record.counts.updated))
        .bind(count_to_db(record.counts.failed))
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(&record.executor)
        .bind(record.supersedes)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn insert_document(&self, document: &SourceDocument) -> Result<(), StoreError> {
        bounded(self.timeout, async {
            sqlx::query(
                r#"
                INSERT INTO source_documents (
                    document_id, filename, product_code, product_confidence, content,
                    content_hash, format, status, metadata, uploaded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(document.id)
            .bind(&document.filename)
            .bind(&document.product_code)
            .bind(document.product_confidence)
            .bind(&document.content)
            .bind(&document.content_hash)
            .bind(document.format.map(|f| f.as_str()))
            .bind(document.status.as_str())
            .bind(&document.metadata)
            .bind(document.uploaded_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn update_document(&self, id: Uuid, update: &DocumentUpdate) -> Result<(), StoreError> {
        bounded(self.timeout, async {
            let result = sqlx::query(
                r#"
                UPDATE source_documents
                   SET status = COALESCE($2, status),
                       format = COALESCE($3, format),
                       product_code = COALESCE($4, product_code),
                       product_confidence = COALESCE($5, product_confidence),
                       metadata = metadata || COALESCE($6, '{}'::jsonb)
                 WHERE document_id = $1
                "#,
            )
            .bind(id)
            .bind(update.status.map(|s| s.as_str()))
            .bind(update.format.map(|f| f.as_str()))
            .bind(&update.product_code)
            .bind(update.product_confidence)
            .bind(&update.metadata)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::NotFound {
                    entity: "document",
                    id,
                });
            }
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<SourceDocument>, StoreError> {
        bounded(self.timeout, async {
            let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM source_documents WHERE document_id = $1");
            let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
            row.as_ref().map(document_from_row).transpose()
        })
        .await
    }

    async fn insert_mappings(&self, mappings: &[Mapping]) -> Result<(), StoreError> {
        if mappings.is_empty() {
            return Ok(());
        }
        bounded(self.timeout, async {
            let mut tx = self.pool.begin().await?;
            for mapping in mappings {
                let candidate = &mapping.candidate;
                let flags = serde_json::to_value(&candidate.flags)
                    .map_err(|err| StoreError::Corrupt(format!("flags: {err}")))?;
                sqlx::query(
                    r#"
                    INSERT INTO generated_mappings (
                        mapping_id, candidate_id, document_id, source_node, target_table,
                        target_column, transformation_logic, confidence_score, flags,
                        reasoning, schema_signature, generated_at, approval_status,
                        approved_by, reviewer_notes, decided_at, execution_status,
                        supersedes_mapping_id, created_at
                    ) VALUES (
                        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                        $11, $12, $13, $14, $15, $16, $17, $18, $19
                    )
                    "#,
                )
                .bind(mapping.id)
                .bind(candidate.id)
                .bind(candidate.document_id)
                .bind(&candidate.source_path)
                .bind(&candidate.target_table)
                .bind(&candidate.target_column)
                .bind(&candidate.transformation)
                .bind(candidate.confidence)
                .bind(&flags)
                .bind(&candidate.rationale)
                .bind(&mapping.schema_signature)
                .bind(candidate.generated_at)
                .bind(mapping.approval_status.as_str())
                .bind(&mapping.approver)
                .bind(&mapping.reviewer_notes)
                .bind(mapping.decided_at)
                .bind(mapping.execution_status.as_str())
                .bind(mapping.supersedes)
                .bind(mapping.created_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            debug!(count = mappings.len(), "mappings inserted");
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn get_mapping(&self, id: Uuid) -> Result<Option<Mapping>, StoreError> {
        bounded(self.timeout, async {
            let sql = format!("SELECT {MAPPING_COLUMNS} FROM generated_mappings WHERE mapping_id = $1");
            let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
            row.as_ref().map(mapping_from_row).transpose()
        })
        .await
    }

    async fn list_mappings(&self, filter: &MappingFilter) -> Result<Vec<Mapping>, StoreError> {
        bounded(self.timeout, async {
            let sql = format!(
                r#"
                SELECT {MAPPING_COLUMNS}
                  FROM generated_mappings
                 WHERE ($1::uuid IS NULL OR document_id = $1)
                   AND ($2::text IS NULL OR approval_status = $2)
                 ORDER BY created_at, confidence_score DESC, mapping_id
                 LIMIT $3
                "#
            );
            let rows = sqlx::query(&sql)
                .bind(filter.document_id)
                .bind(filter.approval_status.map(|s| s.as_str()))
                .bind(filter.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(mapping_from_row).collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn transition_approval(
        &self,
        id: Uuid,
        expected: ApprovalStatus,
        decision: &ApprovalDecision,
    ) -> Result<Option<Mapping>, StoreError> {
        bounded(self.timeout, async {
            let sql = format!(
                r#"
                UPDATE generated_mappings
                   SET approval_status = $3,
                       approved_by = $4,
                       reviewer_notes = $5,
                       decided_at = $6
                 WHERE mapping_id = $1
                   AND approval_status = $2
                RETURNING {MAPPING_COLUMNS}
                "#
            );
            let row = sqlx::query(&sql)
                .bind(id)
                .bind(expected.as_str())
                .bind(decision.status.as_str())
                .bind(&decision.approver)
                .bind(&decision.notes)
                .bind(decision.decided_at)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(mapping_from_row).transpose()
        })
        .await
    }

    async fn begin_execution(
        &self,
        record: &ExecutionRecord,
        expected: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        bounded(self.timeout, async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                UPDATE generated_mappings
                   SET execution_status = $3
                 WHERE mapping_id = $1
                   AND approval_status = $4
                   AND execution_status = $2
                "#,
            )
            .bind(record.mapping_id)
            .bind(expected.as_str())
            .bind(ExecutionStatus::Running.as_str())
            .bind(ApprovalStatus::Approved.as_str())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Ok(false);
            }
            Self::insert_execution_row(&mut tx, record).await?;
            tx.commit().await?;
            Ok::<_, StoreError>(true)
        })
        .await
    }

    async fn complete_execution(&self, record: &ExecutionRecord) -> Result<bool, StoreError> {
        let running_id = record.supersedes.ok_or_else(|| {
            StoreError::Conflict("terminal execution record must supersede a running record".into())
        })?;
        bounded(self.timeout, async {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                r#"
                UPDATE generated_mappings
                   SET execution_status = $2
                 WHERE mapping_id = $1
                   AND execution_status = $3
                   AND (
                       SELECT l.execution_id
                         FROM etl_execution_log l
                        WHERE l.mapping_id = $1
                        ORDER BY l.execution_start DESC, l.logged_at DESC
                        LIMIT 1
                   ) = $4
                "#,
            )
            .bind(record.mapping_id)
            .bind(record.status.as_str())
            .bind(ExecutionStatus::Running.as_str())
            .bind(running_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Ok(false);
            }
            Self::insert_execution_row(&mut tx, record).await?;
            tx.commit().await?;
            Ok::<_, StoreError>(true)
        })
        .await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, StoreError> {
        bounded(self.timeout, async {
            let sql = format!("SELECT {EXECUTION_COLUMNS} FROM etl_execution_log WHERE execution_id = $1");
            let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
            row.as_ref().map(execution_from_row).transpose()
        })
        .await
    }

    async fn list_executions(&self, mapping_id: Uuid) -> Result<Vec<ExecutionRecord>, StoreError> {
        bounded(self.timeout, async {
            let sql = format!(
                "SELECT {EXECUTION_COLUMNS} FROM etl_execution_log WHERE mapping_id = $1 \
                 ORDER BY execution_start, logged_at"
            );
            let rows = sqlx::query(&sql).bind(mapping_id).fetch_all(&self.pool).await?;
            rows.iter().map(execution_from_row).collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn insert_reconciliation(&self, result: &ReconciliationResult) -> Result<(), StoreError> {
        bounded(self.timeout, async {
            sqlx::query(
                r#"
                INSERT INTO reconciliation_results (
                    recon_id, execution_id, source_count, target_count, match_count,
                    mismatch_count, missing_in_target, extra_in_target,
                    reconciliation_status, details, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(result.id)
            .bind(result.execution_id)
            .bind(count_to_db(result.source_count))
            .bind(count_to_db(result.target_count))
            .bind(count_to_db(result.match_count))
            .bind(count_to_db(result.mismatch_count))
            .bind(count_to_db(result.missing_in_target))
            .bind(count_to_db(result.extra_in_target))
            .bind(result.status.as_str())
            .bind(&result.details)
            .bind(result.created_at)
            .execute(&self.pool)
            .await?;
            Ok::<_, StoreError>(())
        })
        .await
    }

    async fn list_reconciliations(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ReconciliationResult>, StoreError> {
        bounded(self.timeout, async {
            let sql = format!(
                "SELECT {RECONCILIATION_COLUMNS} FROM reconciliation_results \
                 WHERE execution_id = $1 ORDER BY created_at"
            );
            let rows = sqlx::query(&sql).bind(execution_id).fetch_all(&self.pool).await?;
            rows.iter().map(reconciliation_from_row).collect::<Result<Vec<_>, _>>()
        })
        .await
    }

    async fn relevant_history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<HistoricalMapping>, StoreError> {
        bounded(self.timeout, async {
            let rows = sqlx::query(
                r#"
                SELECT m.mapping_id, m.source_node, m.target_table, m.target_column,
                       m.transformation_logic, m.approval_status, m.confidence_score,
                       m.schema_signature, m.decided_at
                  FROM generated_mappings m
                 WHERE m.approval_status IN ($3, $4)
                   AND NOT EXISTS (
                       SELECT 1
                         FROM generated_mappings s
                        WHERE s.supersedes_mapping_id = m.mapping_id
                          AND s.approval_status <> $5
                   )
                 ORDER BY COALESCE(m.schema_signature = $1, false) DESC,
                          m.decided_at DESC NULLS LAST
                 LIMIT $2
                "#,
            )
            .bind(&query.schema_signature)
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .bind(ApprovalStatus::Approved.as_str())
            .bind(ApprovalStatus::Rejected.as_str())
            .bind(ApprovalStatus::Pending.as_str())
            .fetch_all(&self.pool)
            .await?;

            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                out.push(HistoricalMapping {
                    mapping_id: row.try_get("mapping_id")?,
                    source_path: row.try_get("source_node")?,
                    target_table: row.try_get("target_table")?,
                    target_column: row.try_get("target_column")?,
                    transformation: row.try_get("transformation_logic")?,
                    approval_status: parse_column(row, "approval_status")?,
                    confidence: row.try_get("confidence_score")?,
                    schema_signature: row.try_get("schema_signature")?,
                    decided_at: row.try_get("decided_at")?,
                });
            }
            Ok::<_, StoreError>(out)
        })
        .await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<Uuid, SourceDocument>,
    mappings: Vec<Mapping>,
    executions: Vec<ExecutionRecord>,
    reconciliations: Vec<ReconciliationResult>,
}

impl MemoryState {
    fn mapping_mut(&mut self, id: Uuid) -> Option<&mut Mapping> {
        self.mappings.iter_mut().find(|m| m.id == id)
    }

    fn latest_execution(&self, mapping_id: Uuid) -> Option<&ExecutionRecord> {
        self.executions.iter().rev().find(|e| e.mapping_id == mapping_id)
    }
}

fn merge_metadata(target: &mut JsonValue, patch: &JsonValue) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(existing), Some(patch)) => {
            for (key, value) in patch {
                existing.insert(key.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// In-process [`MappingStore`] with the same compare-and-set semantics as
/// the Postgres adapter.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn insert_document(&self, document: &SourceDocument) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.documents.contains_key(&document.id) {
            return Err(StoreError::Conflict(format!("document {} exists", document.id)));
        }
        state.documents.insert(document.id, document.clone());
        Ok(())
    }

    async fn update_document(&self, id: Uuid, update: &DocumentUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let document = state.documents.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "document",
            id,
        })?;
        if let Some(status) = update.status {
            document.status = status;
        }
        if let Some(format) = update.format {
            document.format = Some(format);
        }
        if let Some(code) = &update.product_code {
            document.product_code = Some(code.clone());
        }
        if let Some(confidence) = update.product_confidence {
            document.product_confidence = Some(confidence);
        }
        if let Some(metadata) = &update.metadata {
            merge_metadata(&mut document.metadata, metadata);
        }
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<SourceDocument>, StoreError> {
        Ok(self.state.lock().await.documents.get(&id).cloned())
    }

    async fn insert_mappings(&self, mappings: &[Mapping]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for (idx, mapping) in mappings.iter().enumerate() {
            if !state.documents.contains_key(&mapping.document_id()) {
                return Err(StoreError::Conflict(format!(
                    "mapping {} references unknown document {}",
                    mapping.id,
                    mapping.document_id()
                )));
            }
            let earlier = &mappings[..idx];
            let duplicate = state
                .mappings
                .iter()
                .chain(earlier)
                .any(|m| m.id == mapping.id || m.candidate.id == mapping.candidate.id);
            if duplicate {
                return Err(StoreError::Conflict(format!("mapping {} exists", mapping.id)));
            }
            if let Some(previous) = mapping.supersedes {
                let known = state.mappings.iter().chain(earlier).any(|m| m.id == previous);
                if !known {
                    return Err(StoreError::Conflict(format!(
                        "mapping {} supersedes unknown mapping {previous}",
                        mapping.id
                    )));
                }
            }
        }
        state.mappings.extend(mappings.iter().cloned());
        Ok(())
    }

    async fn get_mapping(&self, id: Uuid) -> Result<Option<Mapping>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.mappings.iter().find(|m| m.id == id).cloned())
    }

    async fn list_mappings(&self, filter: &MappingFilter) -> Result<Vec<Mapping>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .iter()
            .filter(|m| filter.document_id.map_or(true, |id| m.document_id() == id))
            .filter(|m| filter.approval_status.map_or(true, |s| m.approval_status == s))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn transition_approval(
        &self,
        id: Uuid,
        expected: ApprovalStatus,
        decision: &ApprovalDecision,
    ) -> Result<Option<Mapping>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(mapping) = state.mapping_mut(id) else {
            return Ok(None);
        };
        if mapping.approval_status != expected {
            return Ok(None);
        }
        mapping.approval_status = decision.status;
        mapping.approver = Some(decision.approver.clone());
        mapping.reviewer_notes = decision.notes.clone();
        mapping.decided_at = Some(decision.decided_at);
        Ok(Some(mapping.clone()))
    }

    async fn begin_execution(
        &self,
        record: &ExecutionRecord,
        expected: ExecutionStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(mapping) = state.mapping_mut(record.mapping_id) else {
            return Ok(false);
        };
        if mapping.approval_status != ApprovalStatus::Approved
            || mapping.execution_status != expected
        {
            return Ok(false);
        }
        mapping.execution_status = ExecutionStatus::Running;
        state.executions.push(record.clone());
        Ok(true)
    }

    async fn complete_execution(&self, record: &ExecutionRecord) -> Result<bool, StoreError> {
        let running_id = record.supersedes.ok_or_else(|| {
            StoreError::Conflict("terminal execution record must supersede a running record".into())
        })?;
        let mut state = self.state.lock().await;
        if state.latest_execution(record.mapping_id).map(|e| e.id) != Some(running_id) {
            return Ok(false);
        }
        let Some(mapping) = state.mapping_mut(record.mapping_id) else {
            return Ok(false);
        };
        if mapping.execution_status != ExecutionStatus::Running {
            return Ok(false);
        }
        mapping.execution_status = record.status;
        state.executions.push(record.clone());
        Ok(true)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.executions.iter().find(|e| e.id == id).cloned())
    }

    async fn list_executions(&self, mapping_id: Uuid) -> Result<Vec<ExecutionRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .executions
            .iter()
            .filter(|e| e.mapping_id == mapping_id)
            .cloned()
            .collect())
    }

    async fn insert_reconciliation(&self, result: &ReconciliationResult) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if !state.executions.iter().any(|e| e.id == result.execution_id) {
            return Err(StoreError::NotFound {
                entity: "execution",
                id: result.execution_id,
            });
        }
        state.reconciliations.push(result.clone());
        Ok(())
    }

    async fn list_reconciliations(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ReconciliationResult>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .reconciliations
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn relevant_history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<HistoricalMapping>, StoreError> {
        let state = self.state.lock().await;
        let corrected = |id: Uuid| {
            state
                .mappings
                .iter()
                .any(|m| m.supersedes == Some(id) && m.approval_status != ApprovalStatus::Pending)
        };
        let mut decided = state
            .mappings
            .iter()
            .filter(|m| m.approval_status != ApprovalStatus::Pending)
            .filter(|m| !corrected(m.id))
            .map(HistoricalMapping::from_mapping)
            .collect::<Vec<_>>();
        decided.sort_by(|a, b| {
            let a_current = query.schema_signature.as_deref() == Some(a.schema_signature.as_str());
            let b_current = query.schema_signature.as_deref() == Some(b.schema_signature.as_str());
            b_current
                .cmp(&a_current)
                .then_with(|| b.decided_at.cmp(&a.decided_at))
        });
        decided.truncate(query.limit);
        Ok(decided)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn ts(minute: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn document() -> SourceDocument {
        SourceDocument::from_bytes("policy.xml", b"<Policy/>", Some(DocumentFormat::Xml), ts(0))
    }

    fn mapping(document_id: Uuid, path: &str, signature: &str) -> Mapping {
        let candidate = CandidateMapping {
            id: Uuid::new_v4(),
            document_id,
            source_path: path.to_string(),
            target_table: "POLICY".to_string(),
            target_column: "POLICY_NUMBER".to_string(),
            transformation: None,
            confidence: 0.9,
            rationale: "name match".to_string(),
            generated_at: ts(1),
            flags: vec![],
        };
        Mapping::pending(candidate, signature, ts(1))
    }

    fn decision(status: ApprovalStatus, minute: u32) -> ApprovalDecision {
        ApprovalDecision {
            status,
            approver: "reviewer".to_string(),
            notes: None,
            decided_at: ts(minute),
        }
    }

    fn execution(mapping_id: Uuid, status: ExecutionStatus, supersedes: Option<Uuid>) -> ExecutionRecord {
        ExecutionRecord {
            id: Uuid::new_v4(),
            mapping_id,
            target_table: "POLICY".to_string(),
            attempt: 1,
            counts: RowCounts::default(),
            started_at: ts(5),
            finished_at: None,
            status,
            error: None,
            executor: "etl".to_string(),
            supersedes,
        }
    }

    async fn seeded() -> (MemoryStore, SourceDocument) {
        let store = MemoryStore::new();
        let doc = document();
        store.insert_document(&doc).await.expect("insert document");
        (store, doc)
    }

    #[tokio::test]
    async fn approval_is_compare_and_set() {
        let (store, doc) = seeded().await;
        let m = mapping(doc.id, "/Policy/Number", "sig");
        store.insert_mappings(std::slice::from_ref(&m)).await.expect("insert");

        let approved = store
            .transition_approval(m.id, ApprovalStatus::Pending, &decision(ApprovalStatus::Approved, 2))
            .await
            .expect("transition");
        assert_eq!(approved.map(|m| m.approval_status), Some(ApprovalStatus::Approved));

        let again = store
            .transition_approval(m.id, ApprovalStatus::Pending, &decision(ApprovalStatus::Rejected, 3))
            .await
            .expect("transition");
        assert!(again.is_none());
        let stored = store.get_mapping(m.id).await.expect("get").expect("exists");
        assert_eq!(stored.approval_status, ApprovalStatus::Approved);
        assert_eq!(stored.decided_at, Some(ts(2)));
    }

    #[tokio::test]
    async fn mappings_require_known_document_and_unique_candidates() {
        let (store, doc) = seeded().await;
        let orphan = mapping(Uuid::new_v4(), "/X", "sig");
        assert!(matches!(
            store.insert_mappings(&[orphan]).await,
            Err(StoreError::Conflict(_))
        ));

        let m = mapping(doc.id, "/Policy/Number", "sig");
        let mut dup = mapping(doc.id, "/Policy/Other", "sig");
        dup.candidate.id = m.candidate.id;
        assert!(store.insert_mappings(&[m, dup]).await.is_err());
        let listed = store
            .list_mappings(&MappingFilter {
                document_id: Some(doc.id),
                ..Default::default()
            })
            .await
            .expect("list");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn execution_requires_approval_and_closes_latest_running_record() {
        let (store, doc) = seeded().await;
        let m = mapping(doc.id, "/Policy/Number", "sig");
        store.insert_mappings(std::slice::from_ref(&m)).await.expect("insert");

        let running = execution(m.id, ExecutionStatus::Running, None);
        assert!(!store
            .begin_execution(&running, ExecutionStatus::NotStarted)
            .await
            .expect("begin"));

        store
            .transition_approval(m.id, ApprovalStatus::Pending, &decision(ApprovalStatus::Approved, 2))
            .await
            .expect("approve");
        assert!(store
            .begin_execution(&running, ExecutionStatus::NotStarted)
            .await
            .expect("begin"));

        let stray = execution(m.id, ExecutionStatus::Succeeded, Some(Uuid::new_v4()));
        assert!(!store.complete_execution(&stray).await.expect("complete"));

        let done = execution(m.id, ExecutionStatus::Succeeded, Some(running.id));
        assert!(store.complete_execution(&done).await.expect("complete"));
        assert!(!store.complete_execution(&done).await.expect("complete twice"));

        let stored = store.get_mapping(m.id).await.expect("get").expect("exists");
        assert_eq!(stored.execution_status, ExecutionStatus::Succeeded);
        let log = store.list_executions(m.id).await.expect("list");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, ExecutionStatus::Running);
        assert_eq!(log[1].supersedes, Some(running.id));
    }

    #[tokio::test]
    async fn history_prefers_current_schema_and_skips_pending_or_corrected() {
        let (store, doc) = seeded().await;
        let old_schema = mapping(doc.id, "/Policy/Number", "old");
        let current = mapping(doc.id, "/Policy/Premium", "sig");
        let pending = mapping(doc.id, "/Policy/Pending", "sig");
        let corrected = mapping(doc.id, "/Policy/Wrong", "sig");
        let mut correction = mapping(doc.id, "/Policy/Right", "sig");
        correction.supersedes = Some(corrected.id);
        store
            .insert_mappings(&[
                old_schema.clone(),
                current.clone(),
                pending,
                corrected.clone(),
                correction.clone(),
            ])
            .await
            .expect("insert");

        for (id, minute) in [(old_schema.id, 10), (current.id, 2), (corrected.id, 3), (correction.id, 4)] {
            store
                .transition_approval(id, ApprovalStatus::Pending, &decision(ApprovalStatus::Approved, minute))
                .await
                .expect("approve");
        }

        let history = store
            .relevant_history(&HistoryQuery {
                schema_signature: Some("sig".to_string()),
                limit: 10,
            })
            .await
            .expect("history");
        let paths = history.iter().map(|h| h.source_path.as_str()).collect::<Vec<_>>();
        assert_eq!(paths, vec!["/Policy/Right", "/Policy/Premium", "/Policy/Number"]);

        let limited = store
            .relevant_history(&HistoryQuery {
                schema_signature: None,
                limit: 1,
            })
            .await
            .expect("history");
        assert_eq!(limited[0].source_path, "/Policy/Number");
        assert!(limited[0].decided_at > Some(ts(0) + ChronoDuration::minutes(5)));
    }

    #[tokio::test]
    async fn document_updates_merge_metadata() {
        let (store, doc) = seeded().await;
        store
            .update_document(
                doc.id,
                &DocumentUpdate {
                    metadata: Some(serde_json::json!({"archive_path": "a/b.xml"})),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        store
            .update_document(
                doc.id,
                &DocumentUpdate {
                    status: Some(DocumentStatus::Failed),
                    metadata: Some(serde_json::json!({"stage": "normalize"})),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        let stored = store.get_document(doc.id).await.expect("get").expect("exists");
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert_eq!(stored.metadata["archive_path"], "a/b.xml");
        assert_eq!(stored.metadata["stage"], "normalize");

        let missing = store.update_document(Uuid::new_v4(), &DocumentUpdate::default()).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn static_schema_loads_tables_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("schema.yaml");
        std::fs::write(
            &path,
            r#"
tables:
  - name: POLICY
    columns:
      - { name: POLICY_NUMBER, data_type: varchar, nullable: false }
      - { name: PREMIUM, data_type: numeric }
  - name: INSURED
    columns:
      - { name: NAME, data_type: varchar, description: Primary insured }
"#,
        )
        .expect("write");
        let source = StaticSchemaSource::from_yaml_file(&path).expect("load");
        let schema = source.fetch().await.expect("fetch");
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.tables(), vec!["POLICY", "INSURED"]);
        let premium = schema.lookup("policy", "premium").expect("premium");
        assert_eq!(premium.ordinal_position, 2);
        assert!(premium.nullable);

        let empty = StaticSchemaSource::default().fetch().await;
        assert!(matches!(empty, Err(SchemaError::Unavailable(_))));
    }
}
