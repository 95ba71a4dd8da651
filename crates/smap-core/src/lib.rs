//! Core domain model for the schema mapping pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "smap-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Text round-tripping for enums persisted as TEXT columns.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Xml,
    Json,
    Csv,
    Html,
}

text_enum!(DocumentFormat {
    Xml => "xml",
    Json => "json",
    Csv => "csv",
    Html => "html",
});

impl DocumentFormat {
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Format hint from a file name extension, if it names a supported format.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "xml" => Some(Self::Xml),
            "json" => Some(Self::Json),
            "csv" | "tsv" | "txt" => Some(Self::Csv),
            "html" | "htm" => Some(Self::Html),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentStatus {
    Pending,
    Normalized,
    Mapped,
    PartiallyMapped,
    Failed,
}

text_enum!(DocumentStatus {
    Pending => "Pending",
    Normalized => "Normalized",
    Mapped => "Mapped",
    PartiallyMapped => "PartiallyMapped",
    Failed => "Failed",
});

/// Raw uploaded document as staged before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: Uuid,
    pub filename: String,
    pub format: Option<DocumentFormat>,
    pub product_code: Option<String>,
    pub product_confidence: Option<f64>,
    pub content: String,
    pub content_hash: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: DocumentStatus,
    pub metadata: JsonValue,
}

impl SourceDocument {
    pub fn from_bytes(
        filename: impl Into<String>,
        bytes: &[u8],
        format: Option<DocumentFormat>,
        uploaded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            format,
            product_code: None,
            product_confidence: None,
            content: String::from_utf8_lossy(bytes).into_owned(),
            content_hash: sha256_hex(bytes),
            uploaded_at,
            status: DocumentStatus::Pending,
            metadata: JsonValue::Object(Default::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveType {
    String,
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamp,
    Null,
}

/// Codes such as ZIPs or policy numbers keep their leading zeros.
fn is_zero_padded(value: &str) -> bool {
    let digits = value.strip_prefix(|c| c == '+' || c == '-').unwrap_or(value);
    let mut chars = digits.chars();
    chars.next() == Some('0') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

text_enum!(PrimitiveType {
    String => "string",
    Integer => "integer",
    Decimal => "decimal",
    Boolean => "boolean",
    Date => "date",
    Timestamp => "timestamp",
    Null => "null",
});

impl PrimitiveType {
    /// Infer the narrowest primitive type for a leaf value.
    pub fn infer(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || is_zero_padded(value) {
            return Self::String;
        }
        if value.parse::<i64>().is_ok() {
            return Self::Integer;
        }
        if value.chars().any(|c| c.is_ascii_digit())
            && value.parse::<f64>().map(f64::is_finite).unwrap_or(false)
        {
            return Self::Decimal;
        }
        if value.len() == 10 && NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok() {
            return Self::Date;
        }
        if DateTime::parse_from_rfc3339(value).is_ok()
            || NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").is_ok()
            || NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
        {
            return Self::Timestamp;
        }
        if matches!(
            value.to_ascii_lowercase().as_str(),
            "true" | "false" | "yes" | "no" | "y" | "n"
        ) {
            return Self::Boolean;
        }
        Self::String
    }

    /// Widen two observed types into one that holds both.
    pub fn widen(self, other: Self) -> Self {
        use PrimitiveType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, t) | (t, Null) => t,
            (Integer, Decimal) | (Decimal, Integer) => Decimal,
            (Date, Timestamp) | (Timestamp, Date) => Timestamp,
            _ => String,
        }
    }

    /// Whether a value of this type loads into a column of `target_type`
    /// (a SQL type name such as `NUMBER(10,2)` or `character varying`)
    /// without an explicit transformation.
    pub fn is_compatible_with(&self, target_type: &str) -> bool {
        let target = target_type
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let textual = matches!(
            target.as_str(),
            "varchar" | "character varying" | "text" | "string" | "char" | "character" | "bpchar"
        );
        if textual {
            return true;
        }
        let integral = matches!(
            target.as_str(),
            "int" | "integer" | "bigint" | "smallint" | "int2" | "int4" | "int8" | "number" | "numeric" | "decimal"
        );
        let fractional = matches!(
            target.as_str(),
            "float" | "float4" | "float8" | "double" | "double precision" | "real" | "decimal" | "numeric" | "number"
        );
        let temporal = target.starts_with("timestamp") || target == "datetime";
        match self {
            PrimitiveType::Null => true,
            PrimitiveType::String => false,
            PrimitiveType::Integer => integral || fractional,
            PrimitiveType::Decimal => fractional,
            PrimitiveType::Boolean => matches!(target.as_str(), "boolean" | "bool"),
            PrimitiveType::Date => target == "date" || temporal,
            PrimitiveType::Timestamp => temporal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum NodeValue {
    Leaf(String),
    Container,
}

/// Canonical, addressable unit of a normalized source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceNode {
    pub path: String,
    pub name: String,
    pub value: NodeValue,
    pub data_type: PrimitiveType,
    pub depth: usize,
}

impl SourceNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self.value, NodeValue::Leaf(_))
    }

    pub fn sample_value(&self) -> Option<&str> {
        match &self.value {
            NodeValue::Leaf(text) => Some(text.as_str()),
            NodeValue::Container => None,
        }
    }

    pub fn path_pattern(&self) -> String {
        path_pattern(&self.path)
    }
}

/// Strip positional `[n]` suffixes so repeated siblings share one pattern.
pub fn path_pattern(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '[' {
            let mut index = String::new();
            while let Some(&next) = chars.peek() {
                if next.is_ascii_digit() {
                    index.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            if chars.peek() == Some(&']') && !index.is_empty() {
                chars.next();
                continue;
            }
            out.push('[');
            out.push_str(&index);
            continue;
        }
        out.push(c);
    }
    out
}

/// Number of addressable segments in a node path.
pub fn path_depth(path: &str) -> usize {
    path.split('/').filter(|segment| !segment.is_empty()).count()
}

/// Document-level product classification from structural heuristics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProductGuess {
    pub product_code: Option<String>,
    pub confidence: f64,
    pub scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetColumn {
    pub table: String,
    pub column: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub ordinal_position: i32,
    #[serde(default)]
    pub description: Option<String>,
}

/// Snapshot of the relational target schema, ordered as fetched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<TargetColumn>", into = "Vec<TargetColumn>")]
pub struct TargetSchema {
    columns: Vec<TargetColumn>,
    index: BTreeMap<(String, String), usize>,
}

impl From<Vec<TargetColumn>> for TargetSchema {
    fn from(columns: Vec<TargetColumn>) -> Self {
        Self::new(columns)
    }
}

impl From<TargetSchema> for Vec<TargetColumn> {
    fn from(schema: TargetSchema) -> Self {
        schema.columns
    }
}

fn schema_key(table: &str, column: &str) -> (String, String) {
    (
        table.trim().to_ascii_uppercase(),
        column.trim().to_ascii_uppercase(),
    )
}

impl TargetSchema {
    /// Build a schema; later duplicates of a table+column key are ignored.
    pub fn new(columns: Vec<TargetColumn>) -> Self {
        let mut kept = Vec::with_capacity(columns.len());
        let mut index = BTreeMap::new();
        for column in columns {
            let key = schema_key(&column.table, &column.column);
            if index.contains_key(&key) {
                continue;
            }
            index.insert(key, kept.len());
            kept.push(column);
        }
        Self {
            columns: kept,
            index,
        }
    }

    pub fn columns(&self) -> &[TargetColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Case-insensitive lookup. A schema-qualified table (`SILVER.POLICY`)
    /// falls back to its last segment.
    pub fn lookup(&self, table: &str, column: &str) -> Option<&TargetColumn> {
        if let Some(&idx) = self.index.get(&schema_key(table, column)) {
            return self.columns.get(idx);
        }
        let (_, unqualified) = table.rsplit_once('.')?;
        self.index
            .get(&schema_key(unqualified, column))
            .and_then(|&idx| self.columns.get(idx))
    }

    pub fn contains(&self, table: &str, column: &str) -> bool {
        self.lookup(table, column).is_some()
    }

    pub fn tables(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for column in &self.columns {
            if !out.contains(&column.table.as_str()) {
                out.push(column.table.as_str());
            }
        }
        out
    }

    /// Stable digest of the schema shape, used to key mapping history.
    pub fn signature(&self) -> String {
        let mut lines = self
            .columns
            .iter()
            .map(|c| {
                format!(
                    "{}.{}:{}:{}",
                    c.table.to_ascii_uppercase(),
                    c.column.to_ascii_uppercase(),
                    c.data_type.to_ascii_lowercase(),
                    c.nullable
                )
            })
            .collect::<Vec<_>>();
        lines.sort();
        sha256_hex(lines.join("\n").as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateFlag {
    ConfidenceClamped,
    LowConfidence,
    TypeMismatch,
}

/// Model-proposed correspondence between a source node and a target column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMapping {
    pub id: Uuid,
    pub document_id: Uuid,
    pub source_path: String,
    pub target_table: String,
    pub target_column: String,
    pub transformation: Option<String>,
    pub confidence: f64,
    pub rationale: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub flags: Vec<CandidateFlag>,
}

impl CandidateMapping {
    pub fn is_identity(&self) -> bool {
        self.transformation
            .as_deref()
            .map(|t| t.trim().is_empty())
            .unwrap_or(true)
    }

    pub fn has_flag(&self, flag: CandidateFlag) -> bool {
        self.flags.contains(&flag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

text_enum!(ApprovalStatus {
    Pending => "Pending",
    Approved => "Approved",
    Rejected => "Rejected",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

text_enum!(ExecutionStatus {
    NotStarted => "NotStarted",
    Running => "Running",
    Succeeded => "Succeeded",
    Failed => "Failed",
});

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Lifecycle-tracked mapping wrapping exactly one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: Uuid,
    pub candidate: CandidateMapping,
    pub schema_signature: String,
    pub approval_status: ApprovalStatus,
    pub approver: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub reviewer_notes: Option<String>,
    pub execution_status: ExecutionStatus,
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Mapping {
    pub fn pending(
        candidate: CandidateMapping,
        schema_signature: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            candidate,
            schema_signature: schema_signature.into(),
            approval_status: ApprovalStatus::Pending,
            approver: None,
            decided_at: None,
            reviewer_notes: None,
            execution_status: ExecutionStatus::NotStarted,
            supersedes: None,
            created_at,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.candidate.document_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
}

/// Append-only record of one execution attempt. A finished attempt is a
/// separate record that supersedes its `Running` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub mapping_id: Uuid,
    pub target_table: String,
    pub attempt: u32,
    pub counts: RowCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub executor: String,
    pub supersedes: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconciliationStatus {
    Matched,
    PartialMismatch,
    Failed,
}

text_enum!(ReconciliationStatus {
    Matched => "Matched",
    PartialMismatch => "PartialMismatch",
    Failed => "Failed",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub source_count: u64,
    pub target_count: u64,
    pub match_count: u64,
    pub mismatch_count: u64,
    pub missing_in_target: u64,
    pub extra_in_target: u64,
    pub status: ReconciliationStatus,
    pub details: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// A decided mapping read back from the append-only history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalMapping {
    pub mapping_id: Uuid,
    pub source_path: String,
    pub target_table: String,
    pub target_column: String,
    pub transformation: Option<String>,
    pub approval_status: ApprovalStatus,
    pub confidence: f64,
    pub schema_signature: String,
    pub decided_at: Option<DateTime<Utc>>,
}

impl HistoricalMapping {
    pub fn from_mapping(mapping: &Mapping) -> Self {
        Self {
            mapping_id: mapping.id,
            source_path: mapping.candidate.source_path.clone(),
            target_table: mapping.candidate.target_table.clone(),
            target_column: mapping.candidate.target_column.clone(),
            transformation: mapping.candidate.transformation.clone(),
            approval_status: mapping.approval_status,
            confidence: mapping.candidate.confidence,
            schema_signature: mapping.schema_signature.clone(),
            decided_at: mapping.decided_at,
        }
    }
}
