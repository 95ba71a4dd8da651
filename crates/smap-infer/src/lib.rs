//! Model-driven mapping inference: history selection, batching, prompting,
//! tolerant reply parsing and structural validation of suggestions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use smap_core::{
    path_pattern, ApprovalStatus, CandidateFlag, CandidateMapping, HistoricalMapping, SourceNode,
    TargetColumn, TargetSchema,
};
use smap_storage::{ChatMessage, CompletionError, CompletionRequest, CompletionService};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "smap-infer";

const SAMPLE_CHARS: usize = 120;
const DEFAULT_CONFIDENCE: f64 = 0.5;

const SYSTEM_PROMPT: &str = "You map fields of semi-structured source documents onto columns of a \
     relational target schema. Reply with a single JSON object and nothing else.";

const TASK_PROMPT: &str = "For each source node propose the target table and column it loads into. \
     Omit nodes without a plausible target. Use only tables and columns listed in target_schema. \
     Follow approved_examples and avoid the pairings listed in rejected_examples. \
     transformation_logic is null when the value loads unchanged.";

const STRICT_REFORMAT: &str = "The previous reply could not be parsed. Reply again with only a JSON \
     object of the form {\"mappings\": [...]} using exactly the keys shown in response_format. \
     No prose and no code fences.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub history_min_similarity: f64,
    pub history_limit: usize,
    pub max_nodes_per_batch: usize,
    pub max_batch_chars: usize,
    pub worker_concurrency: usize,
    pub low_confidence_threshold: f64,
    pub call_timeout_secs: u64,
    pub max_tokens: Option<u32>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            history_min_similarity: 0.80,
            history_limit: 25,
            max_nodes_per_batch: 40,
            max_batch_chars: 12_000,
            worker_concurrency: 4,
            low_confidence_threshold: 0.5,
            call_timeout_secs: 120,
            max_tokens: None,
        }
    }
}

impl InferenceConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

/// Cooperative cancellation shared between a caller and running inference.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("batch {batch}: unparseable model reply after retry: {reason}")]
    Parse { batch: usize, reason: String },
    #[error("batch {batch}: {source}")]
    Completion {
        batch: usize,
        #[source]
        source: CompletionError,
    },
    #[error("batch {batch}: model call timed out after {timeout:?}")]
    Timeout { batch: usize, timeout: Duration },
    #[error("batch {batch}: {reason}")]
    Worker { batch: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    /// 1-based position in the document's batch plan.
    pub index: usize,
    pub node_count: usize,
    pub estimated_tokens: usize,
    pub history_examples: usize,
    pub retried: bool,
    pub status: BatchStatus,
    pub accepted: usize,
    pub dropped: usize,
    pub clamped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InferenceOutcome {
    pub candidates: Vec<CandidateMapping>,
    pub batches: Vec<BatchReport>,
    pub cancelled: bool,
}

impl InferenceOutcome {
    pub fn failed_batches(&self) -> impl Iterator<Item = &BatchReport> {
        self.batches
            .iter()
            .filter(|b| matches!(b.status, BatchStatus::Failed { .. }))
    }

    pub fn all_failed(&self) -> bool {
        !self.batches.is_empty() && self.failed_batches().count() == self.batches.len()
    }

    pub fn is_partial(&self) -> bool {
        self.failed_batches().next().is_some() && !self.all_failed()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.batches.iter().map(|b| b.estimated_tokens).sum()
    }
}

fn squash(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Best of path-pattern similarity and node-name vs target-column similarity.
pub fn history_similarity(node: &SourceNode, entry: &HistoricalMapping) -> f64 {
    let by_path = jaro_winkler(
        &node.path_pattern().to_lowercase(),
        &path_pattern(&entry.source_path).to_lowercase(),
    );
    let by_name = jaro_winkler(&squash(&node.name), &squash(&entry.target_column));
    by_path.max(by_name)
}

/// Decided history entries relevant to a batch, most similar first.
pub fn select_history<'h>(
    batch: &[&SourceNode],
    history: &'h [HistoricalMapping],
    min_similarity: f64,
    limit: usize,
) -> Vec<&'h HistoricalMapping> {
    let mut scored = history
        .iter()
        .filter(|entry| entry.approval_status != ApprovalStatus::Pending)
        .filter_map(|entry| {
            let best = batch
                .iter()
                .map(|node| history_similarity(node, entry))
                .fold(0.0_f64, f64::max);
            (best >= min_similarity).then_some((entry, best))
        })
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(limit);
    scored.into_iter().map(|(entry, _)| entry).collect()
}

#[derive(Debug, Serialize)]
struct PromptNode<'a> {
    path: &'a str,
    name: &'a str,
    data_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample: Option<String>,
}

fn prompt_node(node: &SourceNode) -> PromptNode<'_> {
    PromptNode {
        path: &node.path,
        name: &node.name,
        data_type: node.data_type.as_str(),
        sample: node
            .sample_value()
            .filter(|s| !s.is_empty())
            .map(|s| s.chars().take(SAMPLE_CHARS).collect()),
    }
}

fn prompt_node_chars(node: &SourceNode) -> usize {
    serde_json::to_string(&prompt_node(node))
        .map(|s| s.len())
        .unwrap_or(node.path.len())
        + 1
}

/// Split leaves into batches bounded by node count and serialized size.
/// A node larger than `max_chars` on its own still gets a batch.
pub fn plan_batches<'a>(
    leaves: &[&'a SourceNode],
    max_nodes: usize,
    max_chars: usize,
) -> Vec<Vec<&'a SourceNode>> {
    let max_nodes = max_nodes.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<&SourceNode> = Vec::new();
    let mut current_chars = 0;
    for &node in leaves {
        let size = prompt_node_chars(node);
        if !current.is_empty() && (current.len() >= max_nodes || current_chars + size > max_chars) {
            batches.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current_chars += size;
        current.push(node);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn schema_payload(schema: &TargetSchema) -> JsonValue {
    JsonValue::Array(
        schema
            .columns()
            .iter()
            .map(|c| {
                json!({
                    "table": c.table,
                    "column": c.column,
                    "data_type": c.data_type,
                    "nullable": c.nullable,
                    "description": c.description,
                })
            })
            .collect(),
    )
}

fn example_payload(entry: &HistoricalMapping) -> JsonValue {
    json!({
        "source_node": entry.source_path,
        "target_table": entry.target_table,
        "target_column": entry.target_column,
        "transformation_logic": entry.transformation,
    })
}

pub fn build_prompt(
    batch: &[&SourceNode],
    schema_json: &JsonValue,
    examples: &[&HistoricalMapping],
) -> Vec<ChatMessage> {
    let nodes = batch
        .iter()
        .filter_map(|node| serde_json::to_value(prompt_node(node)).ok())
        .collect::<Vec<_>>();
    let approved = examples
        .iter()
        .filter(|e| e.approval_status == ApprovalStatus::Approved)
        .map(|e| example_payload(e))
        .collect::<Vec<_>>();
    let rejected = examples
        .iter()
        .filter(|e| e.approval_status == ApprovalStatus::Rejected)
        .map(|e| example_payload(e))
        .collect::<Vec<_>>();
    let payload = json!({
        "task": TASK_PROMPT,
        "source_nodes": nodes,
        "target_schema": schema_json,
        "approved_examples": approved,
        "rejected_examples": rejected,
        "response_format": {
            "mappings": [{
                "source_node": "/Root/Field",
                "target_table": "TABLE",
                "target_column": "COLUMN",
                "transformation_logic": null,
                "confidence_score": 0.9,
                "reasoning": "why"
            }]
        }
    });
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(payload.to_string()),
    ]
}

/// Rough prompt size: four characters per token.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    chars.div_ceil(4)
}

/// One suggestion as the model wrote it, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawSuggestion {
    #[serde(alias = "source_path", alias = "xpath", alias = "source")]
    pub source_node: String,
    #[serde(default, alias = "table")]
    pub target_table: Option<String>,
    #[serde(alias = "column")]
    pub target_column: String,
    #[serde(default, alias = "transformation")]
    pub transformation_logic: Option<String>,
    #[serde(default, alias = "confidence")]
    pub confidence_score: Option<JsonValue>,
    #[serde(default, alias = "rationale")]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReply {
    pub suggestions: Vec<RawSuggestion>,
    /// Array items that were not suggestion objects.
    pub malformed: usize,
}

fn strip_code_fence(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    let body = match after.find('\n') {
        Some(nl) if after[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => &after[nl + 1..],
        _ => after,
    };
    match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    }
}

fn outermost_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Tolerant reply parsing: code fences, surrounding prose, a bare array or
/// an object holding `mappings`.
pub fn parse_reply(text: &str) -> Result<ParsedReply, String> {
    let text = text.trim();
    let value = match serde_json::from_str::<JsonValue>(text) {
        Ok(value) => value,
        Err(_) => {
            let body = strip_code_fence(text).trim();
            match serde_json::from_str::<JsonValue>(body) {
                Ok(value) => value,
                Err(first) => {
                    let inner =
                        outermost_json(body).ok_or_else(|| format!("no JSON found: {first}"))?;
                    serde_json::from_str(inner).map_err(|err| err.to_string())?
                }
            }
        }
    };
    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => match map.remove("mappings").or_else(|| map.remove("mapping")) {
            Some(JsonValue::Array(items)) => items,
            Some(other) => return Err(format!("mappings is not an array: {other}")),
            None if map.contains_key("source_node") => vec![JsonValue::Object(map)],
            None => return Err("reply has no mappings array".to_string()),
        },
        other => return Err(format!("unexpected JSON value: {other}")),
    };

    let mut parsed = ParsedReply::default();
    for item in items {
        match serde_json::from_value::<RawSuggestion>(item) {
            Ok(suggestion) => parsed.suggestions.push(suggestion),
            Err(err) => {
                debug!(%err, "skipping malformed suggestion");
                parsed.malformed += 1;
            }
        }
    }
    Ok(parsed)
}

/// Out-of-range or NaN confidences are clamped into [0, 1].
pub fn clamp_confidence(value: f64) -> (f64, bool) {
    if value.is_nan() {
        (0.0, true)
    } else if value < 0.0 {
        (0.0, true)
    } else if value > 1.0 {
        (1.0, true)
    } else {
        (value, false)
    }
}

fn raw_confidence(value: Option<&JsonValue>) -> f64 {
    match value {
        None | Some(JsonValue::Null) => DEFAULT_CONFIDENCE,
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(JsonValue::String(s)) => s.trim().parse::<f64>().unwrap_or(f64::NAN),
        Some(_) => f64::NAN,
    }
}

fn normalize_transformation(raw: Option<&str>) -> Option<String> {
    let text = raw?.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("null") || text.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(text.to_string())
    }
}

/// Resolve a model-named target to the schema's column. Without a table the
/// column must be unique across the schema (or written `TABLE.COLUMN`).
pub fn resolve_target<'s>(
    schema: &'s TargetSchema,
    table: Option<&str>,
    column: &str,
) -> Option<&'s TargetColumn> {
    let column = column.trim();
    if let Some(table) = table.map(str::trim).filter(|t| !t.is_empty()) {
        return schema.lookup(table, column);
    }
    if let Some((table, unqualified)) = column.rsplit_once('.') {
        if let Some(found) = schema.lookup(table, unqualified) {
            return Some(found);
        }
    }
    let mut matches = schema
        .columns()
        .iter()
        .filter(|c| c.column.eq_ignore_ascii_case(column));
    let first = matches.next()?;
    matches.next().is_none().then_some(first)
}

struct Validator<'a> {
    leaves: HashMap<&'a str, (usize, &'a SourceNode)>,
    schema: &'a TargetSchema,
    document_id: Uuid,
    generated_at: DateTime<Utc>,
    low_confidence_threshold: f64,
}

impl<'a> Validator<'a> {
    fn lookup_node(&self, path: &str) -> Option<(usize, &'a SourceNode)> {
        let path = path.trim();
        if let Some(found) = self.leaves.get(path) {
            return Some(*found);
        }
        if !path.starts_with('/') {
            return self.leaves.get(format!("/{path}").as_str()).copied();
        }
        None
    }

    fn validate(&self, raw: &RawSuggestion) -> Result<(usize, CandidateMapping), String> {
        let (order, node) = self
            .lookup_node(&raw.source_node)
            .ok_or_else(|| "source node not in document".to_string())?;
        let column = resolve_target(self.schema, raw.target_table.as_deref(), &raw.target_column)
            .ok_or_else(|| "target column not in schema".to_string())?;

        let (confidence, clamped) = clamp_confidence(raw_confidence(raw.confidence_score.as_ref()));
        let transformation = normalize_transformation(raw.transformation_logic.as_deref());

        let mut flags = Vec::new();
        if clamped {
            flags.push(CandidateFlag::ConfidenceClamped);
        }
        if confidence < self.low_confidence_threshold {
            flags.push(CandidateFlag::LowConfidence);
        }

        let identity = format!(
            "{}|{}|{}",
            node.path,
            column.table.to_ascii_uppercase(),
            column.column.to_ascii_uppercase()
        );
        let mut candidate = CandidateMapping {
            id: Uuid::new_v5(&self.document_id, identity.as_bytes()),
            document_id: self.document_id,
            source_path: node.path.clone(),
            target_table: column.table.clone(),
            target_column: column.column.clone(),
            transformation,
            confidence,
            rationale: raw.reasoning.clone().unwrap_or_default(),
            generated_at: self.generated_at,
            flags,
        };
        // A value copied as-is has to fit the column's type family.
        if candidate.is_identity() && !node.data_type.is_compatible_with(&column.data_type) {
            candidate.flags.push(CandidateFlag::TypeMismatch);
        }
        Ok((order, candidate))
    }
}

enum BatchRun {
    Skipped,
    Replied { parsed: ParsedReply, retried: bool },
}

async fn call_model(
    batch: usize,
    completion: &dyn CompletionService,
    request: &CompletionRequest,
    timeout: Duration,
) -> Result<String, InferenceError> {
    match tokio::time::timeout(timeout, completion.complete(request)).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(source)) => Err(InferenceError::Completion { batch, source }),
        Err(_) => Err(InferenceError::Timeout { batch, timeout }),
    }
}

/// A failed batch and whether the strict reformat call was made.
struct BatchFailure {
    error: InferenceError,
    retried: bool,
}

impl BatchFailure {
    fn first_attempt(error: InferenceError) -> Self {
        Self { error, retried: false }
    }

    fn after_retry(error: InferenceError) -> Self {
        Self { error, retried: true }
    }
}

async fn run_batch(
    batch: usize,
    completion: Arc<dyn CompletionService>,
    semaphore: Arc<Semaphore>,
    cancel: Cancellation,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<BatchRun, BatchFailure> {
    let _permit = semaphore.acquire_owned().await.map_err(|_| {
        BatchFailure::first_attempt(InferenceError::Worker {
            batch,
            reason: "worker pool closed".to_string(),
        })
    })?;
    if cancel.is_cancelled() {
        return Ok(BatchRun::Skipped);
    }

    let reply = call_model(batch, completion.as_ref(), &request, timeout)
        .await
        .map_err(BatchFailure::first_attempt)?;
    match parse_reply(&reply) {
        Ok(parsed) => Ok(BatchRun::Replied {
            parsed,
            retried: false,
        }),
        Err(first) => {
            warn!(batch, reason = %first, "unparseable reply, retrying with strict format");
            let mut strict = request;
            strict.messages.push(ChatMessage::assistant(reply));
            strict.messages.push(ChatMessage::user(STRICT_REFORMAT));
            let reply = call_model(batch, completion.as_ref(), &strict, timeout)
                .await
                .map_err(BatchFailure::after_retry)?;
            parse_reply(&reply)
                .map(|parsed| BatchRun::Replied {
                    parsed,
                    retried: true,
                })
                .map_err(|reason| BatchFailure::after_retry(InferenceError::Parse { batch, reason }))
        }
    }
}

pub struct InferenceEngine {
    completion: Arc<dyn CompletionService>,
    config: InferenceConfig,
}

impl InferenceEngine {
    pub fn new(completion: Arc<dyn CompletionService>, config: InferenceConfig) -> Self {
        Self { completion, config }
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    /// Infer candidate mappings for the leaves of one normalized document.
    ///
    /// Batches run on a bounded worker pool; a failing batch is reported and
    /// never aborts its siblings. When `cancel` fires, unsent batches are
    /// skipped and every reply is discarded.
    pub async fn infer(
        &self,
        document_id: Uuid,
        nodes: &[SourceNode],
        schema: &TargetSchema,
        history: &[HistoricalMapping],
        cancel: &Cancellation,
    ) -> InferenceOutcome {
        let span = info_span!("inference", document_id = %document_id);
        self.infer_inner(document_id, nodes, schema, history, cancel)
            .instrument(span)
            .await
    }

    async fn infer_inner(
        &self,
        document_id: Uuid,
        nodes: &[SourceNode],
        schema: &TargetSchema,
        history: &[HistoricalMapping],
        cancel: &Cancellation,
    ) -> InferenceOutcome {
        let cfg = &self.config;
        let generated_at = Utc::now();
        let leaves = nodes.iter().filter(|n| n.is_leaf()).collect::<Vec<_>>();
        let batches = plan_batches(&leaves, cfg.max_nodes_per_batch, cfg.max_batch_chars);
        let schema_json = schema_payload(schema);
        let semaphore = Arc::new(Semaphore::new(cfg.worker_concurrency.max(1)));
        let timeout = cfg.call_timeout();

        let mut reports = Vec::with_capacity(batches.len());
        let mut workers = JoinSet::new();
        for (slot, batch) in batches.iter().enumerate() {
            let index = slot + 1;
            let examples = select_history(batch, history, cfg.history_min_similarity, cfg.history_limit);
            let messages = build_prompt(batch, &schema_json, &examples);
            reports.push(BatchReport {
                index,
                node_count: batch.len(),
                estimated_tokens: estimate_tokens(&messages),
                history_examples: examples.len(),
                retried: false,
                status: BatchStatus::Failed {
                    error: "worker stopped before reporting".to_string(),
                },
                accepted: 0,
                dropped: 0,
                clamped: 0,
            });

            let request = CompletionRequest {
                messages,
                json_mode: true,
                max_tokens: cfg.max_tokens,
            };
            let completion = Arc::clone(&self.completion);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let span = info_span!("batch", index, nodes = batch.len());
            workers.spawn(
                async move {
                    let result = run_batch(index, completion, semaphore, cancel, request, timeout).await;
                    (slot, result)
                }
                .instrument(span),
            );
        }

        let mut runs: Vec<Option<BatchRun>> = batches.iter().map(|_| None).collect();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((slot, Ok(run))) => {
                    if let Some(entry) = runs.get_mut(slot) {
                        *entry = Some(run);
                    }
                }
                Ok((slot, Err(failure))) => {
                    warn!(error = %failure.error, retried = failure.retried, "batch failed");
                    if let Some(report) = reports.get_mut(slot) {
                        report.retried = failure.retried;
                        report.status = BatchStatus::Failed {
                            error: failure.error.to_string(),
                        };
                    }
                }
                Err(err) => warn!(error = %err, "inference worker stopped"),
            }
        }

        let cancelled = cancel.is_cancelled();
        let validator = Validator {
            leaves: leaves
                .iter()
                .enumerate()
                .map(|(order, node)| (node.path.as_str(), (order, *node)))
                .collect(),
            schema,
            document_id,
            generated_at,
            low_confidence_threshold: cfg.low_confidence_threshold,
        };

        let mut positions: HashMap<(String, String, String), usize> = HashMap::new();
        let mut accepted: Vec<(usize, CandidateMapping)> = Vec::new();
        for (report, run) in reports.iter_mut().zip(runs) {
            match run {
                None => {}
                Some(BatchRun::Skipped) => report.status = BatchStatus::Skipped,
                Some(BatchRun::Replied { parsed, retried }) => {
                    report.status = BatchStatus::Completed;
                    report.retried = retried;
                    report.dropped = parsed.malformed;
                    if parsed.malformed > 0 {
                        warn!(batch = report.index, count = parsed.malformed, "dropping malformed suggestions");
                    }
                    if cancelled {
                        continue;
                    }
                    for raw in &parsed.suggestions {
                        let (order, candidate) = match validator.validate(raw) {
                            Ok(valid) => valid,
                            Err(reason) => {
                                report.dropped += 1;
                                warn!(
                                    batch = report.index,
                                    source_node = %raw.source_node,
                                    target_table = raw.target_table.as_deref().unwrap_or(""),
                                    target_column = %raw.target_column,
                                    %reason,
                                    "dropping candidate"
                                );
                                continue;
                            }
                        };
                        report.accepted += 1;
                        if candidate.has_flag(CandidateFlag::ConfidenceClamped) {
                            report.clamped += 1;
                        }
                        let key = (
                            candidate.source_path.clone(),
                            candidate.target_table.to_ascii_uppercase(),
                            candidate.target_column.to_ascii_uppercase(),
                        );
                        match positions.get(&key) {
                            Some(&pos) => {
                                if candidate.confidence > accepted[pos].1.confidence {
                                    accepted[pos] = (order, candidate);
                                }
                            }
                            None => {
                                positions.insert(key, accepted.len());
                                accepted.push((order, candidate));
                            }
                        }
                    }
                }
            }
        }

        if cancelled {
            info!(batches = reports.len(), "inference cancelled, replies discarded");
            return InferenceOutcome {
                candidates: Vec::new(),
                batches: reports,
                cancelled: true,
            };
        }

        accepted.sort_by(|a, b| {
            b.1.confidence
                .total_cmp(&a.1.confidence)
                .then_with(|| a.0.cmp(&b.0))
        });
        let outcome = InferenceOutcome {
            candidates: accepted.into_iter().map(|(_, c)| c).collect(),
            batches: reports,
            cancelled: false,
        };
        info!(
            leaves = leaves.len(),
            batches = outcome.batches.len(),
            failed = outcome.failed_batches().count(),
            candidates = outcome.candidates.len(),
            estimated_tokens = outcome.estimated_tokens(),
            "inference finished"
        );
        outcome
    }
}
