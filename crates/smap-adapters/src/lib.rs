//! Format adapters + generic tree normalizer for source documents.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use smap_core::{DocumentFormat, NodeValue, PrimitiveType, ProductGuess, SourceNode};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "smap-adapters";

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed {} document: {reason}", format_label(.format))]
    MalformedDocument {
        format: Option<DocumentFormat>,
        reason: String,
    },
}

fn format_label(format: &Option<DocumentFormat>) -> &'static str {
    format.map(|f| f.as_str()).unwrap_or("unrecognised")
}

fn malformed(format: DocumentFormat, reason: impl Into<String>) -> NormalizeError {
    NormalizeError::MalformedDocument {
        format: Some(format),
        reason: reason.into(),
    }
}

/// Format-neutral tree produced by every adapter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TreeNode {
    pub name: String,
    pub text: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<TreeNode>,
    /// Overrides per-value inference (CSV columns, JSON nulls).
    pub data_type: Option<PrimitiveType>,
}

impl TreeNode {
    pub fn element(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_child(mut self, child: TreeNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    fn append_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match &mut self.text {
            Some(existing) if !existing.is_empty() => {
                existing.push(' ');
                existing.push_str(text);
            }
            _ => self.text = Some(text.to_string()),
        }
    }
}

/// Capability of turning raw text of one format into a [`TreeNode`] forest.
pub trait Parseable: Send + Sync {
    fn format(&self) -> DocumentFormat;

    /// Cheap content check used when no format hint is given.
    fn sniff(&self, text: &str) -> bool;

    fn parse_tree(&self, text: &str) -> Result<Vec<TreeNode>, NormalizeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XmlAdapter;

fn xml_element(start: &BytesStart<'_>) -> Result<TreeNode, NormalizeError> {
    let mut node = TreeNode::element(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(|err| malformed(DocumentFormat::Xml, err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|err| malformed(DocumentFormat::Xml, err.to_string()))?;
        node.attributes.push((key, value.into_owned()));
    }
    Ok(node)
}

fn attach(stack: &mut [TreeNode], roots: &mut Vec<TreeNode>, node: TreeNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => roots.push(node),
    }
}

impl Parseable for XmlAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Xml
    }

    fn sniff(&self, text: &str) -> bool {
        text.trim_start().starts_with('<')
    }

    fn parse_tree(&self, text: &str) -> Result<Vec<TreeNode>, NormalizeError> {
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);

        let mut stack: Vec<TreeNode> = Vec::new();
        let mut roots: Vec<TreeNode> = Vec::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => stack.push(xml_element(&start)?),
                Ok(Event::Empty(start)) => {
                    let node = xml_element(&start)?;
                    attach(&mut stack, &mut roots, node);
                }
                Ok(Event::End(_)) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| malformed(DocumentFormat::Xml, "closing tag without opening tag"))?;
                    attach(&mut stack, &mut roots, node);
                }
                Ok(Event::Text(text)) => {
                    let text = text
                        .unescape()
                        .map_err(|err| malformed(DocumentFormat::Xml, err.to_string()))?;
                    match stack.last_mut() {
                        Some(top) => top.append_text(&text),
                        None if text.trim().is_empty() => {}
                        None => {
                            return Err(malformed(DocumentFormat::Xml, "text outside the root element"));
                        }
                    }
                }
                Ok(Event::CData(data)) => {
                    let data = data.into_inner();
                    if let Some(top) = stack.last_mut() {
                        top.append_text(&String::from_utf8_lossy(&data));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => {
                    return Err(malformed(
                        DocumentFormat::Xml,
                        format!("at byte {}: {err}", reader.buffer_position()),
                    ));
                }
            }
        }

        if let Some(open) = stack.last() {
            return Err(malformed(
                DocumentFormat::Xml,
                format!("unclosed element <{}>", open.name),
            ));
        }
        match roots.len() {
            0 => Err(malformed(DocumentFormat::Xml, "no root element")),
            1 => Ok(roots),
            n => Err(malformed(DocumentFormat::Xml, format!("{n} root elements"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonAdapter;

/// Work left in one open JSON container.
enum JsonEntry {
    Field(String, JsonValue),
    /// An array nested directly in an array keeps its own wrapper element.
    Group(String, Vec<JsonValue>),
}

fn array_entries(name: &str, items: Vec<JsonValue>) -> Vec<JsonEntry> {
    items
        .into_iter()
        .map(|item| match item {
            JsonValue::Array(inner) => JsonEntry::Group(name.to_string(), inner),
            other => JsonEntry::Field(name.to_string(), other),
        })
        .collect()
}

fn json_leaf(name: String, value: JsonValue) -> TreeNode {
    match value {
        JsonValue::Null => {
            let mut node = TreeNode::leaf(name, "");
            node.data_type = Some(PrimitiveType::Null);
            node
        }
        JsonValue::String(s) => TreeNode::leaf(name, s),
        other => TreeNode::leaf(name, other.to_string()),
    }
}

/// Build the forest with an explicit stack of open containers; each frame
/// keeps its pending entries reversed so `pop` yields document order.
fn json_forest(top: Vec<JsonEntry>) -> Vec<TreeNode> {
    let open = |name: String, mut pending: Vec<JsonEntry>| {
        pending.reverse();
        (TreeNode::element(name), pending)
    };
    let mut frames = vec![open(String::new(), top)];
    let mut forest = Vec::new();

    while let Some((node, pending)) = frames.last_mut() {
        match pending.pop() {
            Some(JsonEntry::Field(name, JsonValue::Array(items))) => {
                pending.extend(array_entries(&name, items).into_iter().rev());
            }
            Some(JsonEntry::Field(name, JsonValue::Object(map))) => {
                let fields = map
                    .into_iter()
                    .map(|(key, child)| JsonEntry::Field(key, child))
                    .collect();
                frames.push(open(name, fields));
            }
            Some(JsonEntry::Field(name, scalar)) => node.children.push(json_leaf(name, scalar)),
            Some(JsonEntry::Group(name, items)) => {
                let entries = array_entries("item", items);
                frames.push(open(name, entries));
            }
            None => {
                if let Some((finished, _)) = frames.pop() {
                    match frames.last_mut() {
                        Some((parent, _)) => parent.children.push(finished),
                        None => forest = finished.children,
                    }
                }
            }
        }
    }
    forest
}

/// Parse JSON of any nesting depth; the stack grows on the heap as needed.
fn parse_json_value(text: &str) -> Result<JsonValue, serde_json::Error> {
    let mut deserializer = serde_json::Deserializer::from_str(text);
    deserializer.disable_recursion_limit();
    let value = JsonValue::deserialize(serde_stacker::Deserializer::new(&mut deserializer))?;
    deserializer.end()?;
    Ok(value)
}

impl Parseable for JsonAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Json
    }

    fn sniff(&self, text: &str) -> bool {
        matches!(text.trim_start().chars().next(), Some('{') | Some('['))
    }

    fn parse_tree(&self, text: &str) -> Result<Vec<TreeNode>, NormalizeError> {
        let value =
            parse_json_value(text).map_err(|err| malformed(DocumentFormat::Json, err.to_string()))?;
        let top = match value {
            JsonValue::Object(map) => map
                .into_iter()
                .map(|(key, child)| JsonEntry::Field(key, child))
                .collect(),
            array @ JsonValue::Array(_) => vec![JsonEntry::Field("item".to_string(), array)],
            scalar => vec![JsonEntry::Field("value".to_string(), scalar)],
        };
        Ok(json_forest(top))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CsvAdapter {
    pub max_sample_rows: usize,
}

impl Default for CsvAdapter {
    fn default() -> Self {
        Self {
            max_sample_rows: 200,
        }
    }
}

const CSV_DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Most frequent candidate delimiter on the header line.
pub fn detect_delimiter(text: &str) -> Option<u8> {
    let header = text.lines().find(|line| !line.trim().is_empty())?;
    CSV_DELIMITERS
        .iter()
        .map(|&d| (d, header.bytes().filter(|&b| b == d).count()))
        .filter(|(_, count)| *count > 0)
        .max_by_key(|(_, count)| *count)
        .map(|(d, _)| d)
}

impl Parseable for CsvAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Csv
    }

    fn sniff(&self, text: &str) -> bool {
        let first = text.trim_start().chars().next();
        !matches!(first, Some('<') | Some('{') | Some('[') | None) && detect_delimiter(text).is_some()
    }

    fn parse_tree(&self, text: &str) -> Result<Vec<TreeNode>, NormalizeError> {
        let delimiter = detect_delimiter(text).unwrap_or(b',');
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .has_headers(true)
            .from_reader(text.as_bytes());

        let headers = reader
            .headers()
            .map_err(|err| malformed(DocumentFormat::Csv, err.to_string()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();
        if headers.iter().all(String::is_empty) {
            return Err(malformed(DocumentFormat::Csv, "missing header row"));
        }

        let mut samples: Vec<Option<String>> = vec![None; headers.len()];
        let mut types: Vec<PrimitiveType> = vec![PrimitiveType::Null; headers.len()];
        for record in reader.records().take(self.max_sample_rows) {
            let record = record.map_err(|err| malformed(DocumentFormat::Csv, err.to_string()))?;
            for (idx, value) in record.iter().enumerate().take(headers.len()) {
                let value = value.trim();
                if value.is_empty() {
                    continue;
                }
                types[idx] = types[idx].widen(PrimitiveType::infer(value));
                if samples[idx].is_none() {
                    samples[idx] = Some(value.to_string());
                }
            }
        }

        Ok(headers
            .into_iter()
            .enumerate()
            .map(|(idx, header)| {
                let name = if header.is_empty() {
                    format!("column_{}", idx + 1)
                } else {
                    header
                };
                let mut node = TreeNode::leaf(name, samples[idx].clone().unwrap_or_default());
                node.data_type = Some(match types[idx] {
                    PrimitiveType::Null => PrimitiveType::String,
                    other => other,
                });
                node
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlAdapter;

const HTML_SKIPPED: [&str; 4] = ["script", "style", "noscript", "template"];

fn html_element(element: ElementRef<'_>) -> TreeNode {
    let value = element.value();
    let mut node = TreeNode::element(value.name());
    for (key, val) in value.attrs() {
        if key != "style" {
            node.attributes.push((key.to_string(), val.to_string()));
        }
    }
    node
}

/// Walk the parsed DOM with an explicit stack of (node, remaining children).
fn html_tree(root: ElementRef<'_>) -> TreeNode {
    let mut frames = vec![(html_element(root), root.children())];
    let mut finished_root = None;

    while let Some((node, children)) = frames.last_mut() {
        match children.next() {
            Some(child) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    if !HTML_SKIPPED.contains(&child_element.value().name()) {
                        frames.push((html_element(child_element), child_element.children()));
                    }
                } else if let Some(text) = child.value().as_text() {
                    node.append_text(text);
                }
            }
            None => {
                if let Some((finished, _)) = frames.pop() {
                    match frames.last_mut() {
                        Some((parent, _)) => parent.children.push(finished),
                        None => finished_root = Some(finished),
                    }
                }
            }
        }
    }
    finished_root.unwrap_or_else(|| html_element(root))
}

impl Parseable for HtmlAdapter {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Html
    }

    fn sniff(&self, text: &str) -> bool {
        let head = text
            .trim_start()
            .chars()
            .take(512)
            .collect::<String>()
            .to_ascii_lowercase();
        head.starts_with("<!doctype html") || head.contains("<html")
    }

    fn parse_tree(&self, text: &str) -> Result<Vec<TreeNode>, NormalizeError> {
        if text.trim().is_empty() {
            return Err(malformed(DocumentFormat::Html, "empty document"));
        }
        let document = Html::parse_document(text);
        Ok(vec![html_tree(document.root_element())])
    }
}

fn sanitize_segment(name: &str, attribute: bool) -> String {
    let mut segment = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '[' | ']' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect::<String>();
    if !attribute && segment.starts_with('@') {
        segment.replace_range(0..1, "_");
    }
    if segment.is_empty() {
        segment.push('_');
    }
    segment
}

/// Segments for one sibling group; repeated names get 1-based `[n]` suffixes.
fn indexed_segments<'a>(names: impl Iterator<Item = &'a str> + Clone, attribute: bool) -> Vec<String> {
    let mut totals: HashMap<String, usize> = HashMap::new();
    for name in names.clone() {
        *totals.entry(sanitize_segment(name, attribute)).or_default() += 1;
    }
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .map(|name| {
            let segment = sanitize_segment(name, attribute);
            let prefix = if attribute { "@" } else { "" };
            if totals[&segment] > 1 {
                let n = seen.entry(segment.clone()).or_default();
                *n += 1;
                format!("{prefix}{segment}[{n}]")
            } else {
                format!("{prefix}{segment}")
            }
        })
        .collect()
}

fn push_siblings<'a>(
    stack: &mut Vec<(&'a TreeNode, String, usize)>,
    siblings: &'a [TreeNode],
    parent_path: &str,
    parent_depth: usize,
) {
    let segments = indexed_segments(siblings.iter().map(|s| s.name.as_str()), false);
    let entries = siblings
        .iter()
        .zip(segments)
        .map(|(node, segment)| (node, format!("{parent_path}/{segment}"), parent_depth + 1))
        .collect::<Vec<_>>();
    stack.extend(entries.into_iter().rev());
}

/// Flatten a forest into document-ordered nodes. Iterative, so nesting
/// depth is bounded only by memory.
pub fn flatten_forest(forest: &[TreeNode]) -> Vec<SourceNode> {
    let mut out = Vec::new();
    let mut stack = Vec::new();
    push_siblings(&mut stack, forest, "", 0);

    while let Some((node, path, depth)) = stack.pop() {
        let (value, data_type) = if node.children.is_empty() {
            let text = node.text.clone().unwrap_or_default();
            let data_type = node.data_type.unwrap_or_else(|| PrimitiveType::infer(&text));
            (NodeValue::Leaf(text), data_type)
        } else {
            (NodeValue::Container, PrimitiveType::Null)
        };
        out.push(SourceNode {
            path: path.clone(),
            name: node.name.clone(),
            value,
            data_type,
            depth,
        });

        let attribute_segments =
            indexed_segments(node.attributes.iter().map(|(name, _)| name.as_str()), true);
        for ((name, attr_value), segment) in node.attributes.iter().zip(attribute_segments) {
            out.push(SourceNode {
                path: format!("{path}/{segment}"),
                name: name.clone(),
                value: NodeValue::Leaf(attr_value.clone()),
                data_type: PrimitiveType::infer(attr_value),
                depth: depth + 1,
            });
        }

        push_siblings(&mut stack, &node.children, &path, depth);
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductProfile {
    pub product_code: String,
    pub product_name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub node_patterns: Vec<String>,
    #[serde(default)]
    pub attribute_patterns: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
struct ProductProfilesFile {
    #[serde(default)]
    products: Vec<ProductProfile>,
}

const KEYWORD_SCORE: f64 = 1.0;
const NODE_EXACT_SCORE: f64 = 2.0;
const NODE_FUZZY_SCORE: f64 = 1.5;
const SECTION_BONUS: f64 = 0.5;
const REPEAT_BONUS: f64 = 0.5;
const ATTRIBUTE_EXACT_SCORE: f64 = 1.5;
const ATTRIBUTE_FUZZY_SCORE: f64 = 1.0;
const CODE_SCORE: f64 = 3.0;
const FUZZY_THRESHOLD: f64 = 0.9;

/// Normalized score a profile needs before it is reported as the product.
pub const DEFAULT_PRODUCT_MIN_SCORE: f64 = 0.2;

/// Scores a document's structure against configured product profiles.
#[derive(Debug, Clone)]
pub struct ProductDetector {
    profiles: Vec<ProductProfile>,
    min_score: f64,
}

impl Default for ProductDetector {
    fn default() -> Self {
        Self::new(default_product_profiles())
    }
}

struct StructureSummary {
    /// lowercase tag -> (occurrences, shallowest depth)
    tags: HashMap<String, (usize, usize)>,
    attributes: Vec<String>,
    text: String,
}

impl StructureSummary {
    fn from_nodes(nodes: &[SourceNode]) -> Self {
        let mut tags: HashMap<String, (usize, usize)> = HashMap::new();
        let mut attributes = Vec::new();
        let mut text = String::new();
        for node in nodes {
            let name = node.name.to_ascii_lowercase();
            let is_attribute = node
                .path
                .rsplit('/')
                .next()
                .map(|segment| segment.starts_with('@'))
                .unwrap_or(false);
            if is_attribute {
                attributes.push(name.clone());
            } else {
                let entry = tags.entry(name.clone()).or_insert((0, node.depth));
                entry.0 += 1;
                entry.1 = entry.1.min(node.depth);
            }
            text.push_str(&name);
            text.push(' ');
            if let Some(value) = node.sample_value() {
                text.push_str(&value.to_ascii_lowercase());
                text.push(' ');
            }
        }
        Self {
            tags,
            attributes,
            text,
        }
    }
}

impl ProductDetector {
    pub fn new(profiles: Vec<ProductProfile>) -> Self {
        Self {
            profiles,
            min_score: DEFAULT_PRODUCT_MIN_SCORE,
        }
    }

    pub fn with_min_score(mut self, min_score: f64) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed: ProductProfilesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(parsed.products))
    }

    pub fn profiles(&self) -> &[ProductProfile] {
        &self.profiles
    }

    fn score_profile(&self, profile: &ProductProfile, summary: &StructureSummary) -> f64 {
        let mut score = 0.0;

        for keyword in &profile.keywords {
            if summary.text.contains(&keyword.to_ascii_lowercase()) {
                score += KEYWORD_SCORE;
            }
        }

        for pattern in &profile.node_patterns {
            let pattern = pattern.to_ascii_lowercase();
            if let Some(&(count, depth)) = summary.tags.get(&pattern) {
                score += NODE_EXACT_SCORE;
                if depth <= 2 {
                    score += SECTION_BONUS;
                }
                if count > 1 {
                    score += REPEAT_BONUS;
                }
            } else if summary
                .tags
                .keys()
                .any(|tag| jaro_winkler(&pattern, tag) > FUZZY_THRESHOLD)
            {
                score += NODE_FUZZY_SCORE;
            }
        }

        for pattern in &profile.attribute_patterns {
            let pattern = pattern.to_ascii_lowercase();
            if summary.attributes.contains(&pattern) {
                score += ATTRIBUTE_EXACT_SCORE;
            } else if summary
                .attributes
                .iter()
                .any(|attr| jaro_winkler(&pattern, attr) > FUZZY_THRESHOLD)
            {
                score += ATTRIBUTE_FUZZY_SCORE;
            }
        }

        if summary.text.contains(&profile.product_code.to_ascii_lowercase()) {
            score += CODE_SCORE;
        }

        let max_possible = profile.keywords.len() as f64 * KEYWORD_SCORE
            + profile.node_patterns.len() as f64 * (NODE_EXACT_SCORE + SECTION_BONUS + REPEAT_BONUS)
            + profile.attribute_patterns.len() as f64 * ATTRIBUTE_EXACT_SCORE
            + CODE_SCORE;
        ((score / max_possible) * profile.weight).clamp(0.0, 1.0)
    }

    pub fn detect(&self, nodes: &[SourceNode]) -> ProductGuess {
        let summary = StructureSummary::from_nodes(nodes);
        let scores = self
            .profiles
            .iter()
            .map(|profile| (profile.product_code.clone(), self.score_profile(profile, &summary)))
            .collect::<BTreeMap<_, _>>();

        let best = self
            .profiles
            .iter()
            .filter_map(|p| scores.get(&p.product_code).map(|s| (p.product_code.clone(), *s)))
            .fold(None::<(String, f64)>, |best, (code, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((code, score)),
            });

        match best {
            Some((code, confidence)) if confidence >= self.min_score => ProductGuess {
                product_code: Some(code),
                confidence,
                scores,
            },
            _ => ProductGuess {
                product_code: None,
                confidence: 0.0,
                scores,
            },
        }
    }
}

fn profile(code: &str, name: &str, keywords: &[&str], nodes: &[&str], attributes: &[&str]) -> ProductProfile {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    ProductProfile {
        product_code: code.to_string(),
        product_name: name.to_string(),
        keywords: owned(keywords),
        node_patterns: owned(nodes),
        attribute_patterns: owned(attributes),
        weight: 1.0,
    }
}

/// Profiles used when no profile file is configured.
pub fn default_product_profiles() -> Vec<ProductProfile> {
    vec![
        profile(
            "PA001",
            "Personal Auto Insurance",
            &["auto", "vehicle", "driver", "vin", "automobile"],
            &["Vehicle", "Driver", "VIN", "Make", "Model"],
            &["vehicleidentificationnum", "driverage"],
        ),
        profile(
            "HO003",
            "Homeowners Insurance",
            &["homeowner", "dwelling", "property", "residence", "house"],
            &["Dwelling", "PropertyDetails", "BuildingYear", "ConstructionType", "Occupancy"],
            &["squarefootage", "propertyvalue"],
        ),
        profile(
            "CP001",
            "Commercial Property Insurance",
            &["commercial", "business", "office", "businessproperty"],
            &["CommercialBuilding", "BusinessProperty", "BusinessName", "OccupancyType"],
            &["businessname"],
        ),
        profile(
            "UMB001",
            "Personal Umbrella Insurance",
            &["umbrella", "excess", "excessliability", "underlyingretention"],
            &["Umbrella", "ExcessLiability", "UnderlyingRetention"],
            &["underlyingretention"],
        ),
        profile(
            "WC001",
            "Workers Compensation",
            &["workers", "workerscomp", "employee", "payroll"],
            &["Employee", "Payroll", "WorkersComp", "Occupation"],
            &["employeecount", "payrollamount"],
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedDocument {
    pub format: DocumentFormat,
    pub nodes: Vec<SourceNode>,
    pub product: ProductGuess,
}

impl NormalizedDocument {
    pub fn leaves(&self) -> impl Iterator<Item = &SourceNode> {
        self.nodes.iter().filter(|n| n.is_leaf())
    }

    pub fn node(&self, path: &str) -> Option<&SourceNode> {
        self.nodes.iter().find(|n| n.path == path)
    }
}

/// Generic normalizer: picks a format adapter, builds the tree, flattens it.
pub struct Normalizer {
    adapters: Vec<Box<dyn Parseable>>,
    detector: ProductDetector,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(ProductDetector::default())
    }
}

impl Normalizer {
    /// Adapters are sniffed in registration order; HTML precedes XML.
    pub fn new(detector: ProductDetector) -> Self {
        Self {
            adapters: vec![
                Box::new(HtmlAdapter),
                Box::new(XmlAdapter),
                Box::new(JsonAdapter),
                Box::new(CsvAdapter::default()),
            ],
            detector,
        }
    }

    /// Replace the adapter registered for the same format.
    pub fn with_adapter(mut self, adapter: Box<dyn Parseable>) -> Self {
        let format = adapter.format();
        self.adapters.retain(|a| a.format() != format);
        self.adapters.insert(0, adapter);
        self
    }

    pub fn detect_format(&self, text: &str) -> Option<DocumentFormat> {
        self.adapters
            .iter()
            .find(|a| a.sniff(text))
            .map(|a| a.format())
    }

    pub fn normalize(
        &self,
        bytes: &[u8],
        hint: Option<DocumentFormat>,
    ) -> Result<NormalizedDocument, NormalizeError> {
        let text = std::str::from_utf8(bytes).map_err(|err| NormalizeError::MalformedDocument {
            format: hint,
            reason: format!("not valid UTF-8: {err}"),
        })?;
        let text = text.trim_start_matches('\u{feff}');
        if text.trim().is_empty() {
            return Err(NormalizeError::MalformedDocument {
                format: hint,
                reason: "empty document".to_string(),
            });
        }

        let format = match hint {
            Some(format) => format,
            None => self
                .detect_format(text)
                .ok_or_else(|| NormalizeError::MalformedDocument {
                    format: None,
                    reason: "content does not match any supported format".to_string(),
                })?,
        };
        let adapter = self
            .adapters
            .iter()
            .find(|a| a.format() == format)
            .ok_or_else(|| malformed(format, "no adapter registered"))?;

        let forest = adapter.parse_tree(text)?;
        let nodes = flatten_forest(&forest);
        let product = self.detector.detect(&nodes);
        debug!(
            format = %format,
            nodes = nodes.len(),
            product = ?product.product_code,
            "document normalized"
        );
        Ok(NormalizedDocument {
            format,
            nodes,
            product,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use smap_core::path_depth;
    use std::collections::HashSet;

    const POLICY_XML: &str = r#"<?xml version="1.0"?>
<Policy xmlns="urn:acme" id="P-1">
  <Number>POL-001</Number>
  <Premium currency="USD">1250.75</Premium>
  <Insured><Name>Jane &amp; Co</Name></Insured>
  <Vehicle><VIN>1HGCM82633A004352</VIN><Make>Honda</Make></Vehicle>
  <Driver><Name>Jane</Name></Driver>
  <Driver><Name>John</Name><![CDATA[note]]></Driver>
</Policy>"#;

    fn paths(doc: &NormalizedDocument) -> Vec<&str> {
        doc.nodes.iter().map(|n| n.path.as_str()).collect()
    }

    #[test]
    fn xml_paths_follow_document_order_with_sibling_indexes() {
        let doc = Normalizer::default()
            .normalize(POLICY_XML.as_bytes(), None)
            .expect("normalize");
        assert_eq!(doc.format, DocumentFormat::Xml);
        assert_eq!(
            paths(&doc),
            vec![
                "/Policy",
                "/Policy/@id",
                "/Policy/Number",
                "/Policy/Premium",
                "/Policy/Premium/@currency",
                "/Policy/Insured",
                "/Policy/Insured/Name",
                "/Policy/Vehicle",
                "/Policy/Vehicle/VIN",
                "/Policy/Vehicle/Make",
                "/Policy/Driver[1]",
                "/Policy/Driver[1]/Name",
                "/Policy/Driver[2]",
                "/Policy/Driver[2]/Name",
            ]
        );
        let premium = doc.node("/Policy/Premium").expect("premium");
        assert_eq!(premium.data_type, PrimitiveType::Decimal);
        assert_eq!(premium.sample_value(), Some("1250.75"));
        assert_eq!(
            doc.node("/Policy/Insured/Name").and_then(|n| n.sample_value()),
            Some("Jane & Co")
        );
        assert_eq!(doc.node("/Policy/Insured").map(|n| n.data_type), Some(PrimitiveType::Null));
    }

    #[test]
    fn product_guess_comes_from_structure() {
        let doc = Normalizer::default()
            .normalize(POLICY_XML.as_bytes(), Some(DocumentFormat::Xml))
            .expect("normalize");
        assert_eq!(doc.product.product_code.as_deref(), Some("PA001"));
        assert!(doc.product.confidence > 0.2);
        assert_eq!(doc.product.scores.len(), default_product_profiles().len());
    }

    #[test]
    fn unknown_structure_is_tolerated_without_product() {
        let doc = Normalizer::default()
            .normalize(b"<Root><Alpha>1</Alpha><Beta/></Root>", None)
            .expect("normalize");
        assert_eq!(doc.nodes.len(), 3);
        assert_eq!(doc.product.product_code, None);
    }

    #[test]
    fn unbalanced_xml_is_malformed() {
        let normalizer = Normalizer::default();
        for bad in ["<Policy><Number>1</Policy>", "<Policy><Number>1</Number>", "<A/><B/>", ""] {
            let err = normalizer.normalize(bad.as_bytes(), Some(DocumentFormat::Xml));
            assert!(
                matches!(err, Err(NormalizeError::MalformedDocument { .. })),
                "expected malformed for {bad:?}"
            );
        }
        assert!(normalizer.normalize(&[0xff, 0xfe, 0x00], None).is_err());
    }

    #[test]
    fn handles_hundreds_of_distinct_paths_and_deep_nesting() {
        let mut xml = String::from("<Root>");
        for i in 0..250 {
            xml.push_str(&format!("<Field{i}>{i}</Field{i}>"));
        }
        for _ in 0..2_000 {
            xml.push_str("<Level>");
        }
        xml.push_str("<Leaf>deep</Leaf>");
        for _ in 0..2_000 {
            xml.push_str("</Level>");
        }
        xml.push_str("</Root>");

        let doc = Normalizer::default()
            .normalize(xml.as_bytes(), None)
            .expect("normalize");
        let distinct = doc.nodes.iter().map(|n| &n.path).collect::<HashSet<_>>();
        assert_eq!(distinct.len(), doc.nodes.len());
        assert!(distinct.len() > 2_200);
        let deepest = doc.nodes.iter().map(|n| n.depth).max().unwrap_or_default();
        assert_eq!(deepest, 2_002);
    }

    #[test]
    fn json_and_html_nest_far_past_parser_recursion_limits() {
        let depth = 1_500;
        let json = format!("{}\"leaf\"{}", "{\"a\": ".repeat(depth), "}".repeat(depth));
        let doc = Normalizer::default()
            .normalize(json.as_bytes(), None)
            .expect("deep json");
        assert_eq!(doc.format, DocumentFormat::Json);
        let leaf = doc.leaves().next().expect("one leaf");
        assert_eq!(leaf.depth, depth);
        assert_eq!(leaf.sample_value(), Some("leaf"));
        assert_eq!(path_depth(&leaf.path), leaf.depth);

        let nested_arrays = format!("{}1{}", "[".repeat(depth), "]".repeat(depth));
        let doc = Normalizer::default()
            .normalize(nested_arrays.as_bytes(), Some(DocumentFormat::Json))
            .expect("deep arrays");
        assert_eq!(doc.leaves().count(), 1);

        let html = format!(
            "<!DOCTYPE html><html><body>{}deep{}</body></html>",
            "<div>".repeat(1_200),
            "</div>".repeat(1_200)
        );
        let doc = Normalizer::default()
            .normalize(html.as_bytes(), None)
            .expect("deep html");
        assert_eq!(doc.format, DocumentFormat::Html);
        let deepest = doc.leaves().max_by_key(|n| n.depth).expect("leaf");
        assert!(deepest.depth >= 1_200);
        assert_eq!(deepest.sample_value(), Some("deep"));
    }

    #[test]
    fn json_arrays_become_indexed_siblings() {
        let json = r#"{"policy": {"number": "POL-9", "premium": 99.5, "active": true,
            "drivers": [{"name": "A"}, {"name": "B"}], "tags": [], "notes": null}}"#;
        let doc = Normalizer::default()
            .normalize(json.as_bytes(), None)
            .expect("normalize");
        assert_eq!(doc.format, DocumentFormat::Json);
        let p = paths(&doc);
        assert!(p.contains(&"/policy/number"));
        assert!(p.contains(&"/policy/drivers[2]/name"));
        assert_eq!(doc.node("/policy/premium").map(|n| n.data_type), Some(PrimitiveType::Decimal));
        assert_eq!(doc.node("/policy/active").map(|n| n.data_type), Some(PrimitiveType::Boolean));
        assert_eq!(doc.node("/policy/notes").map(|n| n.data_type), Some(PrimitiveType::Null));
        assert!(Normalizer::default().normalize(b"{\"a\": ", None).is_err());
    }

    #[test]
    fn csv_columns_are_typed_across_rows() {
        let csv = "policy_number;premium;effective\nP-1;100;2024-01-01\nP-2;100.5;2024-02-01\n";
        let doc = Normalizer::default()
            .normalize(csv.as_bytes(), None)
            .expect("normalize");
        assert_eq!(doc.format, DocumentFormat::Csv);
        assert_eq!(paths(&doc), vec!["/policy_number", "/premium", "/effective"]);
        assert_eq!(doc.node("/premium").map(|n| n.data_type), Some(PrimitiveType::Decimal));
        assert_eq!(doc.node("/effective").map(|n| n.data_type), Some(PrimitiveType::Date));
        assert_eq!(doc.node("/policy_number").and_then(|n| n.sample_value()), Some("P-1"));
    }

    #[test]
    fn html_tree_skips_scripts() {
        let html = "<!DOCTYPE html><html><head><script>var x;</script></head>\
                    <body><table id=\"t\"><tr><td>1</td><td>2</td></tr></table></body></html>";
        let doc = Normalizer::default()
            .normalize(html.as_bytes(), None)
            .expect("normalize");
        assert_eq!(doc.format, DocumentFormat::Html);
        let p = paths(&doc);
        assert!(p.iter().all(|path| !path.contains("script")));
        assert!(p.iter().any(|path| path.ends_with("/td[2]")));
        assert!(p.iter().any(|path| path.ends_with("/table/@id")));
    }

    #[test]
    fn detector_loads_profiles_from_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("products.yaml");
        std::fs::write(
            &path,
            "products:\n  - product_code: BOAT1\n    product_name: Marine\n    keywords: [hull]\n    node_patterns: [Vessel]\n",
        )
        .expect("write");
        let detector = ProductDetector::from_yaml_file(&path).expect("load");
        let normalizer = Normalizer::new(detector);
        let doc = normalizer
            .normalize(b"<Vessel><Hull>steel hull</Hull></Vessel>", None)
            .expect("normalize");
        assert_eq!(doc.product.product_code.as_deref(), Some("BOAT1"));
    }

    fn arb_tree() -> impl Strategy<Value = TreeNode> {
        let leaf = ("[a-zA-Z@/\\[\\]0-9_ ]{1,6}", proptest::option::of("[a-z0-9 .-]{0,8}")).prop_map(
            |(name, text)| TreeNode {
                name,
                text,
                ..Default::default()
            },
        );
        leaf.prop_recursive(6, 96, 6, |inner| {
            (
                "[a-zA-Z]{1,3}",
                proptest::collection::vec(inner, 0..6),
                proptest::collection::vec(("[a-z/]{1,3}", "[a-z0-9]{0,4}"), 0..3),
            )
                .prop_map(|(name, children, attributes)| TreeNode {
                    name,
                    text: None,
                    attributes,
                    children,
                    data_type: None,
                })
        })
    }

    proptest! {
        #[test]
        fn paths_are_unique_and_depth_matches_nesting(forest in proptest::collection::vec(arb_tree(), 1..4)) {
            let nodes = flatten_forest(&forest);
            let mut seen = HashSet::new();
            for node in &nodes {
                prop_assert!(seen.insert(node.path.clone()), "duplicate path {}", node.path);
                prop_assert_eq!(node.depth, path_depth(&node.path));
            }
        }
    }
}
