//! Structured output extraction
//!
//! Agents reply with free text that should contain one JSON object. The
//! object is located with a greedy match from the first `{` to the last `}`
//! and decoded into the shapes below.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::gateway::ExecutionResult;
use crate::model::{
    agent_id_for, clamp_priority, unique_item_id, AgentResult, Plan, PlanItem, PlanItemStatus, Source,
};

static JSON_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").expect("Invalid JSON object regex"));

/// Confidence assumed when a researcher reply has no JSON at all
const UNSTRUCTURED_CONFIDENCE: f64 = 0.7;

/// Confidence assumed when the JSON omits it
const DEFAULT_CONFIDENCE: f64 = 0.8;

/// The outermost `{...}` span of `text`, if any
pub fn extract_json_object(text: &str) -> Option<&str> {
    JSON_OBJECT.find(text).map(|m| m.as_str())
}

// ============================================================================
// Planner
// ============================================================================

/// What the planner is asked to produce
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannerOutput {
    /// How the research question was understood
    #[serde(default)]
    pub understanding: String,
    /// Questions that would narrow the scope
    #[serde(default)]
    pub clarifications: Vec<String>,
    pub plan_items: Vec<PlannedItem>,
    #[serde(default = "default_estimated_minutes")]
    pub estimated_time_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannedItem {
    /// Optional stable identifier; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub topic: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: String,
    /// 1 (highest) to 5 (lowest)
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub key_questions: Vec<String>,
    #[serde(default)]
    pub suggested_sources: Vec<String>,
}

fn default_estimated_minutes() -> u32 {
    30
}

fn default_priority() -> i32 {
    1
}

/// JSON schema of [`PlannerOutput`], embedded in the planner prompt
pub fn planner_schema() -> String {
    let schema = schemars::schema_for!(PlannerOutput);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// Turn planner text into a plan with at least one item
pub fn parse_plan(content: &str) -> Result<Plan, String> {
    let json = extract_json_object(content)
        .ok_or_else(|| "planner output contains no JSON object".to_string())?;
    let output: PlannerOutput =
        serde_json::from_str(json).map_err(|e| format!("invalid plan JSON: {}", e))?;

    if output.plan_items.is_empty() {
        return Err("planner produced no plan items".to_string());
    }

    let mut seen = HashSet::new();
    let mut items = Vec::with_capacity(output.plan_items.len());
    for (index, planned) in output.plan_items.into_iter().enumerate() {
        let id = unique_item_id(planned.id.as_deref(), index, |id| seen.contains(id));
        seen.insert(id.clone());

        items.push(PlanItem {
            id,
            topic: planned.topic,
            description: planned.description,
            scope: planned.scope,
            priority: clamp_priority(planned.priority),
            key_questions: planned.key_questions,
            suggested_sources: planned.suggested_sources,
            status: PlanItemStatus::Pending,
        });
    }

    Ok(Plan {
        understanding: output.understanding,
        clarifications: output.clarifications,
        items,
        estimated_minutes: output.estimated_time_minutes,
    })
}

// ============================================================================
// Researcher
// ============================================================================

#[derive(Debug, Deserialize)]
struct ResearcherOutput {
    findings: Option<String>,
    #[serde(default)]
    sources: Vec<SourceOutput>,
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SourceOutput {
    url: Option<String>,
    title: Option<String>,
    #[serde(default)]
    snippet: String,
    reliability: Option<String>,
}

impl From<SourceOutput> for Source {
    fn from(source: SourceOutput) -> Self {
        Source {
            url: source.url.filter(|url| !url.is_empty()),
            title: source.title.unwrap_or_else(|| "Unknown".to_string()),
            snippet: source.snippet,
            reliability: source.reliability.unwrap_or_else(|| "medium".to_string()),
        }
    }
}

/// Build the result of a successful research call for `item`
pub fn researcher_result(item: &PlanItem, execution: &ExecutionResult) -> AgentResult {
    let content = &execution.content;
    let parsed = extract_json_object(content)
        .and_then(|json| serde_json::from_str::<ResearcherOutput>(json).ok());

    let (findings, sources, confidence) = match parsed {
        Some(output) => (
            output.findings.unwrap_or_else(|| content.clone()),
            output.sources.into_iter().map(Source::from).collect(),
            output.confidence.unwrap_or(DEFAULT_CONFIDENCE),
        ),
        None => {
            tracing::debug!(item_id = %item.id, "Researcher output has no JSON, using raw text");
            (content.clone(), Vec::new(), UNSTRUCTURED_CONFIDENCE)
        }
    };

    AgentResult {
        agent_id: agent_id_for(&item.id),
        plan_item_id: item.id.clone(),
        topic: item.topic.clone(),
        findings,
        sources,
        confidence: confidence.clamp(0.0, 1.0),
        raw_notes: content.clone(),
        execution_time: execution.duration,
    }
}
