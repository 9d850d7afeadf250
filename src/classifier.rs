//! Multi-dimensional document classification.
//!
//! A chat model labels each document with team, project, type, time period,
//! confidentiality, mentioned people, tags, and a summary, each with a
//! confidence in [0,1]. The model sees the tenant's existing teams, projects
//! and doc types so labels converge instead of fragmenting. Classification
//! is best-effort: any model failure degrades to a filename heuristic and
//! never blocks document completion.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use crate::llm::{ChatMessage, ChatModel, ChatOptions, LlmError};

pub const DOCUMENT_TYPES: &[&str] = &[
    "contract",
    "policy",
    "report",
    "presentation",
    "meeting_notes",
    "invoice",
    "receipt",
    "proposal",
    "memo",
    "email",
    "spreadsheet",
    "handbook",
    "guide",
    "manual",
    "whitepaper",
    "case_study",
    "specification",
    "design_doc",
    "research",
    "analysis",
    "other",
];

pub const CONFIDENTIALITY_LEVELS: &[&str] = &["public", "internal", "confidential", "restricted"];

const MAX_PROMPT_CHARS: usize = 6000;
const MAX_TAGS: usize = 5;
const MAX_PEOPLE: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub team: Option<String>,
    pub project: Option<String>,
    pub doc_type: String,
    pub time_period: Option<String>,
    pub confidentiality: String,
    #[serde(default)]
    pub people: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub confidence: HashMap<String, f32>,
}

#[derive(Debug, Clone, Default)]
pub struct OrgContext {
    pub teams: Vec<String>,
    pub projects: Vec<String>,
    pub doc_types: Vec<String>,
}

/// Per-tenant soft cache of the organizational vocabulary. Invalidated on
/// every classification write; a miss just means the next classify reloads.
#[derive(Default)]
pub struct OrgContextCache {
    entries: RwLock<HashMap<i64, OrgContext>>,
}

impl OrgContextCache {
    pub async fn get(&self, org_id: i64) -> Option<OrgContext> {
        self.entries.read().await.get(&org_id).cloned()
    }

    pub async fn put(&self, org_id: i64, context: OrgContext) {
        self.entries.write().await.insert(org_id, context);
    }

    pub async fn invalidate(&self, org_id: i64) {
        self.entries.write().await.remove(&org_id);
    }
}

pub async fn classify(
    chat: &dyn ChatModel,
    document_text: &str,
    filename: &str,
    context: &OrgContext,
) -> ClassificationResult {
    let prompt = build_prompt(document_text, filename, context);
    let options = ChatOptions {
        temperature: 0.2,
        max_tokens: 800,
        json_response: true,
    };
    let messages = [
        ChatMessage::system(
            "You are an expert document classifier. Analyze documents and return \
             structured classification information as JSON.",
        ),
        ChatMessage::user(prompt),
    ];

    // One retry on model failure or unparsable JSON, then the heuristic
    // fallback.
    for attempt in 0..2 {
        match chat.complete(&messages, options).await {
            Ok(completion) => match parse_classification(&completion.content) {
                Ok(raw) => return validate(raw),
                Err(err) => {
                    warn!(attempt, filename, error = %err, "classification JSON invalid");
                }
            },
            Err(LlmError::Upstream(message)) | Err(LlmError::Invalid(message)) => {
                warn!(attempt, filename, error = %message, "classification call failed");
            }
        }
    }

    fallback_classification(filename)
}

fn build_prompt(document_text: &str, filename: &str, context: &OrgContext) -> String {
    let mut sample: String = document_text.chars().take(MAX_PROMPT_CHARS).collect();
    if document_text.chars().count() > MAX_PROMPT_CHARS {
        sample.push_str("\n\n[... document continues ...]");
    }

    let known_teams = if context.teams.is_empty() {
        "None specified".to_string()
    } else {
        context.teams.join(", ")
    };
    let known_projects = if context.projects.is_empty() {
        "None specified".to_string()
    } else {
        context.projects.join(", ")
    };

    format!(
        r#"Analyze this document and provide a comprehensive classification.

Document filename: {filename}

Document content:
{sample}

Organization context:
- Known teams: {known_teams}
- Known projects: {known_projects}

Respond with a JSON object:
{{
  "team": "owning team, e.g. Engineering, Marketing, Legal; use a known team when applicable",
  "project": "related project, or null if not project-specific",
  "doc_type": "one of: {types}",
  "time_period": "period referenced, formatted YYYY, YYYY-QN, MMM-YYYY or FYYYYY; null if none",
  "confidentiality": "one of: {levels}",
  "people": ["up to {max_people} full names of actual people mentioned"],
  "tags": ["3-5 specific keywords describing the content"],
  "summary": "one or two sentence summary",
  "confidence": {{ "team": 0.9, "project": 0.8, "doc_type": 0.95, "time_period": 0.9, "confidentiality": 0.85 }}
}}

Confidence values must be between 0.0 and 1.0. Respond ONLY with valid JSON."#,
        types = DOCUMENT_TYPES.join(", "),
        levels = CONFIDENTIALITY_LEVELS.join(", "),
        max_people = MAX_PEOPLE,
    )
}

fn parse_classification(content: &str) -> Result<ClassificationResult, serde_json::Error> {
    serde_json::from_str(content.trim())
}

/// Normalizes model output against the fixed vocabularies. Confidence
/// values outside [0,1] are rejected and replaced with 0.5 rather than
/// rescaled.
fn validate(mut raw: ClassificationResult) -> ClassificationResult {
    if !DOCUMENT_TYPES.contains(&raw.doc_type.as_str()) {
        raw.doc_type = "other".to_string();
    }
    if !CONFIDENTIALITY_LEVELS.contains(&raw.confidentiality.as_str()) {
        raw.confidentiality = "internal".to_string();
    }

    raw.team = raw.team.filter(|t| !t.trim().is_empty());
    raw.project = raw
        .project
        .filter(|p| !p.trim().is_empty() && p.trim().to_lowercase() != "none");
    raw.time_period = raw.time_period.filter(|t| !t.trim().is_empty());

    raw.tags.truncate(MAX_TAGS);
    raw.people.truncate(MAX_PEOPLE);

    for field in ["team", "project", "doc_type", "time_period", "confidentiality"] {
        let score = raw.confidence.get(field).copied();
        let valid = score.map(|s| (0.0..=1.0).contains(&s) && s.is_finite());
        if valid != Some(true) {
            raw.confidence.insert(field.to_string(), 0.5);
        }
    }

    raw
}

/// Minimal classification when the model is unavailable: the doc type comes
/// from the extension and filename keywords, everything else defaults.
pub fn fallback_classification(filename: &str) -> ClassificationResult {
    let lower = filename.to_lowercase();
    let doc_type = if lower.ends_with(".csv") || lower.ends_with(".xlsx") {
        "spreadsheet"
    } else if lower.contains("report") {
        "report"
    } else if lower.contains("contract") {
        "contract"
    } else if lower.contains("invoice") {
        "invoice"
    } else if lower.contains("policy") {
        "policy"
    } else if lower.contains("proposal") {
        "proposal"
    } else {
        "other"
    };

    let confidence = [
        ("team", 0.1_f32),
        ("project", 0.1),
        ("doc_type", 0.3),
        ("time_period", 0.1),
        ("confidentiality", 0.3),
    ]
    .into_iter()
    .map(|(field, score)| (field.to_string(), score))
    .collect();

    ClassificationResult {
        team: None,
        project: None,
        doc_type: doc_type.to_string(),
        time_period: None,
        confidentiality: "internal".to_string(),
        people: Vec::new(),
        tags: Vec::new(),
        summary: "Document could not be automatically classified".to_string(),
        confidence,
    }
}

/// Confidence map for persistence.
pub fn confidence_json(result: &ClassificationResult) -> Value {
    serde_json::to_value(&result.confidence).unwrap_or_else(|_| serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_doc_type_becomes_other() {
        let raw = ClassificationResult {
            doc_type: "sonnet".to_string(),
            confidentiality: "internal".to_string(),
            ..Default::default()
        };
        assert_eq!(validate(raw).doc_type, "other");
    }

    #[test]
    fn unknown_confidentiality_becomes_internal() {
        let raw = ClassificationResult {
            doc_type: "policy".to_string(),
            confidentiality: "top-secret".to_string(),
            ..Default::default()
        };
        assert_eq!(validate(raw).confidentiality, "internal");
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let mut raw = ClassificationResult {
            doc_type: "policy".to_string(),
            confidentiality: "internal".to_string(),
            ..Default::default()
        };
        raw.confidence.insert("team".to_string(), 1.4);
        raw.confidence.insert("doc_type".to_string(), -0.2);
        raw.confidence.insert("project".to_string(), 0.8);
        let validated = validate(raw);
        assert_eq!(validated.confidence["team"], 0.5);
        assert_eq!(validated.confidence["doc_type"], 0.5);
        assert_eq!(validated.confidence["project"], 0.8);
    }

    #[test]
    fn tags_and_people_are_capped() {
        let raw = ClassificationResult {
            doc_type: "policy".to_string(),
            confidentiality: "internal".to_string(),
            tags: (0..10).map(|i| format!("tag{i}")).collect(),
            people: (0..20).map(|i| format!("Person {i}")).collect(),
            ..Default::default()
        };
        let validated = validate(raw);
        assert_eq!(validated.tags.len(), MAX_TAGS);
        assert_eq!(validated.people.len(), MAX_PEOPLE);
    }

    #[test]
    fn fallback_infers_type_from_filename() {
        assert_eq!(fallback_classification("q1_report.pdf").doc_type, "report");
        assert_eq!(fallback_classification("master_contract.docx").doc_type, "contract");
        assert_eq!(fallback_classification("numbers.csv").doc_type, "spreadsheet");
        assert_eq!(fallback_classification("mystery.bin").doc_type, "other");
        assert_eq!(fallback_classification("notes.txt").confidentiality, "internal");
    }

    #[tokio::test]
    async fn cache_invalidation_drops_entry() {
        let cache = OrgContextCache::default();
        cache
            .put(
                7,
                OrgContext {
                    teams: vec!["Engineering".into()],
                    ..Default::default()
                },
            )
            .await;
        assert!(cache.get(7).await.is_some());
        cache.invalidate(7).await;
        assert!(cache.get(7).await.is_none());
    }
}
