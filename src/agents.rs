//! Multi-agent answering.
//!
//! A planner picks which of the three sources to consult (documents, people,
//! external research); the selected agents run concurrently under the chat
//! turn deadline; a synthesis call fuses whatever completed into a cited
//! answer. The agent set is closed, so each agent is a tagged variant with
//! the same outcome shape rather than a trait object.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::warn;

use crate::employees::{self, EmployeeHit};
use crate::error::AppResult;
use crate::llm::{ChatMessage, ChatModel as _, ChatOptions, Researcher as _, ResearchHit, TokenUsage};
use crate::rag::{RagRequest, RagSource};
use crate::state::AppState;

const EMPLOYEE_TOP_K: usize = 5;
const RESEARCH_MAX_RESULTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Documents,
    People,
    External,
}

impl AgentKind {
    fn label(&self) -> &'static str {
        match self {
            AgentKind::Documents => "documents",
            AgentKind::People => "people",
            AgentKind::External => "external",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct QueryPlan {
    #[serde(default = "default_true")]
    needs_documents: bool,
    #[serde(default)]
    needs_people: bool,
    #[serde(default)]
    needs_external: bool,
}

fn default_true() -> bool {
    true
}

impl QueryPlan {
    fn selected(&self) -> Vec<AgentKind> {
        let mut kinds = Vec::new();
        if self.needs_documents {
            kinds.push(AgentKind::Documents);
        }
        if self.needs_people {
            kinds.push(AgentKind::People);
        }
        if self.needs_external {
            kinds.push(AgentKind::External);
        }
        kinds
    }
}

enum AgentHits {
    Documents(Vec<RagSource>),
    People(Vec<EmployeeHit>),
    External(Vec<ResearchHit>),
}

struct AgentOutcome {
    steps: Vec<String>,
    hits: AgentHits,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorSources {
    pub documents: Vec<RagSource>,
    pub employees: Vec<EmployeeHit>,
    pub external: Vec<ResearchHit>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorAnswer {
    pub answer: String,
    pub confidence: f32,
    pub reasoning_steps: Vec<String>,
    pub sources: OrchestratorSources,
    pub usage: TokenUsage,
}

pub async fn process_query(
    state: &AppState,
    org_id: i64,
    query: &str,
) -> AppResult<OrchestratorAnswer> {
    let mut reasoning_steps = Vec::new();

    let plan = plan_query(state, query).await;
    let selected = plan.selected();
    reasoning_steps.push(format!(
        "Planned sources: {}",
        selected
            .iter()
            .map(|kind| kind.label())
            .collect::<Vec<_>>()
            .join(", ")
    ));

    let deadline = Duration::from_secs(state.config.chat_turn_timeout_secs);
    let mut join_set: JoinSet<AgentOutcome> = JoinSet::new();

    for kind in selected {
        let state = state.clone();
        let query = query.to_string();
        join_set.spawn(async move { run_agent(kind, &state, org_id, &query).await });
    }

    let mut documents = Vec::new();
    let mut people = Vec::new();
    let mut external = Vec::new();

    // Collect in completion order until done or the turn deadline; anything
    // still running is cancelled and synthesis uses what arrived.
    let deadline_at = tokio::time::Instant::now() + deadline;
    let mut outcomes = Vec::new();
    loop {
        tokio::select! {
            joined = join_set.join_next() => {
                match joined {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(err)) => warn!(error = %err, "sub-agent task failed"),
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline_at) => {
                join_set.abort_all();
                reasoning_steps.push(format!(
                    "Turn deadline of {}s reached; synthesizing from completed agents",
                    deadline.as_secs()
                ));
                break;
            }
        }
    }

    for outcome in outcomes {
        reasoning_steps.extend(outcome.steps);
        match outcome.hits {
            AgentHits::Documents(hits) => documents = hits,
            AgentHits::People(hits) => people = hits,
            AgentHits::External(hits) => external = hits,
        }
    }

    reasoning_steps.push("Synthesizing answer from all sources".to_string());
    let synthesis = synthesize(state, query, &documents, &people, &external).await?;
    reasoning_steps.push(format!(
        "Synthesis used {} cited sources",
        synthesis.sources_used
    ));

    Ok(OrchestratorAnswer {
        answer: synthesis.answer,
        confidence: synthesis.confidence,
        reasoning_steps,
        sources: OrchestratorSources {
            documents,
            employees: people,
            external,
        },
        usage: synthesis.usage,
    })
}

async fn run_agent(kind: AgentKind, state: &AppState, org_id: i64, query: &str) -> AgentOutcome {
    match kind {
        AgentKind::Documents => {
            let mut steps = vec![format!("Searching internal documents for: {query}")];
            let hits = match crate::rag::retrieve(state, org_id, &RagRequest::new(state, query)).await
            {
                Ok(hits) => {
                    steps.push(format!("Found {} relevant document chunks", hits.len()));
                    hits
                }
                Err(err) => {
                    warn!(error = %err, "document agent failed");
                    steps.push("Document search failed; continuing without it".to_string());
                    Vec::new()
                }
            };
            AgentOutcome {
                steps,
                hits: AgentHits::Documents(hits),
            }
        }
        AgentKind::People => {
            let mut steps = vec!["Searching team member profiles".to_string()];
            let hits = match employees::search_employees(state, org_id, query, EMPLOYEE_TOP_K).await
            {
                Ok(hits) => {
                    steps.push(format!("Found {} relevant team members", hits.len()));
                    hits
                }
                Err(err) => {
                    warn!(error = %err, "people agent failed");
                    steps.push("People search failed; continuing without it".to_string());
                    Vec::new()
                }
            };
            AgentOutcome {
                steps,
                hits: AgentHits::People(hits),
            }
        }
        AgentKind::External => {
            let mut steps = Vec::new();
            let hits = match &state.researcher {
                Some(researcher) => {
                    steps.push("Querying external research sources".to_string());
                    match researcher.query(query, RESEARCH_MAX_RESULTS).await {
                        Ok(hits) => {
                            steps.push(format!("Found {} external sources", hits.len()));
                            hits
                        }
                        Err(err) => {
                            warn!(error = %err, "research agent failed");
                            steps.push("External research failed; continuing without it".to_string());
                            Vec::new()
                        }
                    }
                }
                None => {
                    steps.push(
                        "External research not configured; skipping external sources".to_string(),
                    );
                    Vec::new()
                }
            };
            AgentOutcome {
                steps,
                hits: AgentHits::External(hits),
            }
        }
    }
}

/// Chat-model intent classification with a keyword fallback.
async fn plan_query(state: &AppState, query: &str) -> QueryPlan {
    let messages = [
        ChatMessage::system(
            r#"Decide which sources are needed to answer the user's question.
Respond in JSON:
{
  "needs_documents": true,
  "needs_people": false,
  "needs_external": false
}
needs_people: the question asks about people, team members or who has a skill.
needs_external: the question requires current public information unlikely to be in internal documents."#,
        ),
        ChatMessage::user(query.to_string()),
    ];
    let options = ChatOptions {
        temperature: 0.2,
        max_tokens: 100,
        json_response: true,
    };

    match state.chat.complete(&messages, options).await {
        Ok(completion) => match serde_json::from_str::<QueryPlan>(completion.content.trim()) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "query plan JSON invalid; using heuristic");
                heuristic_plan(query)
            }
        },
        Err(err) => {
            warn!(error = %err, "query planner failed; using heuristic");
            heuristic_plan(query)
        }
    }
}

fn heuristic_plan(query: &str) -> QueryPlan {
    let lower = query.to_lowercase();
    QueryPlan {
        needs_documents: true,
        needs_people: lower.contains("who ")
            || lower.starts_with("who")
            || lower.contains("team")
            || lower.contains("skill"),
        needs_external: false,
    }
}

struct Synthesis {
    answer: String,
    confidence: f32,
    sources_used: usize,
    usage: TokenUsage,
}

async fn synthesize(
    state: &AppState,
    query: &str,
    documents: &[RagSource],
    people: &[EmployeeHit],
    external: &[ResearchHit],
) -> AppResult<Synthesis> {
    let prompt = build_synthesis_prompt(query, documents, people, external);
    let completion = state
        .chat
        .complete(
            &[
                ChatMessage::system(
                    "You synthesize information from multiple sources into one answer. \
                     Cite sources explicitly, e.g. \"According to [policy.pdf]...\". \
                     Distinguish internal knowledge from external sources. If sources \
                     conflict, surface the contradiction in the answer. If nothing \
                     relevant was found, say so honestly.",
                ),
                ChatMessage::user(prompt),
            ],
            ChatOptions::default(),
        )
        .await?;

    let sources_used = count_cited_sources(&completion.content, documents, people, external);
    let confidence = estimate_confidence(documents, people, external);

    Ok(Synthesis {
        answer: completion.content,
        confidence,
        sources_used,
        usage: completion.usage,
    })
}

fn build_synthesis_prompt(
    query: &str,
    documents: &[RagSource],
    people: &[EmployeeHit],
    external: &[ResearchHit],
) -> String {
    let mut parts = vec![format!("User question: {query}\n")];

    if !documents.is_empty() {
        parts.push("=== INTERNAL DOCUMENTS ===".to_string());
        for doc in documents.iter().take(5) {
            parts.push(format!(
                "[{}] (relevance: {:.2})\n{}\n",
                doc.filename, doc.score, doc.chunk_text
            ));
        }
    }

    if !people.is_empty() {
        parts.push("=== TEAM MEMBERS ===".to_string());
        for person in people.iter().take(3) {
            parts.push(format!(
                "{} - {}\nSpecialties: {}\n",
                person.name, person.title, person.specialties
            ));
        }
    }

    if !external.is_empty() {
        parts.push("=== EXTERNAL SOURCES ===".to_string());
        for hit in external.iter().take(3) {
            parts.push(format!("[{}] {}\n{}\n", hit.title, hit.url, hit.snippet));
        }
    }

    parts.push("Provide a comprehensive answer based on the sources above.".to_string());
    parts.join("\n")
}

fn count_cited_sources(
    answer: &str,
    documents: &[RagSource],
    people: &[EmployeeHit],
    external: &[ResearchHit],
) -> usize {
    let docs = documents
        .iter()
        .filter(|doc| answer.contains(doc.filename.as_str()))
        .count();
    let names = people
        .iter()
        .filter(|person| !person.name.is_empty() && answer.contains(person.name.as_str()))
        .count();
    let links = external
        .iter()
        .filter(|hit| answer.contains(hit.url.as_str()) || answer.contains(hit.title.as_str()))
        .count();
    docs + names + links
}

fn estimate_confidence(
    documents: &[RagSource],
    people: &[EmployeeHit],
    external: &[ResearchHit],
) -> f32 {
    let mut confidence = 0.0;
    if !documents.is_empty() {
        let top = &documents[..documents.len().min(3)];
        let avg: f32 = top.iter().map(|doc| doc.score).sum::<f32>() / top.len() as f32;
        confidence += avg * 0.5;
    }
    if !people.is_empty() {
        confidence += 0.3;
    }
    if !external.is_empty() {
        confidence += 0.2;
    }
    confidence.min(1.0)
}

/// Reasoning payload persisted on the assistant message.
pub fn reasoning_json(answer: &OrchestratorAnswer) -> Value {
    serde_json::json!({
        "steps": answer.reasoning_steps,
        "confidence": answer.confidence,
    })
}

/// Sources payload persisted on the assistant message.
pub fn sources_json(sources: &OrchestratorSources) -> Value {
    serde_json::to_value(sources).unwrap_or_else(|_| serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn doc(filename: &str, score: f32) -> RagSource {
        RagSource {
            doc_id: Uuid::new_v4(),
            filename: filename.to_string(),
            page: None,
            score,
            chunk_index: 0,
            chunk_text: "text".to_string(),
        }
    }

    #[test]
    fn heuristic_plan_detects_people_questions() {
        assert!(heuristic_plan("who knows rust?").needs_people);
        assert!(heuristic_plan("which team owns billing").needs_people);
        assert!(!heuristic_plan("what is the travel policy").needs_people);
    }

    #[test]
    fn confidence_scales_with_sources() {
        assert_eq!(estimate_confidence(&[], &[], &[]), 0.0);
        let with_docs = estimate_confidence(&[doc("a.pdf", 0.9), doc("b.pdf", 0.8)], &[], &[]);
        assert!(with_docs > 0.4 && with_docs < 0.5);
        let everything = estimate_confidence(
            &[doc("a.pdf", 1.0)],
            &[EmployeeHit {
                user_id: 1,
                name: "Ada".into(),
                title: "Eng".into(),
                specialties: String::new(),
                relevance: 0.9,
            }],
            &[ResearchHit {
                url: "https://example.com".into(),
                title: "Source 1".into(),
                snippet: String::new(),
                relevance: 1.0,
            }],
        );
        assert_eq!(everything, 1.0);
    }

    #[test]
    fn cited_source_counting_matches_by_name() {
        let documents = vec![doc("policy.pdf", 0.9), doc("other.md", 0.8)];
        let answer = "According to [policy.pdf], travel requires approval.";
        assert_eq!(count_cited_sources(answer, &documents, &[], &[]), 1);
    }

    #[test]
    fn synthesis_prompt_sections_only_appear_with_hits() {
        let prompt = build_synthesis_prompt("q", &[], &[], &[]);
        assert!(!prompt.contains("INTERNAL DOCUMENTS"));
        let prompt = build_synthesis_prompt("q", &[doc("a.pdf", 0.9)], &[], &[]);
        assert!(prompt.contains("INTERNAL DOCUMENTS"));
        assert!(!prompt.contains("TEAM MEMBERS"));
    }
}
