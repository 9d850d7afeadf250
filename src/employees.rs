//! Employee profile embeddings and people search.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::embedder::Embedder as _;
use crate::error::{AppError, AppResult};
use crate::index::{employee_vector_id, namespace_for_org, VectorIndex as _, VectorRecord};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeHit {
    pub user_id: i64,
    pub name: String,
    pub title: String,
    pub specialties: String,
    pub relevance: f32,
}

/// Flattens a profile snapshot into the text that gets embedded.
pub fn profile_text(snapshot: &Value) -> String {
    let mut parts = Vec::new();
    for (label, key) in [
        ("Name", "name"),
        ("Title", "title"),
        ("Bio", "bio"),
        ("Skills", "skills"),
        ("Specialties", "specialties"),
    ] {
        match snapshot.get(key) {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                parts.push(format!("{label}: {text}"));
            }
            Some(Value::Array(items)) => {
                let joined = items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                if !joined.is_empty() {
                    parts.push(format!("{label}: {joined}"));
                }
            }
            _ => {}
        }
    }
    parts.join("\n")
}

/// Embeds the profile and upserts the `employee_{user}` vector in the
/// tenant namespace.
pub async fn upsert_employee_vector(
    state: &AppState,
    org_id: i64,
    user_id: i64,
    snapshot: &Value,
) -> AppResult<String> {
    let text = profile_text(snapshot);
    if text.trim().is_empty() {
        return Err(AppError::bad_request("employee profile is empty"));
    }

    let vectors = state.embedder.embed(&[text], org_id).await?;
    let vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| AppError::internal("embedder returned no vector for profile"))?;

    let vector_id = employee_vector_id(user_id);
    let metadata = json!({
        "type": "employee",
        "user_id": user_id,
        "org_id": org_id,
        "name": snapshot.get("name").and_then(Value::as_str).unwrap_or_default(),
        "title": snapshot.get("title").and_then(Value::as_str).unwrap_or_default(),
        "specialties": specialties_text(snapshot),
    });

    state
        .index
        .upsert(
            &namespace_for_org(org_id),
            vec![VectorRecord {
                id: vector_id.clone(),
                values: vector,
                metadata,
            }],
        )
        .await?;

    Ok(vector_id)
}

pub async fn search_employees(
    state: &AppState,
    org_id: i64,
    query: &str,
    top_k: usize,
) -> AppResult<Vec<EmployeeHit>> {
    let embeddings = state.embedder.embed(&[query.to_string()], org_id).await?;
    let query_vector = embeddings
        .into_iter()
        .next()
        .ok_or_else(|| AppError::internal("embedder returned no vector for query"))?;

    let matches = state
        .index
        .search(
            &namespace_for_org(org_id),
            &query_vector,
            top_k,
            Some(json!({ "type": { "$eq": "employee" } })),
        )
        .await?;

    let hits = matches
        .into_iter()
        .filter_map(|m| {
            let user_id = m.metadata.get("user_id").and_then(Value::as_i64)?;
            Some(EmployeeHit {
                user_id,
                name: m
                    .metadata
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                title: m
                    .metadata
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                specialties: m
                    .metadata
                    .get("specialties")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                relevance: m.score,
            })
        })
        .collect();

    Ok(hits)
}

fn specialties_text(snapshot: &Value) -> String {
    match snapshot.get("specialties").or_else(|| snapshot.get("skills")) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", "),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_text_includes_known_fields() {
        let snapshot = json!({
            "name": "Ada Lovelace",
            "title": "Staff Engineer",
            "skills": ["Rust", "Databases"],
            "irrelevant": 42,
        });
        let text = profile_text(&snapshot);
        assert!(text.contains("Name: Ada Lovelace"));
        assert!(text.contains("Title: Staff Engineer"));
        assert!(text.contains("Skills: Rust, Databases"));
        assert!(!text.contains("irrelevant"));
    }

    #[test]
    fn empty_profile_produces_empty_text() {
        assert!(profile_text(&json!({})).is_empty());
    }
}
