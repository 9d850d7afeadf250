use std::collections::HashMap;

use axum::extract::{Json, Query, State};

use crate::auth::Identity;
use crate::error::{AppError, AppResult};
use crate::folders::{self, Facet, FolderBucket};
use crate::state::AppState;

/// `GET /api/folders/by-{team|project|type|date|person}?org_id=&{facet}=`.
/// The optional filter parameter is named after the facet, e.g.
/// `by-team?org_id=7&team=Engineering`.
async fn facet_view(
    state: AppState,
    identity: Identity,
    params: HashMap<String, String>,
    facet: Facet,
    facet_param: &str,
) -> AppResult<Json<Vec<FolderBucket>>> {
    let org_id: i64 = params
        .get("org_id")
        .ok_or_else(|| AppError::bad_request("org_id is required"))?
        .parse()
        .map_err(|_| AppError::bad_request("org_id must be an integer"))?;
    identity.require_org(org_id)?;

    let filter = params.get(facet_param).map(|s| s.as_str());

    let mut conn = state.db()?;
    let view = folders::folder_view(&mut conn, org_id, facet, filter)?;
    Ok(Json(view))
}

pub async fn by_team(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    identity: Identity,
) -> AppResult<Json<Vec<FolderBucket>>> {
    facet_view(state, identity, params, Facet::Team, "team").await
}

pub async fn by_project(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    identity: Identity,
) -> AppResult<Json<Vec<FolderBucket>>> {
    facet_view(state, identity, params, Facet::Project, "project").await
}

pub async fn by_type(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    identity: Identity,
) -> AppResult<Json<Vec<FolderBucket>>> {
    facet_view(state, identity, params, Facet::DocType, "type").await
}

pub async fn by_date(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    identity: Identity,
) -> AppResult<Json<Vec<FolderBucket>>> {
    facet_view(state, identity, params, Facet::Date, "date").await
}

pub async fn by_person(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    identity: Identity,
) -> AppResult<Json<Vec<FolderBucket>>> {
    facet_view(state, identity, params, Facet::Person, "person").await
}
