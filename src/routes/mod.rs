use axum::http::HeaderValue;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::AppState;

pub mod chat;
pub mod documents;
pub mod employees;
pub mod folders;
pub mod health;
pub mod jobs;
pub mod system;

pub fn create_router(state: AppState) -> Router<()> {
    let cors = if let Some(origins) = state.config.cors_allowed_origin.as_ref() {
        let headers: Vec<HeaderValue> = origins
            .split(',')
            .filter_map(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| {
                    trimmed
                        .parse::<HeaderValue>()
                        .expect("invalid CORS allowed origin")
                })
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let documents_routes = Router::new()
        .route("/upload", post(documents::upload_documents))
        .route("/search", post(documents::search_documents))
        .route(
            "/:id",
            get(documents::get_document).delete(documents::delete_document),
        )
        .route("/:id/download", get(documents::download_document))
        .route("/:id/classification", get(documents::get_classification))
        .route("/:id/reclassify", post(documents::reclassify_document));

    let folders_routes = Router::new()
        .route("/by-team", get(folders::by_team))
        .route("/by-project", get(folders::by_project))
        .route("/by-type", get(folders::by_type))
        .route("/by-date", get(folders::by_date))
        .route("/by-person", get(folders::by_person));

    let chat_routes = Router::new()
        .route(
            "/conversations",
            get(chat::list_conversations).post(chat::create_conversation),
        )
        .route("/:conversation_id/messages", get(chat::list_messages).post(chat::post_message))
        .route("/:conversation_id/archive", post(chat::archive_conversation))
        .route("/:conversation_id/unarchive", post(chat::unarchive_conversation));

    let max_body = (state.config.max_upload_bytes as usize).saturating_mul(11);

    Router::new()
        .route("/api/documents", get(documents::list_documents))
        .nest("/api/documents", documents_routes)
        .nest("/api/folders", folders_routes)
        .nest("/api/chat", chat_routes)
        .route("/api/employees/search", post(employees::search_employees))
        .route("/api/embeddings/generate", post(employees::generate_embedding))
        .route("/api/jobs/:job_id/status", get(jobs::job_status))
        .route("/api/health", get(health::health_check))
        .route("/api/system/status", get(system::system_status))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(max_body))
}
