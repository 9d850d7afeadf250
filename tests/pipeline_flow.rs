mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_json, TestApp};
use corpus::embedder::EmbedError;
use corpus::index::namespace_for_org;
use corpus::jobs::{enqueue_job, JOB_PROCESS_DOCUMENT};
use diesel::prelude::*;
use serde_json::json;
use uuid::Uuid;

const REPORT_TEXT: &[u8] = b"Quarterly report for the platform team.\n\n\
Uptime held at four nines across the quarter. Incident volume dropped by a \
third. The on-call rotation gained two new members and paging noise fell \
sharply after the alert cleanup.";

async fn upload_one(app: &TestApp, token: &str) -> Result<Uuid> {
    let response = app
        .upload_files(7, &[("q_report.txt", "text/plain", REPORT_TEXT)], token)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    Ok(serde_json::from_value(body["uploaded"][0]["doc_id"].clone())?)
}

#[tokio::test]
async fn reprocessing_is_idempotent() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let token = app.session_token(1, 7, "member");

    let doc_id = upload_one(&app, &token).await?;
    app.run_worker_until_idle().await?;

    let first_vectors = app.index().vector_ids(&namespace_for_org(7)).await;
    let first_chunks: i64 = app
        .with_conn(move |conn| {
            use corpus::schema::document_chunks::dsl::*;
            Ok(document_chunks
                .filter(document_id.eq(doc_id))
                .count()
                .get_result(conn)?)
        })
        .await?;
    assert!(first_chunks >= 1);

    // Second run on the same document, as the at-least-once queue can
    // deliver after a crash between upsert and completion.
    app.with_conn(move |conn| {
        enqueue_job(
            conn,
            7,
            JOB_PROCESS_DOCUMENT,
            json!({ "document_id": doc_id, "org_id": 7 }),
            None,
        )
        .map_err(anyhow::Error::from)
    })
    .await?;
    app.run_worker_until_idle().await?;

    let second_vectors = app.index().vector_ids(&namespace_for_org(7)).await;
    let second_chunks: i64 = app
        .with_conn(move |conn| {
            use corpus::schema::document_chunks::dsl::*;
            Ok(document_chunks
                .filter(document_id.eq(doc_id))
                .count()
                .get_result(conn)?)
        })
        .await?;

    assert_eq!(first_vectors, second_vectors);
    assert_eq!(first_chunks, second_chunks);

    // Exactly one classification row survived both runs.
    let classification_count: i64 = app
        .with_conn(move |conn| {
            use corpus::schema::document_classifications::dsl::*;
            Ok(document_classifications
                .filter(document_id.eq(doc_id))
                .count()
                .get_result(conn)?)
        })
        .await?;
    assert_eq!(classification_count, 1);

    let status: String = app
        .with_conn(move |conn| {
            use corpus::schema::documents::dsl::*;
            Ok(documents
                .find(doc_id)
                .select(status)
                .first(conn)?)
        })
        .await?;
    assert_eq!(status, "completed");

    Ok(())
}

#[tokio::test]
async fn budget_gate_fails_job_without_side_effects() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let token = app.session_token(1, 7, "member");

    app.embedder()
        .fail_next
        .lock()
        .await
        .replace(EmbedError::BudgetExceeded(
            "month-to-date $100.00 over limit".to_string(),
        ));

    let response = app
        .upload_files(7, &[("big.txt", "text/plain", REPORT_TEXT)], &token)
        .await?;
    let body = body_to_json(response.into_body()).await?;
    let doc_id: Uuid = serde_json::from_value(body["uploaded"][0]["doc_id"].clone())?;
    let job_id: Uuid = serde_json::from_value(body["uploaded"][0]["job_id"].clone())?;

    app.run_worker_until_idle().await?;

    let response = app
        .get(&format!("/api/jobs/{job_id}/status"), Some(&token))
        .await?;
    let job = body_to_json(response.into_body()).await?;
    assert_eq!(job["status"], "failed");
    assert!(job["error"].as_str().unwrap().starts_with("BudgetExceeded"));

    // No chunks and no vectors were left behind.
    let chunk_count: i64 = app
        .with_conn(move |conn| {
            use corpus::schema::document_chunks::dsl::*;
            Ok(document_chunks
                .filter(document_id.eq(doc_id))
                .count()
                .get_result(conn)?)
        })
        .await?;
    assert_eq!(chunk_count, 0);
    assert_eq!(app.index().vector_count(&namespace_for_org(7)).await, 0);

    let status: String = app
        .with_conn(move |conn| {
            use corpus::schema::documents::dsl::*;
            Ok(documents.find(doc_id).select(status).first(conn)?)
        })
        .await?;
    assert_eq!(status, "failed");

    Ok(())
}

#[tokio::test]
async fn transient_embed_failure_retries_to_success() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let token = app.session_token(1, 7, "member");

    // First embed call fails transiently; the retry succeeds.
    app.embedder()
        .fail_next
        .lock()
        .await
        .replace(EmbedError::Upstream("connection reset".to_string()));

    let doc_id = upload_one(&app, &token).await?;
    app.run_worker_until_idle().await?;

    // The retry is scheduled ~30s out; pull it forward and drain again.
    app.with_conn(|conn| {
        use corpus::schema::jobs::dsl::*;
        diesel::update(jobs)
            .set(run_after.eq(chrono::Utc::now().naive_utc()))
            .execute(conn)?;
        Ok(())
    })
    .await?;
    app.run_worker_until_idle().await?;

    let status: String = app
        .with_conn(move |conn| {
            use corpus::schema::documents::dsl::*;
            Ok(documents.find(doc_id).select(status).first(conn)?)
        })
        .await?;
    assert_eq!(status, "completed");

    let vectors = app.index().vector_ids(&namespace_for_org(7)).await;
    assert!(!vectors.is_empty());

    Ok(())
}

#[tokio::test]
async fn job_progress_is_monotonic_and_timestamps_ordered() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let token = app.session_token(1, 7, "member");

    let response = app
        .upload_files(7, &[("notes.txt", "text/plain", REPORT_TEXT)], &token)
        .await?;
    let body = body_to_json(response.into_body()).await?;
    let job_id: Uuid = serde_json::from_value(body["uploaded"][0]["job_id"].clone())?;

    app.run_worker_until_idle().await?;

    let job = app
        .with_conn(move |conn| {
            use corpus::schema::jobs::dsl::*;
            Ok(jobs.find(job_id).first::<corpus::models::Job>(conn)?)
        })
        .await?;

    assert_eq!(job.status, "completed");
    assert_eq!(job.progress, 100);
    let started = job.started_at.expect("started_at set");
    let completed = job.completed_at.expect("completed_at set");
    assert!(started <= completed);

    // A stale progress write cannot move the bar backwards.
    app.with_conn(move |conn| {
        corpus::jobs::set_job_progress(conn, job_id, 10).map_err(anyhow::Error::from)
    })
    .await?;
    let progress: i32 = app
        .with_conn(move |conn| {
            use corpus::schema::jobs::dsl::*;
            Ok(jobs.find(job_id).select(progress).first(conn)?)
        })
        .await?;
    assert_eq!(progress, 100);

    Ok(())
}

#[tokio::test]
async fn employee_embedding_and_search() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let token = app.session_token(1, 7, "member");

    let response = app
        .post_json(
            "/api/embeddings/generate",
            &json!({
                "org_id": 7,
                "profile": {
                    "name": "Ada Lovelace",
                    "title": "Staff Engineer",
                    "skills": ["Rust", "distributed systems", "databases"]
                }
            }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    app.run_worker_until_idle().await?;

    let response = app
        .post_json(
            "/api/employees/search",
            &json!({ "query": "who knows rust and databases?", "org_id": 7 }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert!(body["results_count"].as_u64().unwrap() >= 1);
    assert_eq!(body["results"][0]["name"], "Ada Lovelace");
    assert_eq!(body["results"][0]["user_id"], 1);

    // A member cannot rebuild someone else's vector.
    let response = app
        .post_json(
            "/api/embeddings/generate",
            &json!({ "org_id": 7, "user_id": 99 }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    Ok(())
}

#[tokio::test]
async fn health_endpoint_is_unauthenticated() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let response = app.get("/api/health", None).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"], "ok");
    assert_eq!(body["checks"]["vector_index"], "ok");

    // System status requires a session.
    let response = app.get("/api/system/status?org_id=7", None).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = app.session_token(1, 7, "member");
    let response = app.get("/api/system/status?org_id=7", Some(&token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert!(body["documents"]["total"].as_i64().is_some());
    assert!(body["usage_this_month"]["tokens"].as_i64().is_some());

    Ok(())
}
