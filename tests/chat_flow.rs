mod common;

use anyhow::Result;
use axum::http::StatusCode;
use common::{acquire_db_lock, body_to_json, TestApp};
use serde_json::json;
use uuid::Uuid;

async fn create_conversation(app: &TestApp, token: &str, org_id: i64) -> Result<Uuid> {
    let response = app
        .post_json(
            "/api/chat/conversations",
            &json!({ "org_id": org_id }),
            Some(token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_to_json(response.into_body()).await?;
    Ok(serde_json::from_value(body["conversation_id"].clone())?)
}

#[tokio::test]
async fn rag_with_empty_corpus_refuses_to_guess() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let token = app.session_token(1, 7, "member");
    let conversation = create_conversation(&app, &token, 7).await?;

    let response = app
        .post_json(
            &format!("/api/chat/{conversation}/messages"),
            &json!({ "message": "what is our travel policy?", "use_rag": true }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert_eq!(
        body["answer"],
        "I don't know based on the available documents."
    );
    assert_eq!(body["sources"]["documents"].as_array().unwrap().len(), 0);

    Ok(())
}

#[tokio::test]
async fn rag_answers_from_uploaded_documents() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let token = app.session_token(1, 7, "member");

    let response = app
        .upload_files(
            7,
            &[(
                "travel_policy.txt",
                "text/plain",
                b"Travel policy: all trips over 500 dollars require manager approval."
                    .as_slice(),
            )],
            &token,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    app.run_worker_until_idle().await?;

    let conversation = create_conversation(&app, &token, 7).await?;
    let response = app
        .post_json(
            &format!("/api/chat/{conversation}/messages"),
            &json!({ "message": "what is the travel approval policy?" }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;
    assert!(body["answer"].as_str().unwrap().contains("[1]"));
    let documents = body["sources"]["documents"].as_array().unwrap();
    assert!(!documents.is_empty());
    assert_eq!(documents[0]["filename"], "travel_policy.txt");
    assert!(body["usage"]["total_tokens"].as_i64().unwrap() > 0);

    // Both turns were persisted in order with the sources attached.
    let response = app
        .get(&format!("/api/chat/{conversation}/messages"), Some(&token))
        .await?;
    let messages = body_to_json(response.into_body()).await?;
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert!(messages[1]["sources"]["documents"].as_array().is_some());

    Ok(())
}

#[tokio::test]
async fn orchestrator_path_returns_reasoning_steps() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let token = app.session_token(1, 7, "member");

    let response = app
        .upload_files(
            7,
            &[(
                "expenses.txt",
                "text/plain",
                b"Expense reports are due by the fifth business day of each month."
                    .as_slice(),
            )],
            &token,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    app.run_worker_until_idle().await?;

    let conversation = create_conversation(&app, &token, 7).await?;
    let response = app
        .post_json(
            &format!("/api/chat/{conversation}/messages"),
            &json!({ "message": "when are expense reports due?", "use_rag": false }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response.into_body()).await?;

    let steps = body["reasoning_steps"].as_array().unwrap();
    assert!(steps[0].as_str().unwrap().starts_with("Planned sources:"));
    assert!(steps
        .iter()
        .any(|s| s.as_str().unwrap().contains("Synthesizing answer")));
    assert!(body["sources"]["documents"].as_array().is_some());
    assert!(body["sources"]["employees"].as_array().is_some());
    assert!(body["sources"]["external"].as_array().is_some());

    Ok(())
}

#[tokio::test]
async fn conversation_listing_titles_and_archive() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let token = app.session_token(1, 7, "member");

    let conversation = create_conversation(&app, &token, 7).await?;
    let response = app
        .post_json(
            &format!("/api/chat/{conversation}/messages"),
            &json!({ "message": "How do I request parental leave?\nAsking for next year." }),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .get("/api/chat/conversations?org_id=7", Some(&token))
        .await?;
    let list = body_to_json(response.into_body()).await?;
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    // Auto-title is the first line of the first user message.
    assert_eq!(list[0]["title"], "How do I request parental leave?");
    assert_eq!(list[0]["archived"], false);

    let response = app
        .post_json(
            &format!("/api/chat/{conversation}/archive"),
            &json!({}),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .get("/api/chat/conversations?org_id=7", Some(&token))
        .await?;
    let list = body_to_json(response.into_body()).await?;
    assert_eq!(list.as_array().unwrap()[0]["archived"], true);

    let response = app
        .post_json(
            &format!("/api/chat/{conversation}/unarchive"),
            &json!({}),
            Some(&token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    Ok(())
}

#[tokio::test]
async fn conversations_are_private_to_their_owner() -> Result<()> {
    let _guard = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let owner = app.session_token(1, 7, "member");
    let other_user = app.session_token(2, 7, "member");
    let other_org = app.session_token(3, 8, "member");

    let conversation = create_conversation(&app, &owner, 7).await?;

    for token in [&other_user, &other_org] {
        let response = app
            .get(&format!("/api/chat/{conversation}/messages"), Some(token))
            .await?;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    let response = app
        .get(&format!("/api/chat/{}/messages", Uuid::new_v4()), Some(&owner))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}
