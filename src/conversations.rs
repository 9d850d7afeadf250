//! Conversation and message persistence.

use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Conversation, Message, NewConversation, NewMessage};
use crate::schema::{conversations, messages};

pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

const AUTO_TITLE_MAX_CHARS: usize = 80;

pub fn list_conversations(
    conn: &mut PgConnection,
    org_id: i64,
    user_id: i64,
) -> AppResult<Vec<Conversation>> {
    let rows = conversations::table
        .filter(conversations::org_id.eq(org_id))
        .filter(conversations::user_id.eq(user_id))
        .order(conversations::last_message_at.desc())
        .load(conn)?;
    Ok(rows)
}

pub fn create_conversation(
    conn: &mut PgConnection,
    org_id: i64,
    user_id: i64,
    title: Option<String>,
) -> AppResult<Conversation> {
    let new_conversation = NewConversation {
        id: Uuid::new_v4(),
        org_id,
        user_id,
        title: title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "New conversation".to_string()),
    };

    diesel::insert_into(conversations::table)
        .values(&new_conversation)
        .execute(conn)?;

    let conversation = conversations::table
        .find(new_conversation.id)
        .first(conn)?;
    Ok(conversation)
}

/// Loads a conversation, enforcing tenant and owner boundaries without
/// revealing whether the row exists.
pub fn get_owned_conversation(
    conn: &mut PgConnection,
    conversation_id: Uuid,
    org_id: i64,
    user_id: i64,
) -> AppResult<Conversation> {
    let conversation: Conversation = conversations::table
        .find(conversation_id)
        .first(conn)
        .optional()?
        .ok_or_else(AppError::not_found)?;

    if conversation.org_id != org_id || conversation.user_id != user_id {
        return Err(AppError::forbidden());
    }
    Ok(conversation)
}

pub fn list_messages(conn: &mut PgConnection, conversation_id: Uuid) -> AppResult<Vec<Message>> {
    let rows = messages::table
        .filter(messages::conversation_id.eq(conversation_id))
        .order(messages::created_at.asc())
        .load(conn)?;
    Ok(rows)
}

/// Appends a message and bumps the conversation's `last_message_at`. The
/// first user message also titles an untitled conversation.
pub fn append_message(
    conn: &mut PgConnection,
    conversation: &Conversation,
    role: &str,
    content: &str,
    reasoning: Option<Value>,
    sources: Option<Value>,
) -> AppResult<Message> {
    let new_message = NewMessage {
        id: Uuid::new_v4(),
        conversation_id: conversation.id,
        role: role.to_string(),
        content: content.to_string(),
        reasoning,
        sources,
    };

    conn.transaction::<_, AppError, _>(|conn| {
        diesel::insert_into(messages::table)
            .values(&new_message)
            .execute(conn)?;

        let now = Utc::now().naive_utc();
        diesel::update(conversations::table.find(conversation.id))
            .set(conversations::last_message_at.eq(now))
            .execute(conn)?;

        if role == ROLE_USER && conversation.title == "New conversation" {
            diesel::update(conversations::table.find(conversation.id))
                .set(conversations::title.eq(auto_title(content)))
                .execute(conn)?;
        }

        Ok(())
    })?;

    let message = messages::table.find(new_message.id).first(conn)?;
    Ok(message)
}

pub fn set_archived(
    conn: &mut PgConnection,
    conversation_id: Uuid,
    archived: bool,
) -> AppResult<()> {
    diesel::update(conversations::table.find(conversation_id))
        .set(conversations::archived.eq(archived))
        .execute(conn)?;
    Ok(())
}

/// First line of the first user message, clipped to 80 characters.
pub fn auto_title(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "New conversation".to_string();
    }
    first_line.chars().take(AUTO_TITLE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::auto_title;

    #[test]
    fn title_is_first_line_clipped() {
        assert_eq!(auto_title("What is our travel policy?\nDetails..."), "What is our travel policy?");
        let long = "x".repeat(200);
        assert_eq!(auto_title(&long).chars().count(), 80);
    }

    #[test]
    fn blank_content_keeps_default_title() {
        assert_eq!(auto_title("   \n"), "New conversation");
    }
}
