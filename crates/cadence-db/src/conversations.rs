//! Conversation rows.

use crate::columns::{json, parsed};
use crate::error::DbError;
use cadence_types::Conversation;
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, room_name, status, preferences_json, created_at, updated_at";

pub fn insert_conversation(conn: &Connection, conversation: &Conversation) -> Result<(), DbError> {
    let preferences = serde_json::to_string(&conversation.preferences)?;
    conn.execute(
        "INSERT INTO conversations (
            id, room_name, status, preferences_json, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            conversation.id,
            conversation.room_name,
            conversation.status.as_str(),
            preferences,
            conversation.created_at,
            conversation.updated_at,
        ],
    )?;
    Ok(())
}

pub fn find_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>, DbError> {
    let conversation = conn
        .query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?1", COLUMNS),
            [id],
            map_row_to_conversation,
        )
        .optional()?;
    Ok(conversation)
}

/// Writes status, room and preferences back.
pub fn update_conversation(conn: &Connection, conversation: &Conversation) -> Result<(), DbError> {
    let preferences = serde_json::to_string(&conversation.preferences)?;
    let changed = conn.execute(
        "UPDATE conversations
         SET room_name = ?2, status = ?3, preferences_json = ?4, updated_at = ?5
         WHERE id = ?1",
        params![
            conversation.id,
            conversation.room_name,
            conversation.status.as_str(),
            preferences,
            conversation.updated_at,
        ],
    )?;
    if changed == 0 {
        return Err(DbError::not_found("conversation", &conversation.id));
    }
    Ok(())
}

fn map_row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        room_name: row.get(1)?,
        status: parsed(row, 2)?,
        preferences: json(row, 3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
