//! Message rows, ordered per conversation by sequence number.

use crate::columns::{limit, parsed};
use crate::error::DbError;
use cadence_types::{CompletionStatus, Message, Role};
use rusqlite::{params, Connection, OptionalExtension, Row};

const COLUMNS: &str = "id, conversation_id, role, previous_id, sequence_number, contents,
    completion_status, created_at, updated_at";

pub fn insert_message(conn: &Connection, message: &Message) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO messages (
            id, conversation_id, role, previous_id, sequence_number, contents,
            completion_status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.id,
            message.conversation_id,
            message.role.as_str(),
            message.previous_id,
            message.sequence_number,
            message.contents,
            message.completion_status.as_str(),
            message.created_at,
            message.updated_at,
        ],
    )?;
    Ok(())
}

/// Writes contents and completion status back. Identity, role and sequence
/// never change after insert.
pub fn update_message(conn: &Connection, message: &Message) -> Result<(), DbError> {
    let changed = conn.execute(
        "UPDATE messages
         SET contents = ?2, completion_status = ?3, updated_at = ?4
         WHERE id = ?1",
        params![
            message.id,
            message.contents,
            message.completion_status.as_str(),
            message.updated_at,
        ],
    )?;
    if changed == 0 {
        return Err(DbError::not_found("message", &message.id));
    }
    Ok(())
}

pub fn find_message(conn: &Connection, id: &str) -> Result<Option<Message>, DbError> {
    let message = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", COLUMNS),
            [id],
            map_row_to_message,
        )
        .optional()?;
    Ok(message)
}

/// The `n` newest messages of a conversation, oldest first.
pub fn latest_messages(
    conn: &Connection,
    conversation_id: &str,
    n: usize,
) -> Result<Vec<Message>, DbError> {
    history_before(conn, conversation_id, i64::MAX, n)
}

/// The `n` newest messages sequenced before `before_sequence`, oldest first.
pub fn history_before(
    conn: &Connection,
    conversation_id: &str,
    before_sequence: i64,
    n: usize,
) -> Result<Vec<Message>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages
         WHERE conversation_id = ?1 AND sequence_number < ?2
         ORDER BY sequence_number DESC
         LIMIT ?3",
        COLUMNS
    ))?;
    let rows = stmt.query_map(
        params![conversation_id, before_sequence, limit(n)],
        map_row_to_message,
    )?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    messages.reverse();
    Ok(messages)
}

/// The `n` newest messages before `before_sequence` that can be replayed
/// to a model: completed, non-empty and not system messages. Oldest first.
pub fn context_history(
    conn: &Connection,
    conversation_id: &str,
    before_sequence: i64,
    n: usize,
) -> Result<Vec<Message>, DbError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages
         WHERE conversation_id = ?1 AND sequence_number < ?2
           AND role != ?4 AND completion_status = ?5 AND trim(contents) != ''
         ORDER BY sequence_number DESC
         LIMIT ?3",
        COLUMNS
    ))?;
    let rows = stmt.query_map(
        params![
            conversation_id,
            before_sequence,
            limit(n),
            Role::System.as_str(),
            CompletionStatus::Completed.as_str(),
        ],
        map_row_to_message,
    )?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    messages.reverse();
    Ok(messages)
}

fn map_row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: parsed(row, 2)?,
        previous_id: row.get(3)?,
        sequence_number: row.get(4)?,
        contents: row.get(5)?,
        completion_status: parsed(row, 6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
