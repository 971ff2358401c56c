use crate::columns::{json, optional_json, parsed};
use crate::error::DbError;
use cadence_types::ToolUse;
use rusqlite::{params, Connection, Row};

pub fn insert_tool_use(conn: &Connection, tool_use: &ToolUse) -> Result<(), DbError> {
    let parameters = serde_json::to_string(&tool_use.parameters)?;
    let result = tool_use.result.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO tool_uses (
            id, message_id, name, parameters_json, result_json, error, status
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            tool_use.id,
            tool_use.message_id,
            tool_use.name,
            parameters,
            result,
            tool_use.error,
            tool_use.status.as_str(),
        ],
    )?;
    Ok(())
}

pub fn update_tool_use(conn: &Connection, tool_use: &ToolUse) -> Result<(), DbError> {
    let result = tool_use.result.as_ref().map(serde_json::to_string).transpose()?;
    let changed = conn.execute(
        "UPDATE tool_uses SET result_json = ?2, error = ?3, status = ?4 WHERE id = ?1",
        params![tool_use.id, result, tool_use.error, tool_use.status.as_str()],
    )?;
    if changed == 0 {
        return Err(DbError::not_found("tool use", &tool_use.id));
    }
    Ok(())
}

/// Tool uses of a message in the order the model requested them.
pub fn tool_uses_for_message(conn: &Connection, message_id: &str) -> Result<Vec<ToolUse>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, message_id, name, parameters_json, result_json, error, status
         FROM tool_uses WHERE message_id = ?1
         ORDER BY rowid ASC",
    )?;
    let rows = stmt.query_map([message_id], map_row_to_tool_use)?;

    let mut tool_uses = Vec::new();
    for row in rows {
        tool_uses.push(row?);
    }
    Ok(tool_uses)
}

fn map_row_to_tool_use(row: &Row<'_>) -> rusqlite::Result<ToolUse> {
    Ok(ToolUse {
        id: row.get(0)?,
        message_id: row.get(1)?,
        name: row.get(2)?,
        parameters: json(row, 3)?,
        result: optional_json(row, 4)?,
        error: row.get(5)?,
        status: parsed(row, 6)?,
    })
}
