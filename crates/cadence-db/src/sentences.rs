use crate::error::DbError;
use cadence_types::Sentence;
use rusqlite::{params, Connection, Row};

pub fn insert_sentence(conn: &Connection, sentence: &Sentence) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO sentences (
            id, message_id, sequence_number, text, is_final, audio, duration_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            sentence.id,
            sentence.message_id,
            sentence.sequence_number,
            sentence.text,
            sentence.is_final,
            sentence.audio,
            sentence.duration_ms,
        ],
    )?;
    Ok(())
}

/// Text is immutable once emitted; only finality and audio change.
pub fn update_sentence(conn: &Connection, sentence: &Sentence) -> Result<(), DbError> {
    let changed = conn.execute(
        "UPDATE sentences SET is_final = ?2, audio = ?3, duration_ms = ?4 WHERE id = ?1",
        params![
            sentence.id,
            sentence.is_final,
            sentence.audio,
            sentence.duration_ms,
        ],
    )?;
    if changed == 0 {
        return Err(DbError::not_found("sentence", &sentence.id));
    }
    Ok(())
}

pub fn sentences_for_message(conn: &Connection, message_id: &str) -> Result<Vec<Sentence>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, message_id, sequence_number, text, is_final, audio, duration_ms
         FROM sentences WHERE message_id = ?1
         ORDER BY sequence_number ASC",
    )?;
    let rows = stmt.query_map([message_id], map_row_to_sentence)?;

    let mut sentences = Vec::new();
    for row in rows {
        sentences.push(row?);
    }
    Ok(sentences)
}

fn map_row_to_sentence(row: &Row<'_>) -> rusqlite::Result<Sentence> {
    Ok(Sentence {
        id: row.get(0)?,
        message_id: row.get(1)?,
        sequence_number: row.get(2)?,
        text: row.get(3)?,
        is_final: row.get(4)?,
        audio: row.get(5)?,
        duration_ms: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversations::insert_conversation;
    use crate::messages::insert_message;
    use crate::run_migrations;
    use cadence_types::{Conversation, Message, Role};

    fn db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        insert_conversation(&conn, &Conversation::new("conv_1")).unwrap();
        insert_message(&conn, &Message::new("msg_1", "conv_1", Role::Assistant, 1, "")).unwrap();
        conn
    }

    #[test]
    fn sentences_come_back_in_sequence_order() {
        let conn = db();
        insert_sentence(&conn, &Sentence::new("sent_b", "msg_1", 1, "Second.")).unwrap();
        insert_sentence(&conn, &Sentence::new("sent_a", "msg_1", 0, "First.")).unwrap();

        let texts: Vec<String> = sentences_for_message(&conn, "msg_1")
            .unwrap()
            .into_iter()
            .map(|s| s.text)
            .collect();
        assert_eq!(texts, vec!["First.", "Second."]);
    }

    #[test]
    fn audio_is_attached_later() {
        let conn = db();
        let mut sentence = Sentence::new("sent_a", "msg_1", 0, "Hello.");
        insert_sentence(&conn, &sentence).unwrap();

        sentence.is_final = true;
        sentence.audio = Some(vec![1, 2, 3, 4]);
        sentence.duration_ms = Some(20);
        update_sentence(&conn, &sentence).unwrap();

        let stored = sentences_for_message(&conn, "msg_1").unwrap();
        assert_eq!(stored, vec![sentence]);
    }

    #[test]
    fn duplicate_sequence_is_rejected() {
        let conn = db();
        insert_sentence(&conn, &Sentence::new("sent_a", "msg_1", 0, "One.")).unwrap();
        assert!(insert_sentence(&conn, &Sentence::new("sent_b", "msg_1", 0, "Two.")).is_err());
    }
}
