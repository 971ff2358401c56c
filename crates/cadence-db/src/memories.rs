//! Long-term memories with brute-force cosine search.
//!
//! Embeddings are stored as little-endian `f32` blobs. Search scans every
//! row, which is adequate for a personal assistant's memory size.

use crate::error::DbError;
use cadence_types::{ids, MemorySearchResult};
use rusqlite::{params, Connection};

/// Stores a memory and returns its generated id.
pub fn insert_memory(conn: &Connection, content: &str, embedding: &[f32]) -> Result<String, DbError> {
    let id = ids::generate(ids::MEMORY);
    conn.execute(
        "INSERT INTO memories (id, content, embedding, dimensions) VALUES (?1, ?2, ?3, ?4)",
        params![id, content, encode_embedding(embedding), embedding.len() as i64],
    )?;
    Ok(id)
}

/// Memories scoring at least `min_score` against `query`, best first.
pub fn search_memories(
    conn: &Connection,
    query: &[f32],
    limit: usize,
    min_score: f32,
) -> Result<Vec<MemorySearchResult>, DbError> {
    if limit == 0 || query.is_empty() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare("SELECT id, content, embedding FROM memories WHERE dimensions = ?1")?;
    let rows = stmt.query_map([query.len() as i64], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
        ))
    })?;

    let mut results = Vec::new();
    for row in rows {
        let (memory_id, content, blob) = row?;
        let score = cosine_similarity(query, &decode_embedding(&blob));
        if score >= min_score {
            results.push(MemorySearchResult {
                memory_id,
                score,
                content,
            });
        }
    }
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(limit);
    Ok(results)
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Zero when the vectors differ in length or either has no magnitude.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_migrations;

    fn db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn embedding_blob_is_little_endian() {
        let blob = encode_embedding(&[1.0, -0.5]);
        assert_eq!(blob.len(), 8);
        assert_eq!(&blob[..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_embedding(&blob), vec![1.0, -0.5]);
    }

    #[test]
    fn cosine_edge_cases() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 1.0], &[2.0, 2.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn search_filters_orders_and_limits() {
        let conn = db();
        insert_memory(&conn, "likes green tea", &[1.0, 0.0, 0.0]).unwrap();
        insert_memory(&conn, "lives in Oslo", &[0.8, 0.6, 0.0]).unwrap();
        insert_memory(&conn, "has a dog", &[0.0, 0.0, 1.0]).unwrap();

        let results = search_memories(&conn, &[1.0, 0.0, 0.0], 5, 0.5).unwrap();
        let contents: Vec<&str> = results.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["likes green tea", "lives in Oslo"]);
        assert!(results[0].score > results[1].score);
        assert!(results[0].memory_id.starts_with("mem_"));

        let top = search_memories(&conn, &[1.0, 0.0, 0.0], 1, 0.0).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].content, "likes green tea");
    }

    #[test]
    fn other_dimensions_are_ignored() {
        let conn = db();
        insert_memory(&conn, "old model", &[1.0, 0.0]).unwrap();
        assert!(search_memories(&conn, &[1.0, 0.0, 0.0], 5, -1.0).unwrap().is_empty());
    }
}
