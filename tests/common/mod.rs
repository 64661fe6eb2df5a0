//! Shared setup for integration tests: a file-backed SQLite client with a
//! `notes` table.

#![allow(dead_code)]

use platform_db::db::DbClient;
use platform_db::{Context, DatabaseConfig, Query};
use serde::Deserialize;
use tempfile::NamedTempFile;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Note {
    pub id: i64,
    pub body: String,
    pub status: String,
}

pub fn insert_note() -> Query {
    Query::new("insert_note", "INSERT INTO notes (body) VALUES (?1)")
}

pub fn update_status() -> Query {
    Query::new("update_status", "UPDATE notes SET status = ?1 WHERE id = ?2")
}

pub fn get_note() -> Query {
    Query::new("get_note", "SELECT id, body, status FROM notes WHERE id = ?1")
}

pub fn list_notes() -> Query {
    Query::new("list_notes", "SELECT id, body, status FROM notes ORDER BY id")
}

pub fn count_notes() -> Query {
    Query::new("count_notes", "SELECT COUNT(*) AS n FROM notes")
}

/// Connect to a fresh SQLite file. The temp file must outlive the client.
pub async fn sqlite_client(max_connections: u32) -> (DbClient, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path().to_str().unwrap().to_string();
    let url = format!("sqlite:{}?mode=rwc&max_connections={}", db_path, max_connections);

    let ctx = Context::background();
    let config = DatabaseConfig::parse(&url).unwrap();
    let client = DbClient::connect(&ctx, &config).await.unwrap();

    use platform_db::QueryExecutor;
    use platform_db::db::Client;
    client
        .db()
        .exec(
            &ctx,
            &Query::new(
                "create_notes",
                "CREATE TABLE notes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    body TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'new'
                )",
            ),
            &[],
        )
        .await
        .unwrap();

    (client, temp_file)
}

pub async fn count(client: &DbClient) -> i64 {
    use platform_db::NamedExecutor;
    use platform_db::db::Client;
    client
        .db()
        .scan_one(&Context::background(), &count_notes(), &[])
        .await
        .unwrap()
}
