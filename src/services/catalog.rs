//! Minimal game / redistributable records that archives hang off.

use crate::models::archive::{ARCHIVE_COLUMNS, Archive, Game, Redistributable};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct Catalog {
    pub db: Arc<SqlitePool>,
}

impl Catalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn create_game(&self, name: &str) -> Result<Game, sqlx::Error> {
        sqlx::query_as::<_, Game>(
            "INSERT INTO games (id, name, created_at) VALUES (?, ?, ?)
             RETURNING id, name, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await
    }

    pub async fn create_redistributable(&self, name: &str) -> Result<Redistributable, sqlx::Error> {
        sqlx::query_as::<_, Redistributable>(
            "INSERT INTO redistributables (id, name, created_at) VALUES (?, ?, ?)
             RETURNING id, name, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await
    }

    pub async fn game_exists(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        exists(&self.db, "SELECT COUNT(*) FROM games WHERE id = ?", id).await
    }

    pub async fn redistributable_exists(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        exists(&self.db, "SELECT COUNT(*) FROM redistributables WHERE id = ?", id).await
    }

    pub async fn archives_for_game(&self, game_id: Uuid) -> Result<Vec<Archive>, sqlx::Error> {
        sqlx::query_as::<_, Archive>(&format!(
            "SELECT {} FROM archives WHERE game_id = ? ORDER BY created_at",
            ARCHIVE_COLUMNS
        ))
        .bind(game_id)
        .fetch_all(&*self.db)
        .await
    }
}

async fn exists(db: &SqlitePool, sql: &str, id: Uuid) -> Result<bool, sqlx::Error> {
    let count: i64 = sqlx::query_scalar(sql).bind(id).fetch_one(db).await?;
    Ok(count > 0)
}
