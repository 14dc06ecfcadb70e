//! User account repository.
//!
//! Passwords arrive already hashed; this layer only stores and returns them.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use transcoda_core::{Error, Result, UserCredentials, UserStore};

use crate::is_unique_violation;

/// PostgreSQL implementation of [`UserStore`].
#[derive(Clone)]
pub struct PgUserStore {
    pool: Pool<Postgres>,
}

impl PgUserStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn insert_user(&self, username: &str, password_hash: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO app_user (id, username, password, created, updated)
             VALUES ($1, $2, $3, $4, $4)",
        )
        .bind(id)
        .bind(username)
        .bind(password_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::AlreadyExists(format!("user {}", username))
            } else {
                Error::Database(e)
            }
        })?;
        Ok(id)
    }

    async fn get_user_credentials(&self, username: &str) -> Result<UserCredentials> {
        let row: Option<(Uuid, String)> =
            sqlx::query_as("SELECT id, password FROM app_user WHERE username = $1")
                .bind(username)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        row.map(|(id, password_hash)| UserCredentials { id, password_hash })
            .ok_or_else(|| Error::NoSuchUser(username.to_string()))
    }
}
