//! Request and audio repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use transcoda_core::{
    validate_status_update, Audio, CreateRequest, Error, HistoryEntry, JobStore, Request,
    RequestStatus, Result,
};

use crate::{is_foreign_key_violation, is_unique_violation};

const REQUEST_COLUMNS: &str = "r.id, r.user_id, a.name AS audio_name, r.source_id, r.source_format,
       r.target_id, r.target_format, r.status::text AS status, r.created, r.updated";

/// PostgreSQL implementation of [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
}

impl PgJobStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_status(s: &str) -> Result<RequestStatus> {
        s.parse::<RequestStatus>().map_err(Error::Internal)
    }

    fn parse_request_row(row: PgRow) -> Result<Request> {
        let status: String = row.get("status");
        Ok(Request {
            id: row.get("id"),
            user_id: row.get("user_id"),
            audio_name: row.get("audio_name"),
            source_id: row.get("source_id"),
            source_format: row.get("source_format"),
            target_id: row.get("target_id"),
            target_format: row.get("target_format"),
            status: Self::parse_status(&status)?,
            created: row.get("created"),
            updated: row.get("updated"),
        })
    }

    fn parse_history_row(row: PgRow) -> Result<HistoryEntry> {
        let status: String = row.get("status");
        Ok(HistoryEntry {
            id: row.get("id"),
            audio_name: row.get("audio_name"),
            source_format: row.get("source_format"),
            target_format: row.get("target_format"),
            created: row.get("created"),
            updated: row.get("updated"),
            status: Self::parse_status(&status)?,
        })
    }

    /// Conditional status write inside `tx`.
    ///
    /// On zero matched rows, distinguishes a missing request from a refused
    /// transition by re-reading the current status.
    async fn transition(
        tx: &mut Transaction<'_, Postgres>,
        request_id: Uuid,
        status: RequestStatus,
        target_id: Option<Uuid>,
    ) -> Result<()> {
        let allowed_from: Vec<String> = status
            .allowed_predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query(
            "UPDATE request
             SET status = $2::request_status, target_id = $3, updated = $4
             WHERE id = $1 AND status::text = ANY($5)",
        )
        .bind(request_id)
        .bind(status.as_str())
        .bind(target_id)
        .bind(Utc::now())
        .bind(&allowed_from)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status::text FROM request WHERE id = $1")
                .bind(request_id)
                .fetch_optional(&mut **tx)
                .await
                .map_err(Error::Database)?;

        match current {
            None => Err(Error::RequestNotFound(request_id)),
            Some(from) => Err(Error::InvalidTransition {
                from: Self::parse_status(&from)?,
                to: status,
            }),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_request(&self, req: CreateRequest) -> Result<Uuid> {
        let source_id = Uuid::new_v4();
        let request_id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("INSERT INTO audio (id, name, format, location) VALUES ($1, $2, $3, $4)")
            .bind(source_id)
            .bind(&req.name)
            .bind(&req.source_format)
            .bind(&req.source_location)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO request (id, user_id, source_id, source_format, target_id, target_format, status, created, updated)
             VALUES ($1, $2, $3, $4, NULL, $5, 'queued'::request_status, $6, $6)",
        )
        .bind(request_id)
        .bind(req.user_id)
        .bind(source_id)
        .bind(&req.source_format)
        .bind(&req.target_format)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                Error::NotFound(format!("user {}", req.user_id))
            } else {
                Error::Database(e)
            }
        })?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "requests",
            op = "create_request",
            request_id = %request_id,
            source_id = %source_id,
            "Request queued"
        );
        Ok(request_id)
    }

    async fn update_request_status(
        &self,
        request_id: Uuid,
        status: RequestStatus,
        target_id: Option<Uuid>,
    ) -> Result<()> {
        validate_status_update(status, target_id)?;

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        Self::transition(&mut tx, request_id, status, target_id).await?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "requests",
            op = "update_status",
            request_id = %request_id,
            status = %status,
            "Request status updated"
        );
        Ok(())
    }

    async fn insert_audio(&self, name: &str, format: &str, location: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO audio (id, name, format, location) VALUES ($1, $2, $3, $4)")
            .bind(id)
            .bind(name)
            .bind(format)
            .bind(location)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(id)
    }

    async fn record_conversion(
        &self,
        request_id: Uuid,
        target_id: Uuid,
        name: &str,
        format: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // The audio row must exist before request.target_id can reference it.
        sqlx::query("INSERT INTO audio (id, name, format, location) VALUES ($1, $2, $3, $4)")
            .bind(target_id)
            .bind(name)
            .bind(format)
            .bind(target_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::AlreadyExists(format!("audio {}", target_id))
                } else {
                    Error::Database(e)
                }
            })?;

        // A refused transition drops `tx`, rolling back the audio insert.
        Self::transition(&mut tx, request_id, RequestStatus::Done, Some(target_id)).await?;

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "requests",
            op = "record_conversion",
            request_id = %request_id,
            target_id = %target_id,
            "Conversion recorded"
        );
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Request> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM request r JOIN audio a ON a.id = r.source_id WHERE r.id = $1",
            REQUEST_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_request_row(row),
            None => Err(Error::RequestNotFound(request_id)),
        }
    }

    async fn get_request_history(&self, user_id: Uuid) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query(
            "SELECT r.id, a.name AS audio_name, r.source_format, r.target_format,
                    r.created, r.updated, r.status::text AS status
             FROM request r
             JOIN audio a ON a.id = r.source_id
             WHERE r.user_id = $1
             ORDER BY r.created ASC, r.id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_history_row).collect()
    }

    async fn get_audio_by_id(&self, id: Uuid) -> Result<Audio> {
        let row: Option<(Uuid, String, String, String)> =
            sqlx::query_as("SELECT id, name, format, location FROM audio WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        row.map(|(id, name, format, location)| Audio {
            id,
            name,
            format,
            location,
        })
        .ok_or(Error::NoSuchAudio(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_all_variants() {
        for status in RequestStatus::ALL {
            assert_eq!(PgJobStore::parse_status(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_parse_status_unknown_is_internal_error() {
        assert!(matches!(
            PgJobStore::parse_status("cancelled"),
            Err(Error::Internal(_))
        ));
    }
}
