use crate::db::RegistrySource;
use crate::error::{RelayError, Result};
use crate::models::registration::RegistrationRow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

/// Persisted registration store. Rows stay visible to the relay while
/// `expires_at` is in the future or the registration is permanent.
pub struct SqliteRegistrationStore {
    pool: SqlitePool,
}

impl SqliteRegistrationStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registrations (
                sn TEXT NOT NULL,
                name TEXT NOT NULL,
                token TEXT NOT NULL,
                email TEXT,
                registered_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                removal_code TEXT NOT NULL,
                permanent INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (sn, token),
                UNIQUE (token, name)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Inserts a time-limited registration. Uniqueness violations on
    /// (sn, token) or (token, name) surface as registry conflicts.
    pub async fn insert(
        &self,
        serial: &str,
        label: &str,
        token: &str,
        email: Option<&str>,
        removal_code: &str,
        days_valid: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + Duration::days(days_valid);
        self.insert_with_expiry(serial, label, token, email, removal_code, now, expires_at, false)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_with_expiry(
        &self,
        serial: &str,
        label: &str,
        token: &str,
        email: Option<&str>,
        removal_code: &str,
        registered_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        permanent: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO registrations (sn, name, token, email, registered_at, expires_at, removal_code, permanent)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(serial)
        .bind(label)
        .bind(token)
        .bind(email)
        .bind(registered_at)
        .bind(expires_at)
        .bind(removal_code)
        .bind(permanent)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(RelayError::RegistryConflict {
                    token: token.to_string(),
                    label: label.to_string(),
                    existing: serial.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Marks a registration permanent, exempting it from expiry.
    pub async fn make_permanent(&self, serial: &str, token: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE registrations SET permanent = 1 WHERE sn = ?1 AND token = ?2",
        )
        .bind(serial)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes a registration when the caller presents its removal code.
    pub async fn remove(&self, serial: &str, token: &str, removal_code: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM registrations WHERE sn = ?1 AND token = ?2 AND removal_code = ?3",
        )
        .bind(serial)
        .bind(token)
        .bind(removal_code)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RegistrySource for SqliteRegistrationStore {
    async fn fetch_active(&self) -> Result<Vec<RegistrationRow>> {
        let rows = sqlx::query(
            r#"
            SELECT sn, name, token, email
            FROM registrations
            WHERE expires_at > ?1 OR permanent = 1
            ORDER BY registered_at
            "#,
        )
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RelayError::SourceUnavailable(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RegistrationRow {
                serial: row.try_get("sn")?,
                label: row.try_get("name")?,
                token: row.try_get("token")?,
                email: row.try_get("email")?,
            });
        }
        Ok(out)
    }
}
