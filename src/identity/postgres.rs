//! PostgreSQL-backed identity and role storage.
//!
//! Uniqueness is enforced by the constraints in `sql/schema.sql`; their
//! violations are mapped back to [`ConflictKind`] by constraint name.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::model::{Identity, Role};
use super::store::{ConflictKind, CredentialStore, RoleRegistry, StoreError, StoreResult};
use super::validation::normalize;

pub const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const IDENTITY_COLUMNS: &str = "id, username, normalized_username, email, normalized_email, \
     email_confirmed, password_hash, lockout_enabled, lockout_end, access_failed_count, \
     concurrency_stamp";

const ROLE_COLUMNS: &str = "id, name, normalized_name, concurrency_stamp";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// # Errors
    /// Returns an error if the pool cannot connect.
    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Create missing tables and indexes.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .instrument(query_span("MIGRATE", "sql/schema.sql"))
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    async fn fetch_identity(&self, query: &str, value: &str) -> StoreResult<Identity> {
        let row = sqlx::query(query)
            .bind(value)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_sqlx(e, "failed to fetch identity"))?;
        match row {
            Some(row) => identity_from_row(&row),
            None => Err(StoreError::NotFound("identity".to_string())),
        }
    }
}

fn query_span(operation: &'static str, statement: &str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn conflict_for_constraint(constraint: Option<&str>) -> ConflictKind {
    match constraint {
        Some("identities_normalized_username_key") => ConflictKind::Username,
        Some("identities_normalized_email_key") => ConflictKind::Email,
        Some("roles_normalized_name_key") => ConflictKind::RoleName,
        _ => ConflictKind::Stale,
    }
}

fn map_sqlx(err: sqlx::Error, context: &'static str) -> StoreError {
    match sqlstate(&err).as_deref() {
        Some("23505") => {
            let constraint = match &err {
                sqlx::Error::Database(db_err) => db_err.constraint().map(str::to_string),
                _ => None,
            };
            StoreError::Conflict(conflict_for_constraint(constraint.as_deref()))
        }
        Some("23503") => StoreError::NotFound("referenced record".to_string()),
        _ => StoreError::Unexpected(anyhow::Error::new(err).context(context)),
    }
}

fn decode(err: sqlx::Error) -> StoreError {
    StoreError::Unexpected(anyhow::Error::new(err).context("failed to decode row"))
}

fn identity_from_row(row: &PgRow) -> StoreResult<Identity> {
    let failed: i32 = row.try_get("access_failed_count").map_err(decode)?;
    Ok(Identity {
        id: row.try_get("id").map_err(decode)?,
        username: row.try_get("username").map_err(decode)?,
        normalized_username: row.try_get("normalized_username").map_err(decode)?,
        email: row.try_get("email").map_err(decode)?,
        normalized_email: row.try_get("normalized_email").map_err(decode)?,
        email_confirmed: row.try_get("email_confirmed").map_err(decode)?,
        password_hash: row.try_get("password_hash").map_err(decode)?,
        lockout_enabled: row.try_get("lockout_enabled").map_err(decode)?,
        lockout_end: row
            .try_get::<Option<DateTime<Utc>>, _>("lockout_end")
            .map_err(decode)?,
        access_failed_count: u32::try_from(failed)
            .map_err(|_| StoreError::Unexpected(anyhow!("negative access_failed_count")))?,
        concurrency_stamp: row.try_get("concurrency_stamp").map_err(decode)?,
    })
}

fn role_from_row(row: &PgRow) -> StoreResult<Role> {
    Ok(Role {
        id: row.try_get("id").map_err(decode)?,
        name: row.try_get("name").map_err(decode)?,
        normalized_name: row.try_get("normalized_name").map_err(decode)?,
        concurrency_stamp: row.try_get("concurrency_stamp").map_err(decode)?,
    })
}

fn roles_from_rows(rows: &[PgRow]) -> StoreResult<Vec<Role>> {
    rows.iter().map(role_from_row).collect()
}

fn failed_count(identity: &Identity) -> i32 {
    i32::try_from(identity.access_failed_count).unwrap_or(i32::MAX)
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_by_username(&self, username: &str) -> StoreResult<Identity> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE normalized_username = $1");
        self.fetch_identity(&query, &normalize(username)).await
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Identity> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE normalized_email = $1");
        self.fetch_identity(&query, &normalize(email)).await
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Identity> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|e| map_sqlx(e, "failed to fetch identity"))?;
        match row {
            Some(row) => identity_from_row(&row),
            None => Err(StoreError::NotFound("identity".to_string())),
        }
    }

    async fn list_identities(&self) -> StoreResult<Vec<Identity>> {
        let query =
            format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY normalized_username");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|e| map_sqlx(e, "failed to list identities"))?;
        rows.iter().map(identity_from_row).collect()
    }

    async fn create_identity(&self, identity: Identity, roles: &[Uuid]) -> StoreResult<Identity> {
        // Identity and its roles are committed together.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx(e, "begin registration transaction"))?;

        let query = format!(
            "INSERT INTO identities ({IDENTITY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        );
        sqlx::query(&query)
            .bind(identity.id)
            .bind(&identity.username)
            .bind(&identity.normalized_username)
            .bind(&identity.email)
            .bind(&identity.normalized_email)
            .bind(identity.email_confirmed)
            .bind(&identity.password_hash)
            .bind(identity.lockout_enabled)
            .bind(identity.lockout_end)
            .bind(failed_count(&identity))
            .bind(identity.concurrency_stamp)
            .execute(&mut *tx)
            .instrument(query_span("INSERT", &query))
            .await
            .map_err(|e| map_sqlx(e, "failed to insert identity"))?;

        let query = "INSERT INTO identity_roles (identity_id, role_id) VALUES ($1, $2)";
        for role_id in roles {
            sqlx::query(query)
                .bind(identity.id)
                .bind(role_id)
                .execute(&mut *tx)
                .instrument(query_span("INSERT", query))
                .await
                .map_err(|e| match map_sqlx(e, "failed to assign role") {
                    StoreError::NotFound(_) => StoreError::NotFound(format!("role {role_id}")),
                    other => other,
                })?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx(e, "commit registration transaction"))?;
        Ok(identity)
    }

    async fn update_identity(&self, mut identity: Identity) -> StoreResult<Identity> {
        let query = r"
            UPDATE identities SET
                username = $3,
                normalized_username = $4,
                email = $5,
                normalized_email = $6,
                email_confirmed = $7,
                password_hash = $8,
                lockout_enabled = $9,
                lockout_end = $10,
                access_failed_count = $11,
                concurrency_stamp = $12
            WHERE id = $1 AND concurrency_stamp = $2
        ";
        let next_stamp = Uuid::new_v4();
        let result = sqlx::query(query)
            .bind(identity.id)
            .bind(identity.concurrency_stamp)
            .bind(&identity.username)
            .bind(&identity.normalized_username)
            .bind(&identity.email)
            .bind(&identity.normalized_email)
            .bind(identity.email_confirmed)
            .bind(&identity.password_hash)
            .bind(identity.lockout_enabled)
            .bind(identity.lockout_end)
            .bind(failed_count(&identity))
            .bind(next_stamp)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .map_err(|e| map_sqlx(e, "failed to update identity"))?;

        if result.rows_affected() == 0 {
            // Either gone or changed underneath us.
            let exists = sqlx::query("SELECT 1 FROM identities WHERE id = $1")
                .bind(identity.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx(e, "failed to check identity"))?;
            return Err(match exists {
                Some(_) => StoreError::Conflict(ConflictKind::Stale),
                None => StoreError::NotFound("identity".to_string()),
            });
        }

        identity.concurrency_stamp = next_stamp;
        Ok(identity)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .instrument(query_span("SELECT", "SELECT 1"))
            .await
            .map_err(|e| map_sqlx(e, "database ping failed"))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl RoleRegistry for PgStore {
    async fn role_exists(&self, name: &str) -> StoreResult<bool> {
        let query = "SELECT EXISTS(SELECT 1 FROM roles WHERE normalized_name = $1)";
        let exists: bool = sqlx::query_scalar(query)
            .bind(normalize(name))
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_sqlx(e, "failed to check role"))?;
        Ok(exists)
    }

    async fn list_roles(&self) -> StoreResult<Vec<Role>> {
        let query = format!("SELECT {ROLE_COLUMNS} FROM roles ORDER BY normalized_name");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|e| map_sqlx(e, "failed to list roles"))?;
        roles_from_rows(&rows)
    }

    async fn find_role_by_id(&self, id: Uuid) -> StoreResult<Role> {
        let query = format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|e| map_sqlx(e, "failed to fetch role"))?;
        row.as_ref()
            .map(role_from_row)
            .unwrap_or_else(|| Err(StoreError::NotFound("role".to_string())))
    }

    async fn find_role_by_name(&self, name: &str) -> StoreResult<Role> {
        let query = format!("SELECT {ROLE_COLUMNS} FROM roles WHERE normalized_name = $1");
        let row = sqlx::query(&query)
            .bind(normalize(name))
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|e| map_sqlx(e, "failed to fetch role"))?;
        row.as_ref()
            .map(role_from_row)
            .unwrap_or_else(|| Err(StoreError::NotFound("role".to_string())))
    }

    async fn search_roles(&self, fragment: &str) -> StoreResult<Vec<Role>> {
        // strpos avoids LIKE wildcard escaping.
        let query = format!(
            "SELECT {ROLE_COLUMNS} FROM roles WHERE strpos(normalized_name, $1) > 0 \
             ORDER BY normalized_name"
        );
        let rows = sqlx::query(&query)
            .bind(normalize(fragment))
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .map_err(|e| map_sqlx(e, "failed to search roles"))?;
        roles_from_rows(&rows)
    }

    async fn create_role(&self, name: &str) -> StoreResult<Role> {
        let role = Role::new(name);
        let query =
            "INSERT INTO roles (id, name, normalized_name, concurrency_stamp) VALUES ($1, $2, $3, $4)";
        sqlx::query(query)
            .bind(role.id)
            .bind(&role.name)
            .bind(&role.normalized_name)
            .bind(role.concurrency_stamp)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| map_sqlx(e, "failed to insert role"))?;
        Ok(role)
    }

    async fn update_role(&self, id: Uuid, name: &str) -> StoreResult<Role> {
        let query = format!(
            "UPDATE roles SET name = $2, normalized_name = $3, concurrency_stamp = $4 \
             WHERE id = $1 RETURNING {ROLE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(name.trim())
            .bind(normalize(name))
            .bind(Uuid::new_v4())
            .fetch_optional(&self.pool)
            .instrument(query_span("UPDATE", &query))
            .await
            .map_err(|e| map_sqlx(e, "failed to update role"))?;
        row.as_ref()
            .map(role_from_row)
            .unwrap_or_else(|| Err(StoreError::NotFound("role".to_string())))
    }

    async fn delete_role(&self, id: Uuid) -> StoreResult<()> {
        let query = "DELETE FROM roles WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .map_err(|e| map_sqlx(e, "failed to delete role"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("role".to_string()));
        }
        Ok(())
    }

    async fn assign_role(&self, identity_id: Uuid, role_name: &str) -> StoreResult<()> {
        let query = r"
            INSERT INTO identity_roles (identity_id, role_id)
            SELECT $1, id FROM roles WHERE normalized_name = $2
            ON CONFLICT DO NOTHING
            RETURNING role_id
        ";
        let inserted = sqlx::query(query)
            .bind(identity_id)
            .bind(normalize(role_name))
            .fetch_optional(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .map_err(|e| match map_sqlx(e, "failed to assign role") {
                StoreError::NotFound(_) => StoreError::NotFound("identity".to_string()),
                other => other,
            })?;
        if inserted.is_some() {
            return Ok(());
        }
        // Nothing inserted: already assigned, or no such role.
        if self.role_exists(role_name).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound("role".to_string()))
        }
    }

    async fn roles_for(&self, identity_id: Uuid) -> StoreResult<Vec<Role>> {
        let query = r"
            SELECT r.id, r.name, r.normalized_name, r.concurrency_stamp
            FROM roles r
            JOIN identity_roles ir ON ir.role_id = r.id
            WHERE ir.identity_id = $1
            ORDER BY r.normalized_name
        ";
        let rows = sqlx::query(query)
            .bind(identity_id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_sqlx(e, "failed to fetch identity roles"))?;
        roles_from_rows(&rows)
    }

    async fn member_count(&self, role_id: Uuid) -> StoreResult<u64> {
        let query = "SELECT COUNT(*) FROM identity_roles WHERE role_id = $1";
        let count: i64 = sqlx::query_scalar(query)
            .bind(role_id)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .map_err(|e| map_sqlx(e, "failed to count role members"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
