use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{Identity, IdentityRow};
use crate::error::AppError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("email already registered")]
    DuplicateEmail,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateEmail => {
                AppError::Conflict("Email already registered. Please use another value".into())
            }
            StoreError::Backend(e) => AppError::Internal(e),
        }
    }
}

/// Lookup/persist interface over user accounts.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Identity>>;
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Identity>>;
    /// Identity whose reset digest matches and whose reset window is still open at `now`.
    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> anyhow::Result<Option<Identity>>;
    /// Insert or replace by id.
    async fn save(&self, identity: &Identity) -> Result<(), StoreError>;
}

const SELECT_USER: &str = r#"
    SELECT id, name, email, photo, role, password_hash, password_changed_at,
           password_reset_token, password_reset_expires, created_at
    FROM users
"#;

#[derive(Clone)]
pub struct PgIdentityStore {
    db: PgPool,
}

impl PgIdentityStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<Identity>> {
        let row = sqlx::query_as::<_, IdentityRow>(&format!("{SELECT_USER} WHERE email = $1"))
            .bind(email)
            .fetch_optional(&self.db)
            .await
            .context("find user by email")?;
        row.map(Identity::try_from).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<Identity>> {
        let row = sqlx::query_as::<_, IdentityRow>(&format!("{SELECT_USER} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .context("find user by id")?;
        row.map(Identity::try_from).transpose()
    }

    async fn find_by_reset_token(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> anyhow::Result<Option<Identity>> {
        let row = sqlx::query_as::<_, IdentityRow>(&format!(
            "{SELECT_USER} WHERE password_reset_token = $1 AND password_reset_expires > $2"
        ))
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.db)
        .await
        .context("find user by reset token")?;
        row.map(Identity::try_from).transpose()
    }

    async fn save(&self, identity: &Identity) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"
            INSERT INTO users (id, name, email, photo, role, password_hash, password_changed_at,
                               password_reset_token, password_reset_expires, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                photo = EXCLUDED.photo,
                role = EXCLUDED.role,
                password_hash = EXCLUDED.password_hash,
                password_changed_at = EXCLUDED.password_changed_at,
                password_reset_token = EXCLUDED.password_reset_token,
                password_reset_expires = EXCLUDED.password_reset_expires
            "#,
        )
        .bind(identity.id)
        .bind(&identity.name)
        .bind(&identity.email)
        .bind(&identity.photo)
        .bind(identity.role.as_str())
        .bind(&identity.password_hash)
        .bind(identity.password_changed_at)
        .bind(&identity.password_reset_token)
        .bind(identity.password_reset_expires)
        .bind(identity.created_at)
        .execute(&self.db)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateEmail)
            }
            Err(e) => Err(StoreError::Backend(anyhow::Error::new(e).context("save user"))),
        }
    }
}
