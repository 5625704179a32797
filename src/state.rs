use crate::auth::{
    jwt::JwtKeys,
    password::PasswordHasher,
    repo::{IdentityStore, PgIdentityStore},
    reset::ResetHandshake,
    services::Accounts,
};
use crate::config::AppConfig;
use crate::notify::{LogNotifier, Notifier};
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub keys: JwtKeys,
    pub accounts: Accounts,
    pub reset: ResetHandshake,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;

        let store = Arc::new(PgIdentityStore::new(db.clone()));
        let notifier = Arc::new(LogNotifier) as Arc<dyn Notifier>;
        Self::from_parts(db, config, store, notifier)
    }

    pub fn from_parts(
        db: PgPool,
        config: Arc<AppConfig>,
        store: Arc<dyn IdentityStore>,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<Self> {
        let keys = JwtKeys::new(&config.jwt);
        let accounts = Accounts::new(store, PasswordHasher::new(&config.hasher)?);
        let reset = ResetHandshake::new(accounts.clone(), notifier, &config.reset);
        Ok(Self {
            db,
            config,
            keys,
            accounts,
            reset,
        })
    }

    /// State over an in-memory identity store and a pool that never connects.
    #[cfg(test)]
    pub fn fake(
        store: Arc<crate::auth::repo::memory::MemoryIdentityStore>,
        notifier: Arc<crate::notify::fake::RecordingNotifier>,
    ) -> Self {
        Self::fake_with(store, notifier, AppConfig::for_tests())
    }

    #[cfg(test)]
    pub fn fake_with(
        store: Arc<crate::auth::repo::memory::MemoryIdentityStore>,
        notifier: Arc<crate::notify::fake::RecordingNotifier>,
        config: AppConfig,
    ) -> Self {
        let db = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy(&config.database_url)
            .expect("lazy pool ok");

        Self::from_parts(db, Arc::new(config), store, notifier).expect("fake state")
    }
}
