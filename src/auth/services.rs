use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::auth::{
    password::PasswordHasher,
    repo::IdentityStore,
    repo_types::{Identity, PendingPassword},
};
use crate::error::AppError;

pub const MIN_PASSWORD_LEN: usize = 8;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    /// Run field validation before persisting.
    pub validate: bool,
}

/// Fields accepted on signup.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
}

/// Account operations on top of an `IdentityStore`.
#[derive(Clone)]
pub struct Accounts {
    store: Arc<dyn IdentityStore>,
    hasher: PasswordHasher,
}

impl Accounts {
    pub fn new(store: Arc<dyn IdentityStore>, hasher: PasswordHasher) -> Self {
        Self { store, hasher }
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    pub async fn save(&self, identity: Identity, opts: SaveOptions) -> Result<Identity, AppError> {
        self.save_at(identity, opts, OffsetDateTime::now_utc()).await
    }

    /// Validates (if asked), hashes a modified password, then persists.
    pub async fn save_at(
        &self,
        mut identity: Identity,
        opts: SaveOptions,
        now: OffsetDateTime,
    ) -> Result<Identity, AppError> {
        identity.email = normalize_email(&identity.email);
        if opts.validate {
            validate(&identity)?;
        }

        if let Some(PendingPassword { plain, .. }) = identity.pending_password.take() {
            let rotating = !identity.password_hash.is_empty();
            identity.password_hash = self.hasher.hash(&plain)?;
            if rotating {
                // One second back so a token issued right after this save stays valid.
                identity.password_changed_at = Some(now - Duration::seconds(1));
            }
            debug!(user_id = %identity.id, "password hashed");
        }

        self.store.save(&identity).await?;
        Ok(identity)
    }

    pub async fn signup(&self, new: NewAccount) -> Result<Identity, AppError> {
        let mut identity = Identity::new(new.name.trim(), normalize_email(&new.email));
        identity.set_password(new.password, new.password_confirm);
        // Validation fails here, before the store is touched.
        validate(&identity)?;
        self.save(identity, SaveOptions { validate: false }).await
    }

    /// Same failure for an unknown email and a wrong password.
    pub async fn check_credentials(&self, email: &str, password: &str) -> Result<Identity, AppError> {
        let email = normalize_email(email);
        if email.is_empty() || password.is_empty() {
            return Err(AppError::Validation("Please provide email and password!".into()));
        }

        let incorrect = || AppError::unauthenticated("Incorrect email or password");
        let Some(identity) = self.store.find_by_email(&email).await? else {
            self.hasher.verify_dummy(password);
            warn!("login unknown email");
            return Err(incorrect());
        };
        if !self.hasher.verify(password, &identity.password_hash)? {
            warn!(user_id = %identity.id, "login invalid password");
            return Err(incorrect());
        }
        Ok(identity)
    }

    pub async fn update_password(
        &self,
        identity: Identity,
        current: &str,
        password: &str,
        password_confirm: &str,
    ) -> Result<Identity, AppError> {
        // The attached identity may be stale; re-read the stored hash.
        let mut fresh = self
            .store
            .find_by_id(identity.id)
            .await?
            .ok_or_else(|| AppError::unauthenticated("The user belonging to this token no longer exists."))?;
        if !self.hasher.verify(current, &fresh.password_hash)? {
            return Err(AppError::unauthenticated("Your current password is wrong."));
        }
        fresh.set_password(password, password_confirm);
        self.save(fresh, SaveOptions { validate: true }).await
    }
}

fn validate(identity: &Identity) -> Result<(), AppError> {
    let mut problems = Vec::new();
    if identity.name.trim().is_empty() {
        problems.push("Please tell us your name".to_string());
    }
    if identity.email.is_empty() {
        problems.push("Please provide your email address".to_string());
    } else if !is_valid_email(&identity.email) {
        problems.push("Please provide a valid email".to_string());
    }
    if let Some(pending) = &identity.pending_password {
        if pending.plain.chars().count() < MIN_PASSWORD_LEN {
            problems.push(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters"
            ));
        }
        if pending.plain != pending.confirm {
            problems.push("Passwords are not the same".to_string());
        }
    } else if identity.password_hash.is_empty() {
        problems.push("Please provide a password".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Invalid input data. {}",
            problems.join(". ")
        )))
    }
}
