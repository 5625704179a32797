//! Password reset handshake.
//!
//! `request_reset` hands out a random credential once and persists only its
//! SHA-256 digest plus an absolute expiry. `redeem` hashes whatever the client
//! presents and looks the digest up again, so a leaked users table cannot be
//! used to reset passwords.

use std::sync::Arc;

use rand::RngCore;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument, warn};

use super::repo_types::Identity;
use super::services::{normalize_email, Accounts, SaveOptions};
use crate::config::{ResetConfig, MAX_TTL_MINUTES};
use crate::error::AppError;
use crate::notify::{Message, Notifier};

const RESET_TOKEN_BYTES: usize = 32;

pub fn generate_reset_token() -> String {
    let mut bytes = [0u8; RESET_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_reset_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// A reset that was just created. The plaintext is not stored anywhere else.
pub struct PendingReset {
    pub identity: Identity,
    pub token: String,
}

#[derive(Clone)]
pub struct ResetHandshake {
    accounts: Accounts,
    notifier: Arc<dyn Notifier>,
    ttl: Duration,
    public_base_url: String,
}

impl ResetHandshake {
    pub fn new(accounts: Accounts, notifier: Arc<dyn Notifier>, cfg: &ResetConfig) -> Self {
        Self {
            accounts,
            notifier,
            ttl: Duration::minutes(cfg.ttl_minutes.clamp(1, MAX_TTL_MINUTES)),
            public_base_url: cfg.public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn reset_url(&self, token: &str) -> String {
        format!("{}/api/v1/users/resetPassword/{}", self.public_base_url, token)
    }

    pub async fn request_reset(&self, email: &str) -> Result<PendingReset, AppError> {
        self.request_reset_at(email, OffsetDateTime::now_utc()).await
    }

    pub async fn request_reset_at(
        &self,
        email: &str,
        now: OffsetDateTime,
    ) -> Result<PendingReset, AppError> {
        let email = normalize_email(email);
        let mut identity = self
            .accounts
            .store()
            .find_by_email(&email)
            .await?
            .ok_or_else(|| AppError::NotFound("There is no user with that email address".into()))?;

        let token = identity.create_password_reset(self.ttl, now);
        let identity = self
            .accounts
            .save(identity, SaveOptions { validate: false })
            .await?;
        Ok(PendingReset { identity, token })
    }

    /// Creates a reset and sends the link; a reset that could not be sent is withdrawn.
    #[instrument(skip(self, email))]
    pub async fn request_and_deliver(&self, email: &str) -> Result<(), AppError> {
        let PendingReset {
            mut identity,
            token,
        } = self.request_reset(email).await?;

        let url = self.reset_url(&token);
        let message = Message {
            to: identity.email.clone(),
            subject: format!(
                "Your password reset token (valid for {} min)",
                self.ttl.whole_minutes()
            ),
            body: format!(
                "Forgot your password? Submit a PATCH request with your new password and \
                 passwordConfirm to: {url}.\nIf you didn't forget your password, please ignore this email!"
            ),
        };

        if let Err(e) = self.notifier.send(message).await {
            error!(error = %e, user_id = %identity.id, "reset email failed; withdrawing reset");
            identity.clear_password_reset();
            self.accounts
                .save(identity, SaveOptions { validate: false })
                .await?;
            return Err(AppError::DeliveryFailure);
        }

        info!(user_id = %identity.id, "reset token sent");
        Ok(())
    }

    pub async fn redeem(
        &self,
        token: &str,
        password: &str,
        password_confirm: &str,
    ) -> Result<Identity, AppError> {
        self.redeem_at(token, password, password_confirm, OffsetDateTime::now_utc())
            .await
    }

    pub async fn redeem_at(
        &self,
        token: &str,
        password: &str,
        password_confirm: &str,
        now: OffsetDateTime,
    ) -> Result<Identity, AppError> {
        let digest = hash_reset_token(token);
        let mut identity = match self
            .accounts
            .store()
            .find_by_reset_token(&digest, now)
            .await?
        {
            Some(identity) if identity.reset_matches(&digest, now) => identity,
            _ => {
                warn!("reset token unmatched or expired");
                return Err(AppError::InvalidOrExpiredReset);
            }
        };

        identity.set_password(password, password_confirm);
        identity.clear_password_reset();
        let identity = self
            .accounts
            .save_at(identity, SaveOptions { validate: true }, now)
            .await?;
        info!(user_id = %identity.id, "password reset redeemed");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo::memory::MemoryIdentityStore;
    use crate::auth::services::tests::{accounts_with, seed_user};
    use crate::notify::fake::RecordingNotifier;

    fn cfg() -> ResetConfig {
        ResetConfig {
            ttl_minutes: 10,
            public_base_url: "https://natours.test/".into(),
            conceal_unknown_email: false,
        }
    }

    fn handshake(
        store: Arc<MemoryIdentityStore>,
        notifier: Arc<RecordingNotifier>,
    ) -> ResetHandshake {
        ResetHandshake::new(accounts_with(store), notifier, &cfg())
    }

    #[test]
    fn reset_token_is_random_hex_and_digest_is_sha256() {
        let a = generate_reset_token();
        let b = generate_reset_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(
            hash_reset_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn request_reset_stores_only_digest_and_ten_minute_expiry() {
        let store = Arc::new(MemoryIdentityStore::default());
        let user = seed_user(&store, "jonas@example.com", "pass1234").await;
        let reset = handshake(store.clone(), Arc::default());

        let now = OffsetDateTime::now_utc();
        let pending = reset.request_reset_at(" Jonas@Example.com ", now).await.unwrap();

        let stored = store.get(user.id).unwrap();
        assert_eq!(stored.password_reset_token, Some(hash_reset_token(&pending.token)));
        assert_ne!(stored.password_reset_token.as_deref(), Some(pending.token.as_str()));
        assert_eq!(stored.password_reset_expires, Some(now + Duration::minutes(10)));
    }

    #[tokio::test]
    async fn oversized_ttl_is_capped_instead_of_panicking() {
        let store = Arc::new(MemoryIdentityStore::default());
        let user = seed_user(&store, "huge@example.com", "pass1234").await;
        let cfg = ResetConfig {
            ttl_minutes: i64::MAX,
            ..cfg()
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let reset = ResetHandshake::new(accounts_with(store.clone()), notifier, &cfg);

        let now = OffsetDateTime::now_utc();
        reset.request_reset_at("huge@example.com", now).await.unwrap();
        assert_eq!(
            store.get(user.id).unwrap().password_reset_expires,
            Some(now + Duration::minutes(MAX_TTL_MINUTES))
        );
    }

    #[tokio::test]
    async fn request_reset_for_unknown_email_is_not_found() {
        let reset = handshake(Arc::default(), Arc::default());
        let err = reset.request_reset("nobody@example.com").await.err().unwrap();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn delivered_link_carries_the_plaintext_token() {
        let store = Arc::new(MemoryIdentityStore::default());
        let user = seed_user(&store, "jonas@example.com", "pass1234").await;
        let notifier = Arc::new(RecordingNotifier::default());
        let reset = handshake(store.clone(), notifier.clone());

        reset.request_and_deliver("jonas@example.com").await.unwrap();

        let sent = notifier.last().expect("a message was sent");
        assert_eq!(sent.to, "jonas@example.com");
        assert!(sent.subject.contains("10 min"));
        let marker = "https://natours.test/api/v1/users/resetPassword/";
        let start = sent.body.find(marker).unwrap() + marker.len();
        let token = &sent.body[start..start + 64];
        let stored = store.get(user.id).unwrap();
        assert_eq!(stored.password_reset_token, Some(hash_reset_token(token)));
    }

    #[tokio::test]
    async fn failed_delivery_withdraws_the_reset() {
        let store = Arc::new(MemoryIdentityStore::default());
        let user = seed_user(&store, "jonas@example.com", "pass1234").await;
        let reset = handshake(store.clone(), Arc::new(RecordingNotifier::failing()));

        let err = reset.request_and_deliver("jonas@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::DeliveryFailure));

        let stored = store.get(user.id).unwrap();
        assert!(stored.password_reset_token.is_none());
        assert!(stored.password_reset_expires.is_none());
    }

    #[tokio::test]
    async fn redeem_sets_password_and_clears_reset() {
        let store = Arc::new(MemoryIdentityStore::default());
        let user = seed_user(&store, "jonas@example.com", "pass1234").await;
        let reset = handshake(store.clone(), Arc::default());
        let now = OffsetDateTime::now_utc();
        let pending = reset.request_reset_at("jonas@example.com", now).await.unwrap();

        let redeemed = reset
            .redeem_at(&pending.token, "newpass123", "newpass123", now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(redeemed.id, user.id);

        let stored = store.get(user.id).unwrap();
        assert!(stored.password_reset_token.is_none());
        assert!(stored.password_reset_expires.is_none());
        assert_ne!(stored.password_hash, user.password_hash);
        let hasher = crate::auth::password::test_hasher();
        assert!(hasher.verify("newpass123", &stored.password_hash).unwrap());

        // Second use of the same credential fails.
        let again = reset.redeem(&pending.token, "another123", "another123").await;
        assert!(matches!(again, Err(AppError::InvalidOrExpiredReset)));
    }

    #[tokio::test]
    async fn redeem_invalidates_tokens_issued_before_it() {
        let store = Arc::new(MemoryIdentityStore::default());
        seed_user(&store, "jonas@example.com", "pass1234").await;
        let reset = handshake(store.clone(), Arc::default());
        let now = OffsetDateTime::now_utc();
        let pending = reset.request_reset_at("jonas@example.com", now).await.unwrap();

        let redeemed_at = now + Duration::minutes(1);
        let identity = reset
            .redeem_at(&pending.token, "newpass123", "newpass123", redeemed_at)
            .await
            .unwrap();

        let old_iat = (now - Duration::minutes(30)).unix_timestamp() as usize;
        let fresh_iat = redeemed_at.unix_timestamp() as usize;
        assert!(identity.changed_password_after(old_iat));
        assert!(!identity.changed_password_after(fresh_iat));
    }

    #[tokio::test]
    async fn wrong_token_fails_and_keeps_pending_reset() {
        let store = Arc::new(MemoryIdentityStore::default());
        let user = seed_user(&store, "jonas@example.com", "pass1234").await;
        let reset = handshake(store.clone(), Arc::default());
        let now = OffsetDateTime::now_utc();
        let pending = reset.request_reset_at("jonas@example.com", now).await.unwrap();

        let err = reset
            .redeem_at(&generate_reset_token(), "newpass123", "newpass123", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpiredReset));
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let stored = store.get(user.id).unwrap();
        assert_eq!(stored.password_reset_token, Some(hash_reset_token(&pending.token)));

        // The genuine credential still works afterwards.
        reset
            .redeem_at(&pending.token, "newpass123", "newpass123", now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn correct_token_after_expiry_fails() {
        let store = Arc::new(MemoryIdentityStore::default());
        let user = seed_user(&store, "jonas@example.com", "pass1234").await;
        let reset = handshake(store.clone(), Arc::default());
        let now = OffsetDateTime::now_utc();
        let pending = reset.request_reset_at("jonas@example.com", now).await.unwrap();

        let err = reset
            .redeem_at(&pending.token, "newpass123", "newpass123", now + Duration::minutes(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpiredReset));
        assert_eq!(store.get(user.id).unwrap().password_hash, user.password_hash);
    }

    #[tokio::test]
    async fn invalid_new_password_keeps_pending_reset() {
        let store = Arc::new(MemoryIdentityStore::default());
        let user = seed_user(&store, "jonas@example.com", "pass1234").await;
        let reset = handshake(store.clone(), Arc::default());
        let now = OffsetDateTime::now_utc();
        let pending = reset.request_reset_at("jonas@example.com", now).await.unwrap();

        let err = reset
            .redeem_at(&pending.token, "newpass123", "different1", now)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(store.get(user.id).unwrap().password_reset_token.is_some());
    }
}
