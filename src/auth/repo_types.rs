use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use super::reset::{generate_reset_token, hash_reset_token};

/// Account roles.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    User,
    Guide,
    LeadGuide,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Guide => "guide",
            Role::LeadGuide => "lead-guide",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "guide" => Ok(Role::Guide),
            "lead-guide" => Ok(Role::LeadGuide),
            "admin" => Ok(Role::Admin),
            other => anyhow::bail!("unknown role {other:?}"),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plaintext password waiting to be hashed by the next save.
#[derive(Clone)]
pub(crate) struct PendingPassword {
    pub plain: String,
    pub confirm: String,
}

/// A user account.
#[derive(Clone, Serialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub photo: Option<String>,
    pub role: Role,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub password_changed_at: Option<OffsetDateTime>,
    #[serde(skip_serializing)]
    pub password_reset_token: Option<String>,
    #[serde(skip_serializing)]
    pub password_reset_expires: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(skip)]
    pub(crate) pending_password: Option<PendingPassword>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("role", &self.role)
            .field("password_hash", &"[REDACTED]")
            .field("password_changed_at", &self.password_changed_at)
            .field("reset_pending", &self.password_reset_token.is_some())
            .finish()
    }
}

impl Identity {
    /// New, unsaved account with the default role.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            email: email.into(),
            photo: None,
            role: Role::default(),
            password_hash: String::new(),
            password_changed_at: None,
            password_reset_token: None,
            password_reset_expires: None,
            created_at: OffsetDateTime::now_utc(),
            pending_password: None,
        }
    }

    /// Marks the password as modified; it is hashed on the next save.
    pub fn set_password(&mut self, plain: impl Into<String>, confirm: impl Into<String>) {
        self.pending_password = Some(PendingPassword {
            plain: plain.into(),
            confirm: confirm.into(),
        });
    }

    /// True when the password changed after a token issued at `iat` (unix seconds).
    pub fn changed_password_after(&self, iat: usize) -> bool {
        match self.password_changed_at {
            Some(changed) => (iat as i64) < changed.unix_timestamp(),
            None => false,
        }
    }

    /// Starts a reset: stores the digest and expiry, returns the plaintext once.
    pub fn create_password_reset(&mut self, ttl: Duration, now: OffsetDateTime) -> String {
        let token = generate_reset_token();
        self.password_reset_token = Some(hash_reset_token(&token));
        self.password_reset_expires = Some(now + ttl);
        token
    }

    pub fn clear_password_reset(&mut self) {
        self.password_reset_token = None;
        self.password_reset_expires = None;
    }

    /// Whether `digest` redeems the pending reset at `now`.
    pub fn reset_matches(&self, digest: &str, now: OffsetDateTime) -> bool {
        match (&self.password_reset_token, self.password_reset_expires) {
            (Some(stored), Some(expires)) => stored == digest && expires > now,
            _ => false,
        }
    }
}

/// Row shape of the `users` table.
#[derive(Debug, FromRow)]
pub struct IdentityRow {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub photo: Option<String>,
    pub role: String,
    pub password_hash: String,
    pub password_changed_at: Option<OffsetDateTime>,
    pub password_reset_token: Option<String>,
    pub password_reset_expires: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = anyhow::Error;

    fn try_from(r: IdentityRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            name: r.name,
            email: r.email,
            photo: r.photo,
            role: r.role.parse()?,
            password_hash: r.password_hash,
            password_changed_at: r.password_changed_at,
            password_reset_token: r.password_reset_token,
            password_reset_expires: r.password_reset_expires,
            created_at: r.created_at,
            pending_password: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_wire_names() {
        assert_eq!(serde_json::to_string(&Role::LeadGuide).unwrap(), r#""lead-guide""#);
        let admin: Role = serde_json::from_str(r#""admin""#).unwrap();
        assert_eq!(admin, Role::Admin);
        for role in [Role::User, Role::Guide, Role::LeadGuide, Role::Admin] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("lead-guid".parse::<Role>().is_err());
    }

    #[test]
    fn serialized_identity_hides_credentials() {
        let mut identity = Identity::new("Jonas", "jonas@example.com");
        identity.password_hash = "$argon2id$v=19$secret".into();
        identity.create_password_reset(Duration::minutes(10), OffsetDateTime::now_utc());

        let json = serde_json::to_string(&identity).unwrap();
        assert!(!json.contains("argon2"));
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("password_reset"));
        assert!(!format!("{identity:?}").contains("argon2"));
    }

    #[test]
    fn changed_password_after_compares_seconds() {
        let mut identity = Identity::new("Jonas", "jonas@example.com");
        assert!(!identity.changed_password_after(0));

        let changed = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        identity.password_changed_at = Some(changed);
        assert!(identity.changed_password_after(1_699_999_999));
        assert!(!identity.changed_password_after(1_700_000_000));
        assert!(!identity.changed_password_after(1_700_000_100));
    }

    #[test]
    fn reset_matches_only_live_digest() {
        let now = OffsetDateTime::now_utc();
        let mut identity = Identity::new("Jonas", "jonas@example.com");
        let token = identity.create_password_reset(Duration::minutes(10), now);
        let digest = hash_reset_token(&token);

        assert_ne!(identity.password_reset_token.as_deref(), Some(token.as_str()));
        assert!(identity.reset_matches(&digest, now));
        assert!(!identity.reset_matches(&hash_reset_token("other"), now));
        assert!(!identity.reset_matches(&digest, now + Duration::minutes(10)));

        identity.clear_password_reset();
        assert!(!identity.reset_matches(&digest, now));
    }
}
