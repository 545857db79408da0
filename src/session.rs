//! Signed session tokens.
//!
//! A token is `<subject-id>.<admin 0|1>.<mac>` where `mac` is the hex BLAKE3
//! keyed hash of the first two fields under a key derived from the session
//! secret. Token issuance happens elsewhere; the relay only verifies.

use crate::error::{RelayError, ValidationError};
use crate::ids::SubjectId;

/// Shortest accepted session secret, in bytes.
pub const MIN_SECRET_LEN: usize = 16;

const KEY_CONTEXT: &str = "consent-relay 2024 session token v1";

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Subject the session acts as.
    pub subject_id: SubjectId,
    /// May act on any subject.
    pub admin: bool,
}

impl Session {
    /// Session of a regular user.
    #[must_use]
    pub fn user(subject_id: impl Into<SubjectId>) -> Self {
        Self {
            subject_id: subject_id.into(),
            admin: false,
        }
    }

    /// Administrative session, may act on any subject.
    #[must_use]
    pub fn admin(subject_id: impl Into<SubjectId>) -> Self {
        Self {
            subject_id: subject_id.into(),
            admin: true,
        }
    }
}

/// Signs and verifies session tokens.
pub struct SessionSigner {
    key: [u8; 32],
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner").finish_non_exhaustive()
    }
}

fn unauthorized(reason: &str) -> RelayError {
    RelayError::Unauthorized {
        reason: reason.to_string(),
    }
}

impl SessionSigner {
    /// Signer keyed by `secret`.
    pub fn new(secret: &str) -> Result<Self, ValidationError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(ValidationError::InvalidSetting {
                field: "session secret".to_string(),
                reason: format!("must be at least {MIN_SECRET_LEN} bytes"),
            });
        }
        Ok(Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
        })
    }

    /// Issues a bearer token for `session`.
    #[must_use]
    pub fn sign(&self, session: &Session) -> String {
        let payload = format!("{}.{}", session.subject_id, u8::from(session.admin));
        let mac = blake3::keyed_hash(&self.key, payload.as_bytes());
        format!("{payload}.{}", mac.to_hex())
    }

    /// Checks the MAC and decodes the session.
    pub fn verify(&self, token: &str) -> Result<Session, RelayError> {
        let (payload, mac_hex) = token
            .trim()
            .rsplit_once('.')
            .ok_or_else(|| unauthorized("malformed session token"))?;
        let presented = blake3::Hash::from_hex(mac_hex).map_err(|_| unauthorized("malformed session token"))?;
        // `Hash` equality is constant-time.
        if presented != blake3::keyed_hash(&self.key, payload.as_bytes()) {
            return Err(unauthorized("invalid session signature"));
        }

        let (subject, admin) = payload
            .rsplit_once('.')
            .ok_or_else(|| unauthorized("malformed session token"))?;
        let admin = match admin {
            "0" => false,
            "1" => true,
            _ => return Err(unauthorized("malformed session token")),
        };
        let subject_id = SubjectId::parse(subject).map_err(|_| unauthorized("malformed session subject"))?;
        Ok(Session { subject_id, admin })
    }
}
