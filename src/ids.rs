//! Opaque string identifiers.
//!
//! Subjects, policies and applications are keyed by opaque strings chosen by
//! the surrounding system (usually UUIDs). The relay never interprets them,
//! but ids arriving from untrusted input are validated with [`parse`] before
//! they reach a store.
//!
//! [`parse`]: SubjectId::parse

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum identifier length in bytes.
pub const MAX_ID_LEN: usize = 128;

fn id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9._:@-]+$").ok())
        .as_ref()
}

fn validate(field: &str, raw: &str) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
        });
    }
    if raw.len() > MAX_ID_LEN {
        return Err(ValidationError::FieldTooLong {
            field: field.to_string(),
            max_length: MAX_ID_LEN,
        });
    }
    if !id_pattern().is_some_and(|pattern| pattern.is_match(raw)) {
        return Err(ValidationError::InvalidCharacters {
            field: field.to_string(),
            value: raw.to_string(),
        });
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a trusted identifier without validation.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Validates an identifier from untrusted input.
            pub fn parse(raw: &str) -> Result<Self, ValidationError> {
                let trimmed = raw.trim();
                validate($field, trimmed)?;
                Ok(Self(trimmed.to_string()))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the identifier bytes (used as the event bus key).
            #[must_use]
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a data subject (an end user whose consent is tracked).
    SubjectId,
    "subject id"
);

string_id!(
    /// Identifier of a data-processing policy.
    PolicyId,
    "policy id"
);

string_id!(
    /// Identifier of an application that declares the policies it needs.
    ApplicationId,
    "application id"
);
