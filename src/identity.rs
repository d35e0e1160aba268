//! Resolution of the acting user for a streaming request.

use crate::error::{IdentityError, SessionError};
use crate::protocol::UserId;
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use std::collections::HashMap;
use std::num::IntErrorKind;
use std::path::Path;

pub const SESSION_COOKIE: &str = "SESSION";

/// Maps a connection's request headers to its logged-in user, if any.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId>;
}

/// Login state keyed by opaque session tokens, as issued by the login
/// service. Empty unless a session file is configured.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, UserId>,
}

impl SessionTable {
    /// Parses a JSON object of `token -> userId`.
    pub fn from_json(raw: &str) -> Result<Self, SessionError> {
        let sessions: HashMap<String, UserId> = serde_json::from_str(raw)?;
        Ok(Self { sessions })
    }

    pub fn from_file(path: &Path) -> Result<Self, SessionError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    fn lookup(&self, token: &str) -> Option<UserId> {
        self.sessions.get(token).copied()
    }
}

impl FromIterator<(String, UserId)> for SessionTable {
    fn from_iter<I: IntoIterator<Item = (String, UserId)>>(iter: I) -> Self {
        Self {
            sessions: iter.into_iter().collect(),
        }
    }
}

impl IdentityResolver for SessionTable {
    fn resolve(&self, headers: &HeaderMap) -> Option<UserId> {
        if let Some(token) = session_cookie(headers) {
            if let Some(user_id) = self.lookup(token) {
                return Some(user_id);
            }
        }

        bearer_token(headers).and_then(|token| self.lookup(token))
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Parses an explicitly supplied user id. Blank input is `Ok(None)`.
pub fn parse_user_id(raw: &str) -> Result<Option<UserId>, IdentityError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    trimmed.parse::<UserId>().map(Some).map_err(|err| match err.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
            IdentityError::OutOfRange(trimmed.to_string())
        }
        _ => IdentityError::Invalid(trimmed.to_string()),
    })
}

/// Same as [`parse_user_id`] for a JSON body field, which may be a number or
/// a string.
pub fn user_id_from_json(value: &serde_json::Value) -> Result<Option<UserId>, IdentityError> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(raw) => parse_user_id(raw),
        serde_json::Value::Number(number) => match number.as_i64() {
            Some(id) => Ok(Some(id)),
            None if number.is_u64() => Err(IdentityError::OutOfRange(number.to_string())),
            // Integer literals past u64 arrive as floats.
            None => match number.as_f64() {
                Some(value) if value.fract() == 0.0 => {
                    Err(IdentityError::OutOfRange(number.to_string()))
                }
                _ => Err(IdentityError::Invalid(number.to_string())),
            },
        },
        other => Err(IdentityError::Invalid(other.to_string())),
    }
}

/// Login state wins; the explicit identifier is only consulted without one.
pub fn resolve_identity(
    resolver: &dyn IdentityResolver,
    headers: &HeaderMap,
    explicit: impl FnOnce() -> Result<Option<UserId>, IdentityError>,
) -> Result<Option<UserId>, IdentityError> {
    match resolver.resolve(headers) {
        Some(user_id) => Ok(Some(user_id)),
        None => explicit(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn parse_user_id_accepts_trimmed_integers() {
        assert_eq!(parse_user_id(" 42 "), Ok(Some(42)));
        assert_eq!(parse_user_id("-7"), Ok(Some(-7)));
        assert_eq!(parse_user_id("   "), Ok(None));
    }

    #[test]
    fn parse_user_id_distinguishes_range_from_garbage() {
        assert_eq!(
            parse_user_id("9223372036854775808"),
            Err(IdentityError::OutOfRange("9223372036854775808".to_string()))
        );
        assert_eq!(
            parse_user_id("-9223372036854775809"),
            Err(IdentityError::OutOfRange("-9223372036854775809".to_string()))
        );
        assert_eq!(
            parse_user_id("abc"),
            Err(IdentityError::Invalid("abc".to_string()))
        );
    }

    #[test]
    fn json_user_ids_may_be_numbers_or_strings() {
        assert_eq!(user_id_from_json(&json!(42)), Ok(Some(42)));
        assert_eq!(user_id_from_json(&json!("42")), Ok(Some(42)));
        assert_eq!(user_id_from_json(&json!(null)), Ok(None));
        assert!(matches!(
            user_id_from_json(&json!(u64::MAX)),
            Err(IdentityError::OutOfRange(_))
        ));
        assert!(matches!(
            user_id_from_json(&json!(1.5)),
            Err(IdentityError::Invalid(_))
        ));
        assert!(matches!(
            user_id_from_json(&json!(true)),
            Err(IdentityError::Invalid(_))
        ));
    }

    #[test]
    fn huge_json_integers_are_out_of_range() {
        let value: serde_json::Value = serde_json::from_str("99999999999999999999").unwrap();
        assert!(matches!(
            user_id_from_json(&value),
            Err(IdentityError::OutOfRange(_))
        ));
        assert!(matches!(
            user_id_from_json(&json!(-1e30)),
            Err(IdentityError::OutOfRange(_))
        ));
    }

    #[test]
    fn session_file_maps_tokens_to_users() {
        let table = SessionTable::from_json(r#"{"abc": 7, "def": 8}"#).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("def"), Some(8));

        assert!(matches!(
            SessionTable::from_json(r#"{"abc": "seven"}"#),
            Err(SessionError::Parse(_))
        ));
        assert!(matches!(
            SessionTable::from_file(Path::new("/nonexistent/sessions.json")),
            Err(SessionError::Io(_))
        ));
    }

    #[test]
    fn session_cookie_and_bearer_token_resolve() {
        let table: SessionTable = [("tok-7".to_string(), 7)].into_iter().collect();

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; SESSION=tok-7"),
        );
        assert_eq!(table.resolve(&headers), Some(7));

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok-7"));
        assert_eq!(table.resolve(&headers), Some(7));

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer unknown"));
        assert_eq!(table.resolve(&headers), None);
    }

    #[test]
    fn login_state_takes_precedence_over_explicit_id() {
        let table: SessionTable = [("tok-1".to_string(), 1)].into_iter().collect();
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer tok-1"));

        let resolved = resolve_identity(&table, &headers, || parse_user_id("not-a-number"));
        assert_eq!(resolved, Ok(Some(1)));

        let resolved = resolve_identity(&table, &HeaderMap::new(), || parse_user_id("2"));
        assert_eq!(resolved, Ok(Some(2)));
    }
}
