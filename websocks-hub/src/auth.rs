//! HTTP Basic authentication at the WebSocket upgrade, per spec.md §4.1:
//! the client presents `Authorization: Basic base64(user:pass)` on the
//! upgrade request and the hub rejects the upgrade outright on mismatch.

use base64::Engine;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing Authorization header")]
    Missing,
    #[error("malformed Authorization header")]
    Malformed,
    #[error("credentials rejected")]
    Rejected,
}

/// Check a raw `Authorization` header value against the configured
/// credential set. Any single match is sufficient.
pub fn check(header_value: Option<&str>, users: &[Credential]) -> Result<(), AuthError> {
    let value = header_value.ok_or(AuthError::Missing)?;
    let encoded = value.strip_prefix("Basic ").ok_or(AuthError::Malformed)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
    let (username, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;

    for cred in users {
        if constant_time_eq_str(username, &cred.username)
            && constant_time_eq_str(password, &cred.password)
        {
            return Ok(());
        }
    }
    Err(AuthError::Rejected)
}

fn constant_time_eq_str(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Vec<Credential> {
        vec![Credential { username: "alice".into(), password: "hunter2".into() }]
    }

    fn basic_header(user: &str, pass: &str) -> String {
        let raw = format!("{user}:{pass}");
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(raw))
    }

    #[test]
    fn accepts_matching_credentials() {
        let header = basic_header("alice", "hunter2");
        assert!(check(Some(&header), &users()).is_ok());
    }

    #[test]
    fn rejects_wrong_password() {
        let header = basic_header("alice", "wrong");
        assert!(matches!(check(Some(&header), &users()), Err(AuthError::Rejected)));
    }

    #[test]
    fn rejects_missing_header() {
        assert!(matches!(check(None, &users()), Err(AuthError::Missing)));
    }

    #[test]
    fn rejects_non_basic_scheme() {
        assert!(matches!(check(Some("Bearer abc"), &users()), Err(AuthError::Malformed)));
    }

    #[test]
    fn rejects_malformed_base64() {
        assert!(matches!(check(Some("Basic ???"), &users()), Err(AuthError::Malformed)));
    }
}
