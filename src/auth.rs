//! Bearer-token authentication
//!
//! Every request must present `Authorization: Bearer <token>` with a token
//! from the active [`CredentialSet`]. Anything else is rejected.

use arc_swap::ArcSwap;
use hyper::header::HeaderValue;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Immutable set of accepted bearer tokens
#[derive(Debug, Clone, Default)]
pub struct CredentialSet {
    tokens: HashSet<String>,
}

impl CredentialSet {
    pub fn new(tokens: HashSet<String>) -> Self {
        Self { tokens }
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for CredentialSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// No Authorization header
    Missing,
    /// Header present but not a usable bearer token
    Malformed,
    /// Well-formed token that is not in the set
    Unknown,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Missing => "missing",
            RejectReason::Malformed => "malformed",
            RejectReason::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Authorized,
    Rejected(RejectReason),
}

impl AuthDecision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, AuthDecision::Authorized)
    }
}

/// Extract the token from a `Bearer <token>` header value.
///
/// The scheme is matched case-insensitively; the token itself is opaque.
pub fn extract_bearer(value: &HeaderValue) -> Option<&str> {
    let value = value.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return None;
    }
    Some(token)
}

/// Decide whether a request carrying `header` may pass
pub fn authorize(credentials: &CredentialSet, header: Option<&HeaderValue>) -> AuthDecision {
    let Some(value) = header else {
        return AuthDecision::Rejected(RejectReason::Missing);
    };
    match extract_bearer(value) {
        Some(token) if credentials.contains(token) => AuthDecision::Authorized,
        Some(_) => AuthDecision::Rejected(RejectReason::Unknown),
        None => AuthDecision::Rejected(RejectReason::Malformed),
    }
}

/// Holder of the active credential set, swapped wholesale on reload
#[derive(Debug)]
pub struct CredentialStore {
    current: ArcSwap<CredentialSet>,
}

impl CredentialStore {
    pub fn new(set: CredentialSet) -> Self {
        Self {
            current: ArcSwap::from_pointee(set),
        }
    }

    /// The set in force right now. Callers keep the returned snapshot for the
    /// whole request so later reloads never affect it.
    pub fn snapshot(&self) -> Arc<CredentialSet> {
        self.current.load_full()
    }

    pub fn replace(&self, set: CredentialSet) {
        let count = set.len();
        self.current.store(Arc::new(set));
        info!(tokens = count, "Credential set replaced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(value: &str) -> HeaderValue {
        HeaderValue::from_str(value).unwrap()
    }

    fn credentials() -> CredentialSet {
        ["alpha-key", "beta-key"].into_iter().collect()
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer(&header("Bearer abc123")), Some("abc123"));
        assert_eq!(extract_bearer(&header("bearer abc123")), Some("abc123"));
        assert_eq!(extract_bearer(&header("Bearer   abc123  ")), Some("abc123"));
        assert_eq!(extract_bearer(&header("abc123")), None);
        assert_eq!(extract_bearer(&header("Basic abc123")), None);
        assert_eq!(extract_bearer(&header("Bearer ")), None);
        assert_eq!(extract_bearer(&header("Bearer a b")), None);
    }

    #[test]
    fn test_authorize_known_token() {
        let decision = authorize(&credentials(), Some(&header("Bearer alpha-key")));
        assert_eq!(decision, AuthDecision::Authorized);
        assert!(decision.is_authorized());
    }

    #[test]
    fn test_authorize_default_deny() {
        let creds = credentials();
        assert_eq!(
            authorize(&creds, None),
            AuthDecision::Rejected(RejectReason::Missing)
        );
        assert_eq!(
            authorize(&creds, Some(&header("Token alpha-key"))),
            AuthDecision::Rejected(RejectReason::Malformed)
        );
        assert_eq!(
            authorize(&creds, Some(&header("Bearer gamma-key"))),
            AuthDecision::Rejected(RejectReason::Unknown)
        );
        // No partial matching
        assert_eq!(
            authorize(&creds, Some(&header("Bearer alpha"))),
            AuthDecision::Rejected(RejectReason::Unknown)
        );
        assert_eq!(
            authorize(&creds, Some(&header("Bearer alpha-key-extra"))),
            AuthDecision::Rejected(RejectReason::Unknown)
        );
    }

    #[test]
    fn test_authorize_non_utf8_header() {
        let value = HeaderValue::from_bytes(b"Bearer \xff\xfe").unwrap();
        assert_eq!(
            authorize(&credentials(), Some(&value)),
            AuthDecision::Rejected(RejectReason::Malformed)
        );
    }

    #[test]
    fn test_empty_set_rejects_everything() {
        let creds = CredentialSet::default();
        assert!(creds.is_empty());
        assert!(!authorize(&creds, Some(&header("Bearer anything"))).is_authorized());
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let store = CredentialStore::new(credentials());
        let before = store.snapshot();

        store.replace(["gamma-key"].into_iter().collect());
        let after = store.snapshot();

        // A request that arrived before the reload keeps its view
        assert!(authorize(&before, Some(&header("Bearer alpha-key"))).is_authorized());
        assert!(!authorize(&after, Some(&header("Bearer alpha-key"))).is_authorized());
        assert!(authorize(&after, Some(&header("Bearer gamma-key"))).is_authorized());
        assert_eq!(after.len(), 1);
    }
}
