//! Webhook identity extracted from request paths.
//!
//! # Design Decisions
//! - Ids must be numeric (upstream snowflakes); tokens must be non-empty
//!   and URL-safe
//! - Ownership of the token is not checked here; the upstream call does that
//! - Tokens never appear in `Display`/`Debug` output

use std::fmt;

use crate::error::ProxyError;

/// Number of token characters kept when a key is printed.
const TOKEN_PREFIX_LEN: usize = 4;

/// An (id, token) pair identifying one upstream webhook.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct WebhookKey {
    id: String,
    token: String,
}

impl WebhookKey {
    /// Validate and build a key.
    pub fn parse(id: &str, token: &str) -> Result<Self, ProxyError> {
        if id.is_empty() || id.len() > 20 || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProxyError::ClientInput("webhook id must be numeric".into()));
        }
        if token.is_empty() {
            return Err(ProxyError::ClientInput("webhook token must not be empty".into()));
        }
        if !token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ProxyError::ClientInput(
                "webhook token contains invalid characters".into(),
            ));
        }
        Ok(Self {
            id: id.to_string(),
            token: token.to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The raw token. Only for building the upstream URL.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Rate-limit route key. The webhook id is the upstream's major parameter.
    pub fn route_key(&self) -> String {
        format!("webhooks/{}", self.id)
    }
}

impl fmt::Display for WebhookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.token.chars().take(TOKEN_PREFIX_LEN).collect();
        write!(f, "{}/{}…", self.id, prefix)
    }
}

impl fmt::Debug for WebhookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WebhookKey({})", self)
    }
}

/// Upstream API version segment, e.g. `v10`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiVersion(String);

impl ApiVersion {
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let digits = raw.strip_prefix('v').unwrap_or("");
        if digits.is_empty() || digits.len() > 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProxyError::ClientInput(format!(
                "'{}' is not an API version",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Everything the path and query say about the upstream target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub key: WebhookKey,
    pub version: Option<ApiVersion>,
    /// Raw query string forwarded verbatim (`thread_id`, `wait`, ...).
    pub query: Option<String>,
}

impl WebhookTarget {
    /// Path on the upstream, e.g. `/api/v10/webhooks/{id}/{token}`.
    pub fn upstream_path(&self) -> String {
        match &self.version {
            Some(v) => format!(
                "/api/{}/webhooks/{}/{}",
                v.as_str(),
                self.key.id(),
                self.key.token()
            ),
            None => format!("/api/webhooks/{}/{}", self.key.id(), self.key.token()),
        }
    }

    /// Path plus query.
    pub fn upstream_path_and_query(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.upstream_path(), q),
            _ => self.upstream_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_numeric_id_and_token() {
        let key = WebhookKey::parse("123456789012345678", "abc-DEF_123").unwrap();
        assert_eq!(key.id(), "123456789012345678");
        assert_eq!(key.route_key(), "webhooks/123456789012345678");
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(WebhookKey::parse("12a", "tok").is_err());
        assert!(WebhookKey::parse("", "tok").is_err());
        assert!(WebhookKey::parse("123", "").is_err());
        assert!(WebhookKey::parse("123", "tok/../x").is_err());
        assert!(WebhookKey::parse("123456789012345678901", "tok").is_err());
    }

    #[test]
    fn display_redacts_token() {
        let key = WebhookKey::parse("42", "supersecrettoken").unwrap();
        let shown = format!("{} {:?}", key, key);
        assert!(shown.contains("42/supe"));
        assert!(!shown.contains("supersecrettoken"));
    }

    #[test]
    fn api_version_format() {
        assert!(ApiVersion::parse("v10").is_ok());
        assert!(ApiVersion::parse("10").is_err());
        assert!(ApiVersion::parse("v").is_err());
        assert!(ApiVersion::parse("vten").is_err());
    }

    #[test]
    fn upstream_path_includes_version_and_query() {
        let target = WebhookTarget {
            key: WebhookKey::parse("1", "t").unwrap(),
            version: Some(ApiVersion::parse("v10").unwrap()),
            query: Some("thread_id=9".into()),
        };
        assert_eq!(
            target.upstream_path_and_query(),
            "/api/v10/webhooks/1/t?thread_id=9"
        );

        let plain = WebhookTarget {
            version: None,
            query: None,
            ..target
        };
        assert_eq!(plain.upstream_path_and_query(), "/api/webhooks/1/t");
    }
}
