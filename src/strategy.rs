//! Connection strategy ladder.
//!
//! Managed databases often require TLS but present certificates the
//! gateway cannot verify. A pool is therefore opened by trying up to three
//! rewrites of the user's URI, in order:
//!
//! 1. **as given**: the URI untouched.
//! 2. **permissive TLS**: the URI with the driver's permissive TLS
//!    parameters set (replacing any existing values for the same keys).
//! 3. **stripped + permissive TLS**: every query parameter dropped, then
//!    only the permissive TLS parameters appended. Recovers from URIs
//!    carrying options the driver rejects.
//!
//! Rewrites operate on the raw query string; values are neither decoded
//! nor re-encoded.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectStrategy {
    AsGiven,
    PermissiveTls,
    StrippedPermissiveTls,
}

impl ConnectStrategy {
    /// Every strategy, in the order they are attempted.
    pub const LADDER: [ConnectStrategy; 3] = [
        ConnectStrategy::AsGiven,
        ConnectStrategy::PermissiveTls,
        ConnectStrategy::StrippedPermissiveTls,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ConnectStrategy::AsGiven => "initial",
            ConnectStrategy::PermissiveTls => "permissive-tls",
            ConnectStrategy::StrippedPermissiveTls => "stripped-permissive-tls",
        }
    }

    /// The URI to dial for this strategy.
    pub fn apply(&self, uri: &str, tls_params: &[(&str, &str)]) -> String {
        let (base, query) = split_query(uri);
        match self {
            ConnectStrategy::AsGiven => uri.to_string(),
            ConnectStrategy::PermissiveTls => {
                let mut params: Vec<(String, String)> = query.map(parse_query).unwrap_or_default();
                for (key, value) in tls_params {
                    match params.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
                        Some(existing) => existing.1 = value.to_string(),
                        None => params.push((key.to_string(), value.to_string())),
                    }
                }
                join_query(base, &params)
            }
            ConnectStrategy::StrippedPermissiveTls => {
                let params: Vec<(String, String)> = tls_params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                join_query(base, &params)
            }
        }
    }
}

impl fmt::Display for ConnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn split_query(uri: &str) -> (&str, Option<&str>) {
    match uri.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (uri, None),
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn join_query(base: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return base.to_string();
    }
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}?{}", base, query.join("&"))
}

fn password_span(uri: &str) -> Option<(usize, usize)> {
    let authority_start = uri.find("://")? + 3;
    let rest = &uri[authority_start..];
    let authority_len = rest.find(['/', '?']).unwrap_or(rest.len());
    let authority = &rest[..authority_len];
    let userinfo_len = authority.rfind('@')?;
    let colon = authority[..userinfo_len].find(':')?;
    let start = authority_start + colon + 1;
    let end = authority_start + userinfo_len;
    (start < end).then_some((start, end))
}

/// Mask the password component of a URI for logs and error messages.
///
/// ```
/// use dbgate::strategy::redact_uri;
/// assert_eq!(
///     redact_uri("postgres://app:s3cret@db:5432/shop"),
///     "postgres://app:***@db:5432/shop"
/// );
/// ```
pub fn redact_uri(uri: &str) -> String {
    match password_span(uri) {
        Some((start, end)) => format!("{}***{}", &uri[..start], &uri[end..]),
        None => uri.to_string(),
    }
}

/// Passwords shorter than this are only masked where they appear inside
/// `user:password@`; replacing them everywhere would shred the message.
const MIN_BARE_PASSWORD_LEN: usize = 4;

/// Remove the password of `uri` from a driver error message, in both its
/// raw and percent-decoded forms.
pub fn redact_message(message: &str, uri: &str) -> String {
    let Some((start, end)) = password_span(uri) else {
        return message.to_string();
    };
    let raw = &uri[start..end];
    let user = uri[..start - 1]
        .rsplit("://")
        .next()
        .unwrap_or_default();

    let mut forms = vec![raw.to_string()];
    let decoded = percent_decode(raw);
    if decoded != raw {
        forms.push(decoded);
    }

    let mut out = message.to_string();
    for password in &forms {
        out = out.replace(&format!("{}:{}@", user, password), &format!("{}:***@", user));
        if password.chars().count() >= MIN_BARE_PASSWORD_LEN {
            out = out.replace(password.as_str(), "***");
        }
    }
    out
}

/// Decode `%XX` escapes; malformed escapes are kept as written.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
