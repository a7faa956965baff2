//! Grammar validators for names, emails, paths, and endpoints.
//!
//! These are the interoperability-critical validators: every handler runs
//! them before touching the persisted graph, and their accept/reject
//! behavior is part of the wire contract.

/// A parsed path: an optional owner email plus at least one segment.
///
/// `"alice@example.com/db/main"` parses to email `"alice@example.com"` and
/// segments `["db", "main"]`; `"/db"` parses to an empty email (meaning the
/// caller's own namespace) and segments `["db"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSpec {
    /// Owner email; empty means the caller's own namespace.
    pub email: String,

    /// Path segments, each passing `validate_name`. Never empty.
    pub segments: Vec<String>,
}

impl PathSpec {
    /// Renders the fully-qualified connection name under the given email.
    ///
    /// Used when the parsed path carries an empty email and the caller's
    /// own email must be substituted.
    pub fn qualified(&self, own_email: &str) -> String {
        let email = if self.email.is_empty() {
            own_email
        } else {
            &self.email
        };
        format!("{}/{}", email, self.segments.join("/"))
    }
}

/// Validates a single name segment: `[-._0-9A-Za-z]+`.
///
/// Empty strings, `/`, whitespace, and `@` are all rejected.
pub fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| matches!(b, b'-' | b'.' | b'_' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'))
}

/// Validates an email as `local@domain` with both parts non-empty.
pub fn validate_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@')
        }
        None => false,
    }
}

/// Validates a path of the form `(email?)/seg(/seg)*`.
///
/// Returns `None` when the email prefix is malformed, when there is no
/// segment, or when any segment fails `validate_name`.
pub fn validate_path(path: &str) -> Option<PathSpec> {
    let (email, rest) = match path.split_once('/') {
        Some((head, rest)) if head.is_empty() => (String::new(), rest),
        Some((head, rest)) if validate_email(head) => (head.to_string(), rest),
        _ => return None,
    };

    if rest.is_empty() {
        return None;
    }

    let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
    if segments.iter().all(|s| validate_name(s)) {
        Some(PathSpec { email, segments })
    } else {
        None
    }
}

/// Validates a fully-qualified connection name: the email prefix is
/// mandatory on top of the `validate_path` rules.
pub fn validate_connection_name(name: &str) -> Option<PathSpec> {
    let spec = validate_path(name)?;
    if spec.email.is_empty() {
        None
    } else {
        Some(spec)
    }
}

/// Validates an address/port pair.
///
/// Rules:
/// - a port beginning with `/` denotes a local (filesystem) endpoint and is
///   mutually exclusive with a non-empty address
/// - `*`/`*` is the wildcard pair (both or neither side must be `*`)
/// - both empty means "no static endpoint"
/// - otherwise both must be present: a hostname-shaped address and a
///   non-zero decimal port
///
/// Whether the wildcard pair is acceptable is role-dependent (a server may
/// not request it) and enforced by the handlers, not here.
pub fn validate_endpoint(address: &str, port: &str) -> bool {
    if port.starts_with('/') {
        return address.is_empty();
    }
    if address == "*" || port == "*" {
        return address == "*" && port == "*";
    }
    if address.is_empty() && port.is_empty() {
        return true;
    }
    if address.is_empty() || port.is_empty() {
        return false;
    }
    let address_ok = address
        .bytes()
        .all(|b| matches!(b, b'-' | b'.' | b'_' | b':' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'));
    let port_ok = port.parse::<u16>().map(|p| p > 0).unwrap_or(false);
    address_ok && port_ok
}
