//! Destination key resolution.
//!
//! Prefix templates accept `{yyyy}`, `{MM}`, `{dd}` and `{HH}`, filled from
//! the UTC clock each time a key is resolved. Files resolved on either side
//! of an hour boundary can land under different prefixes within one run.

use chrono::{DateTime, Utc};

/// Source of "now" for template expansion
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Substitute the date tokens in `template`.
pub fn expand_prefix(template: &str, now: DateTime<Utc>) -> String {
    if template.is_empty() {
        return String::new();
    }
    template
        .replace("{yyyy}", &now.format("%Y").to_string())
        .replace("{MM}", &now.format("%m").to_string())
        .replace("{dd}", &now.format("%d").to_string())
        .replace("{HH}", &now.format("%H").to_string())
}

/// Object key for `relative_path` under an optional prefix template.
pub fn resolve_key(prefix: Option<&str>, relative_path: &str, now: DateTime<Utc>) -> String {
    let prefix = expand_prefix(prefix.unwrap_or_default(), now);
    let key = if prefix.is_empty() {
        relative_path.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), relative_path)
    };
    key.replace('\\', "/")
}
