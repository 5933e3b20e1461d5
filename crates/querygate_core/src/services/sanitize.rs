//! Error message redaction.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::InstanceConnectionInfo;

/// Replacement for redacted secrets.
pub const REDACTED: &str = "***";

/// `scheme://user:password@` credentials embedded in connection strings.
static URL_CREDENTIALS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b([a-z][a-z0-9+.\-]*://[^\s:/@]*):[^\s@/]*@")
        .expect("credential regex is valid")
});

/// `password=...` style key/value pairs in libpq connection strings.
static PASSWORD_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(password|pwd)\s*=\s*('[^']*'|"[^"]*"|\S+)"#)
        .expect("password regex is valid")
});

/// Strips credentials from messages before they leave the engine.
#[derive(Debug, Clone)]
pub struct Redactor {
    secrets: Vec<String>,
    max_len: usize,
}

impl Redactor {
    /// Redactor for the given secrets. Longer secrets are replaced first so a
    /// secret that contains another is not partially revealed.
    pub fn new<I, S>(secrets: I, max_len: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> =
            secrets.into_iter().map(Into::into).filter(|s| !s.is_empty()).collect();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();
        Self { secrets, max_len }
    }

    /// Redactor for an instance's password and connection string.
    pub fn for_instance(info: Option<&InstanceConnectionInfo>, max_len: usize) -> Self {
        let secrets = info.map(InstanceConnectionInfo::secrets).unwrap_or_default();
        Self::new(secrets, max_len)
    }

    /// Redact secrets and bound the message length.
    pub fn sanitize(&self, message: &str) -> String {
        let mut text = message.to_string();
        for secret in &self.secrets {
            if text.contains(secret.as_str()) {
                text = text.replace(secret.as_str(), REDACTED);
            }
        }
        let text = URL_CREDENTIALS.replace_all(&text, format!("$1:{REDACTED}@").as_str());
        let text = PASSWORD_PAIR.replace_all(&text, format!("$1={REDACTED}").as_str());
        bound_length(text.into_owned(), self.max_len)
    }
}

fn bound_length(mut text: String, max_len: usize) -> String {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str("...");
    text
}
