//! Secret redaction for operational logs.
//!
//! At startup the resolved configuration is walked; string values whose key
//! names match any of `logging.redact_patterns` (shell-style globs, matched
//! case-insensitively) are collected. Every log line then passes through a
//! [`Redactor`] that replaces each collected value with `[REDACTED]` before
//! the line reaches stderr or the log file.
//!
//! Redaction is substring-based on *values*, not keys: if the API key ends
//! up embedded in a URL or an error message, it is still scrubbed.

use std::borrow::Cow;
use std::io;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// Replacement text for matched secret values.
pub const REDACTED: &str = "[REDACTED]";

/// Shell-style wildcard match (`*`, `?`), case-insensitive.
///
/// Iterative matcher with single-star backtracking; patterns here are tiny
/// (config key globs), so no compilation step is warranted.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().flat_map(|c| c.to_lowercase()).collect();
    let t: Vec<char> = text.chars().flat_map(|c| c.to_lowercase()).collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            // Retry the last star against one more character.
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Walk a JSON structure and collect string values whose key matches any of
/// the glob patterns. Values of length <= 1 are skipped — they would redact
/// single characters all over the output.
pub fn collect_secret_values(value: &serde_json::Value, patterns: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    walk(value, patterns, &mut out);
    out
}

fn walk(value: &serde_json::Value, patterns: &[String], out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                if let serde_json::Value::String(s) = val {
                    if s.len() > 1 && patterns.iter().any(|p| glob_match(p, key)) {
                        out.push(s.clone());
                    }
                }
                walk(val, patterns, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk(item, patterns, out);
            }
        }
        _ => {}
    }
}

/// Replaces known secret values in log lines. Cheap to clone and share —
/// the secret list is behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Arc<Vec<String>>,
}

impl Redactor {
    /// Build from collected secret values; drops empties and duplicates.
    pub fn new(values: Vec<String>) -> Self {
        let mut secrets: Vec<String> = values.into_iter().filter(|s| s.len() > 1).collect();
        secrets.sort();
        secrets.dedup();
        Self {
            secrets: Arc::new(secrets),
        }
    }

    /// A redactor that never rewrites anything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Number of registered secret values.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Replace every occurrence of every known secret in `line`.
    pub fn redact<'a>(&self, line: &'a str) -> Cow<'a, str> {
        if self.secrets.is_empty() || !self.secrets.iter().any(|s| line.contains(s.as_str())) {
            return Cow::Borrowed(line);
        }
        let mut owned = line.to_string();
        for secret in self.secrets.iter() {
            if owned.contains(secret.as_str()) {
                owned = owned.replace(secret.as_str(), REDACTED);
            }
        }
        Cow::Owned(owned)
    }
}

/// `io::Write` wrapper that scrubs secrets from everything written through it.
pub struct RedactingWriter<W> {
    inner: W,
    redactor: Redactor,
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Formatted log lines are valid UTF-8; anything else passes through
        // lossily rather than unredacted.
        let text = String::from_utf8_lossy(buf);
        let clean = self.redactor.redact(&text);
        self.inner.write_all(clean.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// [`MakeWriter`] adapter so any tracing layer can sit behind redaction.
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactor: Redactor,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M, redactor: Redactor) -> Self {
        Self { inner, redactor }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for RedactingMakeWriter<M> {
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            redactor: self.redactor.clone(),
        }
    }
}
