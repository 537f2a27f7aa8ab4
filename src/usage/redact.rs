use regex::Regex;
use std::sync::OnceLock;

/// Maximum preview length in characters, ellipsis included.
pub const PREVIEW_MAX_CHARS: usize = 180;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap()
    })
}

fn long_hex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[0-9a-fA-F]{32,}\b").unwrap())
}

fn long_alnum_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z0-9]{32,}\b").unwrap())
}

fn tavily_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"tvly-[A-Za-z0-9_<>-]+").unwrap())
}

fn client_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"mcp_[A-Za-z0-9<>]+\.[A-Za-z0-9<>]+").unwrap())
}

fn sensitive_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(token|access_token|auth|apikey|api_key|key|password)=[^&\s]+")
            .unwrap()
    })
}

/// Strip secrets and identifying material from free text, in a fixed order:
/// emails, long hex, long alphanumeric tokens, Tavily keys, client tokens,
/// sensitive URL/query parameters.
pub fn redact(input: &str) -> String {
    let out = email_re().replace_all(input, "<email>");
    let out = long_hex_re().replace_all(&out, "<hex>");
    let out = long_alnum_re().replace_all(&out, "<token>");
    let out = tavily_key_re().replace_all(&out, "tvly-<redacted>");
    let out = client_token_re().replace_all(&out, "mcp_<redacted>");
    let out = sensitive_param_re().replace_all(&out, "$1=<redacted>");
    out.into_owned()
}

/// Redact and clamp to `PREVIEW_MAX_CHARS` characters, marking truncation
/// with a trailing ellipsis.
pub fn redacted_preview(input: &str) -> String {
    let redacted = redact(input);
    if redacted.chars().count() <= PREVIEW_MAX_CHARS {
        return redacted;
    }
    let head: String = redacted.chars().take(PREVIEW_MAX_CHARS - 1).collect();
    format!("{head}…")
}
