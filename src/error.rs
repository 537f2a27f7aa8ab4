use std::fmt;

/// Bridge-wide error taxonomy. Callers dispatch on the variant, never on the
/// display text. No variant carries a raw client token, raw API key, or
/// plaintext credit secret.
#[derive(Debug, Clone)]
pub enum BridgeError {
    /// Missing, malformed, expired, or revoked client token.
    Auth(String),
    /// Malformed JSON-RPC, unknown method/tool, missing or unknown session.
    BadRequest(String),
    /// Upstream rejected the API key (401/403). Handled silently by key
    /// rotation; surfaced only when every key is exhausted.
    InvalidKey,
    /// Upstream reports the key is out of credits.
    QuotaExceeded,
    /// Provider returned 429; `retry_after_ms` is parsed from `Retry-After`
    /// when the header is present and well-formed.
    RateLimited { retry_after_ms: Option<u64> },
    /// The rate-gate wait budget was exceeded before a slot opened.
    RateGateTimeout { max_wait_ms: u64 },
    /// Transport failure or upstream 5xx; retried locally.
    Transient(String),
    /// Non-2xx upstream response outside the classified cases.
    Upstream { status: u16, message: String },
    /// All keys / providers exhausted.
    UpstreamUnavailable,
    /// Unexpected internal failure.
    Internal(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            BridgeError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            BridgeError::InvalidKey => write!(f, "upstream rejected api key"),
            BridgeError::QuotaExceeded => write!(f, "upstream quota exhausted"),
            BridgeError::RateLimited { retry_after_ms } => match retry_after_ms {
                Some(ms) => write!(f, "rate limited by provider, retry after {}ms", ms),
                None => write!(f, "rate limited by provider"),
            },
            BridgeError::RateGateTimeout { max_wait_ms } => {
                write!(f, "rate gate wait budget exceeded ({}ms)", max_wait_ms)
            }
            BridgeError::Transient(msg) => write!(f, "transient upstream error: {}", msg),
            BridgeError::Upstream { status, message } => {
                write!(f, "upstream error, status={}: {}", status, message)
            }
            BridgeError::UpstreamUnavailable => write!(f, "no upstream available"),
            BridgeError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

impl BridgeError {
    /// HTTP status for surfacing this error to an MCP client.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::Auth(_) => 401,
            BridgeError::BadRequest(_) => 400,
            BridgeError::QuotaExceeded | BridgeError::RateLimited { .. } => 429,
            BridgeError::UpstreamUnavailable => 503,
            BridgeError::RateGateTimeout { .. } => 503,
            BridgeError::InvalidKey
            | BridgeError::Transient(_)
            | BridgeError::Upstream { .. }
            | BridgeError::Internal(_) => 500,
        }
    }

    /// JSON-RPC error code: -32600 auth/session, -32601 unknown
    /// method/tool, -32000 custom bad request, -32603 internal.
    pub fn rpc_code(&self) -> i64 {
        match self {
            BridgeError::Auth(_) => -32600,
            BridgeError::BadRequest(_) => -32000,
            _ => -32603,
        }
    }

    /// True for failures worth retrying on the same key.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Transient(_))
            || matches!(self, BridgeError::Upstream { status, .. } if *status >= 500)
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        // Status-code classification happens at the call sites that see the
        // response; what reaches here is connect/timeout/body failures.
        BridgeError::Transient(e.to_string())
    }
}
