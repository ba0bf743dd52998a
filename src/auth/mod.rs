//! Caller identification.
//!
//! Identity issuance is an external concern; the pipeline only needs an
//! opaque identity string for a token presented at connect time. The
//! [`Authenticator`] seam keeps it that way: the bundled
//! [`StaticTokenAuth`] resolves tokens from configuration, and a
//! deployment with a real identity provider plugs in its own
//! implementation.

use std::collections::HashMap;

/// Resolves a connect-time token to a caller identity.
pub trait Authenticator: Send + Sync {
    /// `Some(identity)` when the token is valid, `None` otherwise.
    fn identify(&self, token: &str) -> Option<String>;
}

/// Token table from configuration.
///
/// With an empty table the authenticator runs in passthrough mode: any
/// non-empty token is accepted and used as the identity. Intended for
/// local development only; `run_gateway` logs a warning at startup.
pub struct StaticTokenAuth {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuth {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn is_passthrough(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokenAuth {
    fn identify(&self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        if self.tokens.is_empty() {
            return Some(token.to_string());
        }
        self.tokens.get(token).cloned()
    }
}
