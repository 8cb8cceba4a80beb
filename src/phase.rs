//! Request processing phases

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One named stage of request processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    PostReadRequestHandler,
    TransHandler,
    HeaderParserHandler,
    AccessHandler,
    AuthenHandler,
    AuthzHandler,
    TypeHandler,
    FixupHandler,
    Handler,
    LogHandler,
}

impl Phase {
    /// Order in which the host runs the phases of a request
    pub const HOST_ORDER: [Phase; 10] = [
        Phase::PostReadRequestHandler,
        Phase::TransHandler,
        Phase::HeaderParserHandler,
        Phase::AccessHandler,
        Phase::AuthenHandler,
        Phase::AuthzHandler,
        Phase::TypeHandler,
        Phase::FixupHandler,
        Phase::Handler,
        Phase::LogHandler,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::PostReadRequestHandler => "PostReadRequestHandler",
            Phase::TransHandler => "TransHandler",
            Phase::HeaderParserHandler => "HeaderParserHandler",
            Phase::AccessHandler => "AccessHandler",
            Phase::AuthenHandler => "AuthenHandler",
            Phase::AuthzHandler => "AuthzHandler",
            Phase::TypeHandler => "TypeHandler",
            Phase::FixupHandler => "FixupHandler",
            Phase::Handler => "Handler",
            Phase::LogHandler => "LogHandler",
        }
    }

    /// Phases whose 401 answer may be downgraded for non-authoritative directories
    pub fn is_auth(&self) -> bool {
        matches!(self, Phase::AuthenHandler | Phase::AuthzHandler)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = BridgeError;

    /// Accepts the phase name with or without the `Python` directive prefix
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix("Python").unwrap_or(s);
        Phase::HOST_ORDER
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(bare))
            .ok_or_else(|| BridgeError::invalid_phase(s))
    }
}
