use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::MuxError;

/// Identifier of a multiplexer dataset, optionally bound to one read session.
///
/// The text form is URL-safe base64 of the JSON encoding, so it can be passed
/// around on command lines and in environment variables without quoting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MuxId {
    /// Dataset directory in the blob store.
    pub location: String,
    /// Read session, absent for a bare dataset id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl MuxId {
    pub fn dataset(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            session: None,
        }
    }

    /// The id of `session` over the same dataset.
    pub fn with_session(&self, session: impl Into<String>) -> Self {
        Self {
            location: self.location.clone(),
            session: Some(session.into()),
        }
    }

    /// The bare dataset id.
    pub fn without_session(&self) -> Self {
        Self::dataset(self.location.clone())
    }

    /// The session name, or `MuxError::MissingSession` for a bare dataset id.
    pub fn require_session(&self) -> Result<&str, MuxError> {
        self.session
            .as_deref()
            .ok_or_else(|| MuxError::MissingSession(self.to_string()))
    }

    pub fn encode(&self) -> String {
        // Serializing a struct of strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(encoded: &str) -> Result<Self, MuxError> {
        let json = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| MuxError::InvalidId(format!("{}: {}", encoded, e)))?;
        let id: MuxId = serde_json::from_slice(&json)
            .map_err(|e| MuxError::InvalidId(format!("{}: {}", encoded, e)))?;
        if id.location.is_empty() {
            return Err(MuxError::InvalidId(format!("{}: empty location", encoded)));
        }
        Ok(id)
    }
}

impl fmt::Display for MuxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for MuxId {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
