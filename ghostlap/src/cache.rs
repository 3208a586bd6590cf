//! Single-entry memo of the normalize + segment stages.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{analyze_session, LapError, Params, Session};

/// Identity of one analysis: input content plus the parameters it ran with.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub input_sha256: String,
    pub params_sha256: String,
}

impl SessionKey {
    pub fn new(input: &[u8], params: &Params) -> Result<Self, LapError> {
        Ok(Self {
            input_sha256: sha256_hex(input),
            params_sha256: params.hash_sha256()?,
        })
    }
}

impl Params {
    /// SHA-256 of the JSON-serialized parameters.
    pub fn hash_sha256(&self) -> Result<String, LapError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| LapError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

/// Holds the most recent session. Repeated lookups with identical input and
/// parameters reuse it; anything else recomputes and replaces it.
#[derive(Debug, Default)]
pub struct SessionCache {
    entry: Option<(SessionKey, Session)>,
    hits: u64,
    misses: u64,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compute(&mut self, input: &[u8], params: &Params) -> Result<&Session, LapError> {
        let key = SessionKey::new(input, params)?;
        let session = match self.entry.take() {
            Some((cached, session)) if cached == key => {
                self.hits += 1;
                debug!(input = %key.input_sha256, "session cache hit");
                session
            }
            previous => {
                self.misses += 1;
                match analyze_session(input, params) {
                    Ok(session) => session,
                    Err(e) => {
                        // a failed run leaves the previous entry in place
                        self.entry = previous;
                        return Err(e);
                    }
                }
            }
        };
        Ok(&self.entry.insert((key, session)).1)
    }

    pub fn key(&self) -> Option<&SessionKey> {
        self.entry.as_ref().map(|(key, _)| key)
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
