//! Agent identities: one sealing key plus one signing key.

use crate::error::{CryptoResult, bad_encoding};
use crate::key::random_hex;
use crate::sealing::SealerSecret;
use crate::signing::SignerSecret;
use cojson_types::{AccountOrAgentId, AgentId, SessionId};
use std::fmt;

const SESSION_SUFFIX_BYTES: usize = 8;

/// Secret half of an agent, textually `sealerSecret_z<hex>/signerSecret_z<hex>`.
#[derive(Clone)]
pub struct AgentSecret {
    pub sealer: SealerSecret,
    pub signer: SignerSecret,
}

impl AgentSecret {
    /// Generates a fresh agent.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            sealer: SealerSecret::generate(),
            signer: SignerSecret::generate(),
        }
    }

    pub fn parse(s: &str) -> CryptoResult<Self> {
        let (sealer, signer) = s
            .split_once('/')
            .ok_or_else(|| bad_encoding("agent secret", "missing '/' separator"))?;
        Ok(Self {
            sealer: SealerSecret::parse(sealer)?,
            signer: SignerSecret::parse(signer)?,
        })
    }

    pub fn agent_id(&self) -> AgentId {
        AgentId::from_parts(
            &self.sealer.sealer_id().to_string(),
            &self.signer.signer_id().to_string(),
        )
    }

    /// Text form. Not `Display`, so that secrets are never formatted by accident.
    pub fn to_secret_string(&self) -> String {
        format!("{}/{}", self.sealer, self.signer)
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSecret")
            .field("agent_id", &self.agent_id())
            .finish_non_exhaustive()
    }
}

/// Shorthand for [`AgentSecret::generate`].
pub fn new_random_agent_secret() -> AgentSecret {
    AgentSecret::generate()
}

pub fn new_random_session_id(author: &AccountOrAgentId) -> SessionId {
    SessionId::new(author, &random_hex(SESSION_SUFFIX_BYTES))
}

pub fn new_delete_session_id(author: &AccountOrAgentId) -> SessionId {
    SessionId::new_delete(author, &random_hex(SESSION_SUFFIX_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_matches_key_ids() {
        let secret = AgentSecret::generate();
        let id = secret.agent_id();
        assert_eq!(id.sealer_id(), secret.sealer.sealer_id().to_string());
        assert_eq!(id.signer_id(), secret.signer.signer_id().to_string());
        assert!(AgentId::parse(id.as_str()).is_ok());
    }

    #[test]
    fn secret_text_roundtrip() {
        let secret = AgentSecret::generate();
        let parsed = AgentSecret::parse(&secret.to_secret_string()).unwrap();
        assert_eq!(parsed.agent_id(), secret.agent_id());
    }

    #[test]
    fn session_ids_belong_to_author() {
        let author = AccountOrAgentId::Agent(AgentSecret::generate().agent_id());
        let regular = new_random_session_id(&author);
        let delete = new_delete_session_id(&author);
        assert_eq!(regular.author().unwrap(), author);
        assert_eq!(delete.author().unwrap(), author);
        assert!(!regular.is_delete());
        assert!(delete.is_delete());
        assert_ne!(regular, new_random_session_id(&author));
    }
}
