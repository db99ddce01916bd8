//! Authentication collaborator.
//!
//! Identity issuance lives elsewhere; the server only needs to turn the
//! credential presented on the upgrade request into a participant.

use std::collections::HashMap;

use crate::config::AuthConfig;
use crate::protocol::ParticipantInfo;

pub trait Authenticator: Send + Sync {
    /// `None` rejects the credential.
    fn authenticate(&self, credential: &str) -> Option<ParticipantInfo>;
}

/// Fixed token table, typically from the `[[auth.tokens]]` config section.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, ParticipantInfo>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        self.tokens
            .insert(token.into(), ParticipantInfo::new(participant_id, display_name));
        self
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        config.tokens.iter().fold(Self::new(), |acc, t| {
            acc.with_token(&t.token, &t.participant_id, &t.display_name)
        })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, credential: &str) -> Option<ParticipantInfo> {
        if credential.is_empty() {
            return None;
        }
        self.tokens.get(credential).cloned()
    }
}
