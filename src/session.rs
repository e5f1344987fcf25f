//! Client-side causal sessions.
//!
//! A [`CausalSession`] remembers the highest [`CausalToken`] it has observed
//! and threads it through every operation. Reads issued through a session
//! therefore see the session's own earlier writes even when each call lands
//! on a different node: a replica that has not caught up to the token holds
//! the read until it has, instead of answering with an older value.
//!
//! Sessions are plain client-side state. Two sessions over the same handles
//! are causally independent of each other.

use crate::error::StoreError;
use crate::runtime::NodeHandle;
use crate::types::{CausalToken, ReadConcern, ReadOutcome, ReadPreference, WriteAck, WriteConcern};

/// Tracks causal position across writes and reads.
#[derive(Debug, Default)]
pub struct CausalSession {
    token: Option<CausalToken>,
}

impl CausalSession {
    /// A fresh session with no causal history.
    pub fn new() -> Self {
        Self { token: None }
    }

    /// The highest token observed so far, `None` before the first operation.
    pub fn token(&self) -> Option<CausalToken> {
        self.token
    }

    /// Writes through `node` and advances the session past the new entry.
    pub async fn write(
        &mut self,
        node: &NodeHandle,
        key: String,
        value: String,
        concern: WriteConcern,
    ) -> Result<WriteAck, StoreError> {
        let ack = node.write(key, value, concern, self.token).await?;
        self.advance(ack.token);
        Ok(ack)
    }

    /// Reads through `node`, waiting until the target replica has caught up
    /// to this session's token.
    pub async fn read(
        &mut self,
        node: &NodeHandle,
        key: String,
        concern: ReadConcern,
        preference: ReadPreference,
    ) -> Result<ReadOutcome, StoreError> {
        let outcome = node.read(key, concern, preference, self.token).await?;
        self.advance(outcome.token);
        Ok(outcome)
    }

    fn advance(&mut self, observed: CausalToken) {
        if observed > self.token.unwrap_or(0) {
            self.token = Some(observed);
        }
    }
}
