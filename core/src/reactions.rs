// Reaction engine — validated toggles over the edge store, plus derived
// per-message summaries.

use crate::message::now_ms;
use crate::store::{ReactionEdgeStore, StoreError, ToggleOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Longest accepted reaction string, in characters
const MAX_EMOJI_CHARS: usize = 10;

/// Classic text emoticons accepted alongside emoji code points
const TEXT_EMOTICONS: &[&str] = &[":)", ":(", ":D", ";)", ":P", ":O", ":/", "<3", "xD", ":'("];

#[derive(Debug, Error)]
pub enum ReactionError {
    #[error("Invalid emoji: {0}")]
    InvalidEmoji(String),
    #[error("Invalid reactor identity: {0}")]
    InvalidReactor(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Derived aggregate for one emoji on one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub message_id: String,
    pub emoji: String,
    pub count: usize,
    pub reactors: Vec<String>,
    pub first_at: u64,
    pub last_at: u64,
    pub current_user_reacted: bool,
}

/// An entry of a reactor's recently used emoji
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentReaction {
    pub emoji: String,
    pub count: u64,
    pub last_used: u64,
}

fn is_emoji_char(c: char) -> bool {
    matches!(u32::from(c),
        0x1F000..=0x1FAFF   // emoji planes: symbols, pictographs, supplemental
        | 0x2600..=0x27BF   // misc symbols + dingbats
        | 0x2190..=0x21FF   // arrows
        | 0x2B00..=0x2BFF   // misc symbols and arrows
        | 0x1F1E6..=0x1F1FF // regional indicators
        | 0xFE0F            // variation selector
        | 0x200D            // zero-width joiner
        | 0x20E3            // combining enclosing keycap
    )
}

/// Non-empty, bounded, and either emoji code points or a known emoticon
pub fn validate_emoji(emoji: &str) -> Result<(), ReactionError> {
    if emoji.is_empty() {
        return Err(ReactionError::InvalidEmoji("empty".to_string()));
    }
    if emoji.chars().count() > MAX_EMOJI_CHARS {
        return Err(ReactionError::InvalidEmoji(format!(
            "too long: {} chars",
            emoji.chars().count()
        )));
    }
    if TEXT_EMOTICONS.contains(&emoji) {
        return Ok(());
    }
    if emoji.chars().all(is_emoji_char) {
        return Ok(());
    }
    Err(ReactionError::InvalidEmoji(emoji.to_string()))
}

/// Base58 wallet address, 32-44 chars decoding to 32 bytes
pub fn validate_reactor(reactor: &str) -> Result<(), ReactionError> {
    if reactor.len() < 32 || reactor.len() > 44 {
        return Err(ReactionError::InvalidReactor(format!(
            "bad length: {}",
            reactor.len()
        )));
    }
    let decoded = bs58::decode(reactor)
        .into_vec()
        .map_err(|e| ReactionError::InvalidReactor(e.to_string()))?;
    if decoded.len() != 32 {
        return Err(ReactionError::InvalidReactor(format!(
            "decodes to {} bytes",
            decoded.len()
        )));
    }
    Ok(())
}

pub struct ReactionEngine {
    edges: Arc<ReactionEdgeStore>,
}

impl ReactionEngine {
    pub fn new(edges: Arc<ReactionEdgeStore>) -> Self {
        Self { edges }
    }

    /// Validated toggle: insert the edge if absent, remove it if present
    pub fn toggle(
        &self,
        message_id: &str,
        reactor: &str,
        emoji: &str,
    ) -> Result<ToggleOutcome, ReactionError> {
        validate_emoji(emoji)?;
        validate_reactor(reactor)?;
        Ok(self.edges.toggle(message_id, reactor, emoji, now_ms())?)
    }

    /// Apply a reaction observed on the wire. Identity validation still
    /// applies; idempotent against replays.
    pub fn apply_remote(
        &self,
        message_id: &str,
        reactor: &str,
        emoji: &str,
        add: bool,
        at: u64,
    ) -> Result<bool, ReactionError> {
        validate_emoji(emoji)?;
        validate_reactor(reactor)?;
        Ok(self.edges.apply(message_id, reactor, emoji, add, at)?)
    }

    /// Group a message's edges by emoji. Sorted by first reaction time so
    /// the UI ordering is stable across devices.
    pub fn summaries(
        &self,
        message_id: &str,
        viewer: Option<&str>,
    ) -> Result<Vec<ReactionSummary>, ReactionError> {
        let mut grouped: BTreeMap<String, Vec<crate::store::ReactionEdge>> = BTreeMap::new();
        for edge in self.edges.edges_for(message_id)? {
            grouped.entry(edge.emoji.clone()).or_default().push(edge);
        }

        let mut summaries: Vec<ReactionSummary> = grouped
            .into_iter()
            .map(|(emoji, edges)| {
                let first_at = edges.iter().map(|e| e.created_at).min().unwrap_or(0);
                let last_at = edges.iter().map(|e| e.created_at).max().unwrap_or(0);
                let mut reactors: Vec<String> =
                    edges.iter().map(|e| e.reactor.clone()).collect();
                reactors.sort();
                ReactionSummary {
                    message_id: message_id.to_string(),
                    current_user_reacted: viewer
                        .map(|v| reactors.iter().any(|r| r == v))
                        .unwrap_or(false),
                    count: reactors.len(),
                    emoji,
                    reactors,
                    first_at,
                    last_at,
                }
            })
            .collect();

        summaries.sort_by(|a, b| a.first_at.cmp(&b.first_at).then(a.emoji.cmp(&b.emoji)));
        Ok(summaries)
    }

    /// A reactor's most recently used emoji, ranked by recency
    pub fn recent_for(
        &self,
        reactor: &str,
        limit: usize,
    ) -> Result<Vec<RecentReaction>, ReactionError> {
        let mut by_emoji: BTreeMap<String, RecentReaction> = BTreeMap::new();
        for edge in self.edges.edges_by_reactor(reactor)? {
            let entry = by_emoji
                .entry(edge.emoji.clone())
                .or_insert_with(|| RecentReaction {
                    emoji: edge.emoji.clone(),
                    count: 0,
                    last_used: 0,
                });
            entry.count += 1;
            entry.last_used = entry.last_used.max(edge.created_at);
        }

        let mut recent: Vec<RecentReaction> = by_emoji.into_values().collect();
        recent.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        recent.truncate(limit);
        Ok(recent)
    }
}
