use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// A deck (workspace) a terminal belongs to; its root is the shell's cwd.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeckConfig {
    pub id: String,
    pub root: PathBuf,
}

/// Resolves deck ids to working directories.
pub trait DeckLookup: Send + Sync {
    /// `None` when the deck does not exist (anymore).
    fn deck_root(&self, deck_id: &str) -> Option<PathBuf>;
}

/// Decks declared in configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDecks {
    roots: HashMap<String, PathBuf>,
}

impl StaticDecks {
    pub fn new(decks: &[DeckConfig]) -> Self {
        Self {
            roots: decks
                .iter()
                .map(|d| (d.id.clone(), d.root.clone()))
                .collect(),
        }
    }
}

impl DeckLookup for StaticDecks {
    fn deck_root(&self, deck_id: &str) -> Option<PathBuf> {
        self.roots.get(deck_id).cloned()
    }
}

/// Parse `ID=PATH` from the command line.
pub fn parse_deck_arg(raw: &str) -> Result<DeckConfig, String> {
    let (id, root) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ID=PATH, got {raw:?}"))?;
    if id.is_empty() || root.is_empty() {
        return Err(format!("expected ID=PATH, got {raw:?}"));
    }
    Ok(DeckConfig {
        id: id.to_string(),
        root: PathBuf::from(root),
    })
}
