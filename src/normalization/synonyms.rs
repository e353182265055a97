use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::color::NormalizedColor;

pub const DEFAULT_TABLE_VERSION: &str = "builtin-2";

/// Abbreviation or foreign name → canonical color name, as authored.
const DEFAULT_ENTRIES: &[(&str, &str)] = &[
    // black
    ("BLO", "BLACK"),
    ("BLK", "BLACK"),
    ("BK", "BLACK"),
    ("NOIR", "BLACK"),
    ("NERO", "BLACK"),
    ("SCHWARZ", "BLACK"),
    ("NEGRO", "BLACK"),
    // white
    ("WHT", "WHITE"),
    ("WH", "WHITE"),
    ("BLANC", "WHITE"),
    ("BIANCO", "WHITE"),
    ("WEISS", "WHITE"),
    ("BLANCO", "WHITE"),
    ("OFW", "OFF WHITE"),
    // blues
    ("NVY", "NAVY"),
    ("NAV", "NAVY"),
    ("MARINE", "NAVY"),
    ("BLU", "BLUE"),
    ("BLEU", "BLUE"),
    ("BLAU", "BLUE"),
    ("AZUL", "BLUE"),
    ("LBL", "LIGHT BLUE"),
    // browns
    ("BRN", "BROWN"),
    ("BRW", "BROWN"),
    ("MARRONE", "BROWN"),
    ("MARRON", "BROWN"),
    ("DBR", "DARK BROWN"),
    ("LBR", "LIGHT BROWN"),
    ("CML", "CAMEL"),
    ("COG", "COGNAC"),
    // greys
    ("GRY", "GREY"),
    ("GRAY", "GREY"),
    ("GRIGIO", "GREY"),
    ("GRIS", "GREY"),
    ("GRAU", "GREY"),
    ("DGR", "DARK GREY"),
    ("LGR", "LIGHT GREY"),
    ("ANT", "ANTHRACITE"),
    // reds and pinks
    ("RD", "RED"),
    ("ROUGE", "RED"),
    ("ROSSO", "RED"),
    ("ROJO", "RED"),
    ("ROT", "RED"),
    ("BDX", "BORDEAUX"),
    ("BUR", "BURGUNDY"),
    ("PNK", "PINK"),
    ("ROSA", "PINK"),
    ("ROSE", "PINK"),
    // greens
    ("GRN", "GREEN"),
    ("VERT", "GREEN"),
    ("VERDE", "GREEN"),
    ("OLV", "OLIVE"),
    ("KHK", "KHAKI"),
    // neutrals
    ("BEI", "BEIGE"),
    ("BGE", "BEIGE"),
    ("CRM", "CREAM"),
    ("ECR", "ECRU"),
    ("TPE", "TAUPE"),
    ("SND", "SAND"),
    // metallics and others
    ("GLD", "GOLD"),
    ("ORO", "GOLD"),
    ("SLV", "SILVER"),
    ("ARG", "SILVER"),
    ("YLW", "YELLOW"),
    ("GIALLO", "YELLOW"),
    ("ORG", "ORANGE"),
    ("PRP", "PURPLE"),
    ("VIO", "VIOLET"),
    ("MLT", "MULTICOLOR"),
    ("MULTI", "MULTICOLOR"),
];

#[derive(Debug, Deserialize)]
struct TableFile {
    version: String,
    entries: BTreeMap<String, String>,
}

/// Static abbreviation ↔ canonical color mapping.
///
/// Keys and values are stored in their compact normalized form, so lookups
/// never depend on casing, spacing or punctuation of either side.
#[derive(Debug, Clone, Default)]
pub struct SynonymTable {
    version: String,
    forward: BTreeMap<String, String>,
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl SynonymTable {
    pub fn empty(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    /// Table seeded with the built-in entries.
    pub fn with_defaults() -> Self {
        DEFAULT_ENTRIES
            .iter()
            .fold(Self::empty(DEFAULT_TABLE_VERSION), |table, (abbr, full)| {
                table.register(abbr, full)
            })
    }

    /// Parse a versioned JSON artifact:
    /// `{ "version": "2024-06", "entries": { "BLO": "BLACK", "DBR": "DARK BROWN" } }`.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: TableFile = serde_json::from_str(raw).context("invalid synonym table JSON")?;
        Ok(file
            .entries
            .iter()
            .fold(Self::empty(file.version), |table, (abbr, full)| {
                table.register(abbr, full)
            }))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading synonym table {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    /// Register or override an entry. Entries whose key normalizes to nothing are ignored.
    pub fn register(mut self, abbreviation: &str, canonical: &str) -> Self {
        let key = NormalizedColor::new(abbreviation).compact();
        let value = NormalizedColor::new(canonical).compact();
        if key.is_empty() || value.is_empty() {
            return self;
        }
        if let Some(previous) = self.forward.insert(key.clone(), value.clone()) {
            if let Some(set) = self.reverse.get_mut(&previous) {
                set.remove(&key);
                if set.is_empty() {
                    self.reverse.remove(&previous);
                }
            }
        }
        self.reverse.entry(value).or_default().insert(key);
        self
    }

    /// Canonical (compact) name for a token, looked up by its normalized form.
    pub fn canonical_for(&self, token: &str) -> Option<&str> {
        self.forward.get(token).map(String::as_str)
    }

    /// Abbreviations registered for a canonical (compact) name, sorted.
    pub fn abbreviations_for(&self, canonical: &str) -> impl Iterator<Item = &str> {
        self.reverse
            .get(canonical)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
