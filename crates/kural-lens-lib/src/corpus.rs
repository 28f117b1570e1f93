use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::MIN_COMMENTARY_CHARS;
use crate::error::KuralError;

/// The three books ("Pal") of the Tirukkural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pal {
    Virtue,
    Wealth,
    Love,
}

impl Pal {
    pub const ALL: [Self; 3] = [Self::Virtue, Self::Wealth, Self::Love];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Virtue => "Virtue",
            Self::Wealth => "Wealth",
            Self::Love => "Love",
        }
    }

    /// Presentation metadata for result cards.
    #[must_use]
    pub const fn meta(self) -> PalMeta {
        match self {
            Self::Virtue => PalMeta {
                emoji: "🌿",
                color: "#065F46",
                bg: "#ECFDF5",
                tamil: "அறத்துப்பால்",
            },
            Self::Wealth => PalMeta {
                emoji: "💰",
                color: "#78350F",
                bg: "#FFFBEB",
                tamil: "பொருட்பால்",
            },
            Self::Love => PalMeta {
                emoji: "❤️",
                color: "#7F1D1D",
                bg: "#FFF1F2",
                tamil: "காமத்துப்பால்",
            },
        }
    }
}

impl fmt::Display for Pal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pal {
    type Err = KuralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|pal| pal.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| KuralError::UnknownPal(s.to_string()))
    }
}

/// Parse a user-facing Pal filter.
///
/// `All` (any case) means no filter. Decorated labels such as `"Virtue 🌿"`
/// are accepted; only the first word is looked at.
pub fn parse_pal_filter(value: &str) -> Result<Option<Pal>, KuralError> {
    let word = value.split_whitespace().next().unwrap_or_default();
    if word.is_empty() || word.eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    word.parse().map(Some)
}

/// Display attributes derived purely from a [`Pal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PalMeta {
    pub emoji: &'static str,
    pub color: &'static str,
    pub bg: &'static str,
    pub tamil: &'static str,
}

/// One couplet of the corpus, as stored in the metadata file.
///
/// Entry `i` of the metadata file describes vector `i` of the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kural {
    pub number: u32,
    #[serde(default)]
    pub kural_tamil: String,
    #[serde(default)]
    pub explanation: String,
    /// Solomon Pappaiah's commentary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary_sp: Option<String>,
    /// Mu. Varadarajan's commentary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary_mv: Option<String>,
    /// M. Karunanidhi's commentary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary_mk: Option<String>,
    pub pal: Pal,
    #[serde(default)]
    pub chapter: String,
    #[serde(default)]
    pub section: String,
}

impl Kural {
    /// The commentary to show, in precedence order sp → mv → mk.
    ///
    /// Blank commentaries are skipped.
    pub fn preferred_commentary(&self) -> Option<&str> {
        [&self.commentary_sp, &self.commentary_mv, &self.commentary_mk]
            .into_iter()
            .filter_map(Option::as_deref)
            .map(str::trim)
            .find(|text| !text.is_empty())
    }

    /// [`Self::preferred_commentary`], but only when it is long enough to display.
    pub fn display_commentary(&self) -> Option<&str> {
        self.preferred_commentary()
            .filter(|text| text.chars().count() > MIN_COMMENTARY_CHARS)
    }
}

/// Load the ordered corpus metadata collection from a JSON array.
///
/// Entries are decoded one at a time so a malformed record is reported by
/// its position and Kural number.
pub fn load_metadata(path: &Path) -> anyhow::Result<Vec<Kural>> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read Kural metadata at {}", path.display()))?;
    let entries: Vec<serde_json::Value> = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse Kural metadata at {}", path.display()))?;

    entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let number = entry.get("number").and_then(serde_json::Value::as_u64);
            serde_json::from_value::<Kural>(entry).with_context(|| match number {
                Some(n) => format!(
                    "Invalid Kural metadata entry {i} (Kural #{n}) in {}",
                    path.display()
                ),
                None => format!("Invalid Kural metadata entry {i} in {}", path.display()),
            })
        })
        .collect()
}
