use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::connectome::edge_count;
use crate::error::SimError;

/// Brain atlas resolution an input connectome is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Parcellation {
    P86,
    P129,
    P234,
    P463,
}

impl Parcellation {
    pub const ALL: [Parcellation; 4] = [
        Parcellation::P86,
        Parcellation::P129,
        Parcellation::P234,
        Parcellation::P463,
    ];

    pub fn regions(self) -> usize {
        match self {
            Parcellation::P86 => 86,
            Parcellation::P129 => 129,
            Parcellation::P234 => 234,
            Parcellation::P463 => 463,
        }
    }

    /// Length of the upper-triangle connectivity vector (86 → 3403, 463 → 106953).
    pub fn edge_count(self) -> usize {
        edge_count(self.regions())
    }

    pub fn key(self) -> &'static str {
        match self {
            Parcellation::P86 => "parc_86",
            Parcellation::P129 => "parc_129",
            Parcellation::P234 => "parc_234",
            Parcellation::P463 => "parc_463",
        }
    }

    pub fn from_regions(n: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.regions() == n)
    }
}

impl FromStr for Parcellation {
    type Err = SimError;

    /// Accepts `"parc_86"` as well as the bare `"86"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed.strip_prefix("parc_").unwrap_or(trimmed);
        digits
            .parse::<usize>()
            .ok()
            .and_then(Self::from_regions)
            .ok_or_else(|| SimError::UnknownParcellation(s.to_string()))
    }
}

impl std::fmt::Display for Parcellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}
