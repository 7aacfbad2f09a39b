use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slug::Slug;

/// Opaque id of a chat channel. The bot never owns the channel, only its
/// lookup key; the chat gateway resolves it on demand.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef(pub String);

impl std::fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a puzzle spreadsheet: file id plus the folder it
/// currently lives in and a human-clickable link.
///
/// Identity is the `file_id` alone. The folder changes when the sheet is
/// archived; that is a move, not a new resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetRef {
    pub file_id: String,
    pub folder_id: String,
    pub url: String,
}

impl SheetRef {
    pub fn same_identity(&self, other: &SheetRef) -> bool {
        self.file_id == other.file_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PuzzleStatus {
    New,
    Active,
    Solved,
    Archived,
    Broken,
}

impl PuzzleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PuzzleStatus::New => "new",
            PuzzleStatus::Active => "active",
            PuzzleStatus::Solved => "solved",
            PuzzleStatus::Archived => "archived",
            PuzzleStatus::Broken => "broken",
        }
    }

    /// The legal status transition table. Only the coordinator drives
    /// transitions; the registry rejects everything not listed here.
    ///
    /// `New -> Broken` and `Active -> Broken` cover provisioning failure and
    /// externally deleted resources. `Broken -> Archived` is the manual
    /// cleanup path once a human has dealt with the external side.
    pub fn allows_transition_to(&self, next: PuzzleStatus) -> bool {
        matches!(
            (self, next),
            (PuzzleStatus::New, PuzzleStatus::Active)
                | (PuzzleStatus::New, PuzzleStatus::Broken)
                | (PuzzleStatus::Active, PuzzleStatus::Solved)
                | (PuzzleStatus::Active, PuzzleStatus::Archived)
                | (PuzzleStatus::Active, PuzzleStatus::Broken)
                | (PuzzleStatus::Solved, PuzzleStatus::Archived)
                | (PuzzleStatus::Broken, PuzzleStatus::Archived)
        )
    }

    pub fn all() -> [PuzzleStatus; 5] {
        [
            PuzzleStatus::New,
            PuzzleStatus::Active,
            PuzzleStatus::Solved,
            PuzzleStatus::Archived,
            PuzzleStatus::Broken,
        ]
    }
}

impl std::fmt::Display for PuzzleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PuzzleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(PuzzleStatus::New),
            "active" => Ok(PuzzleStatus::Active),
            "solved" => Ok(PuzzleStatus::Solved),
            "archived" => Ok(PuzzleStatus::Archived),
            "broken" => Ok(PuzzleStatus::Broken),
            other => Err(format!("unknown puzzle status '{other}'")),
        }
    }
}

/// Immutable snapshot of one puzzle record. The registry never hands out
/// mutable references; callers go back through the coordinator to change
/// anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Puzzle {
    pub slug: Slug,
    pub display_name: String,
    pub status: PuzzleStatus,
    pub channel_ref: Option<ChannelRef>,
    pub sheet_ref: Option<SheetRef>,
    pub created_at: DateTime<Utc>,
    pub last_status_change_at: DateTime<Utc>,
}

impl Puzzle {
    pub fn sheet_url(&self) -> Option<&str> {
        self.sheet_ref.as_ref().map(|sheet| sheet.url.as_str())
    }
}

/// Process-wide hunt configuration, built once at startup and passed
/// explicitly into the coordinator and adapters.
#[derive(Debug, Clone)]
pub struct PartyConfig {
    pub start_party_size: u32,
    pub root_folder: String,
    pub command_prefix: String,
    pub live_category: String,
    pub archive_category: String,
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
