use thiserror::Error;

use crate::domain::PuzzleStatus;
use crate::slug::Slug;

/// Which external system a puzzle link points at. Surfaced in errors so a
/// human knows which side to go fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    Channel,
    Sheet,
}

impl std::fmt::Display for LinkSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkSide::Channel => f.write_str("channel"),
            LinkSide::Sheet => f.write_str("sheet"),
        }
    }
}

/// Registry and state errors. None of these are retryable; they are surfaced
/// directly to the invoking user.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a puzzle with slug '{0}' already exists")]
    DuplicateSlug(Slug),

    #[error("no puzzle with slug '{0}'")]
    NotFound(Slug),

    #[error("puzzle '{slug}' is already linked to a different {side}")]
    AlreadyLinked { slug: Slug, side: LinkSide },

    #[error("puzzle '{slug}' cannot move from {from} to {to}")]
    IllegalTransition {
        slug: Slug,
        from: PuzzleStatus,
        to: PuzzleStatus,
    },

    #[error("registry backend error: {0}")]
    Backend(String),
}
