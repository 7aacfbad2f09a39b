use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};

use shared::{
    domain::{ChannelRef, Puzzle, PuzzleStatus, SheetRef},
    error::{LinkSide, RegistryError},
    slug::Slug,
};

/// Durable table of every puzzle the team has ever registered, keyed by
/// slug. Records are never deleted, only archived; the table doubles as the
/// team's hunt history.
///
/// The registry does not serialize callers itself. The coordinator holds a
/// per-slug lock around every mutation, so same-slug operations are
/// linearized above this layer; reads may bypass that lock and get a
/// consistent snapshot from SQLite.
#[derive(Clone)]
pub struct Registry {
    pool: Pool<Sqlite>,
}

fn backend(err: sqlx::Error) -> RegistryError {
    RegistryError::Backend(err.to_string())
}

impl Registry {
    pub async fn open(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let registry = Self { pool };
        registry.ensure_schema().await?;
        Ok(registry)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS puzzles (
                slug                  TEXT PRIMARY KEY,
                display_name          TEXT NOT NULL,
                status                TEXT NOT NULL,
                channel_id            TEXT,
                sheet_file_id         TEXT,
                sheet_folder_id       TEXT,
                sheet_url             TEXT,
                created_at            TEXT NOT NULL,
                last_status_change_at TEXT NOT NULL,
                solved_at             TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Inserts a NEW record. The slug must be globally unused; the
    /// coordinator resolves archived-slug collisions with a disambiguator
    /// before calling this, so any conflict here is a duplicate.
    pub async fn register(&self, slug: &Slug, display_name: &str) -> Result<Puzzle, RegistryError> {
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO puzzles
             (slug, display_name, status, created_at, last_status_change_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(slug.as_str())
        .bind(display_name)
        .bind(PuzzleStatus::New.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if inserted.rows_affected() == 0 {
            return Err(RegistryError::DuplicateSlug(slug.clone()));
        }
        self.find(slug).await
    }

    pub async fn find(&self, slug: &Slug) -> Result<Puzzle, RegistryError> {
        let row = sqlx::query("SELECT * FROM puzzles WHERE slug = ?")
            .bind(slug.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => row_to_puzzle(&row),
            None => Err(RegistryError::NotFound(slug.clone())),
        }
    }

    pub async fn list(&self) -> Result<Vec<Puzzle>, RegistryError> {
        let rows = sqlx::query("SELECT * FROM puzzles ORDER BY created_at, slug")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(row_to_puzzle).collect()
    }

    /// Links the puzzle to its chat channel. Set-once: linking the same
    /// channel again is a no-op, linking a different one fails.
    pub async fn set_channel_ref(
        &self,
        slug: &Slug,
        channel: &ChannelRef,
    ) -> Result<Puzzle, RegistryError> {
        let current = self.find(slug).await?;
        match &current.channel_ref {
            Some(existing) if existing == channel => return Ok(current),
            Some(_) => {
                return Err(RegistryError::AlreadyLinked {
                    slug: slug.clone(),
                    side: LinkSide::Channel,
                })
            }
            None => {}
        }
        sqlx::query("UPDATE puzzles SET channel_id = ? WHERE slug = ?")
            .bind(&channel.0)
            .bind(slug.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        self.find(slug).await
    }

    /// Links the puzzle to its spreadsheet. Identity is the file id; a
    /// re-link with the same file (possibly reporting a different folder)
    /// is idempotent.
    pub async fn set_sheet_ref(
        &self,
        slug: &Slug,
        sheet: &SheetRef,
    ) -> Result<Puzzle, RegistryError> {
        let current = self.find(slug).await?;
        match &current.sheet_ref {
            Some(existing) if existing.same_identity(sheet) => return Ok(current),
            Some(_) => {
                return Err(RegistryError::AlreadyLinked {
                    slug: slug.clone(),
                    side: LinkSide::Sheet,
                })
            }
            None => {}
        }
        sqlx::query(
            "UPDATE puzzles SET sheet_file_id = ?, sheet_folder_id = ?, sheet_url = ?
             WHERE slug = ?",
        )
        .bind(&sheet.file_id)
        .bind(&sheet.folder_id)
        .bind(&sheet.url)
        .bind(slug.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        self.find(slug).await
    }

    /// Moves the puzzle to a new status, enforcing the legal transition
    /// table and stamping `last_status_change_at`.
    pub async fn transition(
        &self,
        slug: &Slug,
        next: PuzzleStatus,
    ) -> Result<Puzzle, RegistryError> {
        let current = self.find(slug).await?;
        if !current.status.allows_transition_to(next) {
            return Err(RegistryError::IllegalTransition {
                slug: slug.clone(),
                from: current.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == PuzzleStatus::Solved {
            sqlx::query(
                "UPDATE puzzles SET status = ?, last_status_change_at = ?, solved_at = ?
                 WHERE slug = ?",
            )
            .bind(next.as_str())
            .bind(now)
            .bind(now)
            .bind(slug.as_str())
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        } else {
            sqlx::query("UPDATE puzzles SET status = ?, last_status_change_at = ? WHERE slug = ?")
                .bind(next.as_str())
                .bind(now)
                .bind(slug.as_str())
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        self.find(slug).await
    }

    /// Startup reconciliation entry point: records a puzzle discovered in
    /// the external systems as ACTIVE with both refs already linked.
    /// Idempotent when the slug is already present.
    pub async fn import_active(
        &self,
        slug: &Slug,
        display_name: &str,
        channel: &ChannelRef,
        sheet: &SheetRef,
    ) -> Result<Puzzle, RegistryError> {
        if let Ok(existing) = self.find(slug).await {
            return Ok(existing);
        }
        let now = Utc::now();
        sqlx::query(
            "INSERT OR IGNORE INTO puzzles
             (slug, display_name, status, channel_id, sheet_file_id, sheet_folder_id,
              sheet_url, created_at, last_status_change_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(slug.as_str())
        .bind(display_name)
        .bind(PuzzleStatus::Active.as_str())
        .bind(&channel.0)
        .bind(&sheet.file_id)
        .bind(&sheet.folder_id)
        .bind(&sheet.url)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        self.find(slug).await
    }

    /// Which puzzle, if any, a sheet file is already linked to.
    /// Registration uses this to flag a fetched sheet that still belongs to
    /// an archived predecessor.
    pub async fn sheet_owner(&self, file_id: &str) -> Result<Option<Slug>, RegistryError> {
        let slug: Option<String> =
            sqlx::query_scalar("SELECT slug FROM puzzles WHERE sheet_file_id = ? LIMIT 1")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(slug.map(|slug| Slug::new(&slug)))
    }

    /// How many puzzles have ever been marked solved. Archiving a solved
    /// puzzle does not reduce this count.
    pub async fn count_solved(&self) -> Result<i64, RegistryError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM puzzles WHERE solved_at IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)
    }
}

fn row_to_puzzle(row: &SqliteRow) -> Result<Puzzle, RegistryError> {
    let status_raw: String = row.try_get("status").map_err(backend)?;
    let status = status_raw
        .parse::<PuzzleStatus>()
        .map_err(RegistryError::Backend)?;

    let channel_ref = row
        .try_get::<Option<String>, _>("channel_id")
        .map_err(backend)?
        .map(ChannelRef);

    let sheet_file_id: Option<String> = row.try_get("sheet_file_id").map_err(backend)?;
    let sheet_ref = match sheet_file_id {
        Some(file_id) => Some(SheetRef {
            file_id,
            folder_id: row
                .try_get::<Option<String>, _>("sheet_folder_id")
                .map_err(backend)?
                .unwrap_or_default(),
            url: row
                .try_get::<Option<String>, _>("sheet_url")
                .map_err(backend)?
                .unwrap_or_default(),
        }),
        None => None,
    };

    Ok(Puzzle {
        slug: Slug::new(&row.try_get::<String, _>("slug").map_err(backend)?),
        display_name: row.try_get("display_name").map_err(backend)?,
        status,
        channel_ref,
        sheet_ref,
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(backend)?,
        last_status_change_at: row
            .try_get::<DateTime<Utc>, _>("last_status_change_at")
            .map_err(backend)?,
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
