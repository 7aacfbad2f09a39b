use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex as StdMutex, MutexGuard},
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use chat::{ChannelMirror, ChatError, Command};
use drive::{SheetListing, SheetMirror, StorageError};
use registry::Registry;
use shared::{
    domain::{ChannelRef, PartyConfig, Puzzle, PuzzleStatus},
    error::RegistryError,
    slug::Slug,
};

/// How many times a provisioning side is attempted before the puzzle is
/// declared broken.
const PROVISION_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
/// Upper bound on archived-slug disambiguation before giving up.
const MAX_DISAMBIGUATION: u32 = 50;
/// The running-gag channel whose name tracks the team's shrinking party.
const PARTY_CHANNEL_PREFIX: &str = "party-of";

/// Result of a user command that did not succeed. `Registry` and `NotReady`
/// are state errors surfaced verbatim; `ChatSide`/`StorageSide` carry the
/// offending side so a human knows where to intervene. Transient failures
/// never reach this type: they are retried internally and only show up here
/// once the retry budget is spent.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("puzzle '{slug}' is still being provisioned")]
    NotReady { slug: Slug },

    #[error("chat side failed for puzzle '{slug}': {reason}")]
    ChatSide { slug: Slug, reason: String },

    #[error("storage side failed for puzzle '{slug}': {reason}")]
    StorageSide { slug: Slug, reason: String },
}

trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for ChatError {
    fn is_transient(&self) -> bool {
        ChatError::is_transient(self)
    }
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

/// The orchestration state machine. Receives parsed commands, consults and
/// updates the registry, and issues paired operations to the chat and
/// storage adapters, absorbing partial failure of either side.
///
/// Commands for the same slug are serialized through a per-slug lock (fair,
/// so submission order is preserved); commands for distinct slugs run in
/// parallel. No lock spans unrelated puzzles' external calls.
pub struct Coordinator {
    registry: Registry,
    channels: ChannelMirror,
    sheets: SheetMirror,
    party: PartyConfig,
    locks: StdMutex<HashMap<Slug, Arc<Mutex<()>>>>,
}

/// Holds one slug's command lock. Dropping it releases the lock and prunes
/// the map entry when no other command is queued on the same slug, so the
/// map does not accumulate entries for every slug a user ever typed.
struct SlugGuard<'a> {
    locks: &'a StdMutex<HashMap<Slug, Arc<Mutex<()>>>>,
    slug: Slug,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SlugGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock_map(self.locks);
        // Two strong counts are the map entry plus this guard's clone; a
        // queued command would hold a third.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.slug);
        }
    }
}

fn lock_map<'a>(
    locks: &'a StdMutex<HashMap<Slug, Arc<Mutex<()>>>>,
) -> MutexGuard<'a, HashMap<Slug, Arc<Mutex<()>>>> {
    locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Coordinator {
    pub fn new(
        registry: Registry,
        channels: ChannelMirror,
        sheets: SheetMirror,
        party: PartyConfig,
    ) -> Self {
        Self {
            registry,
            channels,
            sheets,
            party,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    async fn slug_lock(&self, slug: &Slug) -> SlugGuard<'_> {
        let lock = {
            let mut locks = lock_map(&self.locks);
            Arc::clone(
                locks
                    .entry(slug.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        SlugGuard {
            locks: &self.locks,
            slug: slug.clone(),
            lock,
            guard: Some(guard),
        }
    }

    /// Runs a parsed command and posts the reply (or the failure) back to
    /// the channel the command came from.
    pub async fn dispatch(&self, command: Command, origin: &ChannelRef) {
        let result = match command {
            Command::Register { name } => self.register(&name, origin).await,
            Command::Solved { slug } => self.mark_solved(&slug).await,
            Command::Archive { slug } => self.archive(&slug).await,
            Command::Status { slug } => self.status(slug.as_ref()).await,
            Command::Recount => self.recount().await,
        };
        match result {
            Ok(reply) => self.channels.post_message(origin, &reply).await,
            Err(err) => {
                warn!("command failed: {err}");
                self.channels
                    .post_message(origin, &format!("Command failed: {err}"))
                    .await;
            }
        }
    }

    /// Registers a new puzzle and provisions its channel and sheet
    /// concurrently. Neither side is rolled back on partial failure; the
    /// surviving resource stays linked so a later retry (or a human) can
    /// finish the job, and the puzzle is parked in BROKEN.
    pub async fn register(
        &self,
        name: &str,
        origin: &ChannelRef,
    ) -> Result<String, CommandError> {
        let base = Slug::new(name);
        let _guard = self.slug_lock(&base).await;

        let slug = self.allocate_slug(&base).await?;
        self.registry.register(&slug, name).await?;
        info!(slug = %slug, name, "provisioning puzzle");

        let channel_side = self.provision_side(origin, &slug, "chat", || {
            self.channels.create_puzzle_channel(&slug)
        });
        let sheet_side = self.provision_side(origin, &slug, "storage", || {
            self.sheets.create_puzzle_sheet(name)
        });
        let (channel_result, sheet_result) = tokio::join!(channel_side, sheet_side);

        // A fetched sheet can still belong to an archived predecessor whose
        // archival never managed to move it out of the root folder.
        let previous_owner = match &sheet_result {
            Ok(sheet) => self.registry.sheet_owner(&sheet.file_id).await?,
            Err(_) => None,
        };

        // Link whatever came up, even if the other side failed: retries are
        // create-or-fetch keyed by slug/title, so the refs stay stable.
        if let Ok(channel) = &channel_result {
            self.registry.set_channel_ref(&slug, channel).await?;
        }
        if let Ok(sheet) = &sheet_result {
            self.registry.set_sheet_ref(&slug, sheet).await?;
        }

        match (channel_result, sheet_result) {
            (Ok(channel), Ok(sheet)) => {
                self.registry
                    .transition(&slug, PuzzleStatus::Active)
                    .await?;
                self.channels
                    .post_message(
                        &channel,
                        &format!("Spreadsheet for '{name}': {}", sheet.url),
                    )
                    .await;
                if let Err(err) = self.channels.create_voice_channel(&slug).await {
                    warn!(slug = %slug, "voice channel not created: {err}");
                }
                info!(slug = %slug, channel = %channel, "puzzle active");
                let mut reply = format!("Registered puzzle '{name}' as '{slug}'.");
                if let Some(owner) = previous_owner {
                    warn!(slug = %slug, previous = %owner, "adopted a sheet still linked to another puzzle");
                    reply.push_str(&format!(
                        " Heads up: its spreadsheet previously belonged to '{owner}'."
                    ));
                }
                Ok(reply)
            }
            (channel_result, sheet_result) => {
                self.registry
                    .transition(&slug, PuzzleStatus::Broken)
                    .await?;
                let err = match (channel_result, sheet_result) {
                    (Err(chat_err), Err(storage_err)) => CommandError::ChatSide {
                        slug: slug.clone(),
                        reason: format!("{chat_err} (storage side also failed: {storage_err})"),
                    },
                    (Err(chat_err), Ok(_)) => CommandError::ChatSide {
                        slug: slug.clone(),
                        reason: chat_err.to_string(),
                    },
                    (Ok(_), Err(storage_err)) => CommandError::StorageSide {
                        slug: slug.clone(),
                        reason: storage_err.to_string(),
                    },
                    (Ok(_), Ok(_)) => unreachable!("handled above"),
                };
                error!(slug = %slug, "provisioning failed, puzzle marked broken: {err}");
                Err(err)
            }
        }
    }

    /// Marks an ACTIVE puzzle solved. The registry transition is
    /// authoritative; the sheet's status cell and the celebration message
    /// are best-effort mirrors.
    pub async fn mark_solved(&self, slug: &Slug) -> Result<String, CommandError> {
        let _guard = self.slug_lock(slug).await;

        let puzzle = self.registry.transition(slug, PuzzleStatus::Solved).await?;
        if let Some(sheet) = &puzzle.sheet_ref {
            self.sheets
                .write_status_cell(sheet, PuzzleStatus::Solved)
                .await;
        }
        if let Some(channel) = &puzzle.channel_ref {
            self.channels
                .post_message(
                    channel,
                    &format!("Puzzle '{}' is solved!", puzzle.display_name),
                )
                .await;
        }
        self.channels.remove_voice_channel(slug).await;
        let party = self.update_party_channel().await;
        Ok(format!(
            "Solved '{}'. We're now a party of {party}.",
            puzzle.display_name
        ))
    }

    /// Archives a puzzle: channel moved to the archive category and sheet
    /// to the archive folder, concurrently. Archival is soft; a failure on
    /// either side is reported but the registry still moves to ARCHIVED, so
    /// the team's history stays consistent and a human can fix the external
    /// leftovers.
    pub async fn archive(&self, slug: &Slug) -> Result<String, CommandError> {
        let _guard = self.slug_lock(slug).await;

        let puzzle = self.registry.find(slug).await?;
        match puzzle.status {
            PuzzleStatus::Archived => {
                return Ok(format!("'{slug}' is already archived."));
            }
            PuzzleStatus::New => {
                return Err(CommandError::NotReady { slug: slug.clone() });
            }
            PuzzleStatus::Active | PuzzleStatus::Solved | PuzzleStatus::Broken => {}
        }
        let was_unsolved = puzzle.status != PuzzleStatus::Solved;

        let chat_side = async {
            match &puzzle.channel_ref {
                Some(channel) => self.channels.archive_channel(channel).await.err(),
                None => None,
            }
        };
        let storage_side = async {
            match &puzzle.sheet_ref {
                Some(sheet) => self.sheets.move_to_archive(sheet).await.err(),
                None => None,
            }
        };
        let (chat_err, storage_err) = tokio::join!(chat_side, storage_side);
        self.channels.remove_voice_channel(slug).await;

        let archived = self
            .registry
            .transition(slug, PuzzleStatus::Archived)
            .await?;
        if let Some(sheet) = &archived.sheet_ref {
            self.sheets
                .write_status_cell(sheet, PuzzleStatus::Archived)
                .await;
        }

        let mut reply = format!("Archived '{}'.", archived.display_name);
        if was_unsolved {
            reply.push_str(" It was never marked solved.");
        }
        if let Some(err) = chat_err {
            warn!(slug = %slug, "chat side of archival failed: {err}");
            reply.push_str(&format!(" The chat side needs attention: {err}."));
        }
        if let Some(err) = storage_err {
            warn!(slug = %slug, "storage side of archival failed: {err}");
            reply.push_str(&format!(" The storage side needs attention: {err}."));
        }
        Ok(reply)
    }

    /// Read-only snapshot of one puzzle or all of them, one line each:
    /// `slug — status — sheet link`.
    pub async fn status(&self, slug: Option<&Slug>) -> Result<String, CommandError> {
        let puzzles = match slug {
            Some(slug) => vec![self.registry.find(slug).await?],
            None => self.registry.list().await?,
        };
        if puzzles.is_empty() {
            return Ok("No puzzles registered yet.".to_string());
        }
        Ok(puzzles
            .iter()
            .map(render_status_line)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Recomputes the running party-size gag: starting size minus solved
    /// puzzles, with the server's member count as a hint when the gateway
    /// will give us one.
    pub async fn recount(&self) -> Result<String, CommandError> {
        let party = self.update_party_channel().await;
        match self.channels.member_count().await {
            Ok(members) => Ok(format!(
                "We're now a party of {party} ({members} members on the server)."
            )),
            Err(err) => {
                warn!("member count unavailable: {err}");
                Ok(format!("We're now a party of {party}."))
            }
        }
    }

    /// Startup reconciliation: pairs channels under the live category with
    /// sheets in the root folder by derived slug and imports pairs the
    /// registry has never seen as ACTIVE puzzles. Unpaired resources are
    /// logged and left alone.
    pub async fn reconcile(&self) -> anyhow::Result<usize> {
        let channels = self.channels.list_puzzle_channels().await?;
        let sheets = self.sheets.list_puzzle_sheets().await?;

        let mut sheets_by_slug: HashMap<Slug, SheetListing> = sheets
            .into_iter()
            .map(|listing| (Slug::new(&listing.title), listing))
            .collect();

        let mut imported = 0;
        for summary in channels {
            let slug = Slug::new(&summary.name);
            match self.registry.find(&slug).await {
                Ok(_) => {
                    sheets_by_slug.remove(&slug);
                    continue;
                }
                Err(RegistryError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
            let Some(listing) = sheets_by_slug.remove(&slug) else {
                info!(slug = %slug, "channel has no matching sheet; not importing");
                continue;
            };
            self.registry
                .import_active(&slug, &listing.title, &summary.channel, &listing.sheet)
                .await?;
            info!(slug = %slug, "imported puzzle discovered in external systems");
            imported += 1;
        }

        for slug in sheets_by_slug.keys() {
            info!(slug = %slug, "sheet has no matching channel; not importing");
        }
        Ok(imported)
    }

    async fn current_party_size(&self) -> i64 {
        let solved = self.registry.count_solved().await.unwrap_or(0);
        i64::from(self.party.start_party_size) - solved
    }

    /// Renames the party channel (the one named `party-of-...`) to the
    /// current count. Best-effort; a missing channel or a failed rename
    /// only changes the name, never puzzle state.
    async fn update_party_channel(&self) -> i64 {
        let party = self.current_party_size().await;
        let name = if party < 0 {
            format!("{PARTY_CHANNEL_PREFIX}-minus-{}", -party)
        } else {
            format!("{PARTY_CHANNEL_PREFIX}-{party}")
        };
        match self.channels.find_channel(PARTY_CHANNEL_PREFIX).await {
            Ok(Some(summary)) => {
                if let Err(err) = self.channels.rename_channel(&summary.channel, &name).await {
                    warn!("failed to rename party channel: {err}");
                }
            }
            Ok(None) => info!("no party channel on the server; skipping rename"),
            Err(err) => warn!("party channel lookup failed: {err}"),
        }
        party
    }

    /// Picks the slug a new registration gets: the base slug when free, a
    /// disambiguated one when only archived records are in the way, and
    /// `DuplicateSlug` when a live puzzle already owns it.
    async fn allocate_slug(&self, base: &Slug) -> Result<Slug, CommandError> {
        let mut candidate = base.clone();
        for n in 2..=MAX_DISAMBIGUATION {
            match self.registry.find(&candidate).await {
                Err(RegistryError::NotFound(_)) => return Ok(candidate),
                Ok(existing) if existing.status == PuzzleStatus::Archived => {
                    candidate = base.with_disambiguator(n);
                }
                Ok(_) => return Err(RegistryError::DuplicateSlug(candidate).into()),
                Err(err) => return Err(err.into()),
            }
        }
        Err(RegistryError::DuplicateSlug(base.clone()).into())
    }

    /// Bounded-backoff retry for one provisioning side. Only transient
    /// errors are retried; a "still working" notice goes to the invoking
    /// channel the first time a side has to wait.
    async fn provision_side<T, E, F, Fut>(
        &self,
        origin: &ChannelRef,
        slug: &Slug,
        side: &str,
        operation: F,
    ) -> Result<T, E>
    where
        E: Transient + std::fmt::Display,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < PROVISION_ATTEMPTS => {
                    if attempt == 0 {
                        self.channels
                            .post_message(
                                origin,
                                &format!("Still working on the {side} side for '{slug}'..."),
                            )
                            .await;
                    }
                    warn!(
                        slug = %slug,
                        side,
                        attempt = attempt + 1,
                        "transient failure, retrying: {err}"
                    );
                    tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn render_status_line(puzzle: &Puzzle) -> String {
    match puzzle.sheet_url() {
        Some(url) => format!("{} — {} — {url}", puzzle.slug, puzzle.status),
        None => format!("{} — {} — no sheet", puzzle.slug, puzzle.status),
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
