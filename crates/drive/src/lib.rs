use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use shared::domain::{PuzzleStatus, SheetRef};

/// Cell that mirrors the puzzle's status inside its sheet. Solvers see it
/// at the top of the first tab.
const STATUS_CELL_RANGE: &str = "A1:B1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRef(pub String);

#[derive(Debug, Error)]
pub enum StorageError {
    /// Transient store trouble (network, rate limit, 5xx). Retried with
    /// backoff by the coordinator.
    #[error("spreadsheet store unavailable: {0}")]
    Unavailable(String),

    /// Out of storage quota. Terminal; a human has to free space.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("spreadsheet store rejected the request: {0}")]
    Rejected(String),
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Capability surface over the cloud spreadsheet store. The coordinator is
/// tested against fakes of this trait.
#[async_trait]
pub trait SpreadsheetStore: Send + Sync {
    async fn find_folder(
        &self,
        name: &str,
        parent: Option<&FolderRef>,
    ) -> Result<Option<FolderRef>, StorageError>;
    async fn create_folder(
        &self,
        name: &str,
        parent: Option<&FolderRef>,
    ) -> Result<FolderRef, StorageError>;
    async fn find_spreadsheet(
        &self,
        title: &str,
        folder: &FolderRef,
    ) -> Result<Option<SheetRef>, StorageError>;
    async fn create_spreadsheet(
        &self,
        title: &str,
        folder: &FolderRef,
        template: Option<&str>,
    ) -> Result<SheetRef, StorageError>;
    async fn move_spreadsheet(
        &self,
        sheet: &SheetRef,
        folder: &FolderRef,
    ) -> Result<SheetRef, StorageError>;
    async fn write_cell(
        &self,
        sheet: &SheetRef,
        range: &str,
        value: &str,
    ) -> Result<(), StorageError>;
    async fn list_spreadsheets(
        &self,
        folder: &FolderRef,
    ) -> Result<Vec<SheetListing>, StorageError>;
}

/// A spreadsheet listing paired with its title, for reconciliation.
#[derive(Debug, Clone)]
pub struct SheetListing {
    pub title: String,
    pub sheet: SheetRef,
}

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

#[derive(Debug, Deserialize)]
struct ApiFile {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default, rename = "alternateLink")]
    alternate_link: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    items: Vec<ApiFile>,
}

#[derive(Debug, Serialize)]
struct CreateFileRequest<'a> {
    title: &'a str,
    #[serde(rename = "mimeType")]
    mime_type: &'a str,
    parents: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct MoveFileRequest<'a> {
    parents: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct WriteCellRequest<'a> {
    range: &'a str,
    values: Vec<Vec<&'a str>>,
}

/// REST implementation of [`SpreadsheetStore`] against a Drive-shaped API.
pub struct HttpSpreadsheetStore {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpSpreadsheetStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<ApiFile>, StorageError> {
        let response = self
            .http
            .get(format!("{}/files", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let list: FileList = response.json().await.map_err(transport_error)?;
        Ok(list.items)
    }

    fn to_sheet_ref(file: ApiFile) -> SheetRef {
        SheetRef {
            folder_id: file.parents.into_iter().next().unwrap_or_default(),
            file_id: file.id,
            url: file.alternate_link,
        }
    }
}

fn transport_error(err: reqwest::Error) -> StorageError {
    StorageError::Unavailable(err.to_string())
}

/// 429/5xx are transient; a 403 mentioning quota is terminal capacity;
/// everything else is a plain rejection.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(StorageError::Unavailable(format!("{status}: {body}")));
    }
    if status.as_u16() == 403 && body.to_ascii_lowercase().contains("quota") {
        return Err(StorageError::QuotaExceeded);
    }
    Err(StorageError::Rejected(format!("{status}: {body}")))
}

fn escape_query_term(term: &str) -> String {
    term.replace('\'', "\\'")
}

#[async_trait]
impl SpreadsheetStore for HttpSpreadsheetStore {
    async fn find_folder(
        &self,
        name: &str,
        parent: Option<&FolderRef>,
    ) -> Result<Option<FolderRef>, StorageError> {
        let mut query = format!(
            "mimeType = '{FOLDER_MIME}' and title = '{}' and trashed = false",
            escape_query_term(name)
        );
        if let Some(parent) = parent {
            query.push_str(&format!(" and '{}' in parents", parent.0));
        }
        let found = self.search(&query).await?;
        Ok(found.into_iter().next().map(|f| FolderRef(f.id)))
    }

    async fn create_folder(
        &self,
        name: &str,
        parent: Option<&FolderRef>,
    ) -> Result<FolderRef, StorageError> {
        let response = self
            .http
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.token)
            .json(&CreateFileRequest {
                title: name,
                mime_type: FOLDER_MIME,
                parents: parent.iter().map(|p| p.0.as_str()).collect(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let created: ApiFile = response.json().await.map_err(transport_error)?;
        Ok(FolderRef(created.id))
    }

    async fn find_spreadsheet(
        &self,
        title: &str,
        folder: &FolderRef,
    ) -> Result<Option<SheetRef>, StorageError> {
        let query = format!(
            "mimeType = '{SPREADSHEET_MIME}' and title = '{}' and '{}' in parents and trashed = false",
            escape_query_term(title),
            folder.0
        );
        let found = self.search(&query).await?;
        Ok(found.into_iter().next().map(Self::to_sheet_ref))
    }

    async fn create_spreadsheet(
        &self,
        title: &str,
        folder: &FolderRef,
        template: Option<&str>,
    ) -> Result<SheetRef, StorageError> {
        let url = match template {
            Some(template_id) => format!("{}/files/{template_id}/copy", self.base_url),
            None => format!("{}/files", self.base_url),
        };
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&CreateFileRequest {
                title,
                mime_type: SPREADSHEET_MIME,
                parents: vec![folder.0.as_str()],
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let created: ApiFile = response.json().await.map_err(transport_error)?;
        Ok(Self::to_sheet_ref(created))
    }

    async fn move_spreadsheet(
        &self,
        sheet: &SheetRef,
        folder: &FolderRef,
    ) -> Result<SheetRef, StorageError> {
        let response = self
            .http
            .patch(format!("{}/files/{}", self.base_url, sheet.file_id))
            .bearer_auth(&self.token)
            .json(&MoveFileRequest {
                parents: vec![folder.0.as_str()],
            })
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(SheetRef {
            folder_id: folder.0.clone(),
            ..sheet.clone()
        })
    }

    async fn write_cell(
        &self,
        sheet: &SheetRef,
        range: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .http
            .put(format!(
                "{}/spreadsheets/{}/values/{range}",
                self.base_url, sheet.file_id
            ))
            .bearer_auth(&self.token)
            .json(&WriteCellRequest {
                range,
                values: vec![vec!["Status", value]],
            })
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn list_spreadsheets(
        &self,
        folder: &FolderRef,
    ) -> Result<Vec<SheetListing>, StorageError> {
        let query = format!(
            "mimeType = '{SPREADSHEET_MIME}' and '{}' in parents and trashed = false",
            folder.0
        );
        let found = self.search(&query).await?;
        Ok(found
            .into_iter()
            .map(|file| SheetListing {
                title: file.title.clone(),
                sheet: Self::to_sheet_ref(file),
            })
            .collect())
    }
}

/// Storage-side adapter: one sheet per puzzle inside the hunt's root
/// folder, moved to an archive sub-folder when the puzzle is retired.
pub struct SheetMirror {
    store: Arc<dyn SpreadsheetStore>,
    root_folder_name: String,
    archive_folder_name: String,
    template: Option<String>,
    root_cache: Mutex<Option<FolderRef>>,
}

impl SheetMirror {
    pub fn new(
        store: Arc<dyn SpreadsheetStore>,
        root_folder_name: impl Into<String>,
        archive_folder_name: impl Into<String>,
        template: Option<String>,
    ) -> Self {
        Self {
            store,
            root_folder_name: root_folder_name.into(),
            archive_folder_name: archive_folder_name.into(),
            template,
            root_cache: Mutex::new(None),
        }
    }

    /// The hunt's root folder is provisioned by the team ahead of time, not
    /// by the bot; a missing root is a configuration problem.
    async fn root_folder(&self) -> Result<FolderRef, StorageError> {
        {
            let cached = self.root_cache.lock().await;
            if let Some(root) = cached.as_ref() {
                return Ok(root.clone());
            }
        }
        let root = self
            .store
            .find_folder(&self.root_folder_name, None)
            .await?
            .ok_or_else(|| {
                StorageError::Rejected(format!(
                    "root folder '{}' not found in the spreadsheet store",
                    self.root_folder_name
                ))
            })?;
        *self.root_cache.lock().await = Some(root.clone());
        Ok(root)
    }

    async fn archive_folder(&self) -> Result<FolderRef, StorageError> {
        let root = self.root_folder().await?;
        if let Some(folder) = self
            .store
            .find_folder(&self.archive_folder_name, Some(&root))
            .await?
        {
            return Ok(folder);
        }
        self.store
            .create_folder(&self.archive_folder_name, Some(&root))
            .await
    }

    /// Create-or-fetch by title inside the root folder. A retry after a
    /// transient failure picks up the sheet a previous attempt created
    /// instead of duplicating it.
    pub async fn create_puzzle_sheet(&self, display_name: &str) -> Result<SheetRef, StorageError> {
        let root = self.root_folder().await?;
        if let Some(existing) = self.store.find_spreadsheet(display_name, &root).await? {
            info!(title = display_name, file = %existing.file_id, "reusing existing puzzle sheet");
            return Ok(existing);
        }
        self.store
            .create_spreadsheet(display_name, &root, self.template.as_deref())
            .await
    }

    /// Idempotent move into the archive sub-folder (created lazily).
    pub async fn move_to_archive(&self, sheet: &SheetRef) -> Result<SheetRef, StorageError> {
        let archive = self.archive_folder().await?;
        if sheet.folder_id == archive.0 {
            return Ok(sheet.clone());
        }
        self.store.move_spreadsheet(sheet, &archive).await
    }

    /// Best-effort mirror write of the puzzle status into the sheet. The
    /// registry is authoritative; a failure here is logged and dropped.
    pub async fn write_status_cell(&self, sheet: &SheetRef, status: PuzzleStatus) {
        if let Err(err) = self
            .store
            .write_cell(sheet, STATUS_CELL_RANGE, status.as_str())
            .await
        {
            warn!(file = %sheet.file_id, "failed to mirror status into sheet: {err}");
        }
    }

    /// Sheets currently in the root folder, for startup reconciliation.
    /// Titles come back alongside refs so the caller can derive slugs.
    pub async fn list_puzzle_sheets(&self) -> Result<Vec<SheetListing>, StorageError> {
        let root = self.root_folder().await?;
        self.store.list_spreadsheets(&root).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
