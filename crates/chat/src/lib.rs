use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use shared::domain::ChannelRef;
use shared::slug::Slug;

pub mod command;
pub mod listener;

pub use command::{parse_command, Command};
pub use listener::{ChatListener, InboundMessage};

/// Opaque id of a channel category (the grouping the chat server shows
/// channels under). Categories are an implementation detail of the chat
/// side; nothing outside this crate stores one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRef(pub String);

#[derive(Debug, Clone)]
pub struct ChannelSummary {
    pub channel: ChannelRef,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum ChatError {
    /// Transient gateway trouble (network, rate limit, 5xx). The
    /// coordinator retries these with backoff.
    #[error("chat gateway unavailable: {0}")]
    Unavailable(String),

    /// The server ran out of channel capacity. Terminal; a human has to
    /// make room.
    #[error("channel limit reached on the chat server")]
    ChannelLimitExceeded,

    #[error("chat gateway rejected the request: {0}")]
    Rejected(String),
}

impl ChatError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Unavailable(_))
    }
}

/// Capability surface over the chat server. Everything the bot does on the
/// chat side goes through this trait so the coordinator can be tested
/// against fakes.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn find_category(&self, name: &str) -> Result<Option<CategoryRef>, ChatError>;
    async fn create_category(&self, name: &str) -> Result<CategoryRef, ChatError>;
    async fn create_channel(
        &self,
        name: &str,
        category: &CategoryRef,
    ) -> Result<ChannelRef, ChatError>;
    async fn rename_channel(&self, channel: &ChannelRef, name: &str) -> Result<(), ChatError>;
    async fn move_channel(
        &self,
        channel: &ChannelRef,
        category: &CategoryRef,
    ) -> Result<(), ChatError>;
    async fn list_channels(&self, category: &CategoryRef) -> Result<Vec<ChannelSummary>, ChatError>;
    async fn find_channel_by_prefix(&self, prefix: &str)
        -> Result<Option<ChannelSummary>, ChatError>;
    async fn create_voice_channel(
        &self,
        name: &str,
        category: &CategoryRef,
    ) -> Result<ChannelRef, ChatError>;
    async fn find_voice_channel(&self, name: &str) -> Result<Option<ChannelRef>, ChatError>;
    async fn delete_channel(&self, channel: &ChannelRef) -> Result<(), ChatError>;
    async fn post_message(&self, channel: &ChannelRef, text: &str) -> Result<(), ChatError>;
    async fn member_count(&self) -> Result<u32, ChatError>;
}

const TEXT_CHANNEL: u8 = 0;
const VOICE_CHANNEL: u8 = 2;
const CATEGORY_CHANNEL: u8 = 4;

#[derive(Debug, Deserialize)]
struct ApiChannel {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: u8,
    parent_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateChannelRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct EditChannelRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct PostMessageRequest<'a> {
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct GuildCounts {
    approximate_member_count: u32,
}

/// REST implementation of [`ChatGateway`] against a Discord-shaped API.
pub struct HttpChatGateway {
    http: Client,
    base_url: String,
    token: String,
    guild_id: String,
}

impl HttpChatGateway {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        guild_id: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            guild_id: guild_id.into(),
        }
    }

    async fn guild_channels(&self) -> Result<Vec<ApiChannel>, ChatError> {
        let response = self
            .http
            .get(format!(
                "{}/guilds/{}/channels",
                self.base_url, self.guild_id
            ))
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response.json().await.map_err(transport_error)
    }

    async fn create_guild_channel(
        &self,
        name: &str,
        kind: u8,
        parent_id: Option<&str>,
    ) -> Result<ApiChannel, ChatError> {
        let response = self
            .http
            .post(format!(
                "{}/guilds/{}/channels",
                self.base_url, self.guild_id
            ))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&CreateChannelRequest {
                name,
                kind,
                parent_id,
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response.json().await.map_err(transport_error)
    }

    async fn edit_channel(
        &self,
        channel: &ChannelRef,
        edit: EditChannelRequest<'_>,
    ) -> Result<(), ChatError> {
        let response = self
            .http
            .patch(format!("{}/channels/{}", self.base_url, channel.0))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&edit)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }
}

fn transport_error(err: reqwest::Error) -> ChatError {
    ChatError::Unavailable(err.to_string())
}

/// Maps HTTP failures onto the error taxonomy: 429/5xx are transient, a 400
/// complaining about channel capacity is terminal, everything else is a
/// plain rejection.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ChatError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 || status.is_server_error() {
        return Err(ChatError::Unavailable(format!("{status}: {body}")));
    }
    if body.to_ascii_lowercase().contains("maximum number of") {
        return Err(ChatError::ChannelLimitExceeded);
    }
    Err(ChatError::Rejected(format!("{status}: {body}")))
}

#[async_trait]
impl ChatGateway for HttpChatGateway {
    async fn find_category(&self, name: &str) -> Result<Option<CategoryRef>, ChatError> {
        let channels = self.guild_channels().await?;
        Ok(channels
            .into_iter()
            .find(|c| c.kind == CATEGORY_CHANNEL && c.name == name)
            .map(|c| CategoryRef(c.id)))
    }

    async fn create_category(&self, name: &str) -> Result<CategoryRef, ChatError> {
        let created = self
            .create_guild_channel(name, CATEGORY_CHANNEL, None)
            .await?;
        Ok(CategoryRef(created.id))
    }

    async fn create_channel(
        &self,
        name: &str,
        category: &CategoryRef,
    ) -> Result<ChannelRef, ChatError> {
        let created = self
            .create_guild_channel(name, TEXT_CHANNEL, Some(&category.0))
            .await?;
        Ok(ChannelRef(created.id))
    }

    async fn rename_channel(&self, channel: &ChannelRef, name: &str) -> Result<(), ChatError> {
        self.edit_channel(
            channel,
            EditChannelRequest {
                name: Some(name),
                parent_id: None,
            },
        )
        .await
    }

    async fn move_channel(
        &self,
        channel: &ChannelRef,
        category: &CategoryRef,
    ) -> Result<(), ChatError> {
        self.edit_channel(
            channel,
            EditChannelRequest {
                name: None,
                parent_id: Some(&category.0),
            },
        )
        .await
    }

    async fn list_channels(
        &self,
        category: &CategoryRef,
    ) -> Result<Vec<ChannelSummary>, ChatError> {
        let channels = self.guild_channels().await?;
        Ok(channels
            .into_iter()
            .filter(|c| c.kind == TEXT_CHANNEL && c.parent_id.as_deref() == Some(&category.0))
            .map(|c| ChannelSummary {
                channel: ChannelRef(c.id),
                name: c.name,
            })
            .collect())
    }

    async fn find_channel_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Option<ChannelSummary>, ChatError> {
        let channels = self.guild_channels().await?;
        Ok(channels
            .into_iter()
            .find(|c| c.kind == TEXT_CHANNEL && c.name.starts_with(prefix))
            .map(|c| ChannelSummary {
                channel: ChannelRef(c.id),
                name: c.name,
            }))
    }

    async fn create_voice_channel(
        &self,
        name: &str,
        category: &CategoryRef,
    ) -> Result<ChannelRef, ChatError> {
        let created = self
            .create_guild_channel(name, VOICE_CHANNEL, Some(&category.0))
            .await?;
        Ok(ChannelRef(created.id))
    }

    async fn find_voice_channel(&self, name: &str) -> Result<Option<ChannelRef>, ChatError> {
        let channels = self.guild_channels().await?;
        Ok(channels
            .into_iter()
            .find(|c| c.kind == VOICE_CHANNEL && c.name == name)
            .map(|c| ChannelRef(c.id)))
    }

    async fn delete_channel(&self, channel: &ChannelRef) -> Result<(), ChatError> {
        let response = self
            .http
            .delete(format!("{}/channels/{}", self.base_url, channel.0))
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn post_message(&self, channel: &ChannelRef, text: &str) -> Result<(), ChatError> {
        let response = self
            .http
            .post(format!("{}/channels/{}/messages", self.base_url, channel.0))
            .header("Authorization", format!("Bot {}", self.token))
            .json(&PostMessageRequest { content: text })
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn member_count(&self) -> Result<u32, ChatError> {
        let response = self
            .http
            .get(format!(
                "{}/guilds/{}?with_counts=true",
                self.base_url, self.guild_id
            ))
            .header("Authorization", format!("Bot {}", self.token))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        let counts: GuildCounts = response.json().await.map_err(transport_error)?;
        Ok(counts.approximate_member_count)
    }
}

/// Chat-side adapter: keeps each puzzle's channel in step with its registry
/// record. Channel names are slugs; the live and archive categories are
/// created lazily on first use.
pub struct ChannelMirror {
    gateway: Arc<dyn ChatGateway>,
    live_category: String,
    archive_category: String,
    voice_category: String,
}

impl ChannelMirror {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        live_category: impl Into<String>,
        archive_category: impl Into<String>,
        voice_category: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            live_category: live_category.into(),
            archive_category: archive_category.into(),
            voice_category: voice_category.into(),
        }
    }

    async fn find_or_create_category(&self, name: &str) -> Result<CategoryRef, ChatError> {
        if let Some(category) = self.gateway.find_category(name).await? {
            return Ok(category);
        }
        self.gateway.create_category(name).await
    }

    /// Create-or-fetch by slug under the live category. A retry after a
    /// transient failure finds the channel the earlier attempt may already
    /// have created instead of making a second one.
    pub async fn create_puzzle_channel(&self, slug: &Slug) -> Result<ChannelRef, ChatError> {
        let live = self.find_or_create_category(&self.live_category).await?;
        let existing = self.gateway.list_channels(&live).await?;
        if let Some(found) = existing.into_iter().find(|c| c.name == slug.as_str()) {
            info!(slug = %slug, channel = %found.channel, "reusing existing puzzle channel");
            return Ok(found.channel);
        }
        self.gateway.create_channel(slug.as_str(), &live).await
    }

    /// Idempotent move to the archive category (created lazily).
    pub async fn archive_channel(&self, channel: &ChannelRef) -> Result<(), ChatError> {
        let archive = self.find_or_create_category(&self.archive_category).await?;
        let already_there = self
            .gateway
            .list_channels(&archive)
            .await?
            .iter()
            .any(|c| &c.channel == channel);
        if already_there {
            return Ok(());
        }
        self.gateway.move_channel(channel, &archive).await
    }

    /// Create-or-fetch the puzzle's voice channel, named by slug under the
    /// voice category.
    pub async fn create_voice_channel(&self, slug: &Slug) -> Result<ChannelRef, ChatError> {
        if let Some(existing) = self.gateway.find_voice_channel(slug.as_str()).await? {
            return Ok(existing);
        }
        let voice = self.find_or_create_category(&self.voice_category).await?;
        self.gateway
            .create_voice_channel(slug.as_str(), &voice)
            .await
    }

    /// Deletes the puzzle's voice channel if one exists. Failures are
    /// logged, never propagated; the voice channel is a convenience, not
    /// puzzle state.
    pub async fn remove_voice_channel(&self, slug: &Slug) {
        match self.gateway.find_voice_channel(slug.as_str()).await {
            Ok(Some(channel)) => {
                if let Err(err) = self.gateway.delete_channel(&channel).await {
                    warn!(slug = %slug, "failed to delete voice channel: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(slug = %slug, "voice channel lookup failed: {err}"),
        }
    }

    /// Fire-and-forget notification. Failures are logged, never propagated;
    /// chat messages are a mirror of puzzle state, not part of it.
    pub async fn post_message(&self, channel: &ChannelRef, text: &str) {
        if let Err(err) = self.gateway.post_message(channel, text).await {
            warn!(channel = %channel, "failed to post message: {err}");
        }
    }

    /// Channels currently under the live category, for startup
    /// reconciliation.
    pub async fn list_puzzle_channels(&self) -> Result<Vec<ChannelSummary>, ChatError> {
        match self.gateway.find_category(&self.live_category).await? {
            Some(live) => self.gateway.list_channels(&live).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn member_count(&self) -> Result<u32, ChatError> {
        self.gateway.member_count().await
    }

    /// Looks a channel up by name prefix anywhere in the server.
    pub async fn find_channel(&self, prefix: &str) -> Result<Option<ChannelSummary>, ChatError> {
        self.gateway.find_channel_by_prefix(prefix).await
    }

    pub async fn rename_channel(&self, channel: &ChannelRef, name: &str) -> Result<(), ChatError> {
        self.gateway.rename_channel(channel, name).await
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
