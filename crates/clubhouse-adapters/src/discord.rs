//! Discord REST collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clubhouse_core::authority::{EntitlementAuthority, StripOutcome};
use clubhouse_core::draw::CandidateProvider;
use clubhouse_core::error::ClubhouseError;
use clubhouse_core::types::{
    has_image, Attachment, Candidate, ChannelId, GuildId, MessageId, RoleId, UserId,
};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Discord's maximum page size for channel history.
const PAGE_SIZE: usize = 100;

/// Authenticated HTTP client for the Discord API.
#[derive(Clone)]
pub struct DiscordClient {
    http: Client,
    base_url: String,
    token: String,
}

impl DiscordClient {
    pub fn new(token: impl Into<String>, base_url: &str) -> Result<Self, ClubhouseError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("clubhouse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClubhouseError::Provider(format!("http client init failed: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header(AUTHORIZATION, format!("Bot {}", self.token))
    }
}

impl std::fmt::Debug for DiscordClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Grants and strips the VIP role through guild member role endpoints.
#[derive(Debug, Clone)]
pub struct DiscordRestAuthority {
    client: DiscordClient,
    guilds: Vec<GuildId>,
    vip_role: RoleId,
}

impl DiscordRestAuthority {
    /// An empty `guilds` list means "every guild the bot has joined".
    pub fn new(client: DiscordClient, guilds: Vec<GuildId>, vip_role: RoleId) -> Self {
        Self {
            client,
            guilds,
            vip_role,
        }
    }

    fn role_path(&self, scope: GuildId, user: UserId) -> String {
        format!("/guilds/{scope}/members/{user}/roles/{}", self.vip_role)
    }
}

#[derive(Debug, Deserialize)]
struct PartialGuild {
    id: String,
}

#[async_trait]
impl EntitlementAuthority for DiscordRestAuthority {
    fn authority_id(&self) -> &'static str {
        "discord"
    }

    async fn scopes(&self) -> Result<Vec<GuildId>, ClubhouseError> {
        if !self.guilds.is_empty() {
            return Ok(self.guilds.clone());
        }

        let response = self
            .client
            .request(Method::GET, "/users/@me/guilds")
            .send()
            .await
            .map_err(|e| ClubhouseError::Provider(format!("guild listing failed: {e}")))?;
        let response = expect_success(response)
            .await
            .map_err(|message| ClubhouseError::Provider(format!("guild listing failed: {message}")))?;
        let guilds: Vec<PartialGuild> = response
            .json()
            .await
            .map_err(|e| ClubhouseError::Provider(format!("guild listing decode failed: {e}")))?;

        guilds
            .into_iter()
            .map(|guild| parse_snowflake(&guild.id).map(GuildId))
            .collect()
    }

    async fn apply(&self, scope: GuildId, user: UserId) -> Result<(), ClubhouseError> {
        let response = self
            .client
            .request(Method::PUT, &self.role_path(scope, user))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| ClubhouseError::authority_failed("apply", user, e.to_string()))?;

        expect_success(response)
            .await
            .map_err(|message| ClubhouseError::authority_failed("apply", user, message))?;
        debug!(guild_id = %scope, user_id = %user, "vip role applied");
        Ok(())
    }

    async fn strip(&self, scope: GuildId, user: UserId) -> Result<StripOutcome, ClubhouseError> {
        let response = self
            .client
            .request(Method::DELETE, &self.role_path(scope, user))
            .send()
            .await
            .map_err(|e| ClubhouseError::authority_failed("strip", user, e.to_string()))?;

        // Unknown member: they left the guild, so there is nothing to strip.
        if response.status() == StatusCode::NOT_FOUND {
            debug!(guild_id = %scope, user_id = %user, "member not present");
            return Ok(StripOutcome::NotPresent);
        }

        expect_success(response)
            .await
            .map_err(|message| ClubhouseError::authority_failed("strip", user, message))?;
        debug!(guild_id = %scope, user_id = %user, "vip role stripped");
        Ok(StripOutcome::Stripped)
    }
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    channel_id: String,
    author: ApiUser,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

impl ApiMessage {
    fn into_candidate(self, guild: GuildId) -> Result<Candidate, ClubhouseError> {
        let message_id = MessageId(parse_snowflake(&self.id)?);
        let channel_id = ChannelId(parse_snowflake(&self.channel_id)?);
        Ok(Candidate {
            jump_url: jump_url(guild, channel_id, message_id),
            message_id,
            author: UserId(parse_snowflake(&self.author.id)?),
            created_at: self.timestamp,
            eligible: has_image(&self.attachments),
            content_ref: self.attachments.first().map(|a| a.url.clone()),
        })
    }
}

/// Reads draw candidates from a guild channel's message history.
#[derive(Debug, Clone)]
pub struct DiscordHistoryProvider {
    client: DiscordClient,
    guild_id: GuildId,
}

impl DiscordHistoryProvider {
    pub fn new(client: DiscordClient, guild_id: GuildId) -> Self {
        Self { client, guild_id }
    }

    async fn fetch_page(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
    ) -> Result<Vec<ApiMessage>, ClubhouseError> {
        let mut request = self
            .client
            .request(Method::GET, &format!("/channels/{channel}/messages"))
            .query(&[("limit", PAGE_SIZE.to_string())]);
        if let Some(before) = before {
            request = request.query(&[("before", before.to_string())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClubhouseError::Provider(format!("history fetch failed: {e}")))?;
        let response = expect_success(response)
            .await
            .map_err(|message| ClubhouseError::Provider(format!("history fetch failed: {message}")))?;
        response
            .json()
            .await
            .map_err(|e| ClubhouseError::Provider(format!("history decode failed: {e}")))
    }
}

#[async_trait]
impl CandidateProvider for DiscordHistoryProvider {
    async fn fetch_candidates(
        &self,
        channel: ChannelId,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candidate>, ClubhouseError> {
        let mut collected = Vec::new();
        let mut before = None;

        while collected.len() < limit {
            let page = self.fetch_page(channel, before).await?;
            let Some(last) = page.last() else {
                break;
            };
            before = Some(MessageId(parse_snowflake(&last.id)?));

            let page = page
                .into_iter()
                .map(|message| message.into_candidate(self.guild_id))
                .collect::<Result<Vec<_>, _>>()?;
            if !absorb_page(page, after, limit, &mut collected) {
                break;
            }
        }

        debug!(channel_id = %channel, fetched = collected.len(), "channel history scanned");
        Ok(collected)
    }
}

/// Append a newest-first page; returns whether older pages are still needed.
fn absorb_page(
    page: Vec<Candidate>,
    after: Option<DateTime<Utc>>,
    limit: usize,
    collected: &mut Vec<Candidate>,
) -> bool {
    let full_page = page.len() >= PAGE_SIZE;
    for candidate in page {
        if after.is_some_and(|mark| candidate.created_at <= mark) {
            return false;
        }
        collected.push(candidate);
        if collected.len() >= limit {
            return false;
        }
    }
    full_page
}

pub fn jump_url(guild: GuildId, channel: ChannelId, message: MessageId) -> String {
    format!("https://discord.com/channels/{guild}/{channel}/{message}")
}

fn parse_snowflake(raw: &str) -> Result<u64, ClubhouseError> {
    raw.parse()
        .map_err(|e| ClubhouseError::Provider(format!("invalid snowflake '{raw}': {e}")))
}

async fn expect_success(response: Response) -> Result<Response, String> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(format!("HTTP {status}: {body}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> DiscordClient {
        DiscordClient::new("secret", &server.uri()).unwrap()
    }

    fn message_json(id: u64, second: u32, content_type: Option<&str>) -> serde_json::Value {
        let attachments = match content_type {
            Some(ct) => json!([{ "id": "1", "url": format!("https://cdn/{id}"), "content_type": ct }]),
            None => json!([]),
        };
        json!({
            "id": id.to_string(),
            "channel_id": "20",
            "author": { "id": (id * 10).to_string(), "username": "poster" },
            "content": "",
            "timestamp": Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, second).unwrap().to_rfc3339(),
            "attachments": attachments,
        })
    }

    #[tokio::test]
    async fn apply_puts_member_role() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/guilds/1/members/5/roles/99"))
            .and(header("authorization", "Bot secret"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let authority = DiscordRestAuthority::new(client(&server), vec![GuildId(1)], RoleId(99));
        authority.apply(GuildId(1), UserId(5)).await.unwrap();
    }

    #[tokio::test]
    async fn strip_maps_missing_member_to_not_present() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/guilds/1/members/5/roles/99"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/guilds/1/members/6/roles/99"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/guilds/1/members/7/roles/99"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Missing Permissions"))
            .mount(&server)
            .await;

        let authority = DiscordRestAuthority::new(client(&server), vec![GuildId(1)], RoleId(99));
        assert_eq!(
            authority.strip(GuildId(1), UserId(5)).await.unwrap(),
            StripOutcome::NotPresent
        );
        assert_eq!(
            authority.strip(GuildId(1), UserId(6)).await.unwrap(),
            StripOutcome::Stripped
        );

        let err = authority.strip(GuildId(1), UserId(7)).await.unwrap_err();
        assert!(matches!(err, ClubhouseError::AuthorityOperationFailed { .. }));
        assert!(err.to_string().contains("Missing Permissions"));
    }

    #[tokio::test]
    async fn scopes_fall_back_to_joined_guilds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/@me/guilds"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{ "id": "1" }, { "id": "2" }])),
            )
            .mount(&server)
            .await;

        let authority = DiscordRestAuthority::new(client(&server), Vec::new(), RoleId(99));
        assert_eq!(
            authority.scopes().await.unwrap(),
            vec![GuildId(1), GuildId(2)]
        );
    }

    #[tokio::test]
    async fn history_stops_at_the_watermark() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/20/messages"))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                message_json(3, 3, Some("image/png")),
                message_json(2, 2, None),
                message_json(1, 1, Some("image/jpeg")),
            ])))
            .mount(&server)
            .await;

        let provider = DiscordHistoryProvider::new(client(&server), GuildId(1));
        let after = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 1).unwrap();
        let candidates = provider
            .fetch_candidates(ChannelId(20), Some(after), 500)
            .await
            .unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].message_id, MessageId(3));
        assert!(candidates[0].eligible);
        assert_eq!(candidates[0].author, UserId(30));
        assert_eq!(candidates[0].content_ref.as_deref(), Some("https://cdn/3"));
        assert_eq!(candidates[0].jump_url, "https://discord.com/channels/1/20/3");
        assert!(!candidates[1].eligible);
    }

    #[tokio::test]
    async fn history_errors_surface_as_provider_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/20/messages"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = DiscordHistoryProvider::new(client(&server), GuildId(1));
        let err = provider
            .fetch_candidates(ChannelId(20), None, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ClubhouseError::Provider(_)));
    }

    #[test]
    fn absorb_page_respects_limit_and_page_size() {
        let candidate = |id: u64| Candidate {
            message_id: MessageId(id),
            author: UserId(id),
            created_at: Utc.timestamp_opt(1_740_787_200 - id as i64, 0).unwrap(),
            jump_url: String::new(),
            content_ref: None,
            eligible: true,
        };

        let mut collected = Vec::new();
        let full: Vec<Candidate> = (1..=100).map(candidate).collect();
        assert!(absorb_page(full, None, 500, &mut collected));
        assert_eq!(collected.len(), 100);

        let mut capped = Vec::new();
        let page: Vec<Candidate> = (1..=100).map(candidate).collect();
        assert!(!absorb_page(page, None, 10, &mut capped));
        assert_eq!(capped.len(), 10);

        let mut short = Vec::new();
        assert!(!absorb_page(vec![candidate(1)], None, 10, &mut short));
    }
}
