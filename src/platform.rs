//! Remote platform API client
//!
//! The archiver consumes three wire calls: enumerate a playlist, fetch item
//! metadata, delete a playlist entry. Auth is an OAuth bearer token loaded
//! from a token file under the tokens root and refreshed at most once per
//! request; a failed refresh surfaces as `ApiError::RefreshFailure` so
//! discovery can invalidate the account for the remainder of the run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::models::{ItemMetadata, PlaylistItem};
use crate::paths::resolve_dir;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const PAGE_SIZE: u32 = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    /// OAuth refresh failed; the account is unusable for this run.
    #[error("oauth refresh failed: {0}")]
    RefreshFailure(String),

    #[error("api http error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("api request failed: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

/// OAuth credentials as written by the setup utility.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenFile {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

pub fn load_token_file(path: &Path) -> Result<TokenFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read token file: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse token file: {}", path.display()))
}

/// One authenticated API client, cached per account for a run.
pub struct PlatformClient {
    http: reqwest::Client,
    credentials: TokenFile,
    access_token: Mutex<Option<String>>,
}

impl PlatformClient {
    pub fn new(credentials: TokenFile) -> Self {
        let access_token = credentials.token.clone();
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            credentials,
            access_token: Mutex::new(access_token),
        }
    }

    pub fn from_token_path(path: &Path) -> Result<Self> {
        Ok(Self::new(load_token_file(path)?))
    }

    async fn bearer(&self) -> Result<String, ApiError> {
        let guard = self.access_token.lock().await;
        match guard.as_deref() {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => {
                drop(guard);
                self.refresh().await
            }
        }
    }

    /// Exchange the refresh token for a new access token.
    async fn refresh(&self) -> Result<String, ApiError> {
        let refresh_token = self
            .credentials
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::RefreshFailure("no refresh token".to_string()))?;
        let token_uri = self
            .credentials
            .token_uri
            .as_deref()
            .unwrap_or("https://oauth2.googleapis.com/token");

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.credentials.client_id.as_deref().unwrap_or("")),
            (
                "client_secret",
                self.credentials.client_secret.as_deref().unwrap_or(""),
            ),
        ];

        let response = self
            .http
            .post(token_uri)
            .form(&params)
            .send()
            .await
            .map_err(|e| ApiError::RefreshFailure(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::RefreshFailure(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::RefreshFailure(e.to_string()))?;
        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::RefreshFailure("no access_token in response".to_string()))?
            .to_string();

        *self.access_token.lock().await = Some(token.clone());
        Ok(token)
    }

    /// Issue a request with the bearer token; on 401, refresh once and retry.
    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ApiError> {
        let mut refreshed = false;
        loop {
            let token = self.bearer().await?;
            let response = self
                .http
                .request(method.clone(), url)
                .query(query)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;

            let status = response.status();
            if status.as_u16() == 401 && !refreshed {
                refreshed = true;
                self.access_token.lock().await.take();
                self.refresh().await?;
                continue;
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ApiError::Http {
                    status: status.as_u16(),
                    message,
                });
            }
            if status.as_u16() == 204 {
                return Ok(Value::Null);
            }
            let text = response
                .text()
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| ApiError::Other(e.to_string()));
        }
    }

    /// Enumerate a playlist's current items in native order (paged).
    pub async fn list_playlist_items(
        &self,
        playlist_id: &str,
    ) -> Result<Vec<PlaylistItem>, ApiError> {
        let url = format!("{API_BASE}/playlistItems");
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("part", "snippet,contentDetails".to_string()),
                ("playlistId", playlist_id.to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let body = self.request(reqwest::Method::GET, &url, &query).await?;
            items.extend(parse_playlist_page(&body));

            page_token = body
                .get("nextPageToken")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
        }
        Ok(items)
    }

    /// Fetch metadata for one item; None when the item does not exist.
    pub async fn fetch_item_metadata(
        &self,
        item_id: &str,
    ) -> Result<Option<ItemMetadata>, ApiError> {
        let url = format!("{API_BASE}/videos");
        let query = vec![
            ("part", "snippet,contentDetails".to_string()),
            ("id", item_id.to_string()),
        ];
        let body = self.request(reqwest::Method::GET, &url, &query).await?;
        Ok(parse_video_metadata(&body, item_id))
    }

    /// Delete a playlist entry (remove-after-download).
    pub async fn delete_playlist_entry(&self, entry_id: &str) -> Result<(), ApiError> {
        let url = format!("{API_BASE}/playlistItems");
        let query = vec![("id", entry_id.to_string())];
        self.request(reqwest::Method::DELETE, &url, &query).await?;
        Ok(())
    }
}

/// Parse one playlistItems page into entries.
pub fn parse_playlist_page(body: &Value) -> Vec<PlaylistItem> {
    let Some(items) = body.get("items").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let item_id = item
                .get("contentDetails")
                .and_then(|c| c.get("videoId"))
                .and_then(|v| v.as_str())?
                .to_string();
            Some(PlaylistItem {
                item_id,
                entry_id: item.get("id").and_then(|v| v.as_str()).map(str::to_string),
                position: item
                    .get("snippet")
                    .and_then(|s| s.get("position"))
                    .and_then(|v| v.as_u64())
                    .map(|p| p as u32 + 1),
                url: None,
                title: item
                    .get("snippet")
                    .and_then(|s| s.get("title"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            })
        })
        .collect()
}

/// Parse a videos.list response into normalized metadata.
pub fn parse_video_metadata(body: &Value, item_id: &str) -> Option<ItemMetadata> {
    let snippet = body
        .get("items")
        .and_then(|v| v.as_array())
        .and_then(|items| items.first())
        .and_then(|item| item.get("snippet"))?;

    // publishedAt "2024-03-15T12:00:00Z" -> "20240315"
    let upload_date = snippet
        .get("publishedAt")
        .and_then(|v| v.as_str())
        .map(|s| s.chars().take(10).filter(|c| *c != '-').collect::<String>())
        .filter(|s| s.len() == 8);

    let thumbnails = snippet.get("thumbnails");
    let thumbnail_url = ["maxres", "standard", "high", "medium", "default"]
        .iter()
        .find_map(|size| {
            thumbnails
                .and_then(|t| t.get(size))
                .and_then(|t| t.get("url"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });

    let tags = snippet
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Some(ItemMetadata {
        item_id: item_id.to_string(),
        title: snippet.get("title").and_then(|v| v.as_str()).map(str::to_string),
        channel: snippet
            .get("channelTitle")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        upload_date,
        description: snippet
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        tags,
        url: Some(format!("https://www.youtube.com/watch?v={item_id}")),
        thumbnail_url,
        ..Default::default()
    })
}

/// Per-run cache of account clients. A refresh failure invalidates the
/// account: later lookups return None instead of retrying auth.
pub struct AccountClients {
    tokens_root: PathBuf,
    clients: Mutex<HashMap<String, Option<Arc<PlatformClient>>>>,
}

impl AccountClients {
    pub fn new(tokens_root: PathBuf) -> Self {
        Self {
            tokens_root,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Look up (building on first use) the client for an account. Returns
    /// None for unknown accounts, bad token files, and invalidated entries.
    pub async fn get(&self, account: &str, config: &Config) -> Option<Arc<PlatformClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(entry) = clients.get(account) {
            return entry.clone();
        }

        let built = self.build(account, config);
        let entry = match built {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                log::error!("Failed to initialize API client for account {account}: {err:#}");
                None
            }
        };
        clients.insert(account.to_string(), entry.clone());
        entry
    }

    fn build(&self, account: &str, config: &Config) -> Result<PlatformClient> {
        let account_cfg = config
            .accounts
            .get(account)
            .with_context(|| format!("account {account} is not configured"))?;
        let token_rel = account_cfg
            .token
            .as_deref()
            .with_context(|| format!("account {account} has no token path configured"))?;
        let token_path = resolve_dir(Some(token_rel), &self.tokens_root)
            .map_err(|e| anyhow::anyhow!("invalid token path for {account}: {e}"))?;
        PlatformClient::from_token_path(&token_path)
    }

    /// Drop an account's client for the rest of the run.
    pub async fn invalidate(&self, account: &str) {
        self.clients
            .lock()
            .await
            .insert(account.to_string(), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_playlist_page() {
        let body = json!({
            "items": [
                {
                    "id": "entry-1",
                    "snippet": {"position": 0, "title": "First"},
                    "contentDetails": {"videoId": "v1"}
                },
                {
                    "id": "entry-2",
                    "snippet": {"position": 1, "title": "Second"},
                    "contentDetails": {"videoId": "v2"}
                },
                {"snippet": {}, "contentDetails": {}}
            ],
            "nextPageToken": "tok"
        });
        let items = parse_playlist_page(&body);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_id, "v1");
        assert_eq!(items[0].entry_id.as_deref(), Some("entry-1"));
        assert_eq!(items[0].position, Some(1));
        assert_eq!(items[1].position, Some(2));
    }

    #[test]
    fn test_parse_video_metadata() {
        let body = json!({
            "items": [{
                "snippet": {
                    "title": "A Video",
                    "channelTitle": "A Channel",
                    "publishedAt": "2024-03-15T12:00:00Z",
                    "description": "desc",
                    "tags": ["x"],
                    "thumbnails": {
                        "default": {"url": "https://i/def.jpg"},
                        "maxres": {"url": "https://i/max.jpg"}
                    }
                }
            }]
        });
        let meta = parse_video_metadata(&body, "v1").unwrap();
        assert_eq!(meta.title.as_deref(), Some("A Video"));
        assert_eq!(meta.upload_date.as_deref(), Some("20240315"));
        assert_eq!(meta.thumbnail_url.as_deref(), Some("https://i/max.jpg"));
        assert_eq!(meta.url.as_deref(), Some("https://www.youtube.com/watch?v=v1"));
    }

    #[test]
    fn test_parse_video_metadata_empty() {
        assert!(parse_video_metadata(&json!({"items": []}), "v1").is_none());
    }

    #[tokio::test]
    async fn test_account_clients_invalidation() {
        let tmp = tempfile::tempdir().unwrap();
        let token_path = tmp.path().join("alice.json");
        std::fs::write(
            &token_path,
            r#"{"token":"t","refresh_token":"r","client_id":"c","client_secret":"s"}"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.accounts.insert(
            "alice".to_string(),
            crate::config::AccountConfig {
                token: Some("alice.json".to_string()),
            },
        );

        let clients = AccountClients::new(tmp.path().to_path_buf());
        assert!(clients.get("alice", &config).await.is_some());

        clients.invalidate("alice").await;
        assert!(clients.get("alice", &config).await.is_none());

        assert!(clients.get("nobody", &config).await.is_none());
    }
}
