use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::{Bookmark, BookmarkId, Principal},
    error::ApiError,
    protocol::{ChangeEvent, CreateBookmarkRequest, EventMask, LoginRequest, SessionResponse},
};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;

use crate::{BookmarkStore, ChangeFeed, FeedSubscription, NewBookmark, SessionService};

const FEED_CHANNEL_CAPACITY: usize = 64;

/// The backend over the wire: REST for auth and mutations, a websocket for
/// the change feed. One instance implements all three boundary traits, so a
/// single `Arc<RemoteBackend>` can be handed to the store as each
/// collaborator.
pub struct RemoteBackend {
    http: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Arc<Self>> {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(anyhow!(
                "server url must start with http:// or https://, got '{base_url}'"
            ));
        }
        Ok(Arc::new(Self {
            http: Client::new(),
            base_url,
            token: RwLock::new(None),
        }))
    }

    async fn bearer_token(&self) -> Result<String> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("not signed in"))
    }

    fn ws_url(&self, token: &str, mask: EventMask) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            format!("ws://{}", self.base_url.trim_start_matches("http://"))
        };
        format!("{ws_base}/ws?token={token}&events={}", mask.as_param())
    }
}

/// Turns a non-2xx response into an error carrying the server's `ApiError`
/// envelope when one was sent.
async fn expect_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(envelope) => Err(anyhow::Error::new(envelope)
            .context(format!("server rejected request with {status}"))),
        Err(_) => Err(anyhow!("server returned {status}")),
    }
}

#[async_trait]
impl SessionService for RemoteBackend {
    async fn current_session(&self) -> Result<Option<Principal>> {
        let Some(token) = self.token.read().await.clone() else {
            return Ok(None);
        };
        let response = self
            .http
            .get(format!("{}/auth/session", self.base_url))
            .bearer_auth(&token)
            .send()
            .await
            .context("session lookup request failed")?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        let principal = expect_success(response).await?.json::<Principal>().await?;
        Ok(Some(principal))
    }

    async fn sign_in(&self, email: &str) -> Result<Principal> {
        let response = self
            .http
            .post(format!("{}/auth/login", self.base_url))
            .json(&LoginRequest {
                email: email.to_string(),
            })
            .send()
            .await
            .context("login request failed")?;
        let session = expect_success(response)
            .await?
            .json::<SessionResponse>()
            .await?;
        *self.token.write().await = Some(session.token);
        Ok(session.principal)
    }

    async fn sign_out(&self) -> Result<()> {
        let Some(token) = self.token.write().await.take() else {
            return Ok(());
        };
        let response = self
            .http
            .post(format!("{}/auth/logout", self.base_url))
            .bearer_auth(&token)
            .send()
            .await
            .context("logout request failed")?;
        expect_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl BookmarkStore for RemoteBackend {
    async fn list_newest_first(&self) -> Result<Vec<Bookmark>> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(format!("{}/bookmarks", self.base_url))
            .bearer_auth(&token)
            .send()
            .await
            .context("bookmark list request failed")?;
        let bookmarks = expect_success(response)
            .await?
            .json::<Vec<Bookmark>>()
            .await?;
        Ok(bookmarks)
    }

    async fn insert(&self, bookmark: NewBookmark) -> Result<Bookmark> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .post(format!("{}/bookmarks", self.base_url))
            .bearer_auth(&token)
            .json(&CreateBookmarkRequest {
                title: bookmark.title,
                url: bookmark.url,
            })
            .send()
            .await
            .context("bookmark create request failed")?;
        let created = expect_success(response).await?.json::<Bookmark>().await?;
        Ok(created)
    }

    async fn delete(&self, id: BookmarkId) -> Result<()> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .delete(format!("{}/bookmarks/{}", self.base_url, id))
            .bearer_auth(&token)
            .send()
            .await
            .context("bookmark delete request failed")?;
        expect_success(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for RemoteBackend {
    async fn subscribe(&self, mask: EventMask) -> Result<FeedSubscription> {
        let token = self.bearer_token().await?;
        let ws_url = self.ws_url(&token, mask);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect change feed: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ChangeEvent>(&text) {
                            Ok(event) => {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            // Malformed frames are non-fatal: drop the one
                            // event, keep the subscription.
                            Err(error) => {
                                warn!(%error, "skipping malformed change feed frame");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "change feed socket error");
                        break;
                    }
                }
            }
        });

        Ok(FeedSubscription::new(rx, reader))
    }
}
