use shared::{
    domain::{BookmarkId, Principal, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChangeEvent, CreateBookmarkRequest, SessionResponse},
};
use storage::Storage;
use url::Url;

/// Everything the request handlers need. Transport-free so the handlers can
/// be exercised directly against an in-memory database.
#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Signs a user in by email, creating the account on first contact. This is
/// the dev-grade stand-in for a hosted identity provider: possession of the
/// returned token is the whole credential.
pub async fn sign_in(ctx: &ApiContext, email: &str) -> Result<SessionResponse, ApiError> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "email must be a non-empty address",
        ));
    }

    let principal = ctx.storage.upsert_user(email).await.map_err(internal)?;
    let token = ctx
        .storage
        .create_session(principal.user_id)
        .await
        .map_err(internal)?;
    Ok(SessionResponse { token, principal })
}

pub async fn session_principal(ctx: &ApiContext, token: &str) -> Result<Principal, ApiError> {
    ctx.storage
        .principal_for_token(token)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "no active session"))
}

/// Revokes a session token. Idempotent: signing out an already-dead token
/// succeeds.
pub async fn sign_out(ctx: &ApiContext, token: &str) -> Result<(), ApiError> {
    ctx.storage.revoke_session(token).await.map_err(internal)
}

pub async fn list_bookmarks(
    ctx: &ApiContext,
) -> Result<Vec<shared::domain::Bookmark>, ApiError> {
    ctx.storage
        .list_bookmarks_newest_first()
        .await
        .map_err(internal)
}

/// Validates and persists a new bookmark, attributed to the signed-in
/// principal. Returns the created row together with the change event the
/// transport layer should fan out to feed subscribers.
pub async fn create_bookmark(
    ctx: &ApiContext,
    owner: UserId,
    request: &CreateBookmarkRequest,
) -> Result<(shared::domain::Bookmark, ChangeEvent), ApiError> {
    let title = request.title.trim();
    let url = request.url.trim();
    if title.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "title must be non-empty"));
    }
    if url.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "url must be non-empty"));
    }
    // Url::parse rejects relative references, which is exactly the contract:
    // bookmarks hold absolute URIs.
    if Url::parse(url).is_err() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("'{url}' is not an absolute URL"),
        ));
    }

    let bookmark = ctx
        .storage
        .insert_bookmark(title, url, owner)
        .await
        .map_err(internal)?;
    let event = ChangeEvent::BookmarkInserted {
        bookmark: bookmark.clone(),
    };
    Ok((bookmark, event))
}

/// Deletes a bookmark. Idempotent toward the caller; a change event is
/// produced only when a row was actually removed, so repeated deletes do not
/// echo spurious events into the feed.
pub async fn delete_bookmark(
    ctx: &ApiContext,
    id: BookmarkId,
) -> Result<Option<ChangeEvent>, ApiError> {
    let removed = ctx.storage.delete_bookmark(id).await.map_err(internal)?;
    Ok(removed.then_some(ChangeEvent::BookmarkDeleted { id }))
}

fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %err, "storage operation failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}
