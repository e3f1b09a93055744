use bytes::Bytes;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use crate::error::{ChatError, Result};
use crate::model::{Message, Room, RoomId, RoomInvite, SessionToken, UploadedFile, User};

/// Outcome of a join request. The server's explicit conflict status for a
/// redundant join is success, not failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyMember,
}

/// Typed client for the collaborator HTTP API. The long-lived session
/// cookie is carried by the underlying cookie store; callers never see it.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    pub fn new(base: Url) -> Result<Self> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self { http, base })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }

    pub async fn start_session(&self, name: &str) -> Result<User> {
        let resp = self
            .http
            .post(self.url("session/start"))
            .json(&json!({ "name": name }))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn current_session(&self) -> Result<User> {
        decode(self.http.get(self.url("session/me")).send().await?).await
    }

    /// Fetch the short-lived token used to authenticate the live transport.
    pub async fn session_token(&self) -> Result<String> {
        let token: SessionToken =
            decode(self.http.get(self.url("session/token")).send().await?).await?;
        Ok(token.token)
    }

    pub async fn create_room(&self, name: &str, is_public: bool) -> Result<Room> {
        let resp = self
            .http
            .post(self.url("rooms"))
            .json(&json!({ "name": name, "is_public": is_public }))
            .send()
            .await?;
        decode(resp).await
    }

    pub async fn community_rooms(&self) -> Result<Vec<Room>> {
        decode(self.http.get(self.url("rooms/community")).send().await?).await
    }

    pub async fn userspace_rooms(&self) -> Result<Vec<Room>> {
        decode(self.http.get(self.url("rooms/userspaces")).send().await?).await
    }

    pub async fn my_rooms(&self) -> Result<Vec<Room>> {
        decode(self.http.get(self.url("rooms/my")).send().await?).await
    }

    pub async fn delete_room(&self, id: RoomId) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("rooms/{id}")))
            .send()
            .await?;
        expect_ok(resp).await
    }

    pub async fn join_room(&self, id: RoomId) -> Result<JoinOutcome> {
        let resp = self
            .http
            .post(self.url(&format!("rooms/{id}/join")))
            .send()
            .await?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(JoinOutcome::AlreadyMember);
        }
        expect_ok(resp).await?;
        Ok(JoinOutcome::Joined)
    }

    pub async fn leave_room(&self, id: RoomId) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("rooms/{id}/leave")))
            .send()
            .await?;
        expect_ok(resp).await
    }

    pub async fn room_members(&self, id: RoomId) -> Result<Vec<User>> {
        decode(
            self.http
                .get(self.url(&format!("rooms/{id}/members")))
                .send()
                .await?,
        )
        .await
    }

    /// History fetch; the server returns newest-first.
    pub async fn room_messages(&self, id: RoomId, limit: Option<u32>) -> Result<Vec<Message>> {
        let mut req = self.http.get(self.url(&format!("rooms/{id}/messages")));
        if let Some(limit) = limit {
            req = req.query(&[("limit", limit)]);
        }
        decode(req.send().await?).await
    }

    pub async fn create_invite(&self, id: RoomId) -> Result<Uuid> {
        let invite: RoomInvite = decode(
            self.http
                .post(self.url(&format!("rooms/{id}/invite")))
                .send()
                .await?,
        )
        .await?;
        Ok(invite.token)
    }

    pub async fn room_by_invite(&self, token: &str) -> Result<Room> {
        decode(
            self.http
                .get(self.url(&format!("invite/{token}")))
                .send()
                .await?,
        )
        .await
    }

    pub async fn upload_file(&self, file_name: &str, data: Bytes) -> Result<String> {
        let mime = mime_guess::from_path(file_name)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".into());
        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name(file_name.to_string())
            .mime_str(&mime)?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .http
            .post(self.url("upload-file"))
            .multipart(form)
            .send()
            .await?;
        let uploaded: UploadedFile = decode(resp).await?;
        Ok(uploaded.file_url)
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp.json().await?)
    } else {
        Err(api_error(status, resp).await)
    }
}

async fn expect_ok(resp: Response) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(api_error(status, resp).await)
    }
}

/// Pull the server-provided message out of an error body when present.
/// Bodies are `{"detail": ...}` or `{"error": ...}` depending on the server.
async fn api_error(status: StatusCode, resp: Response) -> ChatError {
    let message = match resp.json::<serde_json::Value>().await {
        Ok(body) => body
            .get("detail")
            .or_else(|| body.get("error"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "request failed".into()),
        Err(_) => "request failed".into(),
    };
    ChatError::Api {
        status: status.as_u16(),
        message,
    }
}
