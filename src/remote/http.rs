// REST client for the job-board backend

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use super::{RemoteApi, RemoteError, RemoteResult};
use crate::models::{
    Chat, ChatId, ChatRecord, ChatStatus, Company, Job, JobApplication, Message, MessageId,
    MessagePatch, NewChat, NewMessage, PinnedChat, Resume, ResumeApplication, User, UserId,
};

#[derive(serde::Deserialize)]
struct UnreadCountBody {
    unread_count: u32,
}

pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, endpoint: &str, builder: RequestBuilder) -> RemoteResult<Response> {
        debug!("-> {}", endpoint);
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!("API error from {}: {} {}", endpoint, status, body);
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(endpoint.to_string()));
        }
        Err(RemoteError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(endpoint: &str, response: Response) -> RemoteResult<T> {
        response.json::<T>().await.map_err(|e| RemoteError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        let response = self.send(path, self.request(Method::GET, path)).await?;
        Self::decode(path, response).await
    }

    async fn send_json<B, T>(&self, method: Method, path: &str, body: &B) -> RemoteResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let response = self.send(path, self.request(method, path).json(body)).await?;
        Self::decode(path, response).await
    }

    async fn send_empty<B>(&self, method: Method, path: &str, body: Option<&B>) -> RemoteResult<()>
    where
        B: Serialize + ?Sized + Sync,
    {
        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.send(path, builder).await.map(|_| ())
    }

    /// Chats without an origin are dropped here rather than failing the whole list
    fn chats_from_records(records: Vec<ChatRecord>) -> Vec<Chat> {
        records
            .into_iter()
            .filter_map(|record| match Chat::try_from(record) {
                Ok(chat) => Some(chat),
                Err(reason) => {
                    warn!("Skipping malformed chat: {}", reason);
                    None
                }
            })
            .collect()
    }

    fn chat_from_record(endpoint: &str, record: ChatRecord) -> RemoteResult<Chat> {
        Chat::try_from(record).map_err(|reason| RemoteError::Decode {
            endpoint: endpoint.to_string(),
            reason,
        })
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn list_chats(&self) -> RemoteResult<Vec<Chat>> {
        let records: Vec<ChatRecord> = self.get_json("/chats/").await?;
        Ok(Self::chats_from_records(records))
    }

    async fn get_chat(&self, id: ChatId) -> RemoteResult<Chat> {
        let path = format!("/chats/{}/", id);
        let record: ChatRecord = self.get_json(&path).await?;
        Self::chat_from_record(&path, record)
    }

    async fn create_chat(&self, chat: &NewChat) -> RemoteResult<Chat> {
        let record: ChatRecord = self.send_json(Method::POST, "/chats/", chat).await?;
        Self::chat_from_record("/chats/", record)
    }

    async fn update_chat_status(&self, id: ChatId, status: ChatStatus) -> RemoteResult<Chat> {
        let path = format!("/chats/{}/", id);
        let record: ChatRecord = self
            .send_json(Method::PATCH, &path, &json!({ "status": status }))
            .await?;
        Self::chat_from_record(&path, record)
    }

    async fn delete_chat(&self, id: ChatId) -> RemoteResult<()> {
        self.send_empty::<()>(Method::DELETE, &format!("/chats/{}/", id), None)
            .await
    }

    async fn mark_all_read(&self, chat: ChatId, user: UserId) -> RemoteResult<()> {
        let path = format!("/chats/{}/mark_all_read/", chat);
        self.send_empty(Method::POST, &path, Some(&json!({ "user_id": user })))
            .await
    }

    async fn unread_count(&self, user: UserId) -> RemoteResult<u32> {
        let body: UnreadCountBody = self
            .get_json(&format!("/chats/unread_count/?user_id={}", user))
            .await?;
        Ok(body.unread_count)
    }

    async fn list_messages(&self) -> RemoteResult<Vec<Message>> {
        self.get_json("/messages/").await
    }

    async fn list_chat_messages(&self, chat: ChatId) -> RemoteResult<Vec<Message>> {
        self.get_json(&format!("/messages/?chat={}", chat)).await
    }

    async fn get_message(&self, id: MessageId) -> RemoteResult<Message> {
        self.get_json(&format!("/messages/{}/", id)).await
    }

    async fn create_message(&self, message: &NewMessage) -> RemoteResult<Message> {
        self.send_json(Method::POST, "/messages/", message).await
    }

    async fn update_message(&self, id: MessageId, patch: &MessagePatch) -> RemoteResult<Message> {
        self.send_json(Method::PATCH, &format!("/messages/{}/", id), patch)
            .await
    }

    async fn delete_message(&self, id: MessageId) -> RemoteResult<()> {
        self.send_empty::<()>(Method::DELETE, &format!("/messages/{}/", id), None)
            .await
    }

    async fn delete_all_messages(&self, chat: ChatId) -> RemoteResult<()> {
        self.send_empty(
            Method::POST,
            "/messages/delete_all/",
            Some(&json!({ "chat_id": chat })),
        )
        .await
    }

    async fn list_job_applications(&self) -> RemoteResult<Vec<JobApplication>> {
        self.get_json("/job_applications/").await
    }

    async fn list_resume_applications(&self) -> RemoteResult<Vec<ResumeApplication>> {
        self.get_json("/resume_applications/").await
    }

    async fn list_jobs(&self) -> RemoteResult<Vec<Job>> {
        self.get_json("/jobs/").await
    }

    async fn list_resumes(&self) -> RemoteResult<Vec<Resume>> {
        self.get_json("/resumes/").await
    }

    async fn list_users(&self) -> RemoteResult<Vec<User>> {
        self.get_json("/users/").await
    }

    async fn get_user(&self, id: UserId) -> RemoteResult<User> {
        self.get_json(&format!("/users/{}/", id)).await
    }

    async fn list_companies(&self) -> RemoteResult<Vec<Company>> {
        self.get_json("/companies/").await
    }

    async fn list_pinned_chats(&self, user: UserId) -> RemoteResult<Vec<PinnedChat>> {
        self.get_json(&format!("/pinned-chats/user/{}/", user)).await
    }

    async fn create_pinned_chat(&self, user: UserId, chat: ChatId) -> RemoteResult<PinnedChat> {
        self.send_json(
            Method::POST,
            "/pinned-chats/",
            &json!({ "user": user, "chat": chat }),
        )
        .await
    }

    async fn delete_pinned_chat(&self, user: UserId, chat: ChatId) -> RemoteResult<()> {
        let path = format!("/pinned-chats/user/{}/chat/{}/", user, chat);
        self.send_empty::<()>(Method::DELETE, &path, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalised() {
        let remote = HttpRemote::new("http://127.0.0.1:8000/app/", Duration::from_secs(5), None)
            .expect("client should build");
        assert_eq!(remote.base_url(), "http://127.0.0.1:8000/app");
    }

    #[test]
    fn test_malformed_chats_are_skipped() {
        let records: Vec<ChatRecord> = serde_json::from_value(json!([
            { "id": 1, "application": 10, "resume_application": null, "status": "active",
              "created_at": "2024-03-01T10:00:00Z" },
            { "id": 2, "application": null, "resume_application": null, "status": "active",
              "created_at": "2024-03-01T10:00:00Z" },
            { "id": 3, "resume_application": 7, "status": "blocked",
              "created_at": "2024-03-01T10:00:00Z" }
        ]))
        .unwrap();

        let chats = HttpRemote::chats_from_records(records);
        let ids: Vec<ChatId> = chats.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(chats[1].status, ChatStatus::Blocked);
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Transport("reset".into()).is_transient());
        assert!(RemoteError::Status { endpoint: "/x".into(), status: 503, body: String::new() }.is_transient());
        assert!(!RemoteError::Status { endpoint: "/x".into(), status: 400, body: String::new() }.is_transient());
        assert!(!RemoteError::NotFound("/x".into()).is_transient());
    }
}
