//! Typed HTTP layer over the `/api/v1` routes.
//!
//! [`ApiClient`] never holds a credential of its own: every authenticated
//! call takes the bearer token from its caller, and the client never touches
//! session state.

use std::time::Duration;

use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{Chat, ChatId, Message, MessageId, MessageKind, User},
    error::ApiError,
    protocol::{
        ChatMessagesResponse, ChatsResponse, LoginRequest, LoginResponse, RegisterRequest,
        RegisterResponse, SendMessageRequest, SendMessageResponse,
    },
};
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let parsed = Url::parse(base_url).map_err(|_| ApiError::InvalidUrl)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ApiError::InvalidUrl);
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ApiError::NetworkError(err.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Url::parse(&format!("{}{path}", self.base_url)).map_err(|_| ApiError::InvalidUrl)
    }

    /// Sends one JSON request and decodes the typed response.
    ///
    /// The `Authorization` header is set only when `bearer` is provided.
    pub async fn request<R, B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        bearer: Option<&str>,
    ) -> Result<R, ApiError>
    where
        R: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            let encoded = serde_json::to_vec(body).map_err(|_| ApiError::EncodingError)?;
            request = request.body(encoded);
        }

        let response = request.send().await.map_err(|err| {
            warn!(%method, path, error = %err, "api: transport failure");
            ApiError::NetworkError(err.to_string())
        })?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ApiError::NetworkError(err.to_string()))?;

        if let Some(err) = ApiError::from_status(status, &bytes) {
            debug!(%method, path, status, "api: request rejected");
            return Err(err);
        }

        serde_json::from_slice(&bytes).map_err(|err| {
            warn!(%method, path, error = %err, "api: response did not match expected shape");
            ApiError::DecodingError
        })
    }

    async fn get<R: DeserializeOwned>(&self, path: &str, bearer: &str) -> Result<R, ApiError> {
        self.request::<R, ()>(Method::GET, path, None, Some(bearer))
            .await
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        self.request(Method::POST, "/auth/login", Some(&body), None)
            .await
    }

    pub async fn register(&self, body: &RegisterRequest) -> Result<RegisterResponse, ApiError> {
        self.request(Method::POST, "/auth/register", Some(body), None)
            .await
    }

    pub async fn profile(&self, bearer: &str) -> Result<User, ApiError> {
        self.get("/users/profile", bearer).await
    }

    pub async fn list_chats(&self, bearer: &str) -> Result<ChatsResponse, ApiError> {
        self.get("/chats", bearer).await
    }

    pub async fn chat(&self, chat_id: ChatId, bearer: &str) -> Result<Chat, ApiError> {
        self.get(&format!("/chats/{}", chat_id.0), bearer).await
    }

    pub async fn chat_messages(
        &self,
        chat_id: ChatId,
        bearer: &str,
    ) -> Result<ChatMessagesResponse, ApiError> {
        self.get(&format!("/messages/chat/{}", chat_id.0), bearer)
            .await
    }

    pub async fn send_message(
        &self,
        content: &str,
        kind: MessageKind,
        chat_id: ChatId,
        reply_to_id: Option<MessageId>,
        bearer: &str,
    ) -> Result<Message, ApiError> {
        let body = SendMessageRequest {
            content: content.to_string(),
            kind,
            chat_id,
            reply_to_id,
        };
        let response: SendMessageResponse = self
            .request(Method::POST, "/messages", Some(&body), Some(bearer))
            .await?;
        Ok(response.data)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
