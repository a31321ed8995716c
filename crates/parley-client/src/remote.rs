use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use parley_types::api::{
    BalanceResponse, ErrorBody, MessageQuery, SendMessageRequest, SendMessageResponse,
    UnlockResponse,
};
use parley_types::models::Message;

use crate::error::ClientError;

/// The server's REST surface as seen by the client.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Messages ascending by `created_at`.
    async fn fetch(&self, chat_id: &str, query: &MessageQuery) -> Result<Vec<Message>, ClientError>;

    async fn send(
        &self,
        chat_id: &str,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, ClientError>;

    async fn mark_read(&self, chat_id: &str) -> Result<(), ClientError>;

    async fn unlock(&self, chat_id: &str, message_id: &str) -> Result<UnlockResponse, ClientError>;

    async fn balance(&self) -> Result<i64, ClientError>;
}

pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.token))
    }

    async fn json<T: DeserializeOwned>(&self, resp: Response) -> Result<T, ClientError> {
        let resp = check(resp).await?;
        Ok(resp.json().await?)
    }
}

/// Turn a non-2xx response into a typed error.
async fn check(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    debug!("Request failed with {}", status);
    match resp.json::<ErrorBody>().await {
        Ok(body) => Err(ClientError::from_body(body)),
        Err(_) => Err(match status {
            StatusCode::UNAUTHORIZED => ClientError::Unauthorized,
            StatusCode::FORBIDDEN => ClientError::Forbidden,
            StatusCode::NOT_FOUND => ClientError::NotFound,
            _ => ClientError::Transient(format!("server returned {}", status)),
        }),
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch(&self, chat_id: &str, query: &MessageQuery) -> Result<Vec<Message>, ClientError> {
        let resp = self
            .authed(self.client.get(self.url(&format!("/chats/{}/messages", chat_id))))
            .query(query)
            .send()
            .await?;
        self.json(resp).await
    }

    async fn send(
        &self,
        chat_id: &str,
        request: SendMessageRequest,
    ) -> Result<SendMessageResponse, ClientError> {
        let resp = self
            .authed(self.client.post(self.url(&format!("/chats/{}/messages", chat_id))))
            .json(&request)
            .send()
            .await?;
        self.json(resp).await
    }

    async fn mark_read(&self, chat_id: &str) -> Result<(), ClientError> {
        let resp = self
            .authed(self.client.post(self.url(&format!("/chats/{}/read", chat_id))))
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    async fn unlock(&self, chat_id: &str, message_id: &str) -> Result<UnlockResponse, ClientError> {
        let path = format!("/chats/{}/messages/{}/unlock", chat_id, message_id);
        let resp = self.authed(self.client.post(self.url(&path))).send().await?;
        self.json(resp).await
    }

    async fn balance(&self) -> Result<i64, ClientError> {
        let resp = self.authed(self.client.get(self.url("/wallet"))).send().await?;
        let body: BalanceResponse = self.json(resp).await?;
        Ok(body.balance)
    }
}
