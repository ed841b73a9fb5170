//! Client for the peer instance's project API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("peer returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("invalid peer url {0}")]
    InvalidUrl(String),
}

/// Project as the peer sees it. `backend_id` holds the local project id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProject {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub backend_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPeerProject {
    pub name: String,
    pub description: String,
    pub backend_id: String,
    pub customer: String,
}

/// One user's grant in a peer project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPermission {
    pub username: String,
    pub role: String,
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct UserRef<'a> {
    username: &'a str,
    role: &'a str,
}

#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Peer project whose `backend_id` is the given local project id.
    async fn find_project(&self, backend_id: &str) -> Result<Option<PeerProject>, PeerError>;

    async fn create_project(&self, project: &NewPeerProject) -> Result<PeerProject, PeerError>;

    async fn list_permissions(&self, project_uuid: &str) -> Result<Vec<PeerPermission>, PeerError>;

    async fn add_permission(
        &self,
        project_uuid: &str,
        permission: &PeerPermission,
    ) -> Result<(), PeerError>;

    async fn update_permission(
        &self,
        project_uuid: &str,
        permission: &PeerPermission,
    ) -> Result<(), PeerError>;

    async fn remove_permission(
        &self,
        project_uuid: &str,
        username: &str,
        role: &str,
    ) -> Result<(), PeerError>;
}

/// `PeerClient` over the peer's REST API with token authentication.
pub struct HttpPeerClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpPeerClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, PeerError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(PeerError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            client: Client::new(),
            base_url: base_url.to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Token {}", self.token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, PeerError> {
        let response = self.authorized(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PeerError::Api { status, body })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, PeerError> {
        Ok(self.send(request).await?.json().await?)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn find_project(&self, backend_id: &str) -> Result<Option<PeerProject>, PeerError> {
        let request = self
            .client
            .get(self.url("/api/projects/"))
            .query(&[("backend_id", backend_id)]);
        let projects: Vec<PeerProject> = self.send_json(request).await?;
        Ok(projects.into_iter().find(|p| p.backend_id == backend_id))
    }

    async fn create_project(&self, project: &NewPeerProject) -> Result<PeerProject, PeerError> {
        debug!(backend_id = %project.backend_id, name = %project.name, "Creating peer project");
        let request = self.client.post(self.url("/api/projects/")).json(project);
        self.send_json(request).await
    }

    async fn list_permissions(&self, project_uuid: &str) -> Result<Vec<PeerPermission>, PeerError> {
        let request = self
            .client
            .get(self.url(&format!("/api/projects/{}/list_users/", project_uuid)));
        self.send_json(request).await
    }

    async fn add_permission(
        &self,
        project_uuid: &str,
        permission: &PeerPermission,
    ) -> Result<(), PeerError> {
        let request = self
            .client
            .post(self.url(&format!("/api/projects/{}/add_user/", project_uuid)))
            .json(permission);
        self.send(request).await.map(|_| ())
    }

    async fn update_permission(
        &self,
        project_uuid: &str,
        permission: &PeerPermission,
    ) -> Result<(), PeerError> {
        let request = self
            .client
            .post(self.url(&format!("/api/projects/{}/update_user/", project_uuid)))
            .json(permission);
        self.send(request).await.map(|_| ())
    }

    async fn remove_permission(
        &self,
        project_uuid: &str,
        username: &str,
        role: &str,
    ) -> Result<(), PeerError> {
        let request = self
            .client
            .post(self.url(&format!("/api/projects/{}/delete_user/", project_uuid)))
            .json(&UserRef { username, role });
        self.send(request).await.map(|_| ())
    }
}
