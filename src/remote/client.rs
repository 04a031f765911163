use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::{Result, SyncError};

use super::api_types::{ApiDocument, ApiProgress, ApiProgressUpdate};
use super::types::{DocumentMeta, ProgressAck, ProgressState};
use super::RemoteService;

/// HTTP client for the sheaf document service.
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_base(
      config.server.url.clone(),
      Config::get_api_token(),
      Duration::from_secs(config.server.timeout_secs),
    )
  }

  pub fn with_base(base: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  /// Append path segments below the base URL. Each segment is
  /// percent-encoded, so ids containing `/`, `?` or `#` stay one segment.
  fn endpoint(&self, segments: &[&str]) -> Result<Url> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| SyncError::Config(format!("Server URL cannot be a base: {}", self.base)))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response> {
    let response = self.authorized(request).send().await?;
    check_status(response).await
  }
}

/// Map non-success statuses onto the error taxonomy: 4xx is an explicit
/// rejection, anything else is treated as the service being unreachable.
async fn check_status(response: Response) -> Result<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  let message = response.text().await.unwrap_or_default();
  if status.is_client_error() {
    Err(SyncError::Rejected {
      status: status.as_u16(),
      message,
    })
  } else {
    Err(SyncError::RemoteUnreachable(format!(
      "server error {}: {}",
      status, message
    )))
  }
}

#[async_trait]
impl RemoteService for HttpRemote {
  async fn fetch_binary(&self, document_id: &str) -> Result<Vec<u8>> {
    let url = self.endpoint(&["api", "documents", document_id, "view"])?;
    debug!(%url, "fetching document content");

    let response = self.send(self.client.get(url)).await?;
    let bytes = response.bytes().await?;
    Ok(bytes.to_vec())
  }

  async fn write_progress(&self, document_id: &str, state: ProgressState) -> Result<ProgressAck> {
    let url = self.endpoint(&["api", "reading-progress", document_id])?;
    let body = ApiProgressUpdate::from(state);

    let response = self.send(self.client.put(url).json(&body)).await?;
    let progress: ApiProgress = response.json().await?;
    Ok(progress.into())
  }

  async fn fetch_document_metadata(&self, document_id: &str) -> Result<DocumentMeta> {
    let url = self.endpoint(&["api", "documents", document_id])?;

    let response = self.send(self.client.get(url)).await?;
    let doc: ApiDocument = response.json().await?;
    Ok(doc.into())
  }

  async fn fetch_progress(&self, document_id: &str) -> Result<Option<ProgressAck>> {
    let url = self.endpoint(&["api", "reading-progress", document_id])?;

    let response = match self.send(self.client.get(url)).await {
      Ok(response) => response,
      Err(SyncError::Rejected { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
        return Ok(None)
      }
      Err(e) => return Err(e),
    };
    let progress: Option<ApiProgress> = response.json().await?;
    Ok(progress.map(ProgressAck::from))
  }

  async fn probe(&self) -> Result<()> {
    let url = self.endpoint(&["health"])?;
    self.client.get(url).send().await?.error_for_status()?;
    Ok(())
  }
}
