//! HTTP implementation of the Remote Gateway against the serverless proxy that
//! fronts the spreadsheet and the file store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{AppendReceipt, MediaUpload, RemoteError, RemoteGateway, SheetRow, UploadedMedia};

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    /// Base URL of the proxy functions, e.g. `https://example.org/.netlify/functions/`
    pub base_url: String,
    pub sheets_write_path: String,
    pub media_upload_path: String,
    /// Separate sharing endpoint. When absent the upload endpoint shares files itself.
    pub media_public_path: Option<String>,
    pub max_media_bytes: usize,
}

impl HttpGatewayConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            sheets_write_path: "compost-sheets-write".to_string(),
            media_upload_path: "compost-media-upload".to_string(),
            media_public_path: None,
            max_media_bytes: super::DEFAULT_MEDIA_MAX_BYTES,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteRequest<'a> {
    /// System id; the proxy maps it to the sheet tab
    tab: &'a str,
    #[serde(flatten)]
    row: &'a SheetRow,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteResponse {
    updated_range: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest<'a> {
    media_data: String,
    mime_type: &'a str,
    filename: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    file_id: Option<String>,
    web_view_link: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublicRequest<'a> {
    file_id: &'a str,
}

pub struct HttpGateway {
    config: HttpGatewayConfig,
    base_url: Url,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGateway")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, RemoteError> {
        if config.base_url.trim().is_empty() {
            return Err(RemoteError::Configuration(
                "gateway base URL is empty".to_string(),
            ));
        }

        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| RemoteError::Configuration(format!("invalid base URL {}: {}", base, e)))?;

        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| RemoteError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            base_url,
            http_client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| RemoteError::Configuration(format!("invalid endpoint {}: {}", path, e)))
    }

    /// POSTs a JSON body and returns the response text of a successful call.
    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &B,
        payload_size: usize,
    ) -> Result<String, RemoteError> {
        let response = self
            .http_client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(format!("reading response body failed: {}", e)))?;

        if status.is_success() {
            return Ok(text);
        }

        let detail = error_detail(&text);
        tracing::debug!("POST {} returned {}: {}", url, status, detail);

        Err(match status.as_u16() {
            413 => RemoteError::PayloadTooLarge {
                size: payload_size,
                limit: self.config.max_media_bytes,
            },
            400 => RemoteError::Validation(detail),
            code => RemoteError::Status {
                status: code,
                body: detail,
            },
        })
    }
}

/// Pulls `details` or `error` out of a JSON error body, falling back to the raw text.
fn error_detail(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => {
            let error = value.get("error").and_then(|v| v.as_str());
            let details = value.get("details").and_then(|v| v.as_str());
            match (error, details) {
                (Some(error), Some(details)) => format!("{}: {}", error, details),
                (Some(error), None) => error.to_string(),
                (None, Some(details)) => details.to_string(),
                (None, None) => body.to_string(),
            }
        }
        Err(_) => body.to_string(),
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn append_reading_row(
        &self,
        system_id: &str,
        row: &SheetRow,
    ) -> Result<AppendReceipt, RemoteError> {
        if system_id.trim().is_empty() {
            return Err(RemoteError::Configuration(
                "missing system id for reading row".to_string(),
            ));
        }

        let url = self.endpoint(&self.config.sheets_write_path)?;
        let request = WriteRequest {
            tab: system_id,
            row,
        };
        let text = self.post_json(url, &request, 0).await?;

        let response: WriteResponse = serde_json::from_str(&text).map_err(|e| {
            RemoteError::InvalidResponse(format!("sheet write response: {} - {}", e, text))
        })?;

        tracing::debug!(
            "Appended {} row at {:?}",
            system_id,
            response.updated_range.as_deref()
        );

        Ok(AppendReceipt {
            updated_range: response.updated_range,
        })
    }

    async fn upload_media(&self, upload: &MediaUpload) -> Result<UploadedMedia, RemoteError> {
        if upload.filename.trim().is_empty() || upload.bytes.is_empty() {
            return Err(RemoteError::Validation(
                "missing required fields: mediaData, filename".to_string(),
            ));
        }
        if upload.bytes.len() > self.config.max_media_bytes {
            return Err(RemoteError::PayloadTooLarge {
                size: upload.bytes.len(),
                limit: self.config.max_media_bytes,
            });
        }

        let url = self.endpoint(&self.config.media_upload_path)?;
        let body = UploadRequest {
            media_data: base64::encode(&upload.bytes),
            mime_type: &upload.mime_type,
            filename: &upload.filename,
        };
        let text = self.post_json(url, &body, upload.bytes.len()).await?;

        let response: UploadResponse = serde_json::from_str(&text).map_err(|e| {
            RemoteError::InvalidResponse(format!("media upload response: {} - {}", e, text))
        })?;

        match (response.file_id, response.web_view_link) {
            (Some(remote_id), Some(view_url)) => Ok(UploadedMedia {
                remote_id,
                view_url,
            }),
            _ => Err(RemoteError::InvalidResponse(format!(
                "media upload response missing fileId or webViewLink: {}",
                text
            ))),
        }
    }

    async fn make_public(&self, remote_id: &str) -> Result<(), RemoteError> {
        let Some(path) = self.config.media_public_path.as_deref() else {
            tracing::debug!("Upload endpoint shares files itself, skipping share for {}", remote_id);
            return Ok(());
        };

        let url = self.endpoint(path)?;
        self.post_json(url, &PublicRequest { file_id: remote_id }, 0)
            .await?;
        Ok(())
    }
}
