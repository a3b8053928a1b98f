use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.driveback.example";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// Interchange formats a proprietary document can be materialized into.
/// The provider performs the export server-side; the declared byte size of
/// such a file already reflects the exported representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Document,
    Spreadsheet,
    Presentation,
    Drawing,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Document => "docx",
            ExportFormat::Spreadsheet => "xlsx",
            ExportFormat::Presentation => "pptx",
            ExportFormat::Drawing => "png",
        }
    }
}

#[derive(Clone)]
pub struct SourceClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl SourceClient {
    pub fn new(token: impl Into<String>) -> Result<Self, SourceError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, SourceError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// One page of files changed since the given unix timestamp.
    pub async fn list_changed(
        &self,
        since: i64,
        page_token: Option<&str>,
    ) -> Result<ChangePage, SourceError> {
        let mut url = self.endpoint("/v1/files/changes")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("since", &since.to_string());
            if let Some(token) = page_token {
                query.append_pair("page_token", token);
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Drains every change page since the given unix timestamp.
    pub async fn list_changed_all(&self, since: i64) -> Result<Vec<RemoteFile>, SourceError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.list_changed(since, page_token.as_deref()).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(files)
    }

    pub async fn get_file(&self, file_id: &str) -> Result<RemoteFile, SourceError> {
        let url = self.endpoint(&format!("/v1/files/{file_id}"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Resolves a short-lived download href for the file's content. For
    /// proprietary documents the export format selects the materialized
    /// representation the href serves.
    pub async fn get_download_link(
        &self,
        file_id: &str,
        export: Option<ExportFormat>,
    ) -> Result<TransferLink, SourceError> {
        let mut url = self.endpoint(&format!("/v1/files/{file_id}/download"))?;
        if let Some(format) = export {
            url.query_pairs_mut()
                .append_pair("export", format.extension());
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SourceError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(SourceError::Api { status, body })
        }
    }
}

impl SourceError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            SourceError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

pub fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    /// Slash-separated, provider-relative ("/Archive/2024/scan.pdf").
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub export: Option<ExportFormat>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChangePage {
    pub files: Vec<RemoteFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TransferLink {
    pub href: Url,
    pub method: String,
    #[serde(default)]
    pub templated: bool,
}
