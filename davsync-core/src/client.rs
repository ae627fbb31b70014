use std::path::Path;

use futures_util::StreamExt;
use reqwest::header::{CONTENT_TYPE, ETAG};
use reqwest::{Client, Method, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::multistatus::{RemoteFile, RemoteFolder, decode, parse_multistatus};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:prop>
    <d:resourcetype/>
    <d:getetag/>
    <d:getcontentlength/>
    <d:getcontenttype/>
    <d:creationdate/>
    <d:getlastmodified/>
    <oc:id/>
    <oc:fileid/>
    <oc:permissions/>
  </d:prop>
</d:propfind>"#;

#[derive(Debug, Error)]
pub enum DavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot be a base for resource paths")]
    BaseUrl,
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed multistatus: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downloaded {
    pub bytes: u64,
    pub etag: Option<String>,
}

#[derive(Clone)]
pub struct DavClient {
    http: Client,
    base_url: Url,
    base_path: String,
    username: String,
    password: Option<String>,
}

impl DavClient {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: Option<String>,
    ) -> Result<Self, DavError> {
        Self::with_http(Client::new(), base_url, username, password)
    }

    pub fn with_http(
        http: Client,
        base_url: &str,
        username: impl Into<String>,
        password: Option<String>,
    ) -> Result<Self, DavError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(DavError::BaseUrl);
        }
        let base_path = decode(base_url.path())?;
        Ok(Self {
            http,
            base_url,
            base_path,
            username: username.into(),
            password,
        })
    }

    /// Reads the properties of `path` alone (`Depth: 0`).
    pub async fn read_metadata(&self, path: &str) -> Result<RemoteFile, DavError> {
        let mut entries = self.propfind(path, "0").await?;
        if entries.is_empty() {
            return Err(DavError::Malformed(format!("no response entry for {path}")));
        }
        Ok(entries.swap_remove(0))
    }

    /// Reads a folder and its direct children (`Depth: 1`).
    pub async fn read_folder(&self, path: &str) -> Result<RemoteFolder, DavError> {
        let entries = self.propfind(path, "1").await?;
        let wanted = folder_path(path);
        let own = entries
            .iter()
            .position(|entry| entry.path == wanted)
            .unwrap_or(0);
        let mut children = entries;
        if children.is_empty() {
            return Err(DavError::Malformed(format!("no response entry for {path}")));
        }
        let folder = children.remove(own);
        Ok(RemoteFolder { folder, children })
    }

    /// Streams the content of `path` into `target`, creating or truncating it.
    pub async fn download_to(&self, path: &str, target: &Path) -> Result<Downloaded, DavError> {
        let url = self.resource_url(path)?;
        let response = self.authorized(Method::GET, url).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let etag = header_etag(&response);

        let mut file = tokio::fs::File::create(target).await?;
        let mut stream = response.bytes_stream();
        let mut bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(Downloaded { bytes, etag })
    }

    /// Uploads `source` to `path`, returning the new version token when the server sends one.
    pub async fn upload_from(&self, path: &str, source: &Path) -> Result<Option<String>, DavError> {
        let url = self.resource_url(path)?;
        let file = tokio::fs::File::open(source).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let response = self.authorized(Method::PUT, url).body(body).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(header_etag(&response))
    }

    async fn propfind(&self, path: &str, depth: &str) -> Result<Vec<RemoteFile>, DavError> {
        let url = self.resource_url(path)?;
        let method =
            Method::from_bytes(b"PROPFIND").map_err(|err| DavError::Malformed(err.to_string()))?;
        let response = self
            .authorized(method, url)
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let body = response.text().await?;
        parse_multistatus(&body, &self.base_path)
    }

    fn authorized(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, self.password.as_deref())
    }

    /// Maps a `/`-separated remote path under the DAV root, percent-encoding each segment.
    pub fn resource_url(&self, path: &str) -> Result<Url, DavError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| DavError::BaseUrl)?;
            segments.pop_if_empty();
            for part in path.split('/').filter(|part| !part.is_empty()) {
                segments.push(part);
            }
            if path.ends_with('/') {
                segments.push("");
            }
        }
        Ok(url)
    }

    async fn api_error(response: reqwest::Response) -> DavError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        DavError::Api { status, body }
    }
}

impl DavError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DavError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DavError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DavError::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::LOCKED | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn folder_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        format!("{trimmed}/")
    } else {
        format!("/{trimmed}/")
    }
}

fn header_etag(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_url_encodes_segments_and_keeps_folder_slash() {
        let client = DavClient::new("https://cloud.example/remote.php/webdav", "u", None).unwrap();
        let url = client.resource_url("/My Docs/a#1.txt").unwrap();
        assert_eq!(
            url.as_str(),
            "https://cloud.example/remote.php/webdav/My%20Docs/a%231.txt"
        );
        let url = client.resource_url("/My Docs/").unwrap();
        assert_eq!(url.as_str(), "https://cloud.example/remote.php/webdav/My%20Docs/");
        let root = client.resource_url("/").unwrap();
        assert_eq!(root.as_str(), "https://cloud.example/remote.php/webdav/");
    }

    #[test]
    fn not_found_is_classified_permanent() {
        let err = DavError::Api {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.classification(), Some(ApiErrorClass::Permanent));
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = DavError::Api {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn folder_path_normalizes_slashes() {
        assert_eq!(folder_path("/"), "/");
        assert_eq!(folder_path("/docs"), "/docs/");
        assert_eq!(folder_path("docs/"), "/docs/");
    }
}
