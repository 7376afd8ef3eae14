use std::fs::File;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::remote::{RemoteError, RemoteStore, MARKER_PATH};
use crate::token::VersionToken;

/// Google Cloud Storage through the JSON API.
///
/// Object transfers use `client`; the marker uses `marker_client`, which
/// carries the short timeout for the read-before-search check.
pub struct GcsStore {
    endpoint: Url,
    bucket: String,
    token: Option<String>,
    client: Client,
    marker_client: Client,
}

#[derive(Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        token: Option<String>,
        request_timeout: Duration,
        marker_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if endpoint.cannot_be_a_base() {
            anyhow::bail!("gcs endpoint must be an http(s) url: {endpoint}");
        }

        Ok(Self {
            endpoint,
            bucket: bucket.to_string(),
            token,
            client: Client::builder().timeout(request_timeout).build()?,
            marker_client: Client::builder()
                .timeout(marker_timeout)
                .connect_timeout(marker_timeout)
                .build()?,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::InvalidPath(self.endpoint.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, name: &str) -> Result<Url, RemoteError> {
        let name = name.trim_start_matches('/');
        if name.is_empty() {
            return Err(RemoteError::InvalidPath(name.to_string()));
        }
        self.url(&["storage", "v1", "b", &self.bucket, "o", name])
    }

    fn upload_url(&self, name: &str) -> Result<Url, RemoteError> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name.trim_start_matches('/'));
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn fetch(&self, client: &Client, name: &str) -> Result<Response, RemoteError> {
        let mut url = self.object_url(name)?;
        url.query_pairs_mut().append_pair("alt", "media");
        log::debug!("GET {url}");

        let response = self.authorize(client.get(url)).send()?;
        check_status(response, name)
    }
}

fn check_status(response: Response, path: &str) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(RemoteError::NotFound(path.to_string()));
    }

    let body = response.text().unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        path: path.to_string(),
        body,
    })
}

impl RemoteStore for GcsStore {
    fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), RemoteError> {
        let url = self.upload_url(remote_path)?;
        let file = File::open(local_path)?;
        log::debug!("POST {url}");

        let response = self
            .authorize(self.client.post(url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(file)
            .send()?;
        check_status(response, remote_path)?;
        Ok(())
    }

    fn download(&self, remote_path: &str, local_path: &Path) -> Result<(), RemoteError> {
        let mut response = self.fetch(&self.client, remote_path)?;

        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(local_path)?;
        if let Err(err) = response.copy_to(&mut file) {
            drop(file);
            let _ = std::fs::remove_file(local_path);
            return Err(err.into());
        }
        file.sync_all()?;
        Ok(())
    }

    fn delete(&self, remote_path: &str) -> Result<(), RemoteError> {
        let url = self.object_url(remote_path)?;
        log::debug!("DELETE {url}");

        let response = self.authorize(self.client.delete(url)).send()?;
        check_status(response, remote_path)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let mut names = vec![];
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url(&["storage", "v1", "b", &self.bucket, "o"])?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("prefix", prefix.trim_start_matches('/'))
                    .append_pair("fields", "items(name),nextPageToken");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let response = self.authorize(self.client.get(url)).send()?;
            let text = check_status(response, prefix)?.text()?;
            let page: ObjectList = serde_json::from_str(&text).map_err(|err| {
                log::error!("{err}. tried to parse: {text:?}");
                RemoteError::InvalidResponse(err.to_string())
            })?;

            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    fn read_marker(&self) -> Result<Option<VersionToken>, RemoteError> {
        match self.fetch(&self.marker_client, MARKER_PATH) {
            Ok(response) => Ok(VersionToken::parse(&response.text()?)),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write_marker(&self, token: &VersionToken) -> Result<(), RemoteError> {
        let url = self.upload_url(MARKER_PATH)?;
        log::debug!("POST {url}");

        let response = self
            .authorize(self.client.post(url))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(token.as_str().to_string())
            .send()?;
        check_status(response, MARKER_PATH)?;
        Ok(())
    }
}
