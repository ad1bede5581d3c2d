//! Remote source access: cheap revision checks and cache-aware downloads.

use std::io::Write;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use regex::Regex;
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{ETAG, HeaderMap, HeaderName, HeaderValue, LAST_MODIFIED, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::HttpSettings;
use crate::domain::{RevisionMarker, SourceId};
use crate::error::DataError;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// File name under the data directory.
    pub name: String,
    pub url: String,
    /// Historical files that never change upstream; fetched only when missing.
    #[serde(default)]
    pub frozen: bool,
}

impl RemoteFile {
    pub fn new(name: &str, url: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            url: url.into(),
            frozen: false,
        }
    }

    pub fn frozen(name: &str, url: impl Into<String>) -> Self {
        Self {
            frozen: true,
            ..Self::new(name, url)
        }
    }
}

/// A way of learning the upstream revision without downloading the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RevisionProbe {
    /// Latest commit id from the GitHub commits API.
    GithubCommit { api_url: String },
    /// First capture group of `pattern` on a web page.
    PageScrape { page_url: String, pattern: String },
    /// A query parameter of the first link on a page matching `link_pattern`.
    LinkQueryParam {
        page_url: String,
        link_pattern: String,
        param: String,
    },
    /// `ETag`, else `Last-Modified`, from a HEAD request.
    LastModified { url: String },
}

#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub id: SourceId,
    pub files: Vec<RemoteFile>,
    /// Tried in order; the first probe that yields a marker wins.
    pub probes: Vec<RevisionProbe>,
}

impl SourceSpec {
    pub fn new(id: SourceId, files: Vec<RemoteFile>, probes: Vec<RevisionProbe>) -> Self {
        Self { id, files, probes }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadInfo {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum DownloadAction {
    Cached,
    Downloaded { bytes: u64 },
}

pub trait Fetcher: Send + Sync {
    fn fetch_text(&self, url: &str) -> Result<String, DataError>;
    fn fetch_head(&self, url: &str) -> Result<HeadInfo, DataError>;
    /// Streams the body of `url` into `sink`, returning the byte count.
    fn fetch_into(&self, url: &str, sink: &mut dyn Write) -> Result<u64, DataError>;
}

/// Asks each probe of `source` in turn for the upstream revision. Has no side
/// effects, so repeated calls agree while upstream is unchanged.
pub fn check_revision<F: Fetcher + ?Sized>(
    fetcher: &F,
    source: &SourceSpec,
) -> Result<RevisionMarker, DataError> {
    let mut last_error = None;
    for probe in &source.probes {
        match probe_revision(fetcher, probe) {
            Ok(marker) => return Ok(marker),
            Err(err) => {
                debug!("revision probe for {} failed: {err}", source.id);
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        DataError::ConfigInvalid(format!("source {} has no revision probes", source.id))
    }))
}

pub fn probe_revision<F: Fetcher + ?Sized>(
    fetcher: &F,
    probe: &RevisionProbe,
) -> Result<RevisionMarker, DataError> {
    match probe {
        RevisionProbe::GithubCommit { api_url } => {
            let body = fetcher.fetch_text(api_url)?;
            let json: Value = serde_json::from_str(&body).map_err(|err| DataError::Fetch {
                url: api_url.clone(),
                message: format!("invalid JSON: {err}"),
            })?;
            json.get("sha")
                .and_then(Value::as_str)
                .map(RevisionMarker::new)
                .ok_or_else(|| DataError::RevisionNotFound {
                    url: api_url.clone(),
                })
        }
        RevisionProbe::PageScrape { page_url, pattern } => {
            let regex = compile(pattern)?;
            let page = fetcher.fetch_text(page_url)?;
            regex
                .captures(&page)
                .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|found| RevisionMarker::new(found.as_str()))
                .ok_or_else(|| DataError::RevisionNotFound {
                    url: page_url.clone(),
                })
        }
        RevisionProbe::LinkQueryParam {
            page_url,
            link_pattern,
            param,
        } => {
            let regex = compile(link_pattern)?;
            let page = fetcher.fetch_text(page_url)?;
            let not_found = || DataError::RevisionNotFound {
                url: page_url.clone(),
            };
            let link = regex.find(&page).ok_or_else(not_found)?.as_str().replace("&amp;", "&");
            let base = Url::parse(page_url).map_err(|err| DataError::Fetch {
                url: page_url.clone(),
                message: err.to_string(),
            })?;
            let link = base.join(&link).map_err(|_| not_found())?;
            link.query_pairs()
                .find(|(key, _)| key == param)
                .map(|(_, value)| RevisionMarker::new(value.into_owned()))
                .filter(|marker| !marker.is_empty())
                .ok_or_else(not_found)
        }
        RevisionProbe::LastModified { url } => {
            let head = fetcher.fetch_head(url)?;
            head.etag
                .or(head.last_modified)
                .map(RevisionMarker::new)
                .ok_or_else(|| DataError::RevisionNotFound { url: url.clone() })
        }
    }
}

/// Writes `file` to `destination` unless it is already there and `force` is
/// off. The body goes to a temp file first so a failed transfer leaves any
/// previous copy intact.
pub fn download<F: Fetcher + ?Sized>(
    fetcher: &F,
    file: &RemoteFile,
    destination: &Utf8Path,
    force: bool,
) -> Result<DownloadAction, DataError> {
    if destination.as_std_path().exists() && !force {
        return Ok(DownloadAction::Cached);
    }
    debug!("{} => {destination}", file.url);
    let mut temp = Store::temp_file_for(destination)?;
    let bytes = fetcher.fetch_into(&file.url, &mut temp)?;
    temp.flush()
        .map_err(|err| DataError::Filesystem(err.to_string()))?;
    Store::persist(temp, destination)?;
    Ok(DownloadAction::Downloaded { bytes })
}

fn compile(pattern: &str) -> Result<Regex, DataError> {
    Regex::new(pattern)
        .map_err(|err| DataError::ConfigInvalid(format!("invalid revision pattern: {err}")))
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    retries: usize,
}

impl HttpFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self, DataError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("scot-covid19/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DataError::ConfigInvalid(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout.min(Duration::from_secs(15)))
            .build()
            .map_err(|err| DataError::Fetch {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            retries: settings.retries,
        })
    }

    fn handle_status(
        url: &str,
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, DataError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "request failed".to_string());
        Err(DataError::FetchStatus {
            url: url.to_string(),
            status,
            message: truncate(&message, 200),
        })
    }

    fn send_with_retries<R>(
        &self,
        url: &str,
        mut make_req: R,
    ) -> Result<reqwest::blocking::Response, DataError>
    where
        R: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.retries && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Self::handle_status(url, resp);
                }
                Err(err) => {
                    if attempt < self.retries && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(DataError::Fetch {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_text(&self, url: &str) -> Result<String, DataError> {
        let response = self.send_with_retries(url, || self.client.get(url))?;
        response.text().map_err(|err| DataError::Fetch {
            url: url.to_string(),
            message: err.to_string(),
        })
    }

    fn fetch_head(&self, url: &str) -> Result<HeadInfo, DataError> {
        let response = self.send_with_retries(url, || self.client.head(url))?;
        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim_matches('"').to_string())
        };
        Ok(HeadInfo {
            etag: header(ETAG),
            last_modified: header(LAST_MODIFIED),
        })
    }

    fn fetch_into(&self, url: &str, sink: &mut dyn Write) -> Result<u64, DataError> {
        let mut response = self.send_with_retries(url, || self.client.get(url))?;
        std::io::copy(&mut response, sink).map_err(|err| DataError::Fetch {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

fn truncate(message: &str, limit: usize) -> String {
    match message.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &message[..idx]),
        None => message.to_string(),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;

    #[derive(Default)]
    struct MockFetcher {
        pages: HashMap<String, String>,
        heads: HashMap<String, HeadInfo>,
        downloads: Mutex<usize>,
    }

    impl Fetcher for MockFetcher {
        fn fetch_text(&self, url: &str) -> Result<String, DataError> {
            self.pages.get(url).cloned().ok_or_else(|| DataError::FetchStatus {
                url: url.to_string(),
                status: 404,
                message: "not found".to_string(),
            })
        }

        fn fetch_head(&self, url: &str) -> Result<HeadInfo, DataError> {
            self.heads.get(url).cloned().ok_or_else(|| DataError::Fetch {
                url: url.to_string(),
                message: "unreachable".to_string(),
            })
        }

        fn fetch_into(&self, url: &str, sink: &mut dyn Write) -> Result<u64, DataError> {
            *self.downloads.lock().unwrap() += 1;
            let body = self.fetch_text(url)?;
            sink.write_all(body.as_bytes()).unwrap();
            Ok(body.len() as u64)
        }
    }

    fn mobility_spec() -> SourceSpec {
        SourceSpec::new(
            SourceId::Mobility,
            vec![],
            vec![
                RevisionProbe::LinkQueryParam {
                    page_url: "https://example.org/mobility/".to_string(),
                    link_pattern: r"https://cdn\.example\.org/report\.csv\?[^\x22\s]+".to_string(),
                    param: "cachebust".to_string(),
                },
                RevisionProbe::PageScrape {
                    page_url: "https://example.org/mobility/".to_string(),
                    pattern: r"Reports created (\d{4}-\d{2}-\d{2})".to_string(),
                },
            ],
        )
    }

    #[test]
    fn github_probe_reads_sha() {
        let mut fetcher = MockFetcher::default();
        fetcher.pages.insert(
            "https://api.example.org/commits/master".to_string(),
            r#"{"sha": "0123abcd", "commit": {}}"#.to_string(),
        );
        let probe = RevisionProbe::GithubCommit {
            api_url: "https://api.example.org/commits/master".to_string(),
        };
        let marker = probe_revision(&fetcher, &probe).unwrap();
        assert_eq!(marker.as_str(), "0123abcd");
    }

    #[test]
    fn link_probe_wins_when_present() {
        let mut fetcher = MockFetcher::default();
        fetcher.pages.insert(
            "https://example.org/mobility/".to_string(),
            r#"<a href="https://cdn.example.org/report.csv?cachebust=9f2e&amp;x=1">csv</a>
               Reports created 2020-06-01"#
                .to_string(),
        );
        let marker = check_revision(&fetcher, &mobility_spec()).unwrap();
        assert_eq!(marker.as_str(), "9f2e");
    }

    #[test]
    fn scrape_probe_is_the_fallback() {
        let mut fetcher = MockFetcher::default();
        fetcher.pages.insert(
            "https://example.org/mobility/".to_string(),
            "<p>Reports created 2020-06-01.</p>".to_string(),
        );
        let first = check_revision(&fetcher, &mobility_spec()).unwrap();
        let second = check_revision(&fetcher, &mobility_spec()).unwrap();
        assert_eq!(first.as_str(), "2020-06-01");
        assert_eq!(first, second);
        assert_eq!(*fetcher.downloads.lock().unwrap(), 0);
    }

    #[test]
    fn last_error_surfaces_when_every_probe_fails() {
        let fetcher = MockFetcher::default();
        let err = check_revision(&fetcher, &mobility_spec()).unwrap_err();
        assert_matches!(err, DataError::FetchStatus { status: 404, .. });
    }

    #[test]
    fn head_probe_prefers_etag() {
        let mut fetcher = MockFetcher::default();
        fetcher.heads.insert(
            "https://example.org/cases.csv".to_string(),
            HeadInfo {
                etag: Some("W/abc".to_string()),
                last_modified: Some("Tue, 02 Jun 2020 10:00:00 GMT".to_string()),
            },
        );
        let probe = RevisionProbe::LastModified {
            url: "https://example.org/cases.csv".to_string(),
        };
        assert_eq!(probe_revision(&fetcher, &probe).unwrap().as_str(), "W/abc");
    }

    #[test]
    fn download_skips_existing_file_unless_forced() {
        let temp = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::from_path_buf(temp.path().join("cases.csv")).unwrap();
        let mut fetcher = MockFetcher::default();
        fetcher
            .pages
            .insert("https://example.org/cases.csv".to_string(), "Date\n".to_string());
        let file = RemoteFile::new("cases.csv", "https://example.org/cases.csv");

        let first = download(&fetcher, &file, &dest, false).unwrap();
        assert_eq!(first, DownloadAction::Downloaded { bytes: 5 });
        let second = download(&fetcher, &file, &dest, false).unwrap();
        assert_eq!(second, DownloadAction::Cached);
        let forced = download(&fetcher, &file, &dest, true).unwrap();
        assert_matches!(forced, DownloadAction::Downloaded { .. });
        assert_eq!(*fetcher.downloads.lock().unwrap(), 2);
    }

    #[test]
    fn failed_download_keeps_previous_copy() {
        let temp = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::from_path_buf(temp.path().join("cases.csv")).unwrap();
        std::fs::write(dest.as_std_path(), "previous").unwrap();
        let fetcher = MockFetcher::default();
        let file = RemoteFile::new("cases.csv", "https://example.org/missing.csv");

        let err = download(&fetcher, &file, &dest, true).unwrap_err();
        assert_matches!(err, DataError::FetchStatus { .. });
        assert_eq!(std::fs::read_to_string(dest.as_std_path()).unwrap(), "previous");
    }
}
