//! WebDAV drive client backed by `ureq`.
//!
//! Listing and stat go through PROPFIND with `quick-xml` parsing of the
//! multistatus body. Consumer NAS servers disagree on which methods they
//! support, so the connectivity probe walks a fallback chain (OPTIONS, HEAD,
//! root existence, root listing) before declaring a server unreachable.
//! Entry names are returned exactly as the server produced them; encoding
//! reconciliation is the adapter's job.

use std::io::Read;
use std::time::Duration;

use base64::Engine;
use log::debug;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::backends::{DriveClient, RemoteEntry, RemoteFileStat};
use crate::protocol::{DriveConfig, DriveKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(15);
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:displayname/>
    <d:getcontentlength/>
    <d:getlastmodified/>
    <d:resourcetype/>
  </d:prop>
</d:propfind>"#;

pub struct WebdavClient {
    http_client: ureq::Agent,
    /// Base URL without trailing slash, e.g. `https://nas.local/dav`.
    base_url: String,
    /// Path portion of `base_url`, used to strip href prefixes.
    base_path: String,
    auth_header: Option<String>,
}

/// One `<d:response>` block from a multistatus body.
#[derive(Debug, Default, Clone)]
struct DavResponse {
    href: String,
    content_length: Option<u64>,
    last_modified: Option<String>,
    is_collection: bool,
}

impl WebdavClient {
    pub fn new(config: &DriveConfig) -> Result<Self, String> {
        let base_url = config.host.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(format!("webdav drive '{}' has an empty url", config.id));
        }
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(format!(
                "webdav drive '{}' url must start with http:// or https://",
                config.id
            ));
        }

        let after_scheme = base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&base_url);
        let base_path = after_scheme
            .split_once('/')
            .map(|(_, path)| format!("/{path}"))
            .unwrap_or_default();

        let auth_header = if config.username.trim().is_empty() {
            None
        } else {
            let credentials = format!("{}:{}", config.username, config.password);
            let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
            Some(format!("Basic {encoded}"))
        };

        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .timeout_write(WRITE_TIMEOUT)
            .build();

        Ok(Self {
            http_client,
            base_url,
            base_path,
            auth_header,
        })
    }

    fn request(&self, method: &str, url: &str) -> ureq::Request {
        let mut request = self.http_client.request(method, url);
        if let Some(auth) = &self.auth_header {
            request = request.set("Authorization", auth);
        }
        request
    }

    /// Builds the request URL for a drive-relative path.
    ///
    /// Segments that came back from a listing are already in server form and
    /// pass through untouched; raw segments get percent-encoded so the
    /// request line stays valid.
    fn url_for(&self, path: &str) -> String {
        let rel = path.trim_matches('/');
        if rel.is_empty() {
            return format!("{}/", self.base_url);
        }
        let encoded: Vec<String> = rel
            .split('/')
            .map(|segment| {
                if is_server_encoded(segment) {
                    segment.to_string()
                } else {
                    urlencoding::encode(segment).into_owned()
                }
            })
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }

    /// Strips scheme, host, and the share base path from a response href,
    /// yielding a drive-relative path in server form.
    fn rel_path_from_href(&self, href: &str) -> String {
        let path = if let Some((_, rest)) = href.split_once("://") {
            rest.split_once('/')
                .map(|(_, path)| format!("/{path}"))
                .unwrap_or_default()
        } else {
            href.to_string()
        };
        let stripped = path
            .strip_prefix(&self.base_path)
            .unwrap_or(path.as_str());
        stripped.trim_matches('/').to_string()
    }

    fn propfind(&self, path: &str, depth: &str) -> Result<Vec<DavResponse>, String> {
        let url = self.url_for(path);
        let response = self
            .request("PROPFIND", &url)
            .set("Depth", depth)
            .set("Content-Type", "application/xml")
            .send_string(PROPFIND_BODY)
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => {
                    format!("webdav propfind {url} returned status {code}")
                }
                other => format!("webdav propfind {url} failed: {other}"),
            })?;
        let body = response
            .into_string()
            .map_err(|err| format!("webdav propfind {url} body read failed: {err}"))?;
        parse_multistatus(&body)
    }

    fn response_to_stat(response: &DavResponse) -> RemoteFileStat {
        RemoteFileStat {
            size: response.content_length.unwrap_or(0),
            modified: response
                .last_modified
                .as_deref()
                .and_then(parse_http_date)
                .map(|secs| secs * 1000)
                .unwrap_or(0),
            is_dir: response.is_collection,
        }
    }
}

impl DriveClient for WebdavClient {
    fn kind(&self) -> DriveKind {
        DriveKind::Webdav
    }

    fn probe(&self) -> Result<(), String> {
        let options_result = self
            .request("OPTIONS", &format!("{}/", self.base_url))
            .call();
        match options_result {
            Ok(_) => return Ok(()),
            Err(err) => debug!("webdav probe: OPTIONS failed, trying HEAD: {err}"),
        }

        match self.request("HEAD", &format!("{}/", self.base_url)).call() {
            Ok(_) => return Ok(()),
            Err(err) => debug!("webdav probe: HEAD failed, trying existence: {err}"),
        }

        match self.exists("/") {
            Ok(true) => return Ok(()),
            Ok(false) => debug!("webdav probe: root reported absent, trying listing"),
            Err(err) => debug!("webdav probe: existence check failed, trying listing: {err}"),
        }

        self.read_dir("/")
            .map(|_| ())
            .map_err(|err| format!("webdav probe exhausted all methods: {err}"))
    }

    fn stat(&self, path: &str) -> Result<RemoteFileStat, String> {
        let responses = self.propfind(path, "0")?;
        let response = responses
            .first()
            .ok_or_else(|| format!("webdav stat {path}: empty multistatus"))?;
        Ok(Self::response_to_stat(response))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, String> {
        let responses = self.propfind(path, "1")?;
        let requested = path.trim_matches('/');

        let mut entries = Vec::new();
        for response in &responses {
            let rel = self.rel_path_from_href(&response.href);
            // Depth 1 echoes the listed directory itself; skip it.
            if rel == requested {
                continue;
            }
            let name = rel.rsplit('/').next().unwrap_or(&rel).to_string();
            if name.is_empty() {
                continue;
            }
            let stat = Self::response_to_stat(response);
            entries.push(RemoteEntry {
                name,
                path: rel,
                is_dir: stat.is_dir,
                size: stat.size,
                modified: stat.modified,
            });
        }
        entries.sort_unstable_by(|left, right| left.name.cmp(&right.name));
        Ok(entries)
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, String> {
        let url = self.url_for(path);
        let response = self.request("GET", &url).call().map_err(|err| match err {
            ureq::Error::Status(code, _) => format!("webdav get {url} returned status {code}"),
            other => format!("webdav get {url} failed: {other}"),
        })?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|err| format!("webdav get {url} body read failed: {err}"))?;
        Ok(bytes)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> Result<(), String> {
        let url = self.url_for(path);
        self.request("PUT", &url)
            .send_bytes(data)
            .map(|_| ())
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => {
                    format!("webdav put {url} returned status {code}")
                }
                other => format!("webdav put {url} failed: {other}"),
            })
    }

    fn exists(&self, path: &str) -> Result<bool, String> {
        let url = self.url_for(path);
        let result = self
            .request("PROPFIND", &url)
            .set("Depth", "0")
            .set("Content-Type", "application/xml")
            .send_string(PROPFIND_BODY);
        match result {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) => Ok(false),
            Err(ureq::Error::Status(code, _)) => {
                Err(format!("webdav exists {url} returned status {code}"))
            }
            Err(other) => Err(format!("webdav exists {url} failed: {other}")),
        }
    }
}

/// True when decoding then re-encoding reproduces the original string, i.e.
/// the segment is already in percent-encoded server form.
///
/// Known ambiguity: names that are fixed points of the transform (certain
/// literal `%XX`-looking substrings) can be misclassified; callers treat the
/// result as a heuristic, not a proof.
pub fn is_server_encoded(segment: &str) -> bool {
    match urlencoding::decode(segment) {
        Ok(decoded) => urlencoding::encode(&decoded) == segment,
        Err(_) => false,
    }
}

/// Parses a PROPFIND multistatus body into per-resource responses.
fn parse_multistatus(xml: &str) -> Result<Vec<DavResponse>, String> {
    let mut reader = Reader::from_str(xml);
    let mut responses = Vec::new();
    let mut current: Option<DavResponse> = None;
    let mut current_element = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(tag)) => {
                let name = local_name(tag.name().as_ref());
                if name == "response" {
                    current = Some(DavResponse::default());
                } else if name == "collection" {
                    if let Some(response) = current.as_mut() {
                        response.is_collection = true;
                    }
                }
                current_element = name;
            }
            Ok(Event::Empty(tag)) => {
                let name = local_name(tag.name().as_ref());
                if name == "collection" {
                    if let Some(response) = current.as_mut() {
                        response.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|err| format!("webdav multistatus text decode failed: {err}"))?
                    .trim()
                    .to_string();
                if value.is_empty() {
                    continue;
                }
                if let Some(response) = current.as_mut() {
                    match current_element.as_str() {
                        "href" => response.href = value,
                        "getcontentlength" => {
                            response.content_length = value.parse::<u64>().ok();
                        }
                        "getlastmodified" => response.last_modified = Some(value),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(tag)) => {
                let name = local_name(tag.name().as_ref());
                if name == "response" {
                    if let Some(response) = current.take() {
                        if !response.href.is_empty() {
                            responses.push(response);
                        }
                    }
                }
                current_element.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(format!("webdav multistatus parse failed: {err}")),
        }
    }

    Ok(responses)
}

fn local_name(qname: &[u8]) -> String {
    let name = match qname.iter().position(|byte| *byte == b':') {
        Some(index) => &qname[index + 1..],
        None => qname,
    };
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

/// Parses an RFC 1123 date (`Tue, 15 Nov 1994 12:45:26 GMT`) to unix seconds.
fn parse_http_date(value: &str) -> Option<i64> {
    let mut parts = value.split_whitespace();
    let _weekday = parts.next()?;
    let day: u32 = parts.next()?.parse().ok()?;
    let month = match parts.next()? {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    let year: i64 = parts.next()?.parse().ok()?;
    let mut clock = parts.next()?.split(':');
    let hour: i64 = clock.next()?.parse().ok()?;
    let minute: i64 = clock.next()?.parse().ok()?;
    let second: i64 = clock.next()?.parse().ok()?;
    if day == 0 || day > 31 || hour > 23 || minute > 59 || second > 60 {
        return None;
    }
    Some(days_from_civil(year, month, day) * 86_400 + hour * 3_600 + minute * 60 + second)
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = if year >= 0 { year } else { year - 399 } / 400;
    let year_of_era = year - era * 400;
    let month_shifted = i64::from((month + 9) % 12);
    let day_of_year = (153 * month_shifted + 2) / 5 + i64::from(day) - 1;
    let day_of_era = year_of_era * 365 + year_of_era / 4 - year_of_era / 100 + day_of_year;
    era * 146_097 + day_of_era - 719_468
}
