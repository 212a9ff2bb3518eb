//! Request dispatch
//!
//! Decides status and body from method, path, query and content type. Kept
//! free of any I/O besides reading served files so it can be tested directly.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use hyper::{Method, StatusCode};
use serde::Serialize;

/// Content type assumed when the request carries none
pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const JSON_CONTENT_TYPE: &str = "application/json";

/// The parts of a request the dispatcher looks at
#[derive(Debug, Clone)]
pub struct RequestParts<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    /// Lower-cased request content type
    pub content_type: &'a str,
    pub body: &'a [u8],
}

/// Status, content type and body to send back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
}

impl Reply {
    fn new(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: content_type.to_string(),
            body: body.into(),
        }
    }

    fn error(status: StatusCode) -> Self {
        let reason = status.canonical_reason().unwrap_or("Error");
        Self::new(
            status,
            DEFAULT_CONTENT_TYPE,
            format!("{} {}\n", status.as_u16(), reason),
        )
    }
}

/// Path segments echoed back for JSON requests
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Echo<'a> {
    Segment(&'a str),
    Pair(BTreeMap<&'a str, &'a str>),
    Segments(Vec<&'a str>),
}

/// Maps requests to replies, serving files below `root`
#[derive(Debug, Clone)]
pub struct RequestHandler {
    root: PathBuf,
}

impl RequestHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handle(&self, request: &RequestParts<'_>) -> Reply {
        match *request.method {
            Method::HEAD => Reply::new(StatusCode::OK, request.content_type, Bytes::new()),
            Method::GET => self.dispatch(request),
            Method::POST => {
                log_body(request);
                self.dispatch(request)
            }
            _ => Reply::error(StatusCode::NOT_IMPLEMENTED),
        }
    }

    fn dispatch(&self, request: &RequestParts<'_>) -> Reply {
        log::debug!("request Content-Type: {}", request.content_type);

        let reply = if has_file_extension(request.path) {
            self.serve_file(request)
        } else if request.content_type == FORM_CONTENT_TYPE {
            serve_form(request)
        } else if request.content_type == JSON_CONTENT_TYPE {
            serve_json(request)
        } else {
            None
        };

        reply.unwrap_or_else(|| Reply::error(StatusCode::NOT_FOUND))
    }

    fn serve_file(&self, request: &RequestParts<'_>) -> Option<Reply> {
        let relative = Path::new(request.path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            log::debug!("Refusing path {}", request.path);
            return None;
        }

        let path = self.root.join(relative);
        match std::fs::read(&path) {
            Ok(contents) => Some(Reply::new(StatusCode::OK, request.content_type, contents)),
            Err(e) => {
                log::debug!("Cannot serve {}: {}", path.display(), e);
                None
            }
        }
    }
}

fn serve_form(request: &RequestParts<'_>) -> Option<Reply> {
    let params: Vec<(String, String)> = url::form_urlencoded::parse(
        request.query.unwrap_or_default().as_bytes(),
    )
    .into_owned()
    .collect();
    log::debug!("request params: {:?}", params);
    Some(Reply::new(StatusCode::OK, request.content_type, Bytes::new()))
}

fn serve_json(request: &RequestParts<'_>) -> Option<Reply> {
    if request.path == "/" {
        return Some(Reply::new(StatusCode::OK, request.content_type, Bytes::new()));
    }

    let segments: Vec<&str> = request.path.split('/').skip(1).collect();
    let echo = match segments.as_slice() {
        [single] => Echo::Segment(*single),
        [key, value] => Echo::Pair(BTreeMap::from([(*key, *value)])),
        _ => Echo::Segments(segments.clone()),
    };

    match serde_json::to_vec(&echo) {
        Ok(body) => Some(Reply::new(StatusCode::OK, request.content_type, body)),
        Err(e) => {
            log::error!("Failed to encode JSON echo: {}", e);
            Some(Reply::error(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn log_body(request: &RequestParts<'_>) {
    if request.content_type == JSON_CONTENT_TYPE {
        match serde_json::from_slice::<serde_json::Value>(request.body) {
            Ok(value) => log::debug!("request body: {}", value),
            Err(e) => log::debug!("request body is not valid JSON: {}", e),
        }
    } else {
        log::debug!("request body: {}", String::from_utf8_lossy(request.body));
    }
}

/// Whether the last path segment ends in `.[a-z0-9]+`
fn has_file_extension(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rsplit_once('.') {
        Some((_, ext)) => {
            !ext.is_empty()
                && ext
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        }
        None => false,
    }
}
