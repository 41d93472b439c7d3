//! Static content served for paths that are not download codes.

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use http::HeaderMap;
use http::header::IF_MODIFIED_SINCE;

const LANDING_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>WebRelay</title>
<style>
body { font-family: system-ui, sans-serif; max-width: 40em; margin: 4em auto; padding: 0 1em; color: #222; }
code { background: #f2f2f2; padding: 0.1em 0.3em; }
</style>
</head>
<body>
<h1>WebRelay</h1>
<p>Share a file or a pipe as a short download link, straight from your machine.</p>
<p>Relay through this server with <code>webrelay --remote-host ws://this-host/ file.bin</code>,
then hand out the printed link. Bytes are streamed live from the uploader and never stored here.</p>
</body>
</html>
"#;

const ROBOTS: &str = "user-agent: *\r\nAllow: /$\r\nDisallow: /";

/// A static page ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StaticReply {
    /// The client's cached copy is current.
    NotModified,
    Page {
        content_type: &'static str,
        body: Bytes,
        last_modified: String,
    },
}

/// The landing page and `robots.txt`.
#[derive(Debug)]
pub(crate) struct FallbackContent {
    modified: DateTime<Utc>,
}

impl FallbackContent {
    /// Content stamped with the current time as its modification date.
    pub fn new() -> Self {
        Self::with_modified(Utc::now())
    }

    pub fn with_modified(modified: DateTime<Utc>) -> Self {
        Self {
            modified: modified.trunc_subsecs(0),
        }
    }

    fn http_date(&self) -> String {
        self.modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    /// Looks up `path` (already stripped of slashes and lowercased).
    pub fn respond(&self, path: &str, headers: &HeaderMap) -> Option<StaticReply> {
        let (content_type, body) = match path {
            "" => ("text/html; charset=utf-8", LANDING_PAGE),
            "robots.txt" => ("text/plain; charset=utf-8", ROBOTS),
            _ => return None,
        };

        let cached = headers
            .get(IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .is_some_and(|since| since.with_timezone(&Utc) >= self.modified);
        if cached {
            return Some(StaticReply::NotModified);
        }

        Some(StaticReply::Page {
            content_type,
            body: Bytes::from_static(body.as_bytes()),
            last_modified: self.http_date(),
        })
    }
}
