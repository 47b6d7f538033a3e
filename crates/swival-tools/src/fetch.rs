//! SSRF-guarded URL fetching.
//!
//! Redirects are followed manually (≤10 hops) so the target host can be
//! re-resolved and classified before every dispatch. Private, loopback,
//! link-local, multicast, and unspecified address classes are rejected
//! before any request is sent; binary MIME types are rejected after the
//! headers arrive.

use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use swival_core::{ToolError, ToolErrorKind};
use swival_policy::{NameResolver, is_public_ip};
use url::Url;

use crate::caps::FETCH_SPILL_CAP;

pub const MAX_REDIRECTS: usize = 10;
pub const HISTORY_CAP_BYTES: u64 = 500 * 1024;

#[derive(Debug)]
pub struct FetchOutcome {
    pub final_url: String,
    pub status: u16,
    pub content_type: String,
    /// Converted (tag-stripped for HTML) text body.
    pub text: String,
    /// Raw body bytes, capped at the spill limit.
    pub raw: Vec<u8>,
}

pub struct UrlFetcher {
    client: reqwest::blocking::Client,
    resolver: Arc<dyn NameResolver + Send + Sync>,
}

impl UrlFetcher {
    pub fn new(
        resolver: Arc<dyn NameResolver + Send + Sync>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .user_agent(concat!("swival/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, resolver })
    }

    pub fn fetch(&self, url: &str) -> Result<FetchOutcome, ToolError> {
        let mut current = Url::parse(url)
            .map_err(|e| ToolError::failed(format!("invalid url {url}: {e}")))?;
        let mut redirects = 0usize;

        loop {
            self.guard_dispatch(&current)?;

            let resp = self
                .client
                .get(current.as_str())
                .send()
                .map_err(|e| ToolError::failed(format!("request failed: {e}")))?;
            let status = resp.status();

            if status.is_redirection() {
                let location = resp
                    .headers()
                    .get("location")
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| ToolError::failed("redirect without Location header"))?;
                current = current
                    .join(location)
                    .map_err(|e| ToolError::failed(format!("bad redirect target: {e}")))?;
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(ToolError::new(
                        ToolErrorKind::RedirectLimit,
                        format!("more than {MAX_REDIRECTS} redirects"),
                    ));
                }
                continue;
            }

            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            if !content_type.is_empty() && !is_textual_mime(&content_type) {
                return Err(ToolError::new(
                    ToolErrorKind::BinaryContent,
                    format!("refusing binary content type {content_type}"),
                ));
            }

            let mut raw = Vec::new();
            resp.take(FETCH_SPILL_CAP as u64)
                .read_to_end(&mut raw)
                .map_err(|e| ToolError::failed(format!("body read failed: {e}")))?;
            if raw.contains(&0) {
                return Err(ToolError::new(
                    ToolErrorKind::BinaryContent,
                    "response body contains binary data",
                ));
            }

            let body = String::from_utf8_lossy(&raw).to_string();
            let text = if content_type.contains("html") {
                strip_html_tags(&body)
            } else {
                body
            };
            return Ok(FetchOutcome {
                final_url: current.to_string(),
                status: status.as_u16(),
                content_type,
                text,
                raw,
            });
        }
    }

    /// Scheme and address-class checks, re-run on every hop.
    fn guard_dispatch(&self, url: &Url) -> Result<(), ToolError> {
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ToolError::new(
                    ToolErrorKind::SchemeNotAllowed,
                    format!("scheme {other} is not allowed; use http or https"),
                ));
            }
        }
        let host = url
            .host_str()
            .ok_or_else(|| ToolError::failed("url has no host"))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = self
            .resolver
            .resolve(host, port)
            .map_err(|e| ToolError::failed(format!("could not resolve {host}: {e}")))?;
        if addrs.is_empty() {
            return Err(ToolError::failed(format!("no addresses for {host}")));
        }
        for addr in addrs {
            if !is_public_ip(addr) {
                return Err(ToolError::new(
                    ToolErrorKind::PrivateAddress,
                    format!("{host} resolves to non-public address {addr}"),
                ));
            }
        }
        Ok(())
    }
}

fn is_textual_mime(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ct.starts_with("text/")
        || ct.ends_with("+json")
        || ct.ends_with("+xml")
        || matches!(
            ct.as_str(),
            "application/json"
                | "application/xml"
                | "application/javascript"
                | "application/x-www-form-urlencoded"
        )
}

/// Minimal HTML-to-text conversion: drop script/style blocks, strip tags,
/// decode common entities, collapse blank runs.
fn strip_html_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len() / 2);
    let mut chars = html.char_indices().peekable();
    let lower = html.to_ascii_lowercase();
    let mut skip_until: Option<usize> = None;

    while let Some((i, c)) = chars.next() {
        if let Some(end) = skip_until {
            if i < end {
                continue;
            }
            skip_until = None;
        }
        if c == '<' {
            for opener in ["<script", "<style"] {
                let closer = if opener == "<script" {
                    "</script>"
                } else {
                    "</style>"
                };
                if lower[i..].starts_with(opener) {
                    skip_until = lower[i..]
                        .find(closer)
                        .map(|off| i + off + closer.len());
                    break;
                }
            }
            if skip_until.is_some() {
                continue;
            }
            // Skip to the end of this tag; block-level tags become newlines.
            let block = ["<p", "<br", "<div", "<li", "<h1", "<h2", "<h3", "<tr"]
                .iter()
                .any(|tag| lower[i..].starts_with(tag));
            for (_, tc) in chars.by_ref() {
                if tc == '>' {
                    break;
                }
            }
            if block {
                text.push('\n');
            }
            continue;
        }
        text.push(c);
    }

    let decoded = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    let mut out = String::with_capacity(decoded.len());
    let mut blank_run = 0;
    for line in decoded.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Append a fetch record to `.swival/HISTORY.md`. Entries are skipped once
/// the file passes the size cap.
pub fn append_history(scratch: &Path, url: &str, status: u16, bytes: usize) {
    let path = scratch.join("HISTORY.md");
    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    if size >= HISTORY_CAP_BYTES {
        return;
    }
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        let _ = writeln!(
            file,
            "- {} GET {url} → {status} ({bytes} bytes)",
            Utc::now().to_rfc3339()
        );
    }
}
