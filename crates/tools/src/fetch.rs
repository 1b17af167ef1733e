//! `read_webpage` adapter — fetch a URL with hard limits and extract
//! readable text from HTML. Internal destinations (loopback, RFC1918,
//! cloud metadata) go through the confirmation gate instead of out silently.

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use wf_domain::confirm::{Confirmer, OperationDetails};

use crate::sensitive::is_internal_url;
use crate::{gate, ToolError, ToolResult};

#[derive(Debug, Clone, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Extract readable text from HTML responses (default true).
    #[serde(default = "d_true")]
    pub extract_text: bool,
}

fn d_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub max_bytes: usize,
    pub max_text_chars: usize,
    pub timeout_secs: u64,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            max_bytes: 5 * 1024 * 1024,
            max_text_chars: 250_000,
            timeout_secs: 20,
        }
    }
}

pub struct WebFetcher {
    client: reqwest::Client,
    limits: FetchLimits,
}

impl WebFetcher {
    pub fn new(limits: FetchLimits) -> wf_domain::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(limits.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| wf_domain::Error::Http(e.to_string()))?;
        Ok(Self { client, limits })
    }

    pub async fn read_webpage(
        &self,
        req: FetchRequest,
        confirmer: Option<&dyn Confirmer>,
    ) -> ToolResult {
        if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
            return Err(ToolError::Failure(format!(
                "unsupported URL scheme in '{}': only http and https are fetchable",
                req.url
            )));
        }

        if is_internal_url(&req.url) {
            gate(
                confirmer,
                "fetch_internal_url",
                &req.url,
                OperationDetails {
                    tool_name: "read_webpage".into(),
                    tool_args: json!({ "url": req.url }),
                    ..Default::default()
                },
            )
            .await?;
        }

        let response = self
            .client
            .get(&req.url)
            .header(reqwest::header::USER_AGENT, "wayfind/0.1")
            .send()
            .await
            .map_err(|e| ToolError::Failure(format!("fetch failed for '{}': {e}", req.url)))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned();

        // Stream with a hard byte cap.
        let mut stream = response.bytes_stream();
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| ToolError::Failure(format!("read failed for '{}': {e}", req.url)))?;
            if body.len() + chunk.len() > self.limits.max_bytes {
                return Err(ToolError::Failure(format!(
                    "response from '{}' exceeded the {} byte limit",
                    req.url, self.limits.max_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        let raw = String::from_utf8_lossy(&body);
        let text = if req.extract_text && content_type.contains("html") {
            html_to_text(&raw, self.limits.max_text_chars)
        } else {
            clip_chars(&raw, self.limits.max_text_chars)
        };

        Ok(json!({
            "url": req.url,
            "status": status,
            "content_type": content_type,
            "bytes": body.len(),
            "text": text,
        }))
    }
}

fn clip_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        s.chars().take(max).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTML to text
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "li", "tr", "br", "article", "section",
    "header", "footer", "blockquote",
];

/// Strip tags, drop script/style content, decode common entities, and
/// collapse whitespace while keeping block-level line breaks.
pub fn html_to_text(html: &str, max_chars: usize) -> String {
    let mut out = String::new();
    let mut rest = html;
    let mut skip_until: Option<&'static str> = None;

    while let Some(open) = rest.find('<') {
        if out.chars().count() >= max_chars {
            break;
        }
        if skip_until.is_none() {
            out.push_str(&rest[..open]);
        }
        rest = &rest[open..];
        let Some(close) = rest.find('>') else { break };
        let tag_body = rest[1..close].trim();
        let tag_name: String = tag_body
            .trim_start_matches('/')
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        let is_closing = tag_body.starts_with('/');

        match (skip_until, is_closing) {
            (Some(until), true) if tag_name == until => skip_until = None,
            (Some(_), _) => {}
            (None, false) if tag_name == "script" || tag_name == "style" => {
                skip_until = Some(if tag_name == "script" { "script" } else { "style" });
            }
            (None, closing) => {
                let line_break = tag_name == "br"
                    || (closing && BLOCK_TAGS.contains(&tag_name.as_str()));
                if line_break && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        rest = &rest[close + 1..];
    }
    if skip_until.is_none() {
        out.push_str(rest);
    }

    let decoded = out
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    // Collapse runs of whitespace per line; cap the final size.
    let mut result = String::new();
    let mut previous_blank = false;
    for line in decoded.lines() {
        let compact = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if compact.is_empty() {
            if !previous_blank && !result.is_empty() {
                result.push('\n');
                previous_blank = true;
            }
        } else {
            result.push_str(&compact);
            result.push('\n');
            previous_blank = false;
        }
    }
    clip_chars(result.trim(), max_chars)
}
