//! HTTP fetch with format conversion.
//!
//! Fetched HTML is converted to markdown (library) or plain text (tag
//! strip) before going through the large-output processor, so the caller
//! gets something readable instead of raw markup.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;

use worknode_protocol::{WebFetchArgs, WebFetchResult};

use super::large_output::{LargeOutputConfig, LargeOutputProcessor};
use super::Workspace;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FETCH_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RESPONSE_SIZE: u64 = 5 * 1024 * 1024;
const FETCH_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

impl Workspace {
    /// Fetch a URL and return its content in the requested format.
    pub async fn webfetch(&self, args: &WebFetchArgs) -> Result<WebFetchResult> {
        if !args.url.starts_with("http://") && !args.url.starts_with("https://") {
            bail!("valid http/https url is required");
        }

        let timeout = resolve_fetch_timeout(args.timeout);
        let format = if args.format.is_empty() {
            "markdown"
        } else {
            args.format.as_str()
        };

        let client = reqwest::Client::builder()
            .user_agent(FETCH_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;

        let response = client
            .get(&args.url)
            .header("Accept-Language", "en-US,en;q=0.9,zh-CN;q=0.8,zh;q=0.7")
            .header("Accept", accept_header(format))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("request timed out")
                } else {
                    anyhow::anyhow!("request failed: {}", e)
                }
            })?;

        if let Some(length) = response.content_length() {
            if length > MAX_RESPONSE_SIZE {
                bail!(
                    "response too large (exceeds {}MB limit)",
                    MAX_RESPONSE_SIZE / (1024 * 1024)
                );
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        // Content-Length can lie (or be absent); count the body as it
        // streams in.
        let mut body: Vec<u8> = Vec::new();
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("request timed out")
                } else {
                    anyhow::anyhow!("failed to read response: {}", e)
                }
            })?
        {
            if body.len() as u64 + chunk.len() as u64 > MAX_RESPONSE_SIZE {
                bail!(
                    "response too large (exceeds {}MB limit)",
                    MAX_RESPONSE_SIZE / (1024 * 1024)
                );
            }
            body.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&body);
        let content = convert_content(&body, format, &content_type);

        let processed = LargeOutputProcessor::new(self, LargeOutputConfig::default())
            .process(&content, "webfetch")
            .await;

        Ok(WebFetchResult {
            content: processed.content,
            url: final_url,
            truncated: processed.truncated,
            file_path: processed.file_path,
            total_size: processed.total_size,
        })
    }
}

fn resolve_fetch_timeout(timeout_secs: u64) -> Duration {
    if timeout_secs == 0 {
        return DEFAULT_FETCH_TIMEOUT;
    }
    Duration::from_secs(timeout_secs).min(MAX_FETCH_TIMEOUT)
}

fn accept_header(format: &str) -> &'static str {
    match format {
        "markdown" => "text/markdown, text/html;q=0.9, */*;q=0.8",
        "text" => "text/plain, text/html;q=0.9, */*;q=0.8",
        _ => "text/html, */*;q=0.8",
    }
}

/// Convert fetched content based on the requested format and what the
/// server actually returned.
fn convert_content(content: &str, format: &str, content_type: &str) -> String {
    let is_html = content_type.contains("text/html");
    match format {
        "markdown" if is_html => convert_html_to_markdown(content),
        "text" if is_html => convert_html_to_text(content),
        _ => content.to_string(),
    }
}

fn convert_html_to_markdown(html: &str) -> String {
    match htmd::convert(html) {
        Ok(markdown) => cleanup_markdown(&markdown),
        // Conversion failure degrades to text extraction.
        Err(_) => convert_html_to_text(html),
    }
}

fn convert_html_to_text(html: &str) -> String {
    let script_re = Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap();
    let html = script_re.replace_all(html, "");

    let style_re = Regex::new(r"(?is)<style[^>]*>.*?</style>").unwrap();
    let html = style_re.replace_all(&html, "");

    let tag_re = Regex::new(r"<[^>]+>").unwrap();
    let text = tag_re.replace_all(&html, " ");

    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    let space_re = Regex::new(r"\s+").unwrap();
    space_re.replace_all(&text, " ").trim().to_string()
}

/// Collapse runs of three or more newlines left behind by conversion.
fn cleanup_markdown(markdown: &str) -> String {
    let blank_re = Regex::new(r"\n{3,}").unwrap();
    blank_re.replace_all(markdown, "\n\n").trim().to_string()
}
