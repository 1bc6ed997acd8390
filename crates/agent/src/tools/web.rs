//! Web fetch tool

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use sortie_provider::RetryPolicy;

use super::{Tool, ToolContext, ToolError};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";
const DEFAULT_MAX_CHARS: usize = 50_000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExtractMode {
    #[default]
    Markdown,
    Text,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FetchParams {
    /// http or https URL
    pub url: String,
    /// How HTML bodies are rendered
    #[serde(default, alias = "extractMode")]
    pub extract_mode: ExtractMode,
    /// Maximum characters of content to return
    #[serde(default, alias = "maxChars")]
    pub max_chars: Option<usize>,
}

/// HTTP GET through the retry executor, with HTML reduced to readable text
pub struct FetchTool {
    client: reqwest::Client,
    retry: RetryPolicy,
    max_chars: usize,
}

impl FetchTool {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            retry,
            max_chars: DEFAULT_MAX_CHARS,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }
}

impl Default for FetchTool {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl Tool for FetchTool {
    type Params = FetchParams;

    const NAME: &'static str = "fetch";

    fn description(&self) -> &str {
        "Fetch a URL and extract readable content as markdown or plain text."
    }

    async fn call(&self, params: FetchParams, _ctx: &ToolContext) -> Result<String, ToolError> {
        let url = reqwest::Url::parse(&params.url)
            .map_err(|e| ToolError::InvalidParams(format!("invalid url '{}': {}", params.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ToolError::InvalidParams(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        let max_chars = params.max_chars.unwrap_or(self.max_chars);
        debug!("Fetching URL: {} (mode: {:?})", url, params.extract_mode);

        let outcome = self
            .retry
            .execute(|attempt| {
                debug!("fetch attempt {} for {}", attempt + 1, url);
                self.client
                    .get(url.clone())
                    .header("User-Agent", USER_AGENT)
                    .timeout(REQUEST_TIMEOUT)
                    .send()
            })
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let response = outcome.value;
        let status = response.status();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::Execution(format!("reading body: {}", e)))?;

        let (content, extractor) = if content_type.contains("application/json") {
            (body, "json")
        } else if !content_type.is_empty() && !content_type.contains("html") {
            (body, "raw")
        } else if params.extract_mode == ExtractMode::Text {
            (strip_tags(&body), "text")
        } else {
            (html_to_markdown(&body), "markdown")
        };

        let (content, truncated) = truncate_chars(content, max_chars);

        Ok(json!({
            "url": params.url,
            "finalUrl": final_url,
            "status": status.as_u16(),
            "extractor": extractor,
            "truncated": truncated,
            "length": content.chars().count(),
            "attempts": outcome.attempts,
            "text": content,
        })
        .to_string())
    }
}

fn truncate_chars(content: String, max_chars: usize) -> (String, bool) {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => (content[..cut].to_string(), true),
        None => (content, false),
    }
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern"))
}

fn strip_tags(html: &str) -> String {
    static BLOCKS: OnceLock<Regex> = OnceLock::new();
    static TAGS: OnceLock<Regex> = OnceLock::new();

    let text = regex(&BLOCKS, r"(?is)<script[\s\S]*?</script>|<style[\s\S]*?</style>")
        .replace_all(html, "");
    let text = regex(&TAGS, r"<[^>]+>").replace_all(&text, "");
    decode_html_entities(&text).trim().to_string()
}

fn html_to_markdown(html: &str) -> String {
    static CHROME: OnceLock<Regex> = OnceLock::new();
    static LINKS: OnceLock<Regex> = OnceLock::new();
    static TOKENS: OnceLock<Regex> = OnceLock::new();
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();

    let html = regex(
        &CHROME,
        r"(?is)<script[\s\S]*?</script>|<style[\s\S]*?</style>|<nav[\s\S]*?</nav>|<header[\s\S]*?</header>|<footer[\s\S]*?</footer>",
    )
    .replace_all(html, "");

    // links become markdown before the tag walk drops the anchors
    let html = regex(
        &LINKS,
        r#"(?is)<a\s[^>]*?href=["']([^"']+)["'][^>]*>(.*?)</a>"#,
    )
    .replace_all(&html, |caps: &regex::Captures| {
        let text = caps[2].trim();
        if text.is_empty() {
            format!("<{}>", &caps[1])
        } else {
            format!("[{}]({})", text, &caps[1])
        }
    });

    let tag_re = regex(&TOKENS, r"(?is)<(/?)([a-z0-9]+)[^>]*?>|([^<]+)");
    let whitespace_re = regex(&WHITESPACE, r"\s+");

    let mut markdown = String::new();
    let mut in_code_block = false;
    let mut list_stack: Vec<&str> = Vec::new();

    for cap in tag_re.captures_iter(&html) {
        let closing = cap.get(1).map(|m| m.as_str()).unwrap_or("");
        let tag = cap
            .get(2)
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_default();
        let text = cap.get(3).map(|m| m.as_str()).unwrap_or("");

        if !text.is_empty() {
            let decoded = decode_html_entities(text);
            let trimmed = decoded.trim();
            if !trimmed.is_empty() {
                if in_code_block {
                    markdown.push_str(&decoded);
                } else {
                    let collapsed = whitespace_re.replace_all(trimmed, " ");
                    if !markdown.is_empty() && !markdown.ends_with(['\n', ' ']) {
                        markdown.push(' ');
                    }
                    markdown.push_str(&collapsed);
                }
            }
            continue;
        }

        let is_closing = closing == "/";

        match tag.as_str() {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                if is_closing {
                    markdown.push_str("\n\n");
                } else {
                    let level = tag[1..].parse::<usize>().unwrap_or(1);
                    markdown.push_str("\n\n");
                    markdown.push_str(&"#".repeat(level));
                    markdown.push(' ');
                }
            }
            "p" | "div" | "section" | "article" | "main" | "aside" => {
                if is_closing {
                    markdown.push_str("\n\n");
                }
            }
            "br" => markdown.push('\n'),
            "hr" => markdown.push_str("\n\n---\n\n"),
            "strong" | "b" => markdown.push_str("**"),
            "em" | "i" => markdown.push('*'),
            "code" => {
                markdown.push('`');
                in_code_block = !is_closing;
            }
            "pre" => markdown.push_str("\n```\n"),
            "ul" | "ol" => {
                if is_closing {
                    list_stack.pop();
                } else {
                    list_stack.push(if tag == "ol" { "ol" } else { "ul" });
                }
                markdown.push('\n');
            }
            "li" => {
                if is_closing {
                    markdown.push('\n');
                } else {
                    let indent = "  ".repeat(list_stack.len().saturating_sub(1));
                    if list_stack.last() == Some(&"ol") {
                        markdown.push_str(&format!("{}1. ", indent));
                    } else {
                        markdown.push_str(&format!("{}- ", indent));
                    }
                }
            }
            "blockquote" => {
                if is_closing {
                    markdown.push('\n');
                } else {
                    markdown.push_str("> ");
                }
            }
            _ => {}
        }
    }

    regex(&BLANK_LINES, r"\n{3,}")
        .replace_all(&markdown, "\n\n")
        .trim()
        .to_string()
}

fn decode_html_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&ndash;", "–")
        .replace("&mdash;", "—")
        .replace("&hellip;", "…")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_tags_drops_scripts() {
        let html = "<html><script>alert(1)</script><p>Hello &amp; bye</p></html>";
        assert_eq!(strip_tags(html), "Hello & bye");
    }

    #[test]
    fn test_markdown_headings_and_lists() {
        let html = "<h2>Title</h2><ul><li>one</li><li>two</li></ul>";
        let md = html_to_markdown(html);
        assert!(md.starts_with("## Title"));
        assert!(md.contains("- one"));
        assert!(md.contains("- two"));
    }

    #[test]
    fn test_markdown_links() {
        let html = r#"<p>See <a href="https://example.com">the docs</a>.</p>"#;
        let md = html_to_markdown(html);
        assert!(md.contains("[the docs](https://example.com)"));
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        let (text, truncated) = truncate_chars("héllo wörld".to_string(), 4);
        assert_eq!(text, "héll");
        assert!(truncated);

        let (text, truncated) = truncate_chars("short".to_string(), 10);
        assert_eq!(text, "short");
        assert!(!truncated);
    }

    #[test]
    fn test_entities_decode_once() {
        assert_eq!(decode_html_entities("&amp;lt;"), "&lt;");
    }
}
