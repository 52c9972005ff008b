use std::sync::LazyLock;

use dom_smoothie::{Readability, TextMode};
use regex::Regex;
use tracing::debug;
use url::Url;

/// Readable content pulled from one HTML page.
#[derive(Debug, Default)]
pub struct ExtractedPage {
    pub title: String,
    pub text: String,
}

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid title regex"));
static MAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<main[^>]*>(.*?)</main>").expect("valid main regex"));
static ARTICLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<article[^>]*>(.*?)</article>").expect("valid article regex")
});
static BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<body[^>]*>(.*)</body>").expect("valid body regex"));
static SCRIPT_STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<noscript\b.*?</noscript>")
        .expect("valid script/style regex")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static HREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s[^>]*href\s*=\s*["']([^"']+)["']"#).expect("valid href regex")
});
static BLANK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid blank regex"));

/// Extract readable content from a page.
///
/// Readability handles the content-id/class heuristics; when it cannot find
/// an article (boilerplate-light pages, fragments), the fallback prefers
/// `<main>`/`<article>` and strips script/style only, keeping nav and footer
/// text, which frequently carries real content on small sites.
pub fn extract_readable(html: &str, url: &Url) -> ExtractedPage {
    let fallback_title = TITLE_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| url.path().to_string());

    let readability = Readability::new(
        html.to_string(),
        Some(url.as_str()),
        Some(dom_smoothie::Config {
            text_mode: TextMode::Formatted,
            ..Default::default()
        }),
    );
    if let Ok(mut readability) = readability {
        if let Ok(article) = readability.parse() {
            let text = article.text_content.trim().to_string();
            if !text.is_empty() {
                let title = if article.title.trim().is_empty() {
                    fallback_title.clone()
                } else {
                    article.title.trim().to_string()
                };
                return ExtractedPage { title, text };
            }
        }
    }

    debug!(url = %url, "readability found no article; using tag-strip fallback");
    ExtractedPage {
        title: fallback_title,
        text: strip_to_text(html),
    }
}

/// Tag-strip extraction: prefer the main/article region, drop script and
/// style only, flatten the rest.
fn strip_to_text(html: &str) -> String {
    let region = MAIN_RE
        .captures(html)
        .or_else(|| ARTICLE_RE.captures(html))
        .or_else(|| BODY_RE.captures(html))
        .and_then(|c| c.get(1))
        .map_or(html, |m| m.as_str());

    let no_scripts = SCRIPT_STYLE_RE.replace_all(region, " ");
    let with_breaks = no_scripts
        .replace("</p>", "\n")
        .replace("</div>", "\n")
        .replace("</li>", "\n")
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n");
    let stripped = TAG_RE.replace_all(&with_breaks, " ");
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    let lines: Vec<String> = decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    BLANK_RE
        .replace_all(lines.join("\n").trim(), "\n\n")
        .into_owned()
}

/// Same-origin links on a page, resolved against the page URL.
pub fn extract_links(html: &str, base: &Url) -> Vec<Url> {
    let mut links = Vec::new();
    for captures in HREF_RE.captures_iter(html) {
        let Some(href) = captures.get(1).map(|m| m.as_str().trim()) else {
            continue;
        };
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("javascript:")
        {
            continue;
        }

        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        resolved.set_fragment(None);
        if super::sitemap::same_origin(&resolved, base) && !links.contains(&resolved) {
            links.push(resolved);
        }
    }
    links
}
