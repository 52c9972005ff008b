use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static LOC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<loc>\s*(.*?)\s*</loc>").expect("valid loc regex"));

/// URLs listed in a sitemap document, restricted to the crawl origin.
///
/// Handles both urlset and sitemap-index payloads; nested sitemap locations
/// are returned like any other URL and the caller decides whether to fetch
/// them.
pub fn parse_sitemap(content: &str, origin: &Url) -> Vec<Url> {
    LOC_RE
        .captures_iter(content)
        .filter_map(|captures| captures.get(1))
        .filter_map(|m| Url::parse(m.as_str().trim()).ok())
        .filter(|url| same_origin(url, origin))
        .collect()
}

/// Conventional sitemap location for an origin.
pub fn sitemap_url(origin: &Url) -> Option<Url> {
    origin.join("/sitemap.xml").ok()
}

pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port() == b.port()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlset_locations_are_extracted_same_origin_only() {
        let origin = Url::parse("https://example.test/").expect("url");
        let sitemap = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.test/docs</loc></url>
  <url><loc> https://example.test/about </loc></url>
  <url><loc>https://other.test/external</loc></url>
</urlset>"#;

        let urls = parse_sitemap(sitemap, &origin);
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].path(), "/docs");
        assert_eq!(urls[1].path(), "/about");
    }

    #[test]
    fn sitemap_index_locations_also_parse() {
        let origin = Url::parse("https://example.test/").expect("url");
        let index = r#"<sitemapindex>
  <sitemap><loc>https://example.test/sitemap-posts.xml</loc></sitemap>
</sitemapindex>"#;

        let urls = parse_sitemap(index, &origin);
        assert_eq!(urls.len(), 1);
        assert!(urls[0].path().ends_with("sitemap-posts.xml"));
    }

    #[test]
    fn garbage_input_yields_nothing() {
        let origin = Url::parse("https://example.test/").expect("url");
        assert!(parse_sitemap("not xml at all", &origin).is_empty());
    }

    #[test]
    fn conventional_sitemap_location() {
        let origin = Url::parse("https://example.test/deep/path").expect("url");
        let url = sitemap_url(&origin).expect("sitemap url");
        assert_eq!(url.as_str(), "https://example.test/sitemap.xml");
    }
}
