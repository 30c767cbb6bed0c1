//! Article extraction from WARC response records.
//!
//! A record is only considered when it is an HTML `response` encoded as
//! UTF-8 whose target URL matches one of the configured glob patterns.
//! Qualifying pages are parsed with `scraper`: the headline comes from
//! `og:title`, `<title>` or the first `<h1>`; the body from paragraphs
//! inside `<article>` (falling back to every paragraph outside navigation
//! chrome); the publish date from the usual meta tags or JSON-LD.
//! Language is detected from the body text, or from the title when the
//! page has no body.

use crate::models::Article;
use crate::warc::{HttpResponse, WarcRecord};
use chrono::{DateTime, NaiveDate};
use glob::Pattern;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

static CONTENT_TYPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<mime>[\w/]+);\s?charset=(?P<charset>.*)$").unwrap());

static OG_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:title"]"#).unwrap());
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static H1: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());
static ARTICLE_PARAGRAPHS: Lazy<Selector> = Lazy::new(|| Selector::parse("article p").unwrap());
static PARAGRAPHS: Lazy<Selector> = Lazy::new(|| Selector::parse("p").unwrap());
static JSON_LD: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("time[datetime]").unwrap());

/// Meta tags that carry a publish date, in order of preference.
static DATE_META: Lazy<Vec<Selector>> = Lazy::new(|| {
    [
        r#"meta[property="article:published_time"]"#,
        r#"meta[name="pubdate"]"#,
        r#"meta[name="publishdate"]"#,
        r#"meta[name="publish-date"]"#,
        r#"meta[itemprop="datePublished"]"#,
        r#"meta[name="date"]"#,
        r#"meta[name="DC.date.issued"]"#,
    ]
    .iter()
    .map(|s| Selector::parse(s).unwrap())
    .collect()
});

/// Paragraphs inside these elements are page chrome, not article text.
const CHROME_TAGS: [&str; 6] = ["nav", "header", "footer", "aside", "form", "noscript"];

/// Paragraphs shorter than this many words are usually captions or bylines.
const MIN_PARAGRAPH_WORDS: usize = 4;

/// Why a qualifying page produced no article.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArticleError {
    #[error("invalid article URL: {0}")]
    InvalidUrl(String),

    #[error("page has neither a title nor body text")]
    Empty,

    #[error("could not detect the article language")]
    UnknownLanguage,

    #[error("response body is not valid UTF-8")]
    NotUtf8,
}

/// What happened to one record.
#[derive(Debug)]
pub enum RecordOutcome {
    /// Not an article candidate.
    Discarded,
    /// A candidate that could not be turned into an article.
    Errored(ArticleError),
    Extracted(Article),
}

/// Decides which records are article candidates.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    patterns: Vec<Pattern>,
}

impl RecordFilter {
    pub fn new(patterns: &[String]) -> Result<Self, glob::PatternError> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RecordFilter { patterns })
    }

    /// Whether `url` matches any pattern. No patterns means no match.
    pub fn matches_url(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(url))
    }

    /// Whether the record is a UTF-8 HTML response for a wanted URL.
    pub fn is_valid(&self, record: &WarcRecord) -> bool {
        self.candidate(record).is_some()
    }

    /// The target URL and parsed HTTP response of a valid record.
    fn candidate<'r>(&self, record: &'r WarcRecord) -> Option<(&'r str, HttpResponse<'r>)> {
        if record.record_type() != Some("response") {
            return None;
        }
        let source = record.target_uri()?;
        let response = record.http_response()?;
        let content_type = response.headers.get("Content-Type")?;
        if !is_utf8_html(content_type) || !self.matches_url(source) {
            return None;
        }
        Some((source, response))
    }

    /// Classify a record and extract its article when it qualifies.
    pub fn process(&self, record: &WarcRecord, date_crawled: NaiveDate) -> RecordOutcome {
        let Some((url, response)) = self.candidate(record) else {
            return RecordOutcome::Discarded;
        };
        let html = match std::str::from_utf8(response.body) {
            Ok(html) => html,
            Err(_) => return RecordOutcome::Errored(ArticleError::NotUtf8),
        };
        match extract_article(url, html, date_crawled) {
            Ok(article) => RecordOutcome::Extracted(article),
            Err(e) => RecordOutcome::Errored(e),
        }
    }
}

fn is_utf8_html(content_type: &str) -> bool {
    CONTENT_TYPE_RE
        .captures(content_type.trim())
        .map(|c| &c["mime"] == "text/html" && c["charset"].trim().eq_ignore_ascii_case("utf-8"))
        .unwrap_or(false)
}

/// Extract an [`Article`] from a page's HTML.
pub fn extract_article(
    url: &str,
    html: &str,
    date_crawled: NaiveDate,
) -> Result<Article, ArticleError> {
    let parsed = Url::parse(url).map_err(|_| ArticleError::InvalidUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ArticleError::InvalidUrl(url.to_string()))?;
    let source_domain = format!("{}://{}", parsed.scheme(), host);

    let document = Html::parse_document(html);
    let title = extract_title(&document);
    let main_text = extract_text(&document);
    if title.is_empty() && main_text.is_empty() {
        return Err(ArticleError::Empty);
    }

    let sample = if main_text.is_empty() { &title } else { &main_text };
    let language = whatlang::detect(sample)
        .map(|info| info.lang().code().to_string())
        .ok_or(ArticleError::UnknownLanguage)?;

    Ok(Article {
        title,
        main_text,
        url: url.to_string(),
        source_domain,
        date_publish: extract_publish_date(&document).map(|d| d.format("%Y-%m-%d").to_string()),
        date_crawled: date_crawled.format("%Y-%m-%d").to_string(),
        language,
    })
}

fn normalize(text: impl Iterator<Item = impl AsRef<str>>) -> String {
    let joined: String = text.map(|t| t.as_ref().to_string()).collect::<Vec<_>>().join(" ");
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_title(document: &Html) -> String {
    if let Some(og) = document
        .select(&OG_TITLE)
        .filter_map(|e| e.value().attr("content"))
        .map(|c| normalize(std::iter::once(c)))
        .find(|c| !c.is_empty())
    {
        return og;
    }
    document
        .select(&TITLE)
        .chain(document.select(&H1))
        .map(|e| normalize(e.text()))
        .find(|t| !t.is_empty())
        .unwrap_or_default()
}

fn in_chrome(element: &ElementRef) -> bool {
    element.ancestors().any(|node| {
        node.value()
            .as_element()
            .map(|e| CHROME_TAGS.contains(&e.name()))
            .unwrap_or(false)
    })
}

fn paragraphs<'a>(elements: impl Iterator<Item = ElementRef<'a>>) -> Vec<String> {
    elements
        .filter(|e| !in_chrome(e))
        .map(|e| normalize(e.text()))
        .filter(|p| p.split_whitespace().count() >= MIN_PARAGRAPH_WORDS)
        .collect()
}

fn extract_text(document: &Html) -> String {
    let mut found = paragraphs(document.select(&ARTICLE_PARAGRAPHS));
    if found.is_empty() {
        found = paragraphs(document.select(&PARAGRAPHS));
    }
    found.join("\n\n")
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.date_naive());
    }
    value
        .get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

fn extract_publish_date(document: &Html) -> Option<NaiveDate> {
    let from_meta = DATE_META.iter().find_map(|selector| {
        document
            .select(selector)
            .filter_map(|e| e.value().attr("content"))
            .find_map(parse_date)
    });
    if from_meta.is_some() {
        return from_meta;
    }

    let from_json_ld = document.select(&JSON_LD).find_map(|script| {
        let raw = script.text().collect::<String>();
        serde_json::from_str::<serde_json::Value>(&raw)
            .ok()
            .and_then(|v| find_date_published(&v))
    });
    if from_json_ld.is_some() {
        return from_json_ld;
    }

    document
        .select(&TIME)
        .filter_map(|e| e.value().attr("datetime"))
        .find_map(parse_date)
}

fn find_date_published(value: &serde_json::Value) -> Option<NaiveDate> {
    match value {
        serde_json::Value::Object(map) => map
            .get("datePublished")
            .and_then(|v| v.as_str())
            .and_then(parse_date)
            .or_else(|| map.values().find_map(find_date_published)),
        serde_json::Value::Array(items) => items.iter().find_map(find_date_published),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warc::WarcReader;
    use crate::warc::tests::{http, record};
    use std::io::Cursor;

    const ENGLISH_PAGE: &str = r#"<html><head>
        <title>Fallback title | Example News</title>
        <meta property="og:title" content="City council approves new park">
        <meta property="article:published_time" content="2022-03-30T14:12:00Z">
        </head><body>
        <nav><p>Home Politics Business Sports Weather Opinion</p></nav>
        <article>
          <h1>City council approves new park</h1>
          <p>The city council voted on Tuesday to approve funding for a new park on the east side of town.</p>
          <p>Residents have asked for more green space for years, and the plan includes a playground and walking trails.</p>
          <p>By Staff</p>
        </article>
        <footer><p>Copyright Example News, all rights reserved worldwide.</p></footer>
        </body></html>"#;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 4, 1).unwrap()
    }

    fn parse_one(bytes: Vec<u8>) -> WarcRecord {
        WarcReader::new(Cursor::new(bytes)).next_record().unwrap().unwrap()
    }

    fn filter(patterns: &[&str]) -> RecordFilter {
        RecordFilter::new(&patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_extracts_article_fields() {
        let article = extract_article("https://www.example.com/news/park", ENGLISH_PAGE, date()).unwrap();
        assert_eq!(article.title, "City council approves new park");
        assert_eq!(article.source_domain, "https://www.example.com");
        assert_eq!(article.date_publish.as_deref(), Some("2022-03-30"));
        assert_eq!(article.date_crawled, "2022-04-01");
        assert_eq!(article.language, "eng");
        assert!(article.main_text.starts_with("The city council voted"));
        assert!(article.main_text.contains("\n\nResidents have asked"));
        assert!(!article.main_text.contains("By Staff"));
        assert!(!article.main_text.contains("Copyright"));
    }

    #[test]
    fn test_falls_back_to_title_tag_and_json_ld_date() {
        let html = r#"<html><head><title>  Storm  hits coast </title>
            <script type="application/ld+json">{"@graph":[{"@type":"NewsArticle","datePublished":"2021-11-02"}]}</script>
            </head><body>
            <p>A powerful storm made landfall early on Monday, knocking out power to thousands of homes along the coast.</p>
            </body></html>"#;
        let article = extract_article("https://news.example.org/storm", html, date()).unwrap();
        assert_eq!(article.title, "Storm hits coast");
        assert_eq!(article.date_publish.as_deref(), Some("2021-11-02"));
        assert_eq!(article.source_domain, "https://news.example.org");
    }

    #[test]
    fn test_missing_publish_date_is_none() {
        let html = "<html><head><title>No date here</title></head><body>\
            <p>This page does not declare when it was published anywhere in its markup at all.</p></body></html>";
        let article = extract_article("https://example.com/x", html, date()).unwrap();
        assert_eq!(article.date_publish, None);
    }

    #[test]
    fn test_empty_page_is_an_error() {
        let result = extract_article("https://example.com/x", "<html><body></body></html>", date());
        assert_eq!(result, Err(ArticleError::Empty));
    }

    #[test]
    fn test_invalid_url_is_an_error() {
        let result = extract_article("not a url", ENGLISH_PAGE, date());
        assert!(matches!(result, Err(ArticleError::InvalidUrl(_))));
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("2022-03-30T14:12:00+02:00"), NaiveDate::from_ymd_opt(2022, 3, 30));
        assert_eq!(parse_date("2022-03-30 14:12"), NaiveDate::from_ymd_opt(2022, 3, 30));
        assert_eq!(parse_date("yesterday"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn test_content_type_check() {
        assert!(is_utf8_html("text/html; charset=utf-8"));
        assert!(is_utf8_html("text/html;charset=UTF-8"));
        assert!(!is_utf8_html("text/html"));
        assert!(!is_utf8_html("text/html; charset=iso-8859-1"));
        assert!(!is_utf8_html("application/json; charset=utf-8"));
    }

    #[test]
    fn test_filter_requires_pattern_match() {
        let rec = parse_one(record(
            "response",
            Some("https://www.example.com/news/park"),
            &http("text/html; charset=utf-8", ENGLISH_PAGE),
        ));
        assert!(filter(&["*example.com*"]).is_valid(&rec));
        assert!(filter(&["*other.org*", "https://www.example.com/*"]).is_valid(&rec));
        assert!(!filter(&["*other.org*"]).is_valid(&rec));
        assert!(!filter(&[]).is_valid(&rec));
    }

    #[test]
    fn test_filter_rejects_non_responses_and_non_html() {
        let request = parse_one(record(
            "request",
            Some("https://www.example.com/news/park"),
            b"GET /news/park HTTP/1.1\r\nHost: www.example.com\r\n\r\n",
        ));
        let json = parse_one(record(
            "response",
            Some("https://www.example.com/api"),
            &http("application/json; charset=utf-8", "{}"),
        ));
        let no_uri = parse_one(record("response", None, &http("text/html; charset=utf-8", ENGLISH_PAGE)));
        let f = filter(&["*"]);
        assert!(!f.is_valid(&request));
        assert!(!f.is_valid(&json));
        assert!(!f.is_valid(&no_uri));
    }

    #[test]
    fn test_candidate_carries_url_and_body() {
        let rec = parse_one(record(
            "response",
            Some("https://www.example.com/news/park"),
            &http("text/html; charset=utf-8", ENGLISH_PAGE),
        ));
        let (url, response) = filter(&["*"]).candidate(&rec).unwrap();
        assert_eq!(url, "https://www.example.com/news/park");
        assert_eq!(response.body, ENGLISH_PAGE.as_bytes());
        assert!(filter(&["*other.org*"]).candidate(&rec).is_none());
    }

    #[test]
    fn test_process_outcomes() {
        let f = filter(&["*"]);

        let good = parse_one(record(
            "response",
            Some("https://www.example.com/news/park"),
            &http("text/html; charset=utf-8", ENGLISH_PAGE),
        ));
        assert!(matches!(f.process(&good, date()), RecordOutcome::Extracted(_)));

        let empty = parse_one(record(
            "response",
            Some("https://www.example.com/blank"),
            &http("text/html; charset=utf-8", "<html></html>"),
        ));
        assert!(matches!(f.process(&empty, date()), RecordOutcome::Errored(ArticleError::Empty)));

        let mut bad_bytes = b"HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n".to_vec();
        bad_bytes.extend_from_slice(&[0xff, 0xfe, 0xfd]);
        let invalid = parse_one(record("response", Some("https://www.example.com/bin"), &bad_bytes));
        assert!(matches!(f.process(&invalid, date()), RecordOutcome::Errored(ArticleError::NotUtf8)));

        let info = parse_one(record("warcinfo", None, b"software: test\r\n"));
        assert!(matches!(f.process(&info, date()), RecordOutcome::Discarded));
    }
}
