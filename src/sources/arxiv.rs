use crate::traits::PaperSource;
use crate::types::{DigestError, PaperRecord, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

const ARXIV_API_URL: &str = "https://export.arxiv.org/api/query";

/// Paper source backed by the arXiv Atom API. Queries the configured
/// categories sorted by submission date and keeps entries newer than the
/// requested window.
pub struct ArxivSource {
    client: Client,
    base_url: String,
    categories: Vec<String>,
    max_results: usize,
}

impl ArxivSource {
    pub fn new(categories: Vec<String>, max_results: usize, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent("paper-digest/0.1")
            .timeout(Duration::from_secs(timeout_secs))
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            base_url: ARXIV_API_URL.to_string(),
            categories,
            max_results,
        })
    }

    fn search_query(&self) -> String {
        self.categories
            .iter()
            .map(|category| format!("cat:{}", category))
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

#[async_trait]
impl PaperSource for ArxivSource {
    fn source_name(&self) -> String {
        format!("arXiv ({})", self.categories.join(", "))
    }

    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Vec<PaperRecord>> {
        let query = self.search_query();
        info!("querying arXiv for '{}' since {}", query, since);

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("search_query", query.as_str()),
                ("start", "0"),
                ("max_results", &self.max_results.to_string()),
                ("sortBy", "submittedDate"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await
            .map_err(|e| DigestError::SourceUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DigestError::SourceUnavailable(format!(
                "arXiv API returned HTTP {}",
                status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DigestError::SourceUnavailable(e.to_string()))?;

        let feed = feed_rs::parser::parse(&bytes[..])
            .map_err(|e| DigestError::SourceUnavailable(format!("feed parse error: {}", e)))?;

        let mut papers = Vec::new();
        for entry in feed.entries {
            let Some(published) = entry.published.or(entry.updated) else {
                warn!("arXiv entry {} has no timestamp, skipping", entry.id);
                continue;
            };
            if published <= since {
                continue;
            }

            let id = canonical_arxiv_id(&entry.id);
            let title = entry
                .title
                .map(|t| collapse_whitespace(&t.content))
                .unwrap_or_default();
            let abstract_text = entry
                .summary
                .map(|s| collapse_whitespace(&s.content))
                .unwrap_or_default();
            let authors: Vec<String> = entry.authors.iter().map(|p| p.name.clone()).collect();
            let url = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_else(|| format!("https://arxiv.org/abs/{}", id));

            debug!("arXiv candidate {}: {}", id, title);
            papers.push(PaperRecord {
                id,
                title,
                authors,
                abstract_text,
                url,
                published_at: published,
            });
        }

        info!("arXiv returned {} papers in window", papers.len());
        Ok(papers)
    }
}

/// Canonical arXiv id: the last path segment of the Atom entry id with any
/// version suffix removed, so re-announced revisions dedup against the
/// original ("2401.12345v2" and "2401.12345v1" are the same paper).
fn canonical_arxiv_id(raw: &str) -> String {
    let id = raw.rsplit('/').next().unwrap_or(raw);
    if let Some(pos) = id.rfind('v') {
        let suffix = &id[pos + 1..];
        if pos > 0 && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
            return id[..pos].to_string();
        }
    }
    id.to_string()
}

/// Atom titles and abstracts from arXiv carry hard line breaks
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_id_strips_url_prefix_and_version() {
        assert_eq!(
            canonical_arxiv_id("http://arxiv.org/abs/2401.12345v2"),
            "2401.12345"
        );
        assert_eq!(canonical_arxiv_id("2401.12345v11"), "2401.12345");
        assert_eq!(canonical_arxiv_id("2401.12345"), "2401.12345");
        // Old-style ids keep their non-version 'v'
        assert_eq!(canonical_arxiv_id("http://arxiv.org/abs/cs/0112017v1"), "0112017");
    }

    #[test]
    fn collapse_whitespace_joins_wrapped_lines() {
        assert_eq!(
            collapse_whitespace("A  Title\n  Split Across\nLines"),
            "A Title Split Across Lines"
        );
    }

    #[tokio::test]
    async fn parses_atom_feed_and_filters_by_window() {
        use chrono::TimeZone;

        let atom = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>ArXiv Query Results</title>
  <id>http://arxiv.org/api/test</id>
  <updated>2024-01-03T00:00:00Z</updated>
  <entry>
    <id>http://arxiv.org/abs/2401.00001v1</id>
    <title>Newer Paper</title>
    <summary>Abstract of the newer paper.</summary>
    <published>2024-01-03T12:00:00Z</published>
    <updated>2024-01-03T12:00:00Z</updated>
    <author><name>Ada Lovelace</name></author>
    <link href="http://arxiv.org/abs/2401.00001v1" rel="alternate" type="text/html"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2312.99999v3</id>
    <title>Older Paper</title>
    <summary>Abstract of the older paper.</summary>
    <published>2023-12-20T12:00:00Z</published>
    <updated>2023-12-21T12:00:00Z</updated>
    <author><name>Alan Turing</name></author>
  </entry>
</feed>"#;

        let feed = feed_rs::parser::parse(atom.as_bytes()).unwrap();
        assert_eq!(feed.entries.len(), 2);

        // Apply the same window/mapping logic fetch_recent uses
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let in_window: Vec<_> = feed
            .entries
            .into_iter()
            .filter(|e| e.published.or(e.updated).map(|p| p > since).unwrap_or(false))
            .collect();

        assert_eq!(in_window.len(), 1);
        assert_eq!(canonical_arxiv_id(&in_window[0].id), "2401.00001");
        assert_eq!(in_window[0].authors[0].name, "Ada Lovelace");
    }
}
