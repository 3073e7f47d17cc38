use crate::types::{
    DigestDocument, DigestError, PaperRecord, Result, SummaryResult, SummaryStatus,
};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Rendered digest content ready for the email channel
#[derive(Debug, Clone)]
pub struct DigestEmail {
    pub subject: String,
    pub body: String,
}

/// Builds the digest document for one run. Pure: identical inputs produce
/// an identical document. Summaries are ordered by published_at descending
/// with ties broken by paper id ascending.
///
/// Composing with zero summaries is a validation error; a run with nothing
/// new short-circuits before ever reaching this stage.
pub fn compose(
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    summaries: Vec<SummaryResult>,
    papers: &HashMap<String, PaperRecord>,
) -> Result<DigestDocument> {
    if summaries.is_empty() {
        return Err(DigestError::Validation(
            "cannot compose a digest from zero summaries".to_string(),
        ));
    }

    let mut ordered = summaries;
    ordered.sort_by(|a, b| {
        match (papers.get(&a.paper_id), papers.get(&b.paper_id)) {
            (Some(pa), Some(pb)) => pb
                .published_at
                .cmp(&pa.published_at)
                .then_with(|| pa.id.cmp(&pb.id)),
            // Summaries without a matching record sort last, by id
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.paper_id.cmp(&b.paper_id),
        }
    });

    debug!("composed digest for run {} with {} entries", run_id, ordered.len());

    Ok(DigestDocument {
        run_id,
        generated_at,
        summaries: ordered,
    })
}

pub fn render_email(digest: &DigestDocument, papers: &HashMap<String, PaperRecord>) -> DigestEmail {
    let subject = format!(
        "AI Paper Digest for {}: {} new paper{}",
        digest.generated_at.format("%Y-%m-%d"),
        digest.summaries.len(),
        if digest.summaries.len() == 1 { "" } else { "s" }
    );

    let mut body = String::new();
    body.push_str(&format!(
        "AI Paper Digest\nGenerated: {}\n\n",
        digest.generated_at.format("%Y-%m-%d %H:%M UTC")
    ));

    for (index, summary) in digest.summaries.iter().enumerate() {
        let Some(paper) = papers.get(&summary.paper_id) else {
            continue;
        };

        body.push_str(&format!("{}. {}\n", index + 1, paper.title));
        body.push_str(&format!("   Authors: {}\n", paper.authors.join(", ")));
        body.push_str(&format!(
            "   Published: {}\n",
            paper.published_at.format("%Y-%m-%d")
        ));
        if summary.status == SummaryStatus::FailedFallback {
            body.push_str("   (summary unavailable, abstract excerpt follows)\n");
        }
        body.push_str(&format!("   {}\n", summary.summary_text));
        body.push_str(&format!("   Link: {}\n\n", paper.url));
    }

    DigestEmail { subject, body }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn paper(id: &str, published_at: DateTime<Utc>) -> PaperRecord {
        PaperRecord {
            id: id.to_string(),
            title: format!("Paper {}", id),
            authors: vec!["A. Author".to_string()],
            abstract_text: "An abstract.".to_string(),
            url: format!("https://arxiv.org/abs/{}", id),
            published_at,
        }
    }

    fn summary(paper_id: &str) -> SummaryResult {
        SummaryResult {
            paper_id: paper_id.to_string(),
            summary_text: format!("Summary of {}", paper_id),
            status: SummaryStatus::Ok,
            attempt_count: 1,
        }
    }

    fn paper_map(papers: Vec<PaperRecord>) -> HashMap<String, PaperRecord> {
        papers.into_iter().map(|p| (p.id.clone(), p)).collect()
    }

    #[test]
    fn orders_by_date_descending_then_id_ascending() {
        let jan_first = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let jan_third = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();

        let papers = paper_map(vec![
            paper("b", jan_third),
            paper("a", jan_third),
            paper("c", jan_first),
        ]);
        let summaries = vec![summary("b"), summary("a"), summary("c")];

        let digest = compose(Uuid::new_v4(), Utc::now(), summaries, &papers).unwrap();
        let order: Vec<&str> = digest.summaries.iter().map(|s| s.paper_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_summaries_is_a_validation_error() {
        let result = compose(Uuid::new_v4(), Utc::now(), Vec::new(), &HashMap::new());
        assert!(matches!(result, Err(DigestError::Validation(_))));
    }

    #[test]
    fn composition_is_deterministic() {
        let published = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let generated = Utc.with_ymd_and_hms(2024, 1, 4, 8, 0, 0).unwrap();
        let run_id = Uuid::new_v4();
        let papers = paper_map(vec![paper("x", published), paper("y", published)]);

        let first = compose(run_id, generated, vec![summary("y"), summary("x")], &papers).unwrap();
        let second = compose(run_id, generated, vec![summary("x"), summary("y")], &papers).unwrap();

        assert_eq!(first.generated_at, second.generated_at);
        let first_order: Vec<_> = first.summaries.iter().map(|s| &s.paper_id).collect();
        let second_order: Vec<_> = second.summaries.iter().map(|s| &s.paper_id).collect();
        assert_eq!(first_order, second_order);
    }

    #[test]
    fn rendered_email_lists_every_entry() {
        let published = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let papers = paper_map(vec![paper("p1", published), paper("p2", published)]);

        let mut fallback = summary("p2");
        fallback.status = SummaryStatus::FailedFallback;

        let digest = compose(
            Uuid::new_v4(),
            Utc::now(),
            vec![summary("p1"), fallback],
            &papers,
        )
        .unwrap();
        let email = render_email(&digest, &papers);

        assert!(email.subject.contains("2 new papers"));
        assert!(email.body.contains("Paper p1"));
        assert!(email.body.contains("Paper p2"));
        assert!(email.body.contains("summary unavailable"));
        assert!(email.body.contains("https://arxiv.org/abs/p1"));
    }
}
