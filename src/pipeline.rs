use crate::composer;
use crate::dedup::DedupStore;
use crate::dispatcher::Dispatcher;
use crate::summarizer::Summarizer;
use crate::traits::PaperSource;
use crate::types::{
    CancelSignal, DeliveryStatus, PaperRecord, RunReport, RunState, SummaryStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Drives one end-to-end digest run:
/// source fetch, dedup filter, summarization, composition, dispatch, dedup
/// commit. Owns the lifetime of all per-run objects; the Dedup Store is the
/// only cross-run state and is held under the advisory run lock for the
/// whole run.
pub struct Pipeline {
    source: Arc<dyn PaperSource>,
    dedup: Arc<DedupStore>,
    summarizer: Summarizer,
    dispatcher: Dispatcher,
    recipients: Vec<String>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn PaperSource>,
        dedup: Arc<DedupStore>,
        summarizer: Summarizer,
        dispatcher: Dispatcher,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            source,
            dedup,
            summarizer,
            dispatcher,
            recipients,
        }
    }

    /// Executes one run. A report is always produced, even when the run
    /// aborts; fatality is visible as `final_state == Aborted` plus a
    /// `failure` message.
    pub async fn run(&self, since: DateTime<Utc>, cancel: &CancelSignal) -> RunReport {
        let run_id = Uuid::new_v4();
        info!("starting digest run {} (window since {})", run_id, since);

        if let Err(e) = self.dedup.acquire_run_lock(run_id).await {
            error!("could not acquire run lock: {}", e);
            let mut report = RunReport::new(run_id);
            report.abort(format!("run lock not acquired: {}", e));
            return report;
        }

        let mut report = self.run_locked(run_id, since, cancel).await;

        if let Err(e) = self.dedup.release_run_lock(run_id).await {
            warn!("failed to release run lock for {}: {}", run_id, e);
            report
                .warnings
                .push(format!("run lock not released cleanly: {}", e));
        }

        info!(
            "run {} finished in state {:?} ({} sent, {} failed, {} skipped)",
            run_id,
            report.final_state,
            report.recipients_sent,
            report.recipients_failed,
            report.recipients_skipped
        );
        report
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        since: DateTime<Utc>,
        cancel: &CancelSignal,
    ) -> RunReport {
        let mut report = RunReport::new(run_id);

        report.final_state = RunState::Fetching;
        let papers = match self.source.fetch_recent(since).await {
            Ok(papers) => papers,
            Err(e) => {
                error!("source fetch failed: {}", e);
                report.abort(format!("source fetch failed: {}", e));
                return report;
            }
        };
        report.papers_considered = papers.len();
        info!(
            "fetched {} candidate papers from {}",
            papers.len(),
            self.source.source_name()
        );

        report.final_state = RunState::Filtering;
        let new_papers = match self.dedup.filter_unseen(papers).await {
            Ok(papers) => papers,
            Err(e) => {
                error!("dedup read failed: {}", e);
                report.abort(format!("dedup read failed: {}", e));
                return report;
            }
        };
        report.papers_new = new_papers.len();

        if new_papers.is_empty() {
            info!("no new papers in window, nothing to send");
            report.final_state = RunState::Done;
            return report;
        }

        if cancel.is_cancelled() {
            report.abort("run cancelled".to_string());
            return report;
        }

        report.final_state = RunState::Summarizing;
        let paper_map: HashMap<String, PaperRecord> = new_papers
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();
        let summaries = self.summarizer.summarize_all(&new_papers, cancel).await;
        report.papers_summarized_ok = summaries
            .iter()
            .filter(|s| s.status == SummaryStatus::Ok)
            .count();
        report.papers_fallback = summaries.len() - report.papers_summarized_ok;

        if cancel.is_cancelled() {
            report.abort("run cancelled during summarization".to_string());
            return report;
        }

        report.final_state = RunState::Composing;
        let digest = match composer::compose(run_id, Utc::now(), summaries, &paper_map) {
            Ok(digest) => digest,
            Err(e) => {
                error!("digest composition failed: {}", e);
                report.abort(format!("digest composition failed: {}", e));
                return report;
            }
        };
        let email = composer::render_email(&digest, &paper_map);

        report.final_state = RunState::Dispatching;
        let records = self
            .dispatcher
            .dispatch(&digest, &email, &self.recipients, cancel)
            .await;
        for record in &records {
            match record.status {
                DeliveryStatus::Sent => report.recipients_sent += 1,
                DeliveryStatus::Failed => report.recipients_failed += 1,
                DeliveryStatus::Skipped => report.recipients_skipped += 1,
            }
        }

        // Every paper in the composed digest counts as covered, regardless
        // of individual delivery outcomes.
        report.final_state = RunState::Committing;
        let paper_ids: HashSet<String> = digest
            .summaries
            .iter()
            .map(|s| s.paper_id.clone())
            .collect();
        if let Err(e) = self.dedup.commit_with_retry(&paper_ids, run_id).await {
            warn!("dedup commit failed after delivery: {}", e);
            report.warnings.push(format!(
                "dedup commit failed, delivered papers may be re-sent next run: {}",
                e
            ));
        }

        if cancel.is_cancelled() {
            report.abort("run cancelled during dispatch".to_string());
        } else {
            report.final_state = RunState::Done;
        }
        report
    }
}
