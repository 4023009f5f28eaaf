//! Run summaries under `reports/{run_id}/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;

use crate::discovery::DiscoveryReport;
use crate::worker::ProcessReport;

pub async fn write_discovery_report(reports_dir: &Path, report: &DiscoveryReport) -> Result<PathBuf> {
    let counts = &report.counts;
    let markdown = format!(
        "# Discovery Run\n\n- Session: `{}`\n- Source: {}\n- Date range: {}\n- Dry run: {}\n- Resumed: {}\n- Pages: {}..={} of {} ({:?})\n- Completed: {}\n- Started: {}\n- Finished: {}\n\n## Counts\n- found: {}\n- new: {}\n- updated: {}\n- skipped: {}\n- failed: {}\n- attachments: {}\n\n## Checkpoint Totals\n- processed: {}\n- downloaded: {}\n- skipped: {}\n",
        report.session_id,
        report.source_id,
        report.date_range,
        report.dry_run,
        report.resumed,
        report.start_page,
        report.last_page_visited,
        report.total_pages,
        report.page_count_basis,
        report.completed,
        report.started_at,
        report.finished_at,
        counts.found,
        counts.new,
        counts.updated,
        counts.skipped,
        counts.failed,
        counts.attachments,
        report.total_processed,
        report.total_downloaded,
        report.total_skipped,
    );
    write_summary(reports_dir, &report.session_id.to_string(), "discovery", report, markdown).await
}

pub async fn write_process_report(reports_dir: &Path, report: &ProcessReport) -> Result<PathBuf> {
    let by_type = report
        .by_type
        .iter()
        .map(|(k, v)| format!("- {}: {}", k, v))
        .collect::<Vec<_>>()
        .join("\n");
    let tiers = report
        .cascade
        .tiers
        .iter()
        .map(|(tier, stats)| {
            format!(
                "| {} | {} | {} | {} | {} | {:.4} |",
                tier, stats.invocations, stats.with_signal, stats.fields_filled, stats.failures, stats.cost_usd
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let errors = report
        .errors
        .iter()
        .map(|e| format!("- {e}"))
        .collect::<Vec<_>>()
        .join("\n");

    let markdown = format!(
        "# Process Run\n\n- Run ID: `{}`\n- Claimed: {}\n- Processed: {}\n- Failed: {}\n- Flagged for review: {}\n- Polls: {}\n- Extraction cost (USD): {:.4}\n\n## Announcement Types\n{}\n\n## Extraction Tiers\n| tier | invoked | with signal | fields filled | failures | cost |\n|---|---|---|---|---|---|\n{}\n\n## Errors\n{}\n",
        report.run_id,
        report.claimed,
        report.processed,
        report.failed,
        report.flagged_for_review,
        report.polls,
        report.cascade.total_cost_usd(),
        by_type,
        tiers,
        if errors.is_empty() { "none".to_string() } else { errors },
    );
    write_summary(reports_dir, &report.run_id.to_string(), "process", report, markdown).await
}

async fn write_summary<T: Serialize>(
    reports_dir: &Path,
    run_id: &str,
    kind: &str,
    report: &T,
    markdown: String,
) -> Result<PathBuf> {
    let run_dir = reports_dir.join(run_id);
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).with_context(|| format!("serializing {kind} report"))?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    fs::write(run_dir.join("summary.md"), markdown)
        .await
        .context("writing summary.md")?;

    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use kfund_core::ExtractionTier;
    use kfund_extract::TierStats;
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn process_report_lists_tier_costs() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = ProcessReport {
            run_id: Uuid::new_v4(),
            claimed: 3,
            processed: 2,
            failed: 1,
            errors: vec!["https://example.test/a: decoding detail payload".to_string()],
            ..Default::default()
        };
        report.by_type.insert("FUNDING".to_string(), 2);
        report.cascade.tiers.insert(
            ExtractionTier::Tier2,
            TierStats {
                invocations: 1,
                with_signal: 1,
                fields_filled: 2,
                failures: 0,
                cost_usd: 0.0012,
            },
        );

        let run_dir = write_process_report(dir.path(), &report).await.unwrap();
        assert_eq!(run_dir, dir.path().join(report.run_id.to_string()));

        let md = std::fs::read_to_string(run_dir.join("summary.md")).unwrap();
        assert!(md.contains("- Processed: 2"));
        assert!(md.contains("| TIER2 | 1 | 1 | 2 | 0 | 0.0012 |"));
        assert!(md.contains("decoding detail payload"));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("summary.json")).unwrap()).unwrap();
        assert_eq!(json["failed"], 1);
    }
}
