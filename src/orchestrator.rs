//! Pipeline Orchestrator
//!
//! Drives the layers in order (raw -> staging -> prod) with fail-fast
//! semantics: a failed layer stops the run and leaves downstream layers
//! untouched, so upstream state stays intact for a later resume. Resume
//! skips the layers before the requested one and trusts their output.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

use crate::aggregator;
use crate::cleaner;
use crate::config::PipelineConfig;
use crate::context::{
    Layer, ProdSummary, RawIngestSummary, Rejection, RunContext, RunMode, StagingSummary,
};
use crate::db::open_store;
use crate::raw_store;

/// Where a run ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Done,
    Failed,
}

/// Everything a finished (or failed) run reports back.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub resume_from: Layer,
    pub state: RunState,
    pub layers_completed: Vec<Layer>,
    pub raw: Option<RawIngestSummary>,
    pub staging: Option<StagingSummary>,
    pub prod: Option<ProdSummary>,
    pub rejections: Vec<Rejection>,
    pub layer_durations_ms: BTreeMap<String, u64>,
    pub duration_ms: u64,
}

/// Run the pipeline from the context's resume point through prod.
pub fn run(config: &PipelineConfig, ctx: &mut RunContext) -> Result<RunReport> {
    let started = Instant::now();
    let mut report = RunReport {
        run_id: ctx.run_id,
        mode: ctx.mode,
        resume_from: ctx.resume_from,
        state: RunState::Failed,
        layers_completed: Vec::new(),
        raw: None,
        staging: None,
        prod: None,
        rejections: Vec::new(),
        layer_durations_ms: BTreeMap::new(),
        duration_ms: 0,
    };

    let outcome = (|| -> Result<()> {
        let mut conn = open_store(&config.db_path)?;

        if ctx.resume_from <= Layer::Raw {
            info!(run_id = %ctx.run_id, layer = %Layer::Raw, "layer starting");
            let layer_started = Instant::now();
            let raw = raw_store::ingest(&mut conn, &config.raw_dir, ctx.mode)
                .context("raw layer failed")?;
            report.raw = Some(raw);
            report
                .layer_durations_ms
                .insert(Layer::Raw.name().to_string(), layer_started.elapsed().as_millis() as u64);
            report.layers_completed.push(Layer::Raw);
        } else {
            info!(layer = %Layer::Raw, "layer skipped by resume");
        }

        if ctx.resume_from <= Layer::Staging {
            info!(run_id = %ctx.run_id, layer = %Layer::Staging, "layer starting");
            let layer_started = Instant::now();
            let staging = cleaner::clean_all(&mut conn, ctx).context("staging layer failed")?;
            report.staging = Some(staging);
            report.layer_durations_ms.insert(
                Layer::Staging.name().to_string(),
                layer_started.elapsed().as_millis() as u64,
            );
            report.layers_completed.push(Layer::Staging);
        } else {
            info!(layer = %Layer::Staging, "layer skipped by resume");
        }

        info!(run_id = %ctx.run_id, layer = %Layer::Prod, "layer starting");
        let layer_started = Instant::now();
        let prod = aggregator::aggregate(&mut conn, ctx).context("prod layer failed")?;
        report.prod = Some(prod);
        report.layer_durations_ms.insert(
            Layer::Prod.name().to_string(),
            layer_started.elapsed().as_millis() as u64,
        );
        report.layers_completed.push(Layer::Prod);
        Ok(())
    })();

    report.rejections = ctx.rejections().to_vec();
    report.duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(()) => {
            report.state = RunState::Done;
            info!(
                run_id = %ctx.run_id,
                duration_ms = report.duration_ms,
                rejections = report.rejections.len(),
                "pipeline run complete"
            );
            Ok(report)
        }
        Err(err) => {
            // Completed layers keep their output; the failed layer's own
            // transactions rolled back, so a resume from it is safe.
            error!(
                run_id = %ctx.run_id,
                completed = ?report.layers_completed,
                error = %err,
                "pipeline run failed"
            );
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    fn write_partition(root: &Path, entity: &str, date: &str, lines: &[&str]) {
        let dir = root.join(entity).join(date);
        std::fs::create_dir_all(&dir).unwrap();
        let mut f = File::create(dir.join("data.jsonl")).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    fn seed_inputs(raw_dir: &Path) {
        write_partition(raw_dir, "customers", "2025-03-01", &[
            r#"{"customer_id": 1, "customer_name": "ada lovelace", "email": "ada@example.com", "country": "UK", "signup_date": "2025-01-01", "customer_segment": "Premium"}"#,
        ]);
        write_partition(raw_dir, "products", "2025-03-01", &[
            r#"{"product_id": 10, "product_name": "Widget", "category": "Tools", "price": 5.0, "cost": 2.0}"#,
        ]);
        write_partition(raw_dir, "orders", "2025-03-01", &[
            r#"{"order_id": 100, "customer_id": 1, "order_date": "2025-03-01", "order_status": "completed", "total_amount": 25.0}"#,
        ]);
        write_partition(raw_dir, "order_items", "2025-03-01", &[
            r#"{"order_item_id": 1000, "order_id": 100, "product_id": 10, "quantity": 5, "unit_price": 5.0}"#,
        ]);
    }

    fn config_in(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            db_path: dir.join("pipeline.db"),
            raw_dir: dir.join("raw"),
            quality: Default::default(),
        }
    }

    #[test]
    fn full_run_completes_all_layers() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        seed_inputs(&config.raw_dir);

        let mut ctx = RunContext::new(RunMode::Incremental, None, Layer::Raw);
        let report = run(&config, &mut ctx).unwrap();
        assert_eq!(report.state, RunState::Done);
        assert_eq!(
            report.layers_completed,
            vec![Layer::Raw, Layer::Staging, Layer::Prod]
        );
        assert_eq!(report.raw.as_ref().unwrap().total_rows(), 4);
        assert_eq!(report.staging.as_ref().unwrap().total_upserted(), 4);
        assert!(report.prod.as_ref().unwrap().total_rows() > 0);
    }

    #[test]
    fn resume_from_staging_skips_raw() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        seed_inputs(&config.raw_dir);

        let mut first = RunContext::new(RunMode::Incremental, None, Layer::Raw);
        run(&config, &mut first).unwrap();

        let mut resumed = RunContext::new(RunMode::Incremental, None, Layer::Staging);
        let report = run(&config, &mut resumed).unwrap();
        assert!(report.raw.is_none());
        assert_eq!(report.layers_completed, vec![Layer::Staging, Layer::Prod]);
    }

    #[test]
    fn empty_inputs_succeed_with_zero_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        // No raw directory at all.
        let mut ctx = RunContext::new(RunMode::Incremental, None, Layer::Raw);
        let report = run(&config, &mut ctx).unwrap();
        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.raw.as_ref().unwrap().total_rows(), 0);
        assert_eq!(report.staging.as_ref().unwrap().total_upserted(), 0);
        assert_eq!(report.prod.as_ref().unwrap().total_rows(), 0);
    }

    #[test]
    fn failed_raw_layer_stops_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        write_partition(&config.raw_dir, "customers", "2025-03-01", &["{broken"]);

        let mut ctx = RunContext::new(RunMode::Incremental, None, Layer::Raw);
        let err = run(&config, &mut ctx).unwrap_err();
        assert!(err.to_string().contains("raw layer failed"));
    }
}
