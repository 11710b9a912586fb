use std::path::Path;

use chrono::Utc;
use nightforge_build::pipeline::BuildPipeline;
use nightforge_build::retry::TokioSleeper;
use nightforge_build::rotate::RotationEngine;
use nightforge_build::stage::RunRoot;
use nightforge_build::template::TemplateStore;
use nightforge_core::config::Config;
use nightforge_exec::RealRunner;

use crate::report::ReportSink;

/// CLI flags that take precedence over the corresponding config options.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOverrides {
    pub rotate_after: Option<i64>,
    pub keep_temp: bool,
    pub no_cache: bool,
    pub verbose: bool,
}

/// The sequential driver: one pipeline run per configured application, then
/// the optional rotation pass, then the report. A failed application is
/// recorded and the run continues.
pub async fn build(
    config_path: &Path,
    apps: &[String],
    overrides: BuildOverrides,
    sink: &dyn ReportSink,
) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let mut options = config.options.clone();
    if overrides.keep_temp {
        options.keep_temp = true;
    }
    if overrides.no_cache {
        options.no_cache = true;
    }
    if overrides.verbose {
        options.verbose = true;
    }

    let templates = TemplateStore::load(&options.template_dir)?;
    let mut root = RunRoot::create(&options.env_dir)?;
    if options.keep_temp {
        root.keep();
    }

    let runner = RealRunner;
    let sleeper = TokioSleeper;
    let pipeline = BuildPipeline::new(
        &runner,
        &sleeper,
        &templates,
        root.path(),
        &config.dns,
        &options,
    );

    let mut report = pipeline.run_all(&config.apps, apps).await;

    if let Some(days) = overrides.rotate_after.or(options.rotate_days) {
        report.rotated = RotationEngine::new(&runner).rotate(days, Utc::now()).await?;
    }

    sink.deliver(&report)?;

    if report.has_failures() {
        anyhow::bail!("{} application(s) failed to build", report.failed_count());
    }
    Ok(())
}
