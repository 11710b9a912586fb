//! Delivery of the finished run report.
//!
//! The report always goes somewhere, success or not. SMTP delivery sits
//! behind the same trait; this binary ships the stdout sink.

use nightforge_core::report::RunReport;

pub trait ReportSink {
    fn deliver(&self, report: &RunReport) -> anyhow::Result<()>;
}

pub struct StdoutSink;

impl ReportSink for StdoutSink {
    fn deliver(&self, report: &RunReport) -> anyhow::Result<()> {
        println!("{report}");
        Ok(())
    }
}
