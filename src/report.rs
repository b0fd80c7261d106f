use anyhow::{Context, Result};
use csv::Writer;
use serde::Serialize;
use serde_json::{Value, json};
use std::{fs, io::IsTerminal, path::Path};

use crate::common::now_unix_seconds;
use crate::error::ClassifiedError;
use crate::portal::JobInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    Interrupted,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "success",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

/// One row of the run outcome, in original input order.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub index: usize,
    pub subscriber_id: String,
    pub date_of_birth: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
    pub payload: Option<Value>,
}

impl JobRecord {
    pub fn success(index: usize, input: &JobInput, attempts: u32, payload: Value) -> Self {
        Self {
            index,
            subscriber_id: input.subscriber_id.clone(),
            date_of_birth: input.date_of_birth.clone(),
            status: JobStatus::Succeeded,
            attempts,
            error_kind: None,
            error: None,
            payload: Some(payload),
        }
    }

    pub fn failure(index: usize, input: &JobInput, attempts: u32, err: &ClassifiedError) -> Self {
        Self {
            index,
            subscriber_id: input.subscriber_id.clone(),
            date_of_birth: input.date_of_birth.clone(),
            status: JobStatus::Failed,
            attempts,
            error_kind: Some(err.kind()),
            error: Some(err.to_string()),
            payload: None,
        }
    }

    pub fn interrupted(index: usize, input: &JobInput) -> Self {
        Self {
            index,
            subscriber_id: input.subscriber_id.clone(),
            date_of_birth: input.date_of_birth.clone(),
            status: JobStatus::Interrupted,
            attempts: 0,
            error_kind: Some("interrupted"),
            error: Some("run stopped before this patient was attempted".to_string()),
            payload: None,
        }
    }
}

/// Final, ordered, serializable outcome of a bulk run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub portal_id: String,
    pub total: usize,
    pub successes: usize,
    pub failures: usize,
    pub interrupted: usize,
    pub duration_seconds: u64,
    pub jobs_per_minute: f64,
    pub final_concurrency: usize,
    pub cooldowns_applied: usize,
    pub records: Vec<JobRecord>,
}

impl RunReport {
    pub fn empty(portal_id: String) -> Self {
        Self {
            portal_id,
            total: 0,
            successes: 0,
            failures: 0,
            interrupted: 0,
            duration_seconds: 0,
            jobs_per_minute: 0.0,
            final_concurrency: 0,
            cooldowns_applied: 0,
            records: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.successes + self.failures + self.interrupted == self.total
            && self.records.len() == self.total
    }

    /// One CSV row per job input, success rows carrying the headline benefit
    /// figures from the adapter summary.
    pub fn export_csv(&self, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed creating report parent directory {}",
                    parent.display()
                )
            })?;
        }

        let file_name = output_path
            .file_name()
            .and_then(|x| x.to_str())
            .unwrap_or("run-report.csv");
        let tmp_path = output_path.with_file_name(format!("{file_name}.tmp"));

        let mut writer = Writer::from_path(&tmp_path)
            .with_context(|| format!("Failed creating temp report CSV {}", tmp_path.display()))?;
        writer
            .write_record([
                "member_id",
                "date_of_birth",
                "status",
                "attempts",
                "error_kind",
                "error",
                "plan_name",
                "deductible_remaining",
                "maximum_remaining",
            ])
            .context("Failed writing report CSV header")?;

        for record in &self.records {
            writer
                .write_record([
                    record.subscriber_id.clone(),
                    record.date_of_birth.clone(),
                    record.status.label().to_string(),
                    record.attempts.to_string(),
                    record.error_kind.unwrap_or_default().to_string(),
                    record.error.clone().unwrap_or_default(),
                    summary_field(record.payload.as_ref(), &["summary", "plan_name"]),
                    summary_field(
                        record.payload.as_ref(),
                        &["summary", "deductible", "remaining"],
                    ),
                    summary_field(
                        record.payload.as_ref(),
                        &["summary", "annual_maximum", "remaining"],
                    ),
                ])
                .with_context(|| {
                    format!("Failed writing report row for {}", record.subscriber_id)
                })?;
        }
        writer.flush().context("Failed flushing report CSV writer")?;

        fs::rename(&tmp_path, output_path).with_context(|| {
            format!(
                "Failed moving temp report {} to {}",
                tmp_path.display(),
                output_path.display()
            )
        })?;
        Ok(())
    }

    /// Full payloads plus the summary block, for downstream consumers.
    pub fn export_json(&self, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed creating report parent directory {}",
                    parent.display()
                )
            })?;
        }

        let document = json!({
            "generated_at_unix": now_unix_seconds(),
            "portal": self.portal_id,
            "summary": {
                "total": self.total,
                "successes": self.successes,
                "failures": self.failures,
                "interrupted": self.interrupted,
                "duration_seconds": self.duration_seconds,
                "jobs_per_minute": self.jobs_per_minute,
                "final_concurrency": self.final_concurrency,
                "cooldowns_applied": self.cooldowns_applied,
            },
            "records": self.records,
        });
        let body = serde_json::to_string_pretty(&document)
            .context("Failed serializing JSON report")?;

        let file_name = output_path
            .file_name()
            .and_then(|x| x.to_str())
            .unwrap_or("run-report.json");
        let tmp_path = output_path.with_file_name(format!("{file_name}.tmp"));
        fs::write(&tmp_path, body)
            .with_context(|| format!("Failed writing temp JSON report {}", tmp_path.display()))?;
        fs::rename(&tmp_path, output_path).with_context(|| {
            format!(
                "Failed moving temp JSON report {} to {}",
                tmp_path.display(),
                output_path.display()
            )
        })?;
        Ok(())
    }

    pub fn print_summary_table(&self) {
        let use_color = std::io::stdout().is_terminal();
        let reset = if use_color { "\x1b[0m" } else { "" };
        let bold = if use_color { "\x1b[1m" } else { "" };
        let cyan = if use_color { "\x1b[36m" } else { "" };
        let green = if use_color { "\x1b[32m" } else { "" };
        let yellow = if use_color { "\x1b[33m" } else { "" };
        let red = if use_color { "\x1b[31m" } else { "" };

        let border = "+--------------------------------------------+--------------------------+";
        let title = "| BULK EXTRACTION SUMMARY                    |                          |";

        println!();
        println!("{bold}{cyan}{border}{reset}");
        println!("{bold}{cyan}{title}{reset}");
        println!("{bold}{cyan}{border}{reset}");
        println!("| {:<42} | {:<24} |", "Portal", self.portal_id);
        println!("| {:<42} | {:<24} |", "Patients in roster", self.total);
        println!(
            "| {:<42} | {}{:<24}{} |",
            "Extracted successfully", green, self.successes, reset
        );
        println!(
            "| {:<42} | {}{:<24}{} |",
            "Failed", red, self.failures, reset
        );
        println!(
            "| {:<42} | {}{:<24}{} |",
            "Interrupted", yellow, self.interrupted, reset
        );
        println!(
            "| {:<42} | {:<24} |",
            "Duration (seconds)", self.duration_seconds
        );
        println!(
            "| {:<42} | {:<24} |",
            "Throughput (patients/minute)",
            format!("{:.1}", self.jobs_per_minute)
        );
        println!(
            "| {:<42} | {:<24} |",
            "Final concurrency", self.final_concurrency
        );
        println!(
            "| {:<42} | {:<24} |",
            "Rate-limit cooldowns", self.cooldowns_applied
        );
        println!("{bold}{cyan}{border}{reset}");
        println!();
    }
}

fn summary_field(payload: Option<&Value>, path: &[&str]) -> String {
    let mut value = match payload {
        Some(value) => value,
        None => return String::new(),
    };
    for key in path {
        value = match value.get(key) {
            Some(next) => next,
            None => return String::new(),
        };
    }
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portal::testing::input;
    use tempfile::TempDir;

    fn sample_report() -> RunReport {
        let ok_payload = json!({
            "summary": {
                "plan_name": "PPO Plus",
                "deductible": { "amount": 50, "met": 10, "remaining": 40 },
                "annual_maximum": { "amount": 1500, "used": 300, "remaining": 1200 },
            }
        });
        let records = vec![
            JobRecord::success(0, &input("P001"), 1, ok_payload),
            JobRecord::failure(
                1,
                &input("P002"),
                2,
                &ClassifiedError::NotFound("no members found".into()),
            ),
            JobRecord::interrupted(2, &input("P003")),
        ];
        RunReport {
            portal_id: "dnoa".into(),
            total: 3,
            successes: 1,
            failures: 1,
            interrupted: 1,
            duration_seconds: 42,
            jobs_per_minute: 4.3,
            final_concurrency: 2,
            cooldowns_applied: 0,
            records,
        }
    }

    #[test]
    fn csv_export_writes_one_row_per_input() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("report.csv");
        let report = sample_report();
        report.export_csv(&path).expect("export failed");

        let body = fs::read_to_string(&path).expect("read failed");
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("member_id,date_of_birth,status"));
        assert!(lines[1].starts_with("P001,1985-03-07,success,1,,,PPO Plus,40,1200"));
        assert!(lines[2].contains("not_found"));
        assert!(lines[3].contains("interrupted"));
        assert!(!path.with_file_name("report.csv.tmp").exists());
    }

    #[test]
    fn json_export_parses_back() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("report.json");
        let report = sample_report();
        report.export_json(&path).expect("export failed");

        let body = fs::read_to_string(&path).expect("read failed");
        let document: Value = serde_json::from_str(&body).expect("invalid JSON");
        assert_eq!(document["portal"], "dnoa");
        assert_eq!(document["summary"]["total"], 3);
        assert_eq!(document["records"].as_array().map(Vec::len), Some(3));
        assert_eq!(document["records"][0]["status"], "succeeded");
    }

    #[test]
    fn completeness_invariant_holds() {
        let report = sample_report();
        assert!(report.is_complete());
        assert!(RunReport::empty("dnoa".into()).is_complete());
    }
}
