use std::path::Path;

use chrono::{DateTime, Local, Utc};
use log::warn;
use serde::Serialize;
use serde_json::{Value, json};

use procward_models::{InvocationFailure, ProcessError, ProcessRecord, ReconciliationResult};

use crate::{
    cli::OutputFormat,
    pidfile::PidFileStore,
    probe::{ExpectedCommand, ProbeResult, ProcessProbe, resolve_program},
};

/// Diagnostic view of one PID file.
#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub pid_file: String,
    pub verdict: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ProcessRecord>,
}

impl ProbeReport {
    /// Reads `pid_file` and judges it. Without `command` the record's own
    /// signature is the reference; a bare PID with neither can only be checked
    /// for liveness. A corrupt file is reported, not raised.
    pub fn collect(
        store: &PidFileStore,
        probe: &ProcessProbe,
        pid_file: &Path,
        command: Option<Vec<String>>,
    ) -> Result<Self, ProcessError> {
        let record = match store.read(pid_file) {
            Ok(record) => record,
            Err(ProcessError::CorruptRecord { reason, .. }) => {
                warn!("{} is corrupt: {}", pid_file.display(), reason);
                return Ok(Self {
                    pid_file: pid_file.display().to_string(),
                    verdict: "corrupt",
                    reason: Some(reason),
                    record: None,
                });
            }
            Err(err) => return Err(err),
        };

        let signature = record.as_ref().and_then(|r| r.signature.as_ref());
        let expected = match (command, signature) {
            (Some(argv), _) => {
                let exe = argv.first().and_then(|program| resolve_program(program, None));
                ExpectedCommand::new(argv, exe)
            }
            (None, Some(signature)) => {
                ExpectedCommand::new(signature.argv.clone(), Some(signature.exe.clone()))
            }
            (None, None) => {
                let verdict = match record.as_ref().and_then(|r| probe.inspect(r.pid)) {
                    Some(live) => ProbeResult::Running(live),
                    None => ProbeResult::Absent,
                };
                return Ok(Self::new(pid_file, record, &verdict));
            }
        };

        let verdict = probe.probe(record.as_ref(), &expected);
        Ok(Self::new(pid_file, record, &verdict))
    }

    pub fn new(pid_file: &Path, record: Option<ProcessRecord>, verdict: &ProbeResult) -> Self {
        let reason = match verdict {
            ProbeResult::Stale { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        Self {
            pid_file: pid_file.display().to_string(),
            verdict: verdict.as_str(),
            reason,
            record,
        }
    }
}

pub fn result_json(result: &ReconciliationResult) -> Value {
    serde_json::to_value(result).unwrap_or_else(|err| json!({ "msg": err.to_string() }))
}

pub fn failure_json(failure: &InvocationFailure) -> Value {
    json!({
        "failed": true,
        "changed": failure.changed,
        "status": failure.status().as_str(),
        "error": failure.error.kind(),
        "msg": failure.error.to_string(),
        "stdout": failure.output.stdout,
        "stderr": failure.output.stderr,
    })
}

pub fn render_result(result: &ReconciliationResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => result_json(result).to_string(),
        OutputFormat::Table => {
            let mut out = render_table(
                &["changed", "status", "pid", "rc", "message"],
                &[vec![
                    result.changed.to_string(),
                    result.status.to_string(),
                    optional(result.pid),
                    optional(result.rc),
                    truncate_cell(&result.msg, 52),
                ]],
            );
            append_stream(&mut out, "stdout", &result.stdout);
            append_stream(&mut out, "stderr", &result.stderr);
            out
        }
    }
}

pub fn render_failure(failure: &InvocationFailure, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => failure_json(failure).to_string(),
        OutputFormat::Table => {
            let mut out = render_table(
                &["changed", "status", "error", "message"],
                &[vec![
                    failure.changed.to_string(),
                    failure.status().to_string(),
                    failure.error.kind().to_string(),
                    truncate_cell(&failure.error.to_string(), 52),
                ]],
            );
            append_stream(&mut out, "stdout", &failure.output.stdout);
            append_stream(&mut out, "stderr", &failure.output.stderr);
            out
        }
    }
}

pub fn render_probe(report: &ProbeReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string(report)
            .unwrap_or_else(|err| json!({ "msg": err.to_string() }).to_string()),
        OutputFormat::Table => {
            let record = report.record.as_ref();
            let command = record
                .and_then(|r| r.signature.as_ref())
                .map(|s| s.argv.join(" "))
                .unwrap_or_else(|| "-".to_string());
            let launched = record.and_then(|r| r.launched_at);
            let mut out = render_table(
                &["pid file", "verdict", "pid", "status", "launched", "age", "command"],
                &[vec![
                    report.pid_file.clone(),
                    report.verdict.to_string(),
                    optional(record.map(|r| r.pid)),
                    record.map_or("-".to_string(), |r| r.status.as_str().to_string()),
                    launched.map_or("-".to_string(), human_time),
                    launched.map_or("-".to_string(), |ts| format_age(Utc::now(), ts)),
                    truncate_cell(&command, 52),
                ]],
            );
            if let Some(reason) = &report.reason {
                out.push_str(&format!("reason: {reason}\n"));
            }
            out
        }
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn append_stream(out: &mut String, name: &str, body: &str) {
    if body.is_empty() {
        return;
    }
    out.push_str(&format!("--- {name} ---\n{body}"));
    if !body.ends_with('\n') {
        out.push('\n');
    }
}

fn truncate_cell(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }

    let mut out = String::new();
    for ch in value.chars().take(max_chars.saturating_sub(3)) {
        out.push(ch);
    }
    out.push_str("...");
    out
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|v| v.chars().count()).collect();
    for row in rows {
        for (idx, value) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(value.chars().count());
        }
    }

    let mut out = String::new();
    push_border(&mut out, '╔', '╦', '╗', &widths);
    push_row(
        &mut out,
        &headers.iter().map(|v| (*v).to_string()).collect::<Vec<_>>(),
        &widths,
    );
    push_border(&mut out, '╠', '╬', '╣', &widths);
    for row in rows {
        push_row(&mut out, row, &widths);
    }
    push_border(&mut out, '╚', '╩', '╝', &widths);
    out
}

fn push_border(out: &mut String, left: char, middle: char, right: char, widths: &[usize]) {
    out.push(left);
    for (idx, width) in widths.iter().enumerate() {
        out.push_str(&"═".repeat(*width + 2));
        if idx + 1 == widths.len() {
            out.push(right);
        } else {
            out.push(middle);
        }
    }
    out.push('\n');
}

fn push_row(out: &mut String, values: &[String], widths: &[usize]) {
    out.push('║');
    for (idx, value) in values.iter().enumerate() {
        let width = widths[idx];
        let padding = width.saturating_sub(value.chars().count());
        out.push_str(&format!(" {}{} ║", value, " ".repeat(padding)));
    }
    out.push('\n');
}

fn format_age(now: DateTime<Utc>, since: DateTime<Utc>) -> String {
    let seconds = now.signed_duration_since(since).num_seconds().max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{hours:02}:{minutes:02}:{secs:02}")
}

fn human_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S %Z")
        .to_string()
}
