//! Check reports shared by preflight and post-change validation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Environment;
use crate::ui;

/// The result of a single check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Warn => write!(f, "WARN"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// A single check result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub details: String,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, details)
    }

    pub fn warn(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, details)
    }

    pub fn fail(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, details)
    }

    fn new(name: impl Into<String>, status: CheckStatus, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            details: details.into(),
        }
    }
}

/// Aggregated pass/warn/fail counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckTotals {
    pub passed: usize,
    pub warnings: usize,
    pub failed: usize,
    pub total: usize,
}

impl CheckTotals {
    /// Sum of two totals (preflight plus validation in a run summary).
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            passed: self.passed + other.passed,
            warnings: self.warnings + other.warnings,
            failed: self.failed + other.failed,
            total: self.total + other.total,
        }
    }
}

/// An ordered list of check results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckReport {
    pub title: String,
    pub checks: Vec<CheckResult>,
}

impl CheckReport {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            checks: Vec::new(),
        }
    }

    pub fn push(&mut self, check: CheckResult) {
        self.checks.push(check);
    }

    pub fn extend(&mut self, checks: impl IntoIterator<Item = CheckResult>) {
        self.checks.extend(checks);
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    #[must_use]
    pub fn totals(&self) -> CheckTotals {
        CheckTotals {
            passed: self.count(CheckStatus::Pass),
            warnings: self.count(CheckStatus::Warn),
            failed: self.count(CheckStatus::Fail),
            total: self.checks.len(),
        }
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.count(CheckStatus::Fail) > 0
    }

    /// Failed checks, `name: details` joined for error messages.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .map(|c| format!("{}: {}", c.name, c.details))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Print every check and the totals line.
    pub fn print_summary(&self) {
        ui::print_section(&self.title);
        for check in &self.checks {
            ui::print_check_result(&check.name, check.status, Some(&check.details));
        }
        let totals = self.totals();
        println!();
        let line = format!(
            "{}/{} passed, {} warning(s), {} failed",
            totals.passed, totals.total, totals.warnings, totals.failed
        );
        if totals.failed > 0 {
            ui::print_error(&line);
        } else if totals.warnings > 0 {
            ui::print_warning(&line);
        } else {
            ui::print_success(&line);
        }
    }
}

/// Machine-readable validation summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub timestamp: DateTime<Utc>,
    pub environment: Environment,
    pub cluster: String,
    pub results: CheckTotals,
    pub status: String,
}

impl ValidationSummary {
    #[must_use]
    pub fn from_report(report: &CheckReport, environment: Environment, cluster: &str) -> Self {
        let results = report.totals();
        let status = if results.failed > 0 {
            "failed"
        } else if results.warnings > 0 {
            "passed_with_warnings"
        } else {
            "passed"
        };
        Self {
            timestamp: Utc::now(),
            environment,
            cluster: cluster.to_string(),
            results,
            status: status.to_string(),
        }
    }
}
