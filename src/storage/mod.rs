//! Persistence traits for test cases, mocks and reports
//!
//! The orchestrators only see these traits; the YAML document store in
//! [`yaml`] is the shipped implementation.

pub mod yaml;

use crate::error::Result;
use crate::models::{Mock, TestCase, TestReport, TestResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use yaml::{YamlMockDb, YamlReportDb, YamlTestDb};

/// Test-case persistence for one recording root
#[async_trait]
pub trait TestDb: Send + Sync {
    /// All test-set ids under the root, natural-sorted
    async fn get_all_test_set_ids(&self) -> Result<Vec<String>>;
    /// Test cases of one set, in stable recording order
    async fn get_test_cases(&self, test_set_id: &str) -> Result<Vec<TestCase>>;
    /// Persist a captured test case; assigns the next free `test-N` name
    /// when the case is unnamed
    async fn insert_test_case(&self, test_set_id: &str, test_case: &TestCase) -> Result<String>;
}

/// Mock persistence for one recording root
#[async_trait]
pub trait MockDb: Send + Sync {
    async fn get_filtered_mocks(
        &self,
        test_set_id: &str,
        req_ts: Option<DateTime<Utc>>,
        res_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<Mock>>;
    async fn get_unfiltered_mocks(
        &self,
        test_set_id: &str,
        req_ts: Option<DateTime<Utc>>,
        res_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<Mock>>;
    async fn insert_mock(&self, test_set_id: &str, mock: &Mock) -> Result<()>;
}

/// Report persistence for test runs
#[async_trait]
pub trait ReportDb: Send + Sync {
    async fn get_all_test_run_ids(&self) -> Result<Vec<String>>;
    /// Persist a report; returns its document name (`report-N`). A report
    /// carrying a name overwrites that document, so a running report can be
    /// finalised in place.
    async fn insert_report(
        &self,
        test_run_id: &str,
        test_set_id: &str,
        report: &TestReport,
    ) -> Result<String>;
    async fn insert_test_case_result(
        &self,
        test_run_id: &str,
        test_set_id: &str,
        result: TestResult,
    ) -> Result<()>;
    async fn get_test_case_results(
        &self,
        test_run_id: &str,
        test_set_id: &str,
    ) -> Result<Vec<TestResult>>;
    async fn get_report(&self, test_run_id: &str, test_set_id: &str) -> Result<TestReport>;
}

/// Sort ids by the numeric suffix after the last `-`, falling back to a
/// lexicographic order for ids without one. `set-10` sorts after `set-2`.
pub fn natural_sort_ids(ids: &mut [String]) {
    fn split(id: &str) -> (String, Option<u64>) {
        match id.rsplit_once('-') {
            Some((prefix, suffix)) => match suffix.parse::<u64>() {
                Ok(n) => (prefix.to_string(), Some(n)),
                Err(_) => (id.to_string(), None),
            },
            None => (id.to_string(), None),
        }
    }
    ids.sort_by(|a, b| {
        let (pa, na) = split(a);
        let (pb, nb) = split(b);
        pa.cmp(&pb)
            .then(match (na, nb) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.cmp(b))
    });
}

/// Next free id under a `<template>-N` naming scheme: 1 + max existing N
pub fn next_id(existing: &[String], template: &str) -> String {
    let max = existing
        .iter()
        .filter_map(|id| id.strip_prefix(template)?.strip_prefix('-')?.parse::<u64>().ok())
        .max();
    format!("{}-{}", template, max.map_or(0, |n| n + 1))
}
