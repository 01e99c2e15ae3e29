//! YAML document store
//!
//! Layout under the recording root:
//!
//! ```text
//! <root>/<test-set>/tests/test-1.yaml     one document per test case
//! <root>/<test-set>/mocks.yaml            multi-document mock stream
//! <report-root>/<test-run-N>/report-N.yaml one report per completed set
//! ```

use super::{natural_sort_ids, MockDb, ReportDb, TestDb};
use crate::error::{Result, RetraceError};
use crate::mocks::MockStore;
use crate::models::{
    Mock, TestCase, TestReport, TestResult, API_VERSION, ENTERPRISE_API_VERSION, REPORT_TEMPLATE,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

fn check_version(version: &str, what: &str, name: &str) {
    if version == ENTERPRISE_API_VERSION {
        warn!(
            "{} {:?} was recorded with the enterprise edition and may not behave correctly here",
            what, name
        );
    } else if version != API_VERSION {
        warn!(
            "{} {:?} carries unknown version {:?}; loading it anyway",
            what, name, version
        );
    }
}

async fn list_dirs(path: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    natural_sort_ids(&mut out);
    Ok(out)
}

async fn list_yaml_stems(path: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
            if let Some(stem) = path.file_stem() {
                out.push(stem.to_string_lossy().into_owned());
            }
        }
    }
    natural_sort_ids(&mut out);
    Ok(out)
}

async fn read_doc<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path).await?;
    serde_yaml::from_str(&content)
        .map_err(|e| RetraceError::Storage(format!("failed to decode {:?}: {}", path, e)))
}

async fn write_doc<T: serde::Serialize>(path: &Path, doc: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_yaml::to_string(doc)?;
    tokio::fs::write(path, data).await?;
    Ok(())
}

/// `1 + max` numeric suffix among `<template>-N` stems; 1 when none exist
fn next_index(stems: &[String], template: &str) -> u64 {
    stems
        .iter()
        .filter_map(|s| s.strip_prefix(template)?.strip_prefix('-')?.parse::<u64>().ok())
        .max()
        .map_or(1, |n| n + 1)
}

/// Test cases as YAML documents, one file per case
pub struct YamlTestDb {
    root: PathBuf,
}

impl YamlTestDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tests_dir(&self, test_set_id: &str) -> PathBuf {
        self.root.join(test_set_id).join("tests")
    }
}

#[async_trait]
impl TestDb for YamlTestDb {
    async fn get_all_test_set_ids(&self) -> Result<Vec<String>> {
        list_dirs(&self.root).await
    }

    async fn get_test_cases(&self, test_set_id: &str) -> Result<Vec<TestCase>> {
        let dir = self.tests_dir(test_set_id);
        let mut cases = Vec::new();
        for stem in list_yaml_stems(&dir).await? {
            let mut tc: TestCase = read_doc(&dir.join(format!("{}.yaml", stem))).await?;
            check_version(&tc.version, "test case", &stem);
            if tc.name.is_empty() {
                tc.name = stem;
            }
            cases.push(tc);
        }
        Ok(cases)
    }

    async fn insert_test_case(&self, test_set_id: &str, test_case: &TestCase) -> Result<String> {
        let dir = self.tests_dir(test_set_id);
        let stems = list_yaml_stems(&dir).await?;
        let name = if test_case.name.is_empty() {
            format!("test-{}", next_index(&stems, "test"))
        } else {
            test_case.name.clone()
        };
        let mut doc = test_case.clone();
        doc.name = name.clone();
        write_doc(&dir.join(format!("{}.yaml", name)), &doc).await?;
        Ok(name)
    }
}

/// Mocks as one multi-document YAML stream per test set
pub struct YamlMockDb {
    root: PathBuf,
}

impl YamlMockDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn mocks_file(&self, test_set_id: &str) -> PathBuf {
        self.root.join(test_set_id).join("mocks.yaml")
    }

    async fn load(&self, test_set_id: &str) -> Result<MockStore> {
        let path = self.mocks_file(test_set_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(MockStore::new());
            }
            Err(e) => return Err(e.into()),
        };
        let mut mocks = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(&content) {
            let mock = Mock::deserialize(doc)
                .map_err(|e| RetraceError::Storage(format!("failed to decode {:?}: {}", path, e)))?;
            check_version(&mock.version, "mock", &mock.name);
            mocks.push(mock);
        }
        Ok(MockStore::from_mocks(mocks))
    }
}

#[async_trait]
impl MockDb for YamlMockDb {
    async fn get_filtered_mocks(
        &self,
        test_set_id: &str,
        req_ts: Option<DateTime<Utc>>,
        res_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<Mock>> {
        Ok(self.load(test_set_id).await?.get_filtered(req_ts, res_ts))
    }

    async fn get_unfiltered_mocks(
        &self,
        test_set_id: &str,
        req_ts: Option<DateTime<Utc>>,
        res_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<Mock>> {
        Ok(self.load(test_set_id).await?.get_unfiltered(req_ts, res_ts))
    }

    async fn insert_mock(&self, test_set_id: &str, mock: &Mock) -> Result<()> {
        let path = self.mocks_file(test_set_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut doc = String::from("---\n");
        doc.push_str(&serde_yaml::to_string(mock)?);

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(doc.as_bytes()).await?;
        Ok(())
    }
}

/// Per-run report files plus in-memory per-set result accumulation
pub struct YamlReportDb {
    root: PathBuf,
    results: Mutex<HashMap<(String, String), Vec<TestResult>>>,
}

impl YamlReportDb {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            results: Mutex::new(HashMap::new()),
        }
    }

    fn run_dir(&self, test_run_id: &str) -> PathBuf {
        self.root.join(test_run_id)
    }
}

#[async_trait]
impl ReportDb for YamlReportDb {
    async fn get_all_test_run_ids(&self) -> Result<Vec<String>> {
        list_dirs(&self.root).await
    }

    async fn insert_report(
        &self,
        test_run_id: &str,
        test_set_id: &str,
        report: &TestReport,
    ) -> Result<String> {
        let dir = self.run_dir(test_run_id);
        let mut doc = report.clone();
        doc.test_set = test_set_id.to_string();
        if doc.name.is_empty() {
            let stems = list_yaml_stems(&dir).await?;
            doc.name = format!(
                "{}-{}",
                REPORT_TEMPLATE,
                next_index(&stems, REPORT_TEMPLATE)
            );
        }
        write_doc(&dir.join(format!("{}.yaml", doc.name)), &doc).await?;
        Ok(doc.name)
    }

    async fn insert_test_case_result(
        &self,
        test_run_id: &str,
        test_set_id: &str,
        result: TestResult,
    ) -> Result<()> {
        self.results
            .lock()
            .entry((test_run_id.to_string(), test_set_id.to_string()))
            .or_default()
            .push(result);
        Ok(())
    }

    async fn get_test_case_results(
        &self,
        test_run_id: &str,
        test_set_id: &str,
    ) -> Result<Vec<TestResult>> {
        Ok(self
            .results
            .lock()
            .get(&(test_run_id.to_string(), test_set_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn get_report(&self, test_run_id: &str, test_set_id: &str) -> Result<TestReport> {
        let dir = self.run_dir(test_run_id);
        for stem in list_yaml_stems(&dir).await? {
            let report: TestReport = read_doc(&dir.join(format!("{}.yaml", stem))).await?;
            if report.test_set == test_set_id {
                return Ok(report);
            }
        }
        Err(RetraceError::Storage(format!(
            "no report for test set {:?} in run {:?}",
            test_set_id, test_run_id
        )))
    }
}
