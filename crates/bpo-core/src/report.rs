//! Dependency reports: what has to exist in the repository per branch and
//! architecture.
//!
//! A get-depends job produces one `depends.<branch>.<arch>.json` file per
//! expected (branch, arch) pair. Each file is a JSON list of packages that
//! are missing from the binary repository.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::job::JobArtifact;
use crate::package::BranchArch;
use crate::{Error, Result};

/// One package listed in a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub pkgname: String,
    pub version: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub depends: Vec<String>,
}

/// A validated report. Every expected section is present, even if empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependencyReport {
    sections: BTreeMap<BranchArch, Vec<ReportEntry>>,
}

impl DependencyReport {
    /// Build a report from the files uploaded by a get-depends job.
    ///
    /// Missing sections, unexpected files, duplicate files and malformed
    /// JSON are all rejected. A missing section never means "nothing
    /// required".
    pub fn from_files(files: &[JobArtifact], expected: &[BranchArch]) -> Result<Self> {
        let expected_set: HashSet<&BranchArch> = expected.iter().collect();
        let mut sections = BTreeMap::new();

        for file in files {
            let key = parse_file_name(&file.name)?;
            if !expected_set.contains(&key) {
                return Err(Error::InvalidInput(format!(
                    "unexpected report file: {}",
                    file.name
                )));
            }
            let entries: Vec<ReportEntry> = serde_json::from_slice(&file.data).map_err(|e| {
                Error::InvalidInput(format!("invalid JSON in {}: {}", file.name, e))
            })?;
            validate_entries(&file.name, &entries)?;
            if sections.insert(key, entries).is_some() {
                return Err(Error::InvalidInput(format!(
                    "duplicate report file: {}",
                    file.name
                )));
            }
        }

        for key in expected {
            if !sections.contains_key(key) {
                return Err(Error::InvalidInput(format!(
                    "missing report file: {}",
                    file_name(key)
                )));
            }
        }

        Ok(Self { sections })
    }

    /// Build a report directly from sections, e.g. for tests or tooling.
    pub fn from_sections(sections: BTreeMap<BranchArch, Vec<ReportEntry>>) -> Self {
        Self { sections }
    }

    pub fn sections(&self) -> impl Iterator<Item = (&BranchArch, &[ReportEntry])> {
        self.sections.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn section(&self, key: &BranchArch) -> Option<&[ReportEntry]> {
        self.sections.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &BranchArch> {
        self.sections.keys()
    }
}

/// `depends.<branch>.<arch>.json` for a key.
pub fn file_name(key: &BranchArch) -> String {
    format!("depends.{}.{}.json", key.branch, key.arch)
}

/// Branch names may contain dots (`v20.05`), arch names never do.
fn parse_file_name(name: &str) -> Result<BranchArch> {
    let inner = name
        .strip_prefix("depends.")
        .and_then(|n| n.strip_suffix(".json"))
        .ok_or_else(|| Error::InvalidInput(format!("invalid report file name: {}", name)))?;
    let (branch, arch) = inner
        .rsplit_once('.')
        .filter(|(b, a)| !b.is_empty() && !a.is_empty())
        .ok_or_else(|| Error::InvalidInput(format!("invalid report file name: {}", name)))?;
    Ok(BranchArch::new(branch, arch))
}

fn validate_entries(file: &str, entries: &[ReportEntry]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for entry in entries {
        if entry.pkgname.is_empty() || entry.version.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{}: entry with empty pkgname or version",
                file
            )));
        }
        if !seen.insert(entry.pkgname.as_str()) {
            return Err(Error::InvalidInput(format!(
                "{}: duplicate entry for {}",
                file, entry.pkgname
            )));
        }
    }
    Ok(())
}
