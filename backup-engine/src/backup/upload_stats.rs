use serde::Serialize;
use std::collections::BTreeSet;

/// Outcome of archiving one class of uploaded files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub total_count: u64,
    pub included_count: u64,
    pub failed_ids: BTreeSet<String>,
}

impl UploadStats {
    pub fn new(total_count: u64) -> Self {
        Self {
            total_count,
            ..Self::default()
        }
    }

    pub fn record_included(&mut self) {
        self.included_count += 1;
    }

    pub fn record_failure(&mut self, id: impl Into<String>) {
        self.failed_ids.insert(id.into());
    }

    pub fn missing_count(&self) -> u64 {
        self.failed_ids.len() as u64
    }
}

/// Per-stage section of the metadata document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub total_count: u64,
    pub included_count: u64,
    pub missing_count: u64,
}

impl From<Option<&UploadStats>> for UploadSummary {
    /// A skipped stage summarizes as all zeroes.
    fn from(stats: Option<&UploadStats>) -> Self {
        match stats {
            Some(stats) => Self {
                total_count: stats.total_count,
                included_count: stats.included_count.min(stats.total_count),
                missing_count: stats.missing_count(),
            },
            None => Self::default(),
        }
    }
}
