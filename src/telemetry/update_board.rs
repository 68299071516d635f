//! Latest firmware update report per node

use super::decoder::UpdateReport;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::info;

#[derive(Debug, Default)]
pub struct UpdateBoard {
    reports: RwLock<HashMap<String, UpdateReport>>,
}

impl UpdateBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the previous report for the same node.
    pub fn record(&self, report: UpdateReport) {
        info!(
            "Node {} reports firmware {} -> {} ({})",
            report.node_name,
            report.first_version,
            report.latest_version,
            if report.active { "active" } else { "inactive" }
        );
        let mut reports = match self.reports.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        reports.insert(report.node_name.clone(), report);
    }

    pub fn latest(&self, node_name: &str) -> Option<UpdateReport> {
        match self.reports.read() {
            Ok(guard) => guard.get(node_name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(node_name).cloned(),
        }
    }

    pub fn all(&self) -> Vec<UpdateReport> {
        let mut all: Vec<UpdateReport> = match self.reports.read() {
            Ok(guard) => guard.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        all.sort_by(|a, b| a.node_name.cmp(&b.node_name));
        all
    }
}
