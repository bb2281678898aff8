//! Selection Policy
//!
//! Chooses the update to launch from the launchable candidates in a scope.

use crate::engine::catalog::{ManifestFilters, UpdateRecord, UpdateStatus};
use crate::engine::config::UpdatesConfig;
use crate::engine::updater::embedded::EmbeddedUpdate;
use uuid::Uuid;

pub trait SelectionPolicy: Send + Sync {
    fn select_update_to_launch(
        &self,
        candidates: &[UpdateRecord],
        filters: &ManifestFilters,
    ) -> Option<UpdateRecord>;
}

/// Newest commit wins among candidates that pass the filters, match the
/// runtime version, and are not a stale embedded update
#[derive(Debug, Clone, Default)]
pub struct DefaultSelectionPolicy {
    runtime_version: Option<String>,
    embedded_update_id: Option<Uuid>,
}

impl DefaultSelectionPolicy {
    pub fn new(runtime_version: Option<String>, embedded_update_id: Option<Uuid>) -> Self {
        Self {
            runtime_version,
            embedded_update_id,
        }
    }

    pub fn from_config(config: &UpdatesConfig, embedded: Option<&EmbeddedUpdate>) -> Self {
        Self::new(
            config.effective_runtime_version().map(str::to_string),
            embedded.map(EmbeddedUpdate::id),
        )
    }

    /// Embedded rows left over from a previous build of the application
    pub fn is_stale_embedded(&self, update: &UpdateRecord) -> bool {
        update.status == UpdateStatus::Embedded && Some(update.id) != self.embedded_update_id
    }

    fn runtime_matches(&self, update: &UpdateRecord) -> bool {
        match &self.runtime_version {
            Some(runtime_version) => update.runtime_version == *runtime_version,
            None => true,
        }
    }
}

impl SelectionPolicy for DefaultSelectionPolicy {
    fn select_update_to_launch(
        &self,
        candidates: &[UpdateRecord],
        filters: &ManifestFilters,
    ) -> Option<UpdateRecord> {
        candidates
            .iter()
            .filter(|u| filters.matches(u))
            .filter(|u| !self.is_stale_embedded(u))
            .filter(|u| self.runtime_matches(u))
            .max_by(|a, b| a.commit_time.cmp(&b.commit_time).then(a.id.cmp(&b.id)))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn update(id: u128, secs: i64, status: UpdateStatus) -> UpdateRecord {
        UpdateRecord {
            id: Uuid::from_u128(id),
            scope_key: "s".to_string(),
            manifest: json!({ "metadata": {} }),
            commit_time: Utc.timestamp_opt(secs, 0).unwrap(),
            runtime_version: "1.0".to_string(),
            status,
            is_verified: true,
            last_accessed: None,
        }
    }

    #[test]
    fn test_newest_wins_over_embedded() {
        let embedded = update(1, 100, UpdateStatus::Embedded);
        let ready = update(2, 200, UpdateStatus::Ready);
        let policy = DefaultSelectionPolicy::new(Some("1.0".to_string()), Some(embedded.id));

        let selected = policy
            .select_update_to_launch(&[embedded, ready.clone()], &ManifestFilters::new())
            .unwrap();
        assert_eq!(selected.id, ready.id);
    }

    #[test]
    fn test_stale_embedded_is_skipped() {
        let stale = update(1, 500, UpdateStatus::Embedded);
        let current = update(2, 100, UpdateStatus::Embedded);
        let policy = DefaultSelectionPolicy::new(None, Some(current.id));

        let selected = policy
            .select_update_to_launch(&[stale.clone(), current.clone()], &ManifestFilters::new())
            .unwrap();
        assert_eq!(selected.id, current.id);

        // Without an embedded update every embedded row is stale
        let policy = DefaultSelectionPolicy::new(None, None);
        assert!(policy
            .select_update_to_launch(&[stale, current], &ManifestFilters::new())
            .is_none());
    }

    #[test]
    fn test_filters_exclude_candidates() {
        let mut main = update(1, 100, UpdateStatus::Ready);
        main.manifest = json!({ "metadata": { "branchname": "main" } });
        let mut beta = update(2, 200, UpdateStatus::Ready);
        beta.manifest = json!({ "metadata": { "branchname": "beta" } });
        let policy = DefaultSelectionPolicy::default();

        let filters = ManifestFilters::new().with("branchname", "main");
        let selected = policy
            .select_update_to_launch(&[main.clone(), beta], &filters)
            .unwrap();
        assert_eq!(selected.id, main.id);
    }

    #[test]
    fn test_runtime_version_mismatch_is_skipped() {
        let mut other_runtime = update(1, 300, UpdateStatus::Ready);
        other_runtime.runtime_version = "2.0".to_string();
        let matching = update(2, 100, UpdateStatus::Ready);
        let policy = DefaultSelectionPolicy::new(Some("1.0".to_string()), None);

        let selected = policy
            .select_update_to_launch(&[other_runtime, matching.clone()], &ManifestFilters::new())
            .unwrap();
        assert_eq!(selected.id, matching.id);
    }

    #[test]
    fn test_tie_breaks_on_id() {
        let low = update(1, 100, UpdateStatus::Ready);
        let high = update(2, 100, UpdateStatus::Ready);
        let policy = DefaultSelectionPolicy::default();

        for candidates in [[low.clone(), high.clone()], [high.clone(), low.clone()]] {
            let selected = policy
                .select_update_to_launch(&candidates, &ManifestFilters::new())
                .unwrap();
            assert_eq!(selected.id, high.id);
        }
    }

    #[test]
    fn test_empty_candidates() {
        let policy = DefaultSelectionPolicy::default();
        assert!(policy
            .select_update_to_launch(&[], &ManifestFilters::new())
            .is_none());
    }
}
