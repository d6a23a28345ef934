use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::ingest::Vocabulary;
use crate::lab_result::{StoredBiomarker, StoredSummary};
use crate::storage::LabStore;
use crate::Result;

/// Names scoring below this against the query are left out.
const NAME_SIMILARITY_MIN: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BiomarkerMatch {
    #[serde(flatten)]
    pub biomarker: StoredBiomarker,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryMatch {
    #[serde(flatten)]
    pub summary: StoredSummary,
    pub score: f64,
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Read-side search over a user's own extracted data. Every query goes
/// through the user-scoped store methods.
pub struct LookupService {
    store: Arc<dyn LabStore>,
    vocabulary: Arc<Vocabulary>,
}

impl LookupService {
    #[must_use]
    pub fn new(store: Arc<dyn LabStore>, vocabulary: Arc<Vocabulary>) -> Self {
        Self { store, vocabulary }
    }

    fn score_name(&self, query: &str, canonical_query: Option<&str>, name: &str) -> f64 {
        let name_lower = name.to_lowercase();
        if canonical_query.is_some_and(|c| c.eq_ignore_ascii_case(name)) || name_lower == query {
            1.0
        } else if name_lower.contains(query) {
            0.9
        } else {
            strsim::jaro_winkler(query, &name_lower)
        }
    }

    /// Biomarkers whose name matches `query` exactly, through a known alias,
    /// as a substring, or by close spelling. Best matches first.
    pub async fn search_biomarkers(
        &self,
        user_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<BiomarkerMatch>> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let canonical = self
            .vocabulary
            .canonicalize(&query)
            .map(|entry| entry.canonical.clone());

        let mut matches: Vec<BiomarkerMatch> = self
            .store
            .list_biomarkers_for_user(user_id)
            .await?
            .into_iter()
            .filter_map(|biomarker| {
                let score = self.score_name(&query, canonical.as_deref(), &biomarker.record.name);
                (score >= NAME_SIMILARITY_MIN).then_some(BiomarkerMatch { biomarker, score })
            })
            .collect();

        // Newest test first among equal scores.
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.biomarker.record.test_date.cmp(&a.biomarker.record.test_date))
        });
        matches.truncate(limit);

        tracing::debug!(
            user_id = %user_id,
            query = %query,
            hits = matches.len(),
            "biomarker search"
        );
        Ok(matches)
    }

    /// Summaries ranked by the share of query keywords they contain.
    pub async fn search_summaries(
        &self,
        user_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SummaryMatch>> {
        let wanted = keywords(query);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let mut matches: Vec<SummaryMatch> = self
            .store
            .list_summaries_for_user(user_id)
            .await?
            .into_iter()
            .filter_map(|summary| {
                let found = keywords(&summary.summary);
                let hits = wanted.intersection(&found).count();
                if hits == 0 {
                    return None;
                }
                #[allow(clippy::cast_precision_loss)]
                let score = hits as f64 / wanted.len() as f64;
                Some(SummaryMatch { summary, score })
            })
            .collect();

        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(limit);

        tracing::debug!(user_id = %user_id, hits = matches.len(), "summary search");
        Ok(matches)
    }
}
