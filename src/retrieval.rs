//! Prompt → ranked catalogue functions, biased by session context.

use crate::catalogue::FunctionDescriptor;
use crate::config::Config;
use crate::error::Result;
use crate::index::CatalogueSnapshot;
use crate::session::SessionStore;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Instant;

/// Scoring knobs for [`Retriever`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalSettings {
    /// Candidates whose raw similarity falls below this are not matches.
    pub similarity_floor: f32,
    /// Added to candidates sharing the category of the session's last function.
    pub context_boost: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RetrievalSettings {
    fn from(config: &Config) -> Self {
        Self {
            similarity_floor: config.similarity_floor,
            context_boost: config.context_boost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredFunction {
    pub descriptor: FunctionDescriptor,
    /// Similarity after the context bonus; this is the ranking key.
    pub score: f32,
    /// Raw cosine similarity to the prompt.
    pub similarity: f32,
    #[serde(skip)]
    pub position: usize,
}

/// Ranked matches, best first, at most `k` and unique by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub matches: Vec<ScoredFunction>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn best(&self) -> Option<&ScoredFunction> {
        self.matches.first()
    }

    pub fn names(&self) -> Vec<&str> {
        self.matches
            .iter()
            .map(|m| m.descriptor.name.as_str())
            .collect()
    }
}

pub struct Retriever<'a> {
    snapshot: &'a CatalogueSnapshot,
    sessions: &'a SessionStore,
    settings: RetrievalSettings,
}

impl<'a> Retriever<'a> {
    pub fn new(
        snapshot: &'a CatalogueSnapshot,
        sessions: &'a SessionStore,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            snapshot,
            sessions,
            settings,
        }
    }

    /// Rank catalogue functions against `prompt`.
    ///
    /// The index is asked for `2k` candidates so that a context bonus can lift
    /// a candidate from just outside the top `k`. An empty result means
    /// nothing cleared the similarity floor.
    pub fn retrieve(&self, prompt: &str, session_id: &str, k: usize) -> Result<RetrievalResult> {
        let start = Instant::now();
        let catalogue = &self.snapshot.catalogue;

        if k == 0 || catalogue.is_empty() {
            return Ok(RetrievalResult::default());
        }

        let hits = self.snapshot.index.query(prompt, k.saturating_mul(2))?;

        let boosted_category = self
            .sessions
            .latest(session_id)
            .and_then(|turn| turn.selected_function_name)
            .and_then(|name| catalogue.descriptor(&name))
            .map(|d| d.category.clone());

        let mut candidates: Vec<ScoredFunction> = hits
            .into_iter()
            .filter(|hit| hit.score >= self.settings.similarity_floor)
            .filter_map(|hit| {
                let descriptor = catalogue.descriptor(&hit.name)?.clone();
                let bonus = match &boosted_category {
                    Some(category) if *category == descriptor.category => {
                        self.settings.context_boost
                    }
                    _ => 0.0,
                };
                Some(ScoredFunction {
                    score: hit.score + bonus,
                    similarity: hit.score,
                    position: hit.position,
                    descriptor,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });

        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.descriptor.name.clone()));
        candidates.truncate(k);

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("retrieval_latency_ms").record(elapsed_ms);

        tracing::debug!(
            session_id,
            k,
            boosted_category = boosted_category.as_deref().unwrap_or(""),
            matches = ?candidates.iter().map(|c| c.descriptor.name.as_str()).collect::<Vec<_>>(),
            elapsed_ms,
            "Retrieval complete"
        );

        Ok(RetrievalResult {
            matches: candidates,
        })
    }
}
