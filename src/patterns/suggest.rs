//! Acceptance-criteria suggestions for a new task.
//!
//! Scoring:
//! - Keyword overlap (Jaccard) between the new task's text and each
//!   existing task's title and description
//! - Plus [`FAILURE_BOOST`] for criteria that show up in the project's
//!   failure patterns: checks that caught real regressions are worth
//!   carrying forward
//!
//! Candidates are de-duplicated by verifier kind and parameters, keeping
//! the best score.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use autoloop_common::NewCriterion;
use serde::Serialize;

use super::failures::common_failure_patterns;
use crate::store::Db;
use crate::util::truncate_str;

pub const FAILURE_BOOST: f64 = 0.25;

/// Failure patterns consulted for the boost.
const FAILURE_PATTERN_WINDOW: usize = 50;

const STOP_WORDS: [&str; 20] = [
    "the", "and", "for", "with", "from", "that", "this", "will", "have", "should", "would",
    "could", "also", "each", "when", "into", "more", "other", "task", "make",
];

#[derive(Debug, Clone, Serialize)]
pub struct CriterionSuggestion {
    pub criterion: NewCriterion,
    pub score: f64,
    /// Best keyword similarity among the tasks that declared it.
    pub similarity: f64,
    pub seen_in_tasks: usize,
    pub failure_prone: bool,
}

/// Lower-cased words longer than three characters, minus stop words.
pub fn extract_keywords(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

fn dedupe_key(criterion: &NewCriterion) -> String {
    format!("{}|{}", criterion.verifier, criterion.params)
}

pub fn suggest_criteria(
    db: &Db,
    project_id: i64,
    title: &str,
    description: &str,
    limit: usize,
) -> Result<Vec<CriterionSuggestion>> {
    let wanted = extract_keywords(&format!("{} {}", title, description));
    let failure_prone: HashSet<i64> = common_failure_patterns(db, project_id, FAILURE_PATTERN_WINDOW)?
        .into_iter()
        .map(|p| p.criterion_id)
        .collect();

    let mut by_key: HashMap<String, CriterionSuggestion> = HashMap::new();
    for task in db.list_tasks(project_id)? {
        let similarity = jaccard(
            &wanted,
            &extract_keywords(&format!("{} {}", task.title, task.description)),
        );
        for criterion in db.get_criteria_for_task(task.id)? {
            let boosted = failure_prone.contains(&criterion.id);
            if similarity <= 0.0 && !boosted {
                continue;
            }
            let score = similarity + if boosted { FAILURE_BOOST } else { 0.0 };
            let candidate = NewCriterion {
                description: criterion.description,
                verifier: criterion.verifier,
                params: criterion.params,
                priority: criterion.priority,
            };
            let key = dedupe_key(&candidate);
            match by_key.get_mut(&key) {
                Some(existing) => {
                    existing.seen_in_tasks += 1;
                    existing.failure_prone |= boosted;
                    existing.similarity = existing.similarity.max(similarity);
                    if score > existing.score {
                        existing.score = score;
                        existing.criterion = candidate;
                    }
                }
                None => {
                    by_key.insert(
                        key,
                        CriterionSuggestion {
                            criterion: candidate,
                            score,
                            similarity,
                            seen_in_tasks: 1,
                            failure_prone: boosted,
                        },
                    );
                }
            }
        }
    }

    let mut suggestions: Vec<CriterionSuggestion> = by_key.into_values().collect();
    suggestions.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.seen_in_tasks.cmp(&a.seen_in_tasks))
            .then(a.criterion.description.cmp(&b.criterion.description))
    });
    suggestions.truncate(limit);
    Ok(suggestions)
}

/// Display criteria suggestions.
pub fn display_suggestions(suggestions: &[CriterionSuggestion]) {
    if suggestions.is_empty() {
        println!("No similar tasks found to suggest criteria from.");
        return;
    }

    println!();
    println!("Suggested Criteria:");
    println!(
        "{:<32} {:<12} {:<8} {:<6} {:<8}",
        "Description", "Verifier", "Score", "Tasks", "Flaky"
    );
    println!(
        "{:<32} {:<12} {:<8} {:<6} {:<8}",
        "--------------------------------", "------------", "--------", "------", "--------"
    );
    for s in suggestions {
        println!(
            "{:<32} {:<12} {:<8.2} {:<6} {:<8}",
            truncate_str(&s.criterion.description, 32),
            s.criterion.verifier,
            s.score,
            s.seen_in_tasks,
            if s.failure_prone { "yes" } else { "" }
        );
    }
    println!();
}
