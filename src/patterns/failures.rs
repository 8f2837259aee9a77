//! Recurring failure signatures across a project's iteration history.
//!
//! A signature is the failing criterion id plus a normalised form of its
//! output: first non-empty line, digits folded to `#`, whitespace collapsed,
//! at most [`SIGNATURE_OUTPUT_CHARS`] characters. Runs that differ only in
//! line numbers, counts or timings collapse onto one signature.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use autoloop_common::TaskIteration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::Db;
use crate::util::truncate_str;

pub const SIGNATURE_OUTPUT_CHARS: usize = 200;

/// Hex characters kept from the SHA-256 digest.
const SIGNATURE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailurePattern {
    pub signature: String,
    pub criterion_id: i64,
    /// `None` when the criterion has since been deleted.
    pub criterion_description: Option<String>,
    pub normalized_output: String,
    pub occurrences: u32,
    /// Distinct tasks the signature was seen in, ascending.
    pub task_ids: Vec<i64>,
    pub last_seen: String,
}

pub fn normalize_output(output: &str) -> String {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let folded: String = line
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect();
    let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SIGNATURE_OUTPUT_CHARS).collect()
}

pub fn failure_signature(criterion_id: i64, normalized_output: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", criterion_id, normalized_output).as_bytes());
    let hex = format!("{:x}", digest);
    hex[..SIGNATURE_LEN].to_string()
}

/// Cluster failing results of finished iterations into ranked patterns.
///
/// Results for criteria in `skip_criteria` (manual ones) are ignored, as are
/// running iterations and iterations without a snapshot. Ranking: most
/// occurrences, then most distinct tasks, then most recent.
pub fn cluster_failures(
    iterations: &[TaskIteration],
    skip_criteria: &HashSet<i64>,
) -> Vec<FailurePattern> {
    let mut by_signature: HashMap<String, FailurePattern> = HashMap::new();

    for iteration in iterations {
        let Some(snapshot) = &iteration.verification_snapshot else {
            continue;
        };
        let seen_at = iteration
            .completed_at
            .clone()
            .unwrap_or_else(|| iteration.started_at.clone());
        for result in snapshot.results.iter().filter(|r| !r.passed) {
            if skip_criteria.contains(&result.criterion_id) {
                continue;
            }
            let normalized = normalize_output(&result.output);
            let signature = failure_signature(result.criterion_id, &normalized);
            let entry = by_signature
                .entry(signature.clone())
                .or_insert_with(|| FailurePattern {
                    signature,
                    criterion_id: result.criterion_id,
                    criterion_description: None,
                    normalized_output: normalized,
                    occurrences: 0,
                    task_ids: Vec::new(),
                    last_seen: seen_at.clone(),
                });
            entry.occurrences += 1;
            if !entry.task_ids.contains(&iteration.task_id) {
                entry.task_ids.push(iteration.task_id);
                entry.task_ids.sort_unstable();
            }
            if seen_at > entry.last_seen {
                entry.last_seen = seen_at.clone();
            }
        }
    }

    let mut patterns: Vec<FailurePattern> = by_signature.into_values().collect();
    patterns.sort_by(|a, b| {
        b.occurrences
            .cmp(&a.occurrences)
            .then(b.task_ids.len().cmp(&a.task_ids.len()))
            .then(b.last_seen.cmp(&a.last_seen))
            .then(a.signature.cmp(&b.signature))
    });
    patterns
}

/// Top `limit` failure patterns of a project, with criterion descriptions.
pub fn common_failure_patterns(db: &Db, project_id: i64, limit: usize) -> Result<Vec<FailurePattern>> {
    let iterations = db.list_project_iterations(project_id)?;

    let mut manual = HashSet::new();
    let mut descriptions = HashMap::new();
    let task_ids: HashSet<i64> = iterations.iter().map(|i| i.task_id).collect();
    for task_id in task_ids {
        for criterion in db.get_criteria_for_task(task_id)? {
            if criterion.is_manual() {
                manual.insert(criterion.id);
            }
            descriptions.insert(criterion.id, criterion.description);
        }
    }

    let mut patterns = cluster_failures(&iterations, &manual);
    patterns.truncate(limit);
    for pattern in &mut patterns {
        pattern.criterion_description = descriptions.get(&pattern.criterion_id).cloned();
    }
    Ok(patterns)
}

/// Display failure patterns.
pub fn display_failure_patterns(patterns: &[FailurePattern]) {
    if patterns.is_empty() {
        println!("No recurring failures recorded.");
        return;
    }

    println!();
    println!("Common Failure Patterns:");
    println!(
        "{:<14} {:<28} {:<6} {:<6} {:<40}",
        "Signature", "Criterion", "Count", "Tasks", "Output"
    );
    println!(
        "{:<14} {:<28} {:<6} {:<6} {:<40}",
        "--------------", "----------------------------", "------", "------", "----------------------------------------"
    );
    for p in patterns {
        let criterion = match &p.criterion_description {
            Some(desc) => format!("#{} {}", p.criterion_id, desc),
            None => format!("#{} (deleted)", p.criterion_id),
        };
        println!(
            "{:<14} {:<28} {:<6} {:<6} {:<40}",
            p.signature,
            truncate_str(&criterion, 28),
            p.occurrences,
            p.task_ids.len(),
            truncate_str(&p.normalized_output, 40)
        );
    }
    println!();
}
