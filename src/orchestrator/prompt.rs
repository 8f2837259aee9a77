//! Prompts handed to the agent: the first session of a task, and the retry
//! after a failed verification pass.

use autoloop_common::{AcceptanceCriterion, Task, TaskVerificationResult};

use crate::util::truncate_str;

/// Per-criterion output budget inside the prompt.
pub const MAX_OUTPUT_IN_PROMPT: usize = 2000;

/// Prompt for the first session of a task. Lists the acceptance criteria so
/// the agent knows how its work will be checked.
pub fn build_task_prompt(task: &Task, criteria: &[AcceptanceCriterion]) -> String {
    let mut prompt = format!("# Task: {}\n\n", task.title);
    if !task.description.trim().is_empty() {
        prompt.push_str(task.description.trim());
        prompt.push_str("\n\n");
    }
    if !criteria.is_empty() {
        prompt.push_str("## Acceptance criteria\n");
        for criterion in criteria {
            prompt.push_str(&format!(
                "- [{}] {} ({})\n",
                criterion.priority.as_str(),
                criterion.description,
                criterion.verifier
            ));
        }
        prompt.push('\n');
    }
    prompt.push_str("Work until every automatic criterion passes, then stop.\n");
    prompt
}

/// Build the feedback prompt for iteration `iteration` of `max_iterations`.
///
/// Lists every automatic criterion that failed with its id, description,
/// verifier kind and (truncated) output. Manual criteria are left out: the
/// agent cannot resolve them.
pub fn build_retry_prompt(
    task: &Task,
    criteria: &[AcceptanceCriterion],
    result: &TaskVerificationResult,
    iteration: u32,
    max_iterations: u32,
) -> String {
    let mut failures = String::new();
    for res in result.results.iter().filter(|r| !r.passed) {
        let criterion = criteria.iter().find(|c| c.id == res.criterion_id);
        if criterion.is_some_and(AcceptanceCriterion::is_manual) {
            continue;
        }
        let (description, kind) = criterion
            .map(|c| (c.description.as_str(), c.verifier.as_str()))
            .unwrap_or(("(criterion removed)", "unknown"));
        let exit = res
            .exit_code
            .map(|code| format!(", exit code {}", code))
            .unwrap_or_default();
        failures.push_str(&format!(
            "### Criterion #{}: {} ({}{})\n```\n{}\n```\n\n",
            res.criterion_id,
            description,
            kind,
            exit,
            truncate_str(res.output.trim(), MAX_OUTPUT_IN_PROMPT)
        ));
    }

    format!(
        r#"## Auto-Iteration {iteration}/{max_iterations}

Task: {title}

The previous session finished, but the following acceptance criteria failed verification:

{failures}## INSTRUCTIONS
1. Read each failure above and find its root cause
2. Fix the code so every listed criterion passes
3. Re-run the failing commands yourself before finishing
4. Do not weaken or delete the checks to make them pass
"#,
        title = task.title,
    )
}
