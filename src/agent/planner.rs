//! Plan and step prompts, and plan parsing.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use crate::agent::collaborators::{MemoryHit, PageState};
use crate::llm::provider::{Capability, ChatMessage, CompletionRequest};
use crate::tasks::model::Task;

const PLAN_SYSTEM_PROMPT: &str = "You are an autonomous agent planning how to reach a goal. \
Reply with ONLY a JSON array of short step descriptions, in the order they must be done. \
Example: [\"Open the feed\", \"Find the newest post\", \"Press like\"]";

const STEP_SYSTEM_PROMPT: &str = "You are an autonomous agent executing one step of a plan. \
Describe concisely what you did for this step and what the result was.";

/// Elements beyond this are left out of the step prompt.
const MAX_PAGE_ELEMENTS: usize = 40;

/// First `[` through last `]`, across lines.
static ARRAY_SPAN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?s)\[.*\]").ok());

pub fn build_plan_request(task: &Task, hints: &[MemoryHit], max_tokens: u32) -> CompletionRequest {
    let payload = &task.payload;
    let mut prompt = format!("Goal: {}\n", payload.goal);
    if let Some(url) = &payload.url {
        let _ = writeln!(prompt, "Target URL: {url}");
    }
    if !payload.params.is_empty() {
        let _ = writeln!(
            prompt,
            "Parameters: {}",
            serde_json::Value::Object(payload.params.clone())
        );
    }
    if !payload.constraints.is_empty() {
        prompt.push_str("Constraints:\n");
        for c in &payload.constraints {
            let _ = writeln!(prompt, "- {c}");
        }
    }
    if !hints.is_empty() {
        prompt.push_str("\nWhat worked before:\n");
        for hint in hints {
            let _ = writeln!(prompt, "- {}", hint.summary);
        }
    }

    CompletionRequest::new(
        Capability::Reasoning,
        vec![ChatMessage::system(PLAN_SYSTEM_PROMPT), ChatMessage::user(prompt)],
    )
    .with_max_tokens(max_tokens)
    .with_temperature(0.2)
}

/// Prompt for step `index` of `plan`. `previous` is the textual result of the
/// step before it, since each step builds on the last.
pub fn build_step_request(
    task: &Task,
    plan: &[String],
    index: usize,
    previous: Option<&str>,
    page: Option<&PageState>,
    max_tokens: u32,
) -> CompletionRequest {
    let mut prompt = format!("Goal: {}\n\nPlan:\n", task.payload.goal);
    for (i, step) in plan.iter().enumerate() {
        let marker = if i == index { "->" } else { "  " };
        let _ = writeln!(prompt, "{marker} {}. {step}", i + 1);
    }
    if !task.payload.constraints.is_empty() {
        let _ = writeln!(prompt, "\nConstraints: {}", task.payload.constraints.join("; "));
    }
    if let Some(prev) = previous {
        let _ = writeln!(prompt, "\nResult of the previous step:\n{prev}");
    }
    if let Some(page) = page {
        let _ = writeln!(
            prompt,
            "\nCurrent page: {} ({}) type={}",
            page.title, page.url, page.page_type
        );
        if !page.elements.is_empty() {
            let shown = page.elements.len().min(MAX_PAGE_ELEMENTS);
            let _ = writeln!(prompt, "Visible elements ({shown} of {}):", page.elements.len());
            for el in page.elements.iter().take(MAX_PAGE_ELEMENTS) {
                let _ = writeln!(prompt, "- {el}");
            }
        }
    }
    let step = plan.get(index).map(String::as_str).unwrap_or_default();
    let _ = write!(prompt, "\nExecute step {}: {step}", index + 1);

    CompletionRequest::new(
        Capability::Reasoning,
        vec![ChatMessage::system(STEP_SYSTEM_PROMPT), ChatMessage::user(prompt)],
    )
    .with_max_tokens(max_tokens)
    .with_temperature(0.3)
}

/// Parse a plan response into step descriptions.
///
/// Accepts a bare JSON array or one embedded in prose or a code fence.
/// Anything else yields the single-step plan `[goal]`.
pub fn parse_plan(text: &str, goal: &str) -> Vec<String> {
    let steps = parse_array(text.trim()).or_else(|| {
        ARRAY_SPAN
            .as_ref()
            .and_then(|re| re.find(text))
            .and_then(|m| parse_array(m.as_str()))
    });

    match steps {
        Some(steps) if !steps.is_empty() => steps,
        _ => vec![goal.to_string()],
    }
}

fn parse_array(raw: &str) -> Option<Vec<String>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(raw).ok()?;
    Some(
        values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                serde_json::Value::Object(obj) => obj
                    .get("step")
                    .or_else(|| obj.get("description"))
                    .and_then(|s| s.as_str())
                    .map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
    )
}
