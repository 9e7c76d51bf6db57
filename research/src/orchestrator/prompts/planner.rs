//! Planner agent prompts

use super::language_instruction;
use crate::model::Plan;
use crate::orchestrator::parse::planner_schema;

const PLANNER_PROMPT: &str = r#"You are a research planner. You turn a research question into a set of independent research items that separate researchers can work on in parallel.

## Your Role
- Work out what the requester actually wants to know, including implicit requirements
- Split the work into focused items, each covering one aspect of the question
- Keep items independent: no item may depend on another item's findings
- Note ambiguities worth clarifying with the requester

## Guidelines
- Produce between 3 and 10 items depending on how broad the question is
- Priority 1 is the most relevant item, 5 the least
- Prefer several narrow items over a few broad ones
- Give every item the key questions it must answer and the kinds of sources worth consulting

## Output Format
Reply with a single JSON object matching this schema and nothing else:

"#;

/// System prompt for the planner, with the output schema and language rule
pub fn planner_system_prompt(language: &str) -> String {
    format!(
        "{}```json\n{}\n```\n{}",
        PLANNER_PROMPT,
        planner_schema(),
        language_instruction(language)
    )
}

pub fn planner_user_prompt(query: &str) -> String {
    format!(
        "Create a research plan for this query:\n\n<query>\n{}\n</query>\n\n\
         Reply with the JSON object only.",
        query
    )
}

/// Planner prompt for a revision requested during plan review
pub fn revision_user_prompt(query: &str, previous: Option<&Plan>, feedback: &str) -> String {
    let mut prompt = planner_user_prompt(query);

    if let Some(plan) = previous {
        let items = plan
            .items
            .iter()
            .map(|item| format!("- [{}] {} (priority {})", item.id, item.topic, item.priority))
            .collect::<Vec<_>>()
            .join("\n");
        prompt.push_str(&format!(
            "\n\n<previous_plan>\nUnderstanding: {}\n{}\n</previous_plan>",
            plan.understanding, items
        ));
    }

    prompt.push_str(&format!(
        "\n\n<feedback>\n{}\n</feedback>\n\n\
         Revise the plan according to the feedback. Keep the ids of items you keep unchanged.",
        feedback
    ));
    prompt
}
