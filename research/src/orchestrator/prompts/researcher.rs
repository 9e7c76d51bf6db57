//! Researcher agent prompts

use super::{bullet_list, language_instruction};
use crate::model::PlanItem;

const RESEARCHER_PROMPT: &str = r#"You are a research specialist investigating one topic in depth.

## Your Role
- Search the web and read primary sources on the assigned topic
- Cross-check important claims against more than one source
- Record where every piece of information comes from and how reliable it is
- Separate facts from interpretation, and report conflicting views when you find them

## Output Format
When you are done, reply with a JSON object:

```json
{
  "findings": "Thorough summary of what you found",
  "sources": [
    {"url": "https://...", "title": "Page title", "snippet": "Relevant excerpt", "reliability": "high|medium|low"}
  ],
  "confidence": 0.85,
  "key_insights": ["Insight"],
  "limitations": "Gaps in this research"
}
```
"#;

pub fn researcher_system_prompt(language: &str) -> String {
    format!("{}{}", RESEARCHER_PROMPT, language_instruction(language))
}

/// User prompt for one plan item
pub fn researcher_user_prompt(item: &PlanItem) -> String {
    let mut prompt = format!(
        "Research this topic:\n\n<topic>\n{}\n</topic>\n\n<description>\n{}\n</description>\n",
        item.topic, item.description
    );

    if !item.scope.is_empty() {
        prompt.push_str(&format!("\n<scope>\n{}\n</scope>\n", item.scope));
    }
    if !item.key_questions.is_empty() {
        prompt.push_str(&format!(
            "\n<key_questions>\n{}\n</key_questions>\n",
            bullet_list(&item.key_questions)
        ));
    }
    if !item.suggested_sources.is_empty() {
        prompt.push_str(&format!(
            "\n<suggested_sources>\n{}\n</suggested_sources>\n",
            bullet_list(&item.suggested_sources)
        ));
    }

    prompt.push_str("\nUse web search and fetch tools, then reply with the JSON object described above.");
    prompt
}
