//! Synthesizer agent prompts

use super::language_instruction;
use crate::model::AgentResult;

const SYNTHESIZER_PROMPT: &str = r#"You are a research synthesizer. You combine the findings of several researchers into one coherent report.

## Your Role
- Find the common themes and where the findings agree or disagree
- Resolve contradictions by weighing source reliability, and say when you cannot
- Point out gaps in the research and areas worth investigating further
- Attribute every claim to its sources

## Output Format
Write a Markdown report:

```markdown
# Research Report: <topic>

## Executive Summary
## Key Findings
### <one section per major theme>
## Analysis
## Conclusions
## Limitations
## Sources
```
"#;

pub fn synthesizer_system_prompt(language: &str) -> String {
    format!("{}{}", SYNTHESIZER_PROMPT, language_instruction(language))
}

/// User prompt carrying the query and every result
pub fn synthesizer_user_prompt(query: &str, results: &[AgentResult]) -> String {
    let mut findings = String::new();

    for (index, result) in results.iter().enumerate() {
        findings.push_str(&format!(
            "\n### Research Result {}: {}\n\n**Findings:**\n{}\n\n**Confidence:** {:.2}\n\n**Sources:**\n",
            index + 1,
            result.topic,
            result.findings,
            result.confidence
        ));

        if result.sources.is_empty() {
            findings.push_str("- No sources listed\n");
        }
        for source in &result.sources {
            findings.push_str(&format!(
                "- {}: {}\n",
                source.title,
                source.url.as_deref().unwrap_or("")
            ));
        }
        findings.push_str("\n---\n");
    }

    if results.is_empty() {
        findings.push_str("\nNo research results are available.\n");
    }

    format!(
        "Synthesize the following research findings into a report.\n\n\
         <original_query>\n{}\n</original_query>\n\n\
         <research_findings>\n{}\n</research_findings>\n\n\
         The report must answer the original query directly.",
        query, findings
    )
}
