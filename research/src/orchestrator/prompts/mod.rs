//! Prompts for the three agent roles
//!
//! Each role has a fixed system prompt and a user prompt built from the
//! session. The system prompt is completed with a language instruction so
//! reports come back in the language of the query.

mod planner;
mod researcher;
mod synthesizer;

pub use planner::{planner_system_prompt, planner_user_prompt, revision_user_prompt};
pub use researcher::{researcher_system_prompt, researcher_user_prompt};
pub use synthesizer::{synthesizer_system_prompt, synthesizer_user_prompt};

/// Instruction appended to every system prompt
pub fn language_instruction(language: &str) -> String {
    let name = match language {
        "zh" => "Chinese",
        "en" => "English",
        other => other,
    };
    format!(
        "\nIMPORTANT: Write every human-readable field of your answer in {} \
         (language code `{}`), the language of the original query. JSON keys stay in English.\n",
        name, language
    )
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}
