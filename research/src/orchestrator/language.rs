//! Response language detection

/// Share of CJK ideographs above which a query is treated as Chinese
const CJK_THRESHOLD: f64 = 0.1;

/// Guess the language a query is written in: `zh` or `en`
pub fn detect_language(text: &str) -> &'static str {
    let total = text.chars().count();
    let cjk = text.chars().filter(|c| is_cjk_ideograph(*c)).count();

    if cjk as f64 > total as f64 * CJK_THRESHOLD {
        "zh"
    } else {
        "en"
    }
}

fn is_cjk_ideograph(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}
