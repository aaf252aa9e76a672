/// One step of a field-value normalization pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalize {
    /// Control characters (newlines, tabs, ...) become spaces.
    StripControl,
    /// Typographic quotes become ASCII quotes.
    NormalizeQuotes,
    /// Runs of whitespace collapse to one space; ends are trimmed.
    CollapseWhitespace,
    /// Surrounding whitespace, commas and semicolons go; a trailing period goes.
    TrimPunctuation,
    /// Surrounding double quotes go.
    StripQuotes,
}

pub const DEFAULT_PIPELINE: &[Normalize] = &[
    Normalize::StripControl,
    Normalize::NormalizeQuotes,
    Normalize::CollapseWhitespace,
    Normalize::TrimPunctuation,
    Normalize::StripQuotes,
];

pub fn apply(value: &str, pipeline: &[Normalize]) -> String {
    pipeline
        .iter()
        .fold(value.to_string(), |acc, step| step.apply(&acc))
}

impl Normalize {
    fn apply(self, s: &str) -> String {
        match self {
            Normalize::StripControl => s
                .chars()
                .map(|c| if c.is_control() { ' ' } else { c })
                .collect(),
            Normalize::NormalizeQuotes => s
                .chars()
                .map(|c| match c {
                    '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{00AB}' | '\u{00BB}' | '\u{2033}' => '"',
                    '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => '\'',
                    c => c,
                })
                .collect(),
            Normalize::CollapseWhitespace => collapse_whitespace(s),
            Normalize::TrimPunctuation => s
                .trim_matches(|c: char| c.is_whitespace() || c == ',' || c == ';')
                .trim_end_matches('.')
                .trim()
                .to_string(),
            Normalize::StripQuotes => s.trim().trim_matches('"').trim().to_string(),
        }
    }
}

pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison key for person names: uppercase, single-spaced.
pub fn name_key(s: &str) -> String {
    collapse_whitespace(&apply(s, DEFAULT_PIPELINE)).to_uppercase()
}
