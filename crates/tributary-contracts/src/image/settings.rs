use std::fmt;

use crate::valves::MAX_NUM_OUTPUTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub const SQUARE: AspectRatio = AspectRatio {
        width: 1,
        height: 1,
    };

    pub fn new(width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self { width, height })
    }

    /// Parses a `W:H` token. Both sides must be positive integers.
    pub fn parse(token: &str) -> Option<Self> {
        let (width, height) = token.trim().split_once(':')?;
        if !is_ascii_number(width) || !is_ascii_number(height) {
            return None;
        }
        Self::new(width.parse().ok()?, height.parse().ok()?)
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSettings {
    pub aspect_ratio: Option<AspectRatio>,
    pub num_outputs: u32,
    pub prompt: String,
}

impl PromptSettings {
    pub fn aspect_ratio_or_square(&self) -> AspectRatio {
        self.aspect_ratio.unwrap_or(AspectRatio::SQUARE)
    }

    pub fn aspect_ratio_label(&self) -> String {
        match self.aspect_ratio {
            Some(ratio) => ratio.to_string(),
            None => format!("{} (default)", AspectRatio::SQUARE),
        }
    }
}

/// Pulls optional `W:H` and `xN` prefixes off the front of a prompt.
///
/// Whichever token comes first is parsed first, then the other one is tried
/// on the remainder. Anything that matches neither stays in the prompt.
pub fn parse_settings_stepwise(text: &str, default_count: u32) -> PromptSettings {
    let mut rest = text.trim();
    let mut aspect_ratio = None;
    let mut num_outputs = None;

    if let Some((count, tail)) = split_count(rest) {
        num_outputs = Some(count);
        rest = tail;
        if let Some((ratio, tail)) = split_aspect_ratio(rest) {
            aspect_ratio = Some(ratio);
            rest = tail;
        }
    } else {
        if let Some((ratio, tail)) = split_aspect_ratio(rest) {
            aspect_ratio = Some(ratio);
            rest = tail;
        }
        if let Some((count, tail)) = split_count(rest) {
            num_outputs = Some(count);
            rest = tail;
        }
    }

    PromptSettings {
        aspect_ratio,
        num_outputs: num_outputs.unwrap_or_else(|| default_count.clamp(1, MAX_NUM_OUTPUTS)),
        prompt: rest.to_string(),
    }
}

fn split_first_token(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim_start()),
        None => (text, ""),
    }
}

fn split_aspect_ratio(text: &str) -> Option<(AspectRatio, &str)> {
    let (head, tail) = split_first_token(text);
    AspectRatio::parse(head).map(|ratio| (ratio, tail))
}

fn split_count(text: &str) -> Option<(u32, &str)> {
    let (head, tail) = split_first_token(text);
    parse_count_token(head).map(|count| (count, tail))
}

fn parse_count_token(token: &str) -> Option<u32> {
    let digits = token
        .strip_prefix('x')
        .or_else(|| token.strip_prefix('X'))
        .or_else(|| token.strip_prefix('×'))?;
    if !is_ascii_number(digits) {
        return None;
    }
    let count = digits.parse::<u64>().unwrap_or(u64::MAX);
    Some(count.clamp(1, MAX_NUM_OUTPUTS as u64) as u32)
}

fn is_ascii_number(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_first_then_aspect_ratio() {
        let parsed = parse_settings_stepwise("x4 16:9 a cat", 1);
        assert_eq!(parsed.num_outputs, 4);
        assert_eq!(parsed.aspect_ratio, AspectRatio::new(16, 9));
        assert_eq!(parsed.prompt, "a cat");
    }

    #[test]
    fn aspect_ratio_first_then_count() {
        let parsed = parse_settings_stepwise("16:9 x4 a cat", 1);
        assert_eq!(parsed.num_outputs, 4);
        assert_eq!(parsed.aspect_ratio, AspectRatio::new(16, 9));
        assert_eq!(parsed.prompt, "a cat");
    }

    #[test]
    fn plain_prompt_uses_defaults() {
        let parsed = parse_settings_stepwise("a plain prompt", 2);
        assert_eq!(parsed.aspect_ratio, None);
        assert_eq!(parsed.num_outputs, 2);
        assert_eq!(parsed.prompt, "a plain prompt");
        assert_eq!(parsed.aspect_ratio_or_square(), AspectRatio::SQUARE);
        assert_eq!(parsed.aspect_ratio_label(), "1:1 (default)");
    }

    #[test]
    fn count_is_clamped_and_accepts_multiplication_sign() {
        assert_eq!(parse_settings_stepwise("x9 dog", 1).num_outputs, 4);
        assert_eq!(parse_settings_stepwise("x0 dog", 1).num_outputs, 1);
        let parsed = parse_settings_stepwise("×3 3:2 dog", 1);
        assert_eq!(parsed.num_outputs, 3);
        assert_eq!(parsed.aspect_ratio, AspectRatio::new(3, 2));
        assert_eq!(parsed.prompt, "dog");
    }

    #[test]
    fn single_prefix_only() {
        let parsed = parse_settings_stepwise("2:3 portrait of a fox", 1);
        assert_eq!(parsed.aspect_ratio, AspectRatio::new(2, 3));
        assert_eq!(parsed.num_outputs, 1);
        assert_eq!(parsed.prompt, "portrait of a fox");

        let parsed = parse_settings_stepwise("x2 portrait of a fox", 1);
        assert_eq!(parsed.aspect_ratio, None);
        assert_eq!(parsed.num_outputs, 2);
        assert_eq!(parsed.prompt, "portrait of a fox");
    }

    #[test]
    fn non_matching_tokens_stay_in_prompt() {
        let parsed = parse_settings_stepwise("0:9 xx2 a cat", 1);
        assert_eq!(parsed.aspect_ratio, None);
        assert_eq!(parsed.prompt, "0:9 xx2 a cat");

        let parsed = parse_settings_stepwise("a cat 16:9 x2", 1);
        assert_eq!(parsed.aspect_ratio, None);
        assert_eq!(parsed.num_outputs, 1);
        assert_eq!(parsed.prompt, "a cat 16:9 x2");

        let parsed = parse_settings_stepwise("xylophone on a table", 1);
        assert_eq!(parsed.num_outputs, 1);
        assert_eq!(parsed.prompt, "xylophone on a table");
    }

    #[test]
    fn prefixes_alone_leave_empty_prompt() {
        let parsed = parse_settings_stepwise("  16:9   x2  ", 1);
        assert_eq!(parsed.aspect_ratio, AspectRatio::new(16, 9));
        assert_eq!(parsed.num_outputs, 2);
        assert_eq!(parsed.prompt, "");
    }

    #[test]
    fn aspect_ratio_display_round_trips() {
        let ratio = AspectRatio::parse("21:9");
        assert_eq!(ratio.map(|value| value.to_string()).as_deref(), Some("21:9"));
        assert_eq!(AspectRatio::parse("16:"), None);
        assert_eq!(AspectRatio::parse("-1:2"), None);
    }
}
