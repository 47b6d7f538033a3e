//! String replacement engine for the `edit_file` tool.
//!
//! `replace` finds and replaces text using multi-pass matching: exact first,
//! then line-trimmed, then Unicode-normalized. When a fuzzy pass matches,
//! the matched span of the original content is replaced and `new_string` is
//! inserted verbatim.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("no changes: old_string and new_string are identical")]
    NoChanges,
    #[error("old_string must not be empty")]
    EmptyOldString,
    #[error("not found: old_string does not appear in the file")]
    NotFound,
    #[error("multiple matches: old_string appears more than once; pass replace_all or add surrounding context")]
    MultipleMatches,
}

/// Normalize Unicode punctuation to ASCII equivalents: smart quotes,
/// dashes, ellipsis, and non-breaking spaces.
fn normalize_unicode(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{201b}' => '\'',
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{201f}' => '"',
            '\u{2010}'..='\u{2015}' => '-',
            '\u{00a0}' => ' ',
            other => other,
        })
        .collect::<String>()
        .replace('\u{2026}', "...")
}

/// Find `old` in `content` comparing lines after `.trim()`, optionally
/// normalized. Returns the byte span of the match.
fn find_fuzzy(
    content: &str,
    old: &str,
    normalize: Option<fn(&str) -> String>,
) -> Option<(usize, usize)> {
    let content_lines: Vec<&str> = content.split('\n').collect();
    let old_lines: Vec<&str> = old.split('\n').collect();
    let old_len = old_lines.len();
    if old_len == 0 || content_lines.len() < old_len {
        return None;
    }

    let prep = |line: &str| -> String {
        let trimmed = line.trim();
        match normalize {
            Some(f) => f(trimmed),
            None => trimmed.to_string(),
        }
    };
    let prepped_old: Vec<String> = old_lines.iter().map(|l| prep(l)).collect();

    for i in 0..=(content_lines.len() - old_len) {
        if (0..old_len).all(|j| prep(content_lines[i + j]) == prepped_old[j]) {
            let start: usize = content_lines[..i].iter().map(|l| l.len() + 1).sum();
            let mut end =
                start + content_lines[i..i + old_len].iter().map(|l| l.len() + 1).sum::<usize>();
            // The window counts a '\n' after every line; the last line of
            // the match only has one when old_string itself ends with '\n'.
            if !old.ends_with('\n') {
                end -= 1;
            }
            return Some((start, end.min(content.len())));
        }
    }
    None
}

fn count_fuzzy(content: &str, old: &str, normalize: Option<fn(&str) -> String>) -> usize {
    let content_lines: Vec<&str> = content.split('\n').collect();
    let old_lines: Vec<&str> = old.split('\n').collect();
    let old_len = old_lines.len();
    if old_len == 0 || content_lines.len() < old_len {
        return 0;
    }
    let prep = |line: &str| -> String {
        let trimmed = line.trim();
        match normalize {
            Some(f) => f(trimmed),
            None => trimmed.to_string(),
        }
    };
    let prepped_old: Vec<String> = old_lines.iter().map(|l| prep(l)).collect();
    (0..=(content_lines.len() - old_len))
        .filter(|&i| (0..old_len).all(|j| prep(content_lines[i + j]) == prepped_old[j]))
        .count()
}

/// Replace `old` with `new` in `content`.
///
/// Passes, tried in order: exact, line-trimmed, Unicode-normalized.
pub fn replace(
    content: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<String, EditError> {
    if old == new {
        return Err(EditError::NoChanges);
    }
    if old.is_empty() {
        return Err(EditError::EmptyOldString);
    }

    let exact_count = content.matches(old).count();
    if exact_count > 1 && !replace_all {
        return Err(EditError::MultipleMatches);
    }
    if exact_count >= 1 {
        return Ok(if replace_all {
            content.replace(old, new)
        } else {
            content.replacen(old, new, 1)
        });
    }

    for normalize in [None, Some(normalize_unicode as fn(&str) -> String)] {
        if let Some((start, end)) = find_fuzzy(content, old, normalize) {
            if !replace_all && count_fuzzy(content, old, normalize) > 1 {
                return Err(EditError::MultipleMatches);
            }
            let mut result = format!("{}{}{}", &content[..start], new, &content[end..]);
            if replace_all {
                while let Some((s, e)) = find_fuzzy(&result, old, normalize) {
                    result = format!("{}{}{}", &result[..s], new, &result[e..]);
                }
            }
            return Ok(result);
        }
    }

    Err(EditError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_single_replacement() {
        let out = replace("fn main() {}\n", "main", "start", false).expect("replace");
        assert_eq!(out, "fn start() {}\n");
    }

    #[test]
    fn identical_strings_rejected() {
        assert_eq!(replace("abc", "x", "x", false), Err(EditError::NoChanges));
    }

    #[test]
    fn empty_old_rejected() {
        assert_eq!(replace("abc", "", "x", false), Err(EditError::EmptyOldString));
    }

    #[test]
    fn ambiguous_match_rejected() {
        assert_eq!(
            replace("a b a", "a", "c", false),
            Err(EditError::MultipleMatches)
        );
    }

    #[test]
    fn replace_all_handles_duplicates() {
        let out = replace("a b a", "a", "c", true).expect("replace");
        assert_eq!(out, "c b c");
    }

    #[test]
    fn missing_text_rejected() {
        assert_eq!(replace("abc", "zzz", "x", false), Err(EditError::NotFound));
    }

    #[test]
    fn line_trimmed_pass_matches_indentation_drift() {
        let content = "    let x = 1;\n    let y = 2;\n";
        let old = "let x = 1;\nlet y = 2;";
        let out = replace(content, old, "let z = 3;", false).expect("fuzzy match");
        assert_eq!(out, "let z = 3;\n");
    }

    #[test]
    fn unicode_pass_matches_smart_quotes() {
        let content = "println!(\u{201c}hi\u{201d});\n";
        let old = "println!(\"hi\");";
        let out = replace(content, old, "println!(\"bye\");", false).expect("unicode match");
        assert_eq!(out, "println!(\"bye\");\n");
    }

    #[test]
    fn fuzzy_match_preserves_surrounding_text() {
        let content = "before\n  target line\nafter\n";
        let out = replace(content, "target line", "replaced", false).expect("replace");
        assert_eq!(out, "before\nreplaced\nafter\n");
    }

    #[test]
    fn fuzzy_ambiguity_rejected() {
        let content = "  x = 1\nother\n  x = 1\n";
        assert_eq!(
            replace(content, "x = 1", "x = 2", false),
            Err(EditError::MultipleMatches)
        );
    }
}
