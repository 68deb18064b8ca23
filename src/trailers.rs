//! Override trailer extraction.
//!
//! An override is written as a trailer line such as
//! `Forked-Override: sentinel, size`. Values are split on commas and
//! whitespace, lower-cased, and de-duplicated in first-seen order.

/// Split one raw trailer value into normalized tokens, appending to `out`.
pub fn push_tokens(raw: &str, out: &mut Vec<String>) {
    for token in raw.split(|c: char| c == ',' || c.is_whitespace()) {
        let value = token.trim().to_lowercase();
        if value.is_empty() || out.contains(&value) {
            continue;
        }
        out.push(value);
    }
}

/// Normalize a list of raw trailer values (as returned by git).
#[must_use]
pub fn tokens_from_values<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        push_tokens(value.as_ref(), &mut out);
    }
    out
}

/// Collect tokens from every `key:` line in free-form text.
///
/// Used for tag messages and notes, which git does not parse as trailers.
/// The key comparison ignores case and surrounding whitespace.
#[must_use]
pub fn collect(text: &str, key: &str) -> Vec<String> {
    let wanted = key.trim().to_lowercase();
    let mut out = Vec::new();
    for line in text.lines() {
        let Some((line_key, rest)) = line.split_once(':') else {
            continue;
        };
        if line_key.trim().to_lowercase() == wanted {
            push_tokens(rest, &mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_commas_and_spaces() {
        assert_eq!(
            tokens_from_values(&["sentinel, size  both_touched"]),
            vec!["sentinel", "size", "both_touched"]
        );
    }

    #[test]
    fn case_folds_and_dedupes_in_order() {
        assert_eq!(
            tokens_from_values(&["Size,SENTINEL", "size", "all"]),
            vec!["size", "sentinel", "all"]
        );
    }

    #[test]
    fn collect_matches_key_case_insensitively() {
        let text = "release 1.2\n\nforked-override: Sentinel\nOther: x\n FORKED-OVERRIDE : size,sentinel\n";
        assert_eq!(collect(text, "Forked-Override"), vec!["sentinel", "size"]);
    }

    #[test]
    fn collect_ignores_lines_without_colon() {
        assert!(collect("Forked-Override sentinel\n", "Forked-Override").is_empty());
    }
}
