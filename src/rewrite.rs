//! Capture-group path rewriting for gateway rules.
//!
//! Templates use positional placeholders (`$1`, `$2`, ...). A placeholder
//! whose index exceeds the pattern's group count stays in the output
//! literally; a group that exists but did not participate in the match
//! substitutes as empty text.

use regex::{Captures, Regex};
use std::borrow::Cow;

const PLACEHOLDER: char = '$';

/// Substitute `captures` into `template`.
///
/// Templates without a placeholder marker are returned borrowed and untouched.
pub fn substitute<'t>(template: &'t str, captures: &Captures<'_>) -> Cow<'t, str> {
    if !template.contains(PLACEHOLDER) {
        return Cow::Borrowed(template);
    }

    // captures.len() counts the implicit whole-match group 0.
    let group_count = captures.len().saturating_sub(1);
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(pos) = rest.find(PLACEHOLDER) {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();

        if digits == 0 {
            out.push(PLACEHOLDER);
            rest = after;
            continue;
        }

        let placeholder = &rest[pos..pos + 1 + digits];
        match after[..digits].parse::<usize>() {
            Ok(index) if index <= group_count => {
                if let Some(group) = captures.get(index) {
                    out.push_str(group.as_str());
                }
            }
            _ => out.push_str(placeholder),
        }
        rest = &after[digits..];
    }

    out.push_str(rest);
    Cow::Owned(out)
}

/// Append a non-empty query string to a rewritten path.
pub fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{}?{}", path, query),
        _ => path.to_string(),
    }
}

/// Rewrite `path` through `pattern` and `template`, keeping `query` intact.
///
/// Returns `None` when the pattern does not match the path.
pub fn rewrite(pattern: &Regex, template: &str, path: &str, query: Option<&str>) -> Option<String> {
    let captures = pattern.captures(path)?;
    let rewritten = substitute(template, &captures);
    Some(with_query(&rewritten, query))
}

/// Split a request target into path and optional query.
pub fn split_path_and_query(target: &str) -> (&str, Option<&str>) {
    match target.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (target, None),
    }
}
