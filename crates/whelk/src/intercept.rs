//! Fast-path recognition of simple custom-command pipelines.
//!
//! The interceptor parses just enough shell syntax to dispatch safely without
//! invoking the engine: pipelines of whitespace/quote-tokenizable commands
//! with no control operators or redirection. Anything it cannot parse is
//! declined (`None`), never an error, and the engine stays authoritative.

use regex_lite::Regex;

/// Split a script on unquoted, unescaped `|` into pipeline stages.
///
/// Returns `None` (not recognized) when the script contains unquoted `;`,
/// `&`, `>`, `<`, or `||`, an empty stage, or unbalanced quoting/escaping at
/// end of input. Quotes and escapes are preserved in the returned stages for
/// the argument splitter to consume.
pub(crate) fn split_pipeline(script: &str) -> Option<Vec<String>> {
    let mut stages = Vec::new();
    let mut buf = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    let chars: Vec<char> = script.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if escaped {
            buf.push(ch);
            escaped = false;
            i += 1;
            continue;
        }
        if ch == '\\' && !in_single {
            buf.push(ch);
            escaped = true;
            i += 1;
            continue;
        }
        if ch == '\'' && !in_double {
            in_single = !in_single;
            buf.push(ch);
            i += 1;
            continue;
        }
        if ch == '"' && !in_single {
            in_double = !in_double;
            buf.push(ch);
            i += 1;
            continue;
        }
        if !in_single && !in_double {
            if matches!(ch, ';' | '&' | '>' | '<') {
                return None;
            }
            if ch == '|' && chars.get(i + 1) == Some(&'|') {
                return None;
            }
            if ch == '|' {
                let stage = buf.trim().to_string();
                if stage.is_empty() {
                    return None;
                }
                stages.push(stage);
                buf.clear();
                i += 1;
                continue;
            }
        }
        buf.push(ch);
        i += 1;
    }

    if in_single || in_double || escaped {
        return None;
    }
    let last = buf.trim().to_string();
    if last.is_empty() {
        return None;
    }
    stages.push(last);
    Some(stages)
}

/// Tokenize a single pipeline stage into arguments.
///
/// Single quotes take their content literally (no escapes inside); double
/// quotes allow backslash escapes; bare backslashes escape the next
/// character. Returns `None` for unterminated quoting/escaping or an empty
/// stage.
pub(crate) fn split_args(stage: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut buf = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut has_token = false;

    for ch in stage.chars() {
        if escaped {
            buf.push(ch);
            has_token = true;
            escaped = false;
            continue;
        }
        if ch == '\\' && !in_single {
            escaped = true;
            continue;
        }
        if ch == '\'' && !in_double {
            in_single = !in_single;
            has_token = true;
            continue;
        }
        if ch == '"' && !in_single {
            in_double = !in_double;
            has_token = true;
            continue;
        }
        if !in_single && !in_double && ch.is_whitespace() {
            if has_token {
                args.push(std::mem::take(&mut buf));
                has_token = false;
            }
            continue;
        }
        buf.push(ch);
        has_token = true;
    }

    if in_single || in_double || escaped {
        return None;
    }
    if has_token {
        args.push(buf);
    }
    if args.is_empty() { None } else { Some(args) }
}

/// Whether the script mentions any of the given command names as a word
/// (start/end of script, whitespace, or a pipe on either side).
pub(crate) fn references_custom_command(script: &str, names: &[String]) -> bool {
    names.iter().any(|name| {
        let pattern = format!(r"(^|[\s|]){}($|[\s|])", regex_lite::escape(name));
        Regex::new(&pattern)
            .map(|re| re.is_match(script))
            .unwrap_or(false)
    })
}
