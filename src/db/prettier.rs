//! Human-readable statement rendering for diagnostic logs.
//!
//! The output substitutes arguments textually and is never sent to the
//! database; execution always binds parameters.

use crate::models::QueryParam;

/// Positional placeholder style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placeholder {
    /// `$1`, `$2`, ... (PostgreSQL)
    #[default]
    Dollar,
    /// `?1`, `?2`, ... as well as `$1`, `$2`, ... (SQLite accepts both)
    Question,
}

impl Placeholder {
    fn prefixes(&self) -> &'static [char] {
        match self {
            Self::Dollar => &['$'],
            Self::Question => &['?', '$'],
        }
    }
}

/// Render `query` with each numbered placeholder replaced by its argument.
///
/// Placeholders without a matching argument are left as they are. Runs of
/// whitespace that contain a tab or line break collapse to one space and the
/// result is trimmed.
pub fn pretty(query: &str, placeholder: Placeholder, args: &[QueryParam]) -> String {
    let substituted = substitute(query, placeholder.prefixes(), args);
    collapse_whitespace(&substituted).trim().to_string()
}

/// Printable form of a single argument: strings and bytes quoted, everything
/// else in its default textual form.
pub fn render_param(param: &QueryParam) -> String {
    match param {
        QueryParam::Null => "NULL".to_string(),
        QueryParam::Bool(v) => v.to_string(),
        QueryParam::Int(v) => v.to_string(),
        QueryParam::Float(v) => v.to_string(),
        QueryParam::String(v) => format!("{:?}", v),
        QueryParam::Bytes(v) => format!("{:?}", String::from_utf8_lossy(v)),
        QueryParam::Json(v) => v.to_string(),
    }
}

fn substitute(query: &str, prefixes: &[char], args: &[QueryParam]) -> String {
    let mut out = String::with_capacity(query.len());
    let mut chars = query.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if !prefixes.contains(&c) {
            out.push(c);
            continue;
        }

        let digits_start = start + c.len_utf8();
        let mut digits_end = digits_start;
        while let Some(&(idx, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            digits_end = idx + d.len_utf8();
            chars.next();
        }

        let position = query[digits_start..digits_end].parse::<usize>().ok();
        match position.and_then(|n| n.checked_sub(1)).and_then(|i| args.get(i)) {
            Some(param) => out.push_str(&render_param(param)),
            None => out.push_str(&query[start..digits_end]),
        }
    }

    out
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = String::new();

    let flush = |run: &mut String, out: &mut String| {
        if run.contains(['\t', '\n', '\r']) {
            out.push(' ');
        } else {
            out.push_str(run);
        }
        run.clear();
    };

    for c in text.chars() {
        if c.is_whitespace() {
            run.push(c);
        } else {
            if !run.is_empty() {
                flush(&mut run, &mut out);
            }
            out.push(c);
        }
    }
    if !run.is_empty() {
        flush(&mut run, &mut out);
    }

    out
}
