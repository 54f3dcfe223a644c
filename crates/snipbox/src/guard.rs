//! Static `#include` guard
//!
//! Scans source text for include directives and checks each header against
//! the policy's deny and allow lists before any compiler runs. The source is
//! first normalised the way the preprocessor's early translation phases see
//! it: trigraphs and digraphs for `#`, line splices and comments. Includes
//! assembled through macros are still not seen.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::policy::ExecutionPolicy;

/// `#include`, `#include_next` and `#import` with a `<h>` or `"h"` operand
static INCLUDE_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?m)^[ \t\f\v]*#[ \t\f\v]*(?:include(?:_next)?|import)[ \t\f\v]*",
        r#"(?:<([^>\n]*)>|"([^"\n]*)")"#,
    ))
    .expect("include directive regex is valid")
});

/// Backslash-newline, tolerating trailing blanks as gcc and clang do
static LINE_SPLICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\[ \t\f\v]*\r?\n").expect("line splice regex is valid"));

/// A line holding only the start of an include directive
static PENDING_INCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[ \t\f\v]*#[ \t\f\v]*(?:include(?:_next)?|import)[ \t\f\v]*$")
        .expect("pending include regex is valid")
});

/// Errors building a guard from a policy
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid include pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A header rejected by the guard
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    #[error("include <{header}> is denied (matches '{pattern}')")]
    Denied { header: String, pattern: String },

    #[error("include <{header}> is not in the allowed list")]
    NotAllowed { header: String },

    #[error("include <{header}> is an absolute or parent-relative path")]
    UnsafePath { header: String },
}

impl GuardViolation {
    /// The offending header name, as written
    pub fn header(&self) -> &str {
        match self {
            GuardViolation::Denied { header, .. }
            | GuardViolation::NotAllowed { header }
            | GuardViolation::UnsafePath { header } => header,
        }
    }
}

/// Compiled allow/deny lists
#[derive(Debug, Clone)]
pub struct IncludeGuard {
    denied: Vec<Regex>,
    allowed: Vec<Regex>,
}

impl IncludeGuard {
    /// Compile the include patterns of `policy`
    pub fn new(policy: &ExecutionPolicy) -> Result<Self, GuardError> {
        Ok(Self {
            denied: compile_patterns(&policy.denied_include_patterns)?,
            allowed: compile_patterns(&policy.allowed_include_patterns)?,
        })
    }

    /// Check every include in `source`, returning the first violation
    pub fn check(&self, source: &str) -> Result<(), GuardViolation> {
        for header in includes(source) {
            self.check_header(&header)?;
        }
        Ok(())
    }

    /// Check a single header name
    ///
    /// Patterns see the header with `.` components and repeated slashes
    /// removed. Absolute and `..` paths are always rejected. Deny patterns win
    /// over allow patterns, and an empty allow list permits anything not denied.
    pub fn check_header(&self, header: &str) -> Result<(), GuardViolation> {
        let Some(name) = normalize_header(header) else {
            return Err(GuardViolation::UnsafePath {
                header: header.to_string(),
            });
        };

        if let Some(pattern) = self.denied.iter().find(|re| re.is_match(&name)) {
            return Err(GuardViolation::Denied {
                header: header.to_string(),
                pattern: pattern.as_str().to_string(),
            });
        }

        if !self.allowed.is_empty() && !self.allowed.iter().any(|re| re.is_match(&name)) {
            return Err(GuardViolation::NotAllowed {
                header: header.to_string(),
            });
        }

        Ok(())
    }
}

/// Header names of every include directive in `source`, in order
pub fn includes(source: &str) -> Vec<String> {
    let text = normalize_source(source);
    INCLUDE_DIRECTIVE
        .captures_iter(&text)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str().trim().to_string())
        })
        .collect()
}

/// Source text as the directive scanner should see it
///
/// Applies the `??=`/`??/` trigraphs, joins spliced lines, maps the `%:`
/// digraph to `#` and replaces comments with whitespace. String, character
/// and raw string literals are copied untouched so comment markers inside
/// them do not count.
fn normalize_source(source: &str) -> String {
    let text = source.replace("??=", "#").replace("??/", "\\");
    let text = LINE_SPLICE.replace_all(&text, "");
    let chars: Vec<char> = text.chars().collect();

    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match (c, chars.get(i + 1).copied()) {
            ('/', Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                out.push(' ');
            }
            ('/', Some('*')) => {
                let body_start = i + 2;
                let mut end = body_start;
                while end < chars.len()
                    && !(chars[end] == '*' && chars.get(end + 1) == Some(&'/'))
                {
                    end += 1;
                }
                let spans_lines = chars[body_start..end.min(chars.len())].contains(&'\n');
                i = (end + 2).min(chars.len());
                // A directive continues across the comment; other code ends
                // its line there, so a `#` after the comment starts a line
                if spans_lines && !current_line(&out).trim_start().starts_with('#') {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            ('%', Some(':')) => {
                out.push('#');
                i += 2;
            }
            ('"', _) if is_raw_prefix(&chars[..i]) => {
                i = copy_raw_string(&chars, i, &mut out);
            }
            ('"' | '\'', _) => {
                i = copy_quoted(&chars, i, c, &mut out);
            }
            ('<', _) if PENDING_INCLUDE.is_match(current_line(&out)) => {
                i = copy_quoted(&chars, i, '>', &mut out);
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn current_line(out: &str) -> &str {
    out.rsplit('\n').next().unwrap_or_default()
}

/// Copy a literal opened at `start` through its closing `close`
///
/// Stops at an unescaped newline, which ends any unterminated literal.
fn copy_quoted(chars: &[char], start: usize, close: char, out: &mut String) -> usize {
    out.push(chars[start]);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            return i;
        }
        out.push(c);
        i += 1;
        if c == close {
            return i;
        }
        if c == '\\' && close != '>' && i < chars.len() && chars[i] != '\n' {
            out.push(chars[i]);
            i += 1;
        }
    }
    i
}

/// `R`, `LR`, `uR`, `UR` or `u8R` as a whole token right before a quote
fn is_raw_prefix(before: &[char]) -> bool {
    let ident_start = before
        .iter()
        .rposition(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map_or(0, |p| p + 1);
    let ident: String = before[ident_start..].iter().collect();
    matches!(ident.as_str(), "R" | "LR" | "uR" | "UR" | "u8R")
}

/// Copy `R"delim( ... )delim"` starting at the quote
///
/// A malformed delimiter falls back to an ordinary string literal.
fn copy_raw_string(chars: &[char], start: usize, out: &mut String) -> usize {
    let delimiter: String = chars[start + 1..]
        .iter()
        .take(17)
        .take_while(|c| **c != '(')
        .collect();
    let open = start + 1 + delimiter.chars().count();
    let well_formed = chars.get(open) == Some(&'(')
        && !delimiter
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ')' | '\\' | '"'));
    if !well_formed {
        return copy_quoted(chars, start, '"', out);
    }

    let terminator: Vec<char> = format!("){delimiter}\"").chars().collect();
    let end = chars[open..]
        .windows(terminator.len())
        .position(|w| w == terminator.as_slice())
        .map_or(chars.len(), |p| open + p + terminator.len());
    out.extend(&chars[start..end]);
    end
}

/// Header path with empty and `.` components dropped
///
/// `None` for absolute paths and paths with a `..` component, which can
/// name any file regardless of the patterns.
fn normalize_header(header: &str) -> Option<String> {
    if header.starts_with('/') {
        return None;
    }
    let mut parts = Vec::new();
    for part in header.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            part => parts.push(part),
        }
    }
    Some(parts.join("/"))
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, GuardError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| GuardError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}
