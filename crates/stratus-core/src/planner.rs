//! Split policy and split-decision handling for the chunk planner.
//!
//! The application asks a language model whether (and where) to split a
//! long document. This module owns everything around that call that does
//! not need I/O:
//!
//! - [`assess`]: size thresholds and the generated-file heuristic that
//!   decide whether a document is even a candidate for splitting.
//! - [`split_prompt`]: the line-numbered prompt sent to the model.
//! - [`parse_decision`]: strict JSON parsing with a structural repair
//!   pass (code fences, trailing commas, unbalanced braces/brackets).
//! - [`validate_ranges`]: bounds, ordering, overlap, and gap filling so
//!   the resulting units cover the body without reordering or
//!   duplicating lines.

use serde::Deserialize;

use crate::chunk::LineRange;
use crate::models::SourceDocument;

/// Line thresholds for splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPolicy {
    /// Documents with fewer lines are never split.
    pub min_lines: usize,
    /// Only documents with more lines are considered for splitting.
    pub max_lines: usize,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            min_lines: 10,
            max_lines: 60,
        }
    }
}

/// Outcome of the pre-split checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    TooShort,
    WithinLimit,
    Generated,
    Candidate,
}

impl Assessment {
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }
}

pub fn assess(doc: &SourceDocument, policy: &SplitPolicy) -> Assessment {
    let lines = doc.line_count();
    if lines < policy.min_lines {
        Assessment::TooShort
    } else if lines <= policy.max_lines {
        Assessment::WithinLimit
    } else if looks_generated(doc) {
        Assessment::Generated
    } else {
        Assessment::Candidate
    }
}

const GENERATED_FILE_NAMES: &[&str] = &[
    "Cargo.lock",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "poetry.lock",
    "Pipfile.lock",
    "Gemfile.lock",
    "composer.lock",
    "flake.lock",
    "uv.lock",
    "go.sum",
];

const GENERATED_SUFFIXES: &[&str] = &[
    ".min.js",
    ".min.css",
    ".map",
    ".lock",
    ".pb.go",
    "_pb2.py",
    ".g.dart",
    ".designer.cs",
];

const GENERATED_MARKERS: &[&str] = &[
    "@generated",
    "do not edit",
    "auto-generated",
    "autogenerated",
    "code generated by",
    "this file was generated",
];

/// Heuristic for files that are machine-written and rarely read by people.
pub fn looks_generated(doc: &SourceDocument) -> bool {
    if GENERATED_FILE_NAMES.contains(&doc.file_name.as_str()) {
        return true;
    }
    let lower_name = doc.file_name.to_lowercase();
    if GENERATED_SUFFIXES.iter().any(|s| lower_name.ends_with(s)) {
        return true;
    }

    let head = doc
        .body
        .lines()
        .take(10)
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();
    if GENERATED_MARKERS.iter().any(|m| head.contains(m)) {
        return true;
    }

    // Minified or serialized blobs: very long lines.
    let (count, total, longest) = doc
        .body
        .lines()
        .fold((0usize, 0usize, 0usize), |(c, t, l), line| {
            (c + 1, t + line.len(), l.max(line.len()))
        });
    count > 0 && (longest > 1000 || total / count > 200)
}

/// The model's answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SplitDecision {
    pub split: bool,
    #[serde(default)]
    pub chunks: Option<Vec<LineRange>>,
}

/// Parse a split decision, attempting one structural repair on failure.
pub fn parse_decision(raw: &str) -> Result<SplitDecision, String> {
    let first_err = match serde_json::from_str::<SplitDecision>(raw.trim()) {
        Ok(decision) => return Ok(decision),
        Err(e) => e,
    };

    let repaired = repair_json(raw);
    serde_json::from_str::<SplitDecision>(&repaired).map_err(|e| {
        format!(
            "unparseable split decision ({first_err}); after repair: {e}; repaired payload: {repaired}"
        )
    })
}

/// Best-effort structural repair of a JSON object emitted by a model.
///
/// Strips code fences and leading prose, drops trailing commas, discards
/// unmatched closers, and appends the closers still open at the end.
pub fn repair_json(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string (e.g. "json") up to the first newline.
        text = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    }
    text = text.trim_end();
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    if let Some(pos) = text.find('{') {
        text = &text[pos..];
    }

    let chars: Vec<char> = text.trim().chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                    out.push(c);
                }
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']') | None) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        out.push('"');
    }
    let trimmed_len = out.trim_end().trim_end_matches(',').len();
    out.truncate(trimmed_len);
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

/// Validate model-proposed ranges against a body of `line_count` lines.
///
/// Ranges are put in document order, ends past the last line are clamped,
/// and uncovered lines are attached to the neighbouring range so every
/// body line lands in exactly one range. Overlaps, empty ranges, and
/// starts outside the body are rejected.
pub fn validate_ranges(ranges: &[LineRange], line_count: usize) -> Result<Vec<LineRange>, String> {
    if ranges.is_empty() {
        return Err("split requested without any ranges".to_string());
    }
    if line_count == 0 {
        return Err("cannot split an empty document".to_string());
    }

    let mut sorted: Vec<LineRange> = ranges.to_vec();
    sorted.sort_by_key(|r| r.start);

    for r in &mut sorted {
        if r.start == 0 {
            return Err(format!("range {}-{} is not 1-based", r.start, r.end));
        }
        if r.start > line_count {
            return Err(format!(
                "range {}-{} starts past the last line ({line_count})",
                r.start, r.end
            ));
        }
        if r.end < r.start {
            return Err(format!("range {}-{} is empty", r.start, r.end));
        }
        r.end = r.end.min(line_count);
    }

    for pair in sorted.windows(2) {
        if pair[1].start <= pair[0].end {
            return Err(format!(
                "ranges {}-{} and {}-{} overlap",
                pair[0].start, pair[0].end, pair[1].start, pair[1].end
            ));
        }
    }

    let last = sorted.len() - 1;
    sorted[0].start = 1;
    for i in 0..last {
        sorted[i].end = sorted[i + 1].start - 1;
    }
    sorted[last].end = line_count;

    Ok(sorted)
}

/// Body lines prefixed with `[line:N]` markers.
pub fn numbered_lines(body: &str) -> String {
    body.lines()
        .enumerate()
        .map(|(i, line)| format!("[line:{}] {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt asking the model for a split decision on one document.
pub fn split_prompt(doc: &SourceDocument, policy: &SplitPolicy) -> String {
    format!(
        r#"You decide how to split one source document into retrieval chunks.

Reply with a single JSON object and nothing else:
{{"split": <bool>, "chunks": [{{"start": <int>, "end": <int>}}, ...] | null}}

Rules:
- "start" and "end" are 1-based, inclusive line numbers taken from the [line:N] markers.
- Chunks must be in document order and must not overlap.
- Each chunk is one logical unit: a function, class, or group of related statements in code;
  a heading with its paragraphs in prose; a block of related settings in configuration.
- Aim for 10 to 50 lines per chunk. Never cut a function or paragraph in half unless it
  exceeds 50 lines, and then cut at an inner boundary.
- If the document has {max} lines or fewer, or looks machine-generated or not meant to be
  read by people, answer {{"split": false, "chunks": null}}.

File name: {name}
File path: {path}
Line count: {count}

Document:
{numbered}
"#,
        max = policy.max_lines,
        name = doc.file_name,
        path = doc.relative_path,
        count = doc.line_count(),
        numbered = numbered_lines(&doc.body),
    )
}
