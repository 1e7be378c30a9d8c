//! Layered text-region location for the edit-file gadget.
//!
//! Locates a search snippet inside file content, robust to whitespace and
//! indentation drift. Strategies are tried in order, each with a fixed
//! confidence:
//!
//! 1. exact substring (1.0)
//! 2. whitespace-insensitive — horizontal whitespace runs collapse to a
//!    single space, newlines preserved (0.95)
//! 3. indentation-preserving — line-by-line after stripping leading
//!    whitespace (0.9)
//! 4. fuzzy — line-wise Levenshtein similarity, length-weighted (the score
//!    is the confidence; accepted at or above the configured threshold)
//!
//! On failure, [`get_match_failure`] proposes the closest windows so the
//! model can correct its snippet.

use serde::Serialize;

/// Tuning knobs for matching and failure suggestions.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Minimum fuzzy similarity to accept a match.
    pub fuzzy_threshold: f64,
    /// Maximum number of failure suggestions.
    pub max_suggestions: usize,
    /// Context lines around the best suggestion in the formatted block.
    pub context_lines: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.8,
            max_suggestions: 3,
            context_lines: 5,
        }
    }
}

/// Which strategy located the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Byte-identical substring.
    Exact,
    /// Horizontal-whitespace-insensitive.
    Whitespace,
    /// Leading-indentation-insensitive, line by line.
    Indentation,
    /// Levenshtein-scored sliding window.
    Fuzzy,
}

/// A located region of the content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// The strategy that found the region.
    pub strategy: MatchStrategy,
    /// Strategy confidence; for fuzzy matches, the similarity score.
    pub confidence: f64,
    /// The exact content slice `[start_index, end_index)`.
    pub matched_content: String,
    /// Byte offset of the region start.
    pub start_index: usize,
    /// Byte offset one past the region end.
    pub end_index: usize,
    /// 1-based first line of the region.
    pub start_line: usize,
    /// 1-based last line of the region.
    pub end_line: usize,
}

/// A near-miss window proposed after a failed match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchSuggestion {
    /// The window's content.
    pub content: String,
    /// 1-based line number of the window start.
    pub line_number: usize,
    /// The window's fuzzy similarity to the search snippet.
    pub similarity: f64,
}

/// Failure report: the closest windows plus a gutter-formatted context block
/// around the best one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchFailure {
    /// Suggestions, best first.
    pub suggestions: Vec<MatchSuggestion>,
    /// Context block around the best suggestion, if any.
    pub context: Option<String>,
}

/// Locates `search` inside `content`, trying each strategy in order.
#[must_use]
pub fn find_match(content: &str, search: &str, config: &MatcherConfig) -> Option<MatchResult> {
    if search.is_empty() {
        return None;
    }
    exact_match(content, search)
        .or_else(|| whitespace_match(content, search))
        .or_else(|| indentation_match(content, search))
        .or_else(|| fuzzy_match(content, search, config.fuzzy_threshold))
}

/// Splices `replacement` over the matched region. An empty replacement
/// deletes the region; everything outside the region is preserved
/// byte-for-byte.
#[must_use]
pub fn apply_replacement(content: &str, result: &MatchResult, replacement: &str) -> String {
    let mut out = String::with_capacity(
        content.len() - (result.end_index - result.start_index) + replacement.len(),
    );
    out.push_str(&content[..result.start_index]);
    out.push_str(replacement);
    out.push_str(&content[result.end_index..]);
    out
}

// ---------------------------------------------------------------------------
// Strategy 1: exact
// ---------------------------------------------------------------------------

fn exact_match(content: &str, search: &str) -> Option<MatchResult> {
    let start = content.find(search)?;
    Some(result_for_range(
        content,
        start,
        start + search.len(),
        MatchStrategy::Exact,
        1.0,
    ))
}

// ---------------------------------------------------------------------------
// Strategy 2: whitespace-insensitive
// ---------------------------------------------------------------------------

/// Normalized text plus, per normalized byte, the original byte range it
/// covers (a collapsed space covers its whole whitespace run).
struct Normalized {
    text: String,
    starts: Vec<usize>,
    ends: Vec<usize>,
}

fn normalize_horizontal_ws(source: &str) -> Normalized {
    let mut text = String::with_capacity(source.len());
    let mut starts = Vec::with_capacity(source.len());
    let mut ends = Vec::with_capacity(source.len());

    let bytes = source.as_bytes();
    let mut i = 0;
    while i < source.len() {
        if bytes[i] == b' ' || bytes[i] == b'\t' {
            let run_start = i;
            while i < source.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
                i += 1;
            }
            text.push(' ');
            starts.push(run_start);
            ends.push(i);
        } else {
            let ch = source[i..].chars().next().unwrap_or('\0');
            let len = ch.len_utf8();
            text.push(ch);
            for _ in 0..len {
                starts.push(i);
                ends.push(i + len);
            }
            i += len;
        }
    }

    Normalized { text, starts, ends }
}

fn whitespace_match(content: &str, search: &str) -> Option<MatchResult> {
    let norm_content = normalize_horizontal_ws(content);
    let norm_search = normalize_horizontal_ws(search);
    if norm_search.text.is_empty() {
        return None;
    }

    let at = norm_content.text.find(&norm_search.text)?;
    let start = norm_content.starts[at];
    let end = norm_content.ends[at + norm_search.text.len() - 1];
    Some(result_for_range(
        content,
        start,
        end,
        MatchStrategy::Whitespace,
        0.95,
    ))
}

// ---------------------------------------------------------------------------
// Strategy 3: indentation-preserving
// ---------------------------------------------------------------------------

/// Line starts (byte offsets) plus line slices, split on `\n`.
fn lines_with_offsets(content: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut offset = 0;
    for line in content.split('\n') {
        out.push((offset, line));
        offset += line.len() + 1;
    }
    out
}

/// The search lines, with a trailing empty line (from a final `\n`) dropped.
fn search_lines(search: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = search.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

fn indentation_match(content: &str, search: &str) -> Option<MatchResult> {
    let content_lines = lines_with_offsets(content);
    let needle = search_lines(search);
    if needle.is_empty() || needle.len() > content_lines.len() {
        return None;
    }

    for window in 0..=content_lines.len() - needle.len() {
        let matches = needle
            .iter()
            .enumerate()
            .all(|(j, line)| content_lines[window + j].1.trim_start() == line.trim_start());
        if matches {
            let (start, _) = content_lines[window];
            let (last_start, last_line) = content_lines[window + needle.len() - 1];
            return Some(result_for_range(
                content,
                start,
                last_start + last_line.len(),
                MatchStrategy::Indentation,
                0.9,
            ));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Strategy 4: fuzzy
// ---------------------------------------------------------------------------

fn levenshtein(a: &str, b: &str) -> usize {
    if a.is_empty() || b.is_empty() {
        return a.chars().count().max(b.chars().count());
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            row[j + 1] = (prev[j + 1] + 1).min(row[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut row);
    }
    prev[b.len()]
}

fn line_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Length-weighted mean of per-line similarities for one window.
fn window_similarity(window: &[(usize, &str)], needle: &[&str]) -> f64 {
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    for (j, search_line) in needle.iter().enumerate() {
        let content_line = window[j].1;
        let weight = content_line.len().max(search_line.len()) as f64;
        if weight == 0.0 {
            continue;
        }
        weighted += line_similarity(content_line, search_line) * weight;
        weight_sum += weight;
    }
    if weight_sum == 0.0 {
        1.0
    } else {
        weighted / weight_sum
    }
}

fn fuzzy_match(content: &str, search: &str, threshold: f64) -> Option<MatchResult> {
    let content_lines = lines_with_offsets(content);
    let needle = search_lines(search);
    if needle.is_empty() || needle.len() > content_lines.len() {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for window in 0..=content_lines.len() - needle.len() {
        let similarity = window_similarity(&content_lines[window..window + needle.len()], &needle);
        if best.is_none_or(|(_, s)| similarity > s) {
            best = Some((window, similarity));
        }
    }

    let (window, similarity) = best?;
    if similarity < threshold {
        return None;
    }
    let (start, _) = content_lines[window];
    let (last_start, last_line) = content_lines[window + needle.len() - 1];
    Some(result_for_range(
        content,
        start,
        last_start + last_line.len(),
        MatchStrategy::Fuzzy,
        similarity,
    ))
}

// ---------------------------------------------------------------------------
// Failure suggestions
// ---------------------------------------------------------------------------

/// Scores every window against the search snippet and reports the closest
/// ones. Windows below `max(0.5, threshold - 0.2)` are dropped.
#[must_use]
pub fn get_match_failure(content: &str, search: &str, config: &MatcherConfig) -> MatchFailure {
    let content_lines = lines_with_offsets(content);
    let needle = search_lines(search);
    if needle.is_empty() || needle.len() > content_lines.len() {
        return MatchFailure {
            suggestions: Vec::new(),
            context: None,
        };
    }

    let cutoff = (config.fuzzy_threshold - 0.2).max(0.5);
    let mut scored: Vec<MatchSuggestion> = Vec::new();
    for window in 0..=content_lines.len() - needle.len() {
        let window_lines = &content_lines[window..window + needle.len()];
        let similarity = window_similarity(window_lines, &needle);
        if similarity >= cutoff {
            scored.push(MatchSuggestion {
                content: window_lines
                    .iter()
                    .map(|(_, line)| *line)
                    .collect::<Vec<_>>()
                    .join("\n"),
                line_number: window + 1,
                similarity,
            });
        }
    }

    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(config.max_suggestions);

    let context = scored
        .first()
        .map(|best| context_block(&content_lines, best, needle.len(), config.context_lines));

    MatchFailure {
        suggestions: scored,
        context,
    }
}

/// Gutter-formatted lines around a suggestion, 1-based numbering.
fn context_block(
    content_lines: &[(usize, &str)],
    best: &MatchSuggestion,
    window_len: usize,
    context_lines: usize,
) -> String {
    let first = best.line_number.saturating_sub(context_lines + 1);
    let last = (best.line_number + window_len - 1 + context_lines).min(content_lines.len());

    let mut out = String::new();
    for (index, (_, line)) in content_lines.iter().enumerate().take(last).skip(first) {
        out.push_str(&format!("{:>4} | {}\n", index + 1, line));
    }
    out
}

// ---------------------------------------------------------------------------
// Shared result construction
// ---------------------------------------------------------------------------

fn result_for_range(
    content: &str,
    start: usize,
    end: usize,
    strategy: MatchStrategy,
    confidence: f64,
) -> MatchResult {
    let matched = &content[start..end];
    let start_line = 1 + content[..start].matches('\n').count();
    let mut newlines = matched.matches('\n').count();
    if matched.ends_with('\n') {
        newlines -= 1;
    }
    MatchResult {
        strategy,
        confidence,
        matched_content: matched.to_string(),
        start_index: start,
        end_index: end,
        start_line,
        end_line: start_line + newlines,
    }
}
