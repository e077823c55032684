//! Result merging: per-backend score normalization, union, per-file
//! de-duplication, and rule-based boosting.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

use crate::models::{CodeChunk, SearchSource, SearchStats, SearchTimings};

/// Line-proximity window for treating two chunks as overlapping.
const PROXIMITY_LINES: usize = 5;

/// Languages that receive the popularity boost.
const POPULAR_LANGUAGES: &[&str] = &["go", "javascript", "typescript", "python", "java"];

#[derive(Debug, Clone)]
pub struct MergedResults {
    pub chunks: Vec<CodeChunk>,
    pub timings: SearchTimings,
    pub stats: SearchStats,
}

/// Raw per-backend outcomes handed to the merger. `None` marks a backend
/// that failed; its absence is recorded in stats but does not fail the
/// merge.
#[derive(Debug, Default)]
pub struct BackendResults {
    pub lexical: Option<Vec<CodeChunk>>,
    pub semantic: Option<Vec<CodeChunk>>,
    pub lexical_ms: u64,
    pub semantic_ms: u64,
}

pub struct ResultMerger {
    max_results: usize,
}

impl ResultMerger {
    pub fn new(max_results: usize) -> Self {
        Self { max_results }
    }

    pub fn merge_and_rank(&self, results: BackendResults) -> MergedResults {
        let merge_start = Instant::now();

        let lexical_failed = results.lexical.is_none();
        let semantic_failed = results.semantic.is_none();
        let lexical = results.lexical.unwrap_or_default();
        let semantic = results.semantic.unwrap_or_default();
        let lexical_count = lexical.len();
        let semantic_count = semantic.len();

        let mut merged = normalize_scores(lexical);
        merged.extend(normalize_scores(semantic));

        let mut final_chunks = deduplicate_and_rank(merged);

        let truncated = final_chunks.len() > self.max_results;
        final_chunks.truncate(self.max_results);

        MergedResults {
            stats: SearchStats {
                lexical_candidates: lexical_count,
                semantic_candidates: semantic_count,
                merged_results: final_chunks.len(),
                results_truncated: truncated,
                lexical_failed,
                semantic_failed,
            },
            timings: SearchTimings {
                lexical_ms: results.lexical_ms,
                semantic_ms: results.semantic_ms,
                merge_ms: merge_start.elapsed().as_millis() as u64,
                composition_ms: 0,
                cache_hit: false,
            },
            chunks: final_chunks,
        }
    }
}

// ─── Normalization ───────────────────────────────────────

/// Map raw backend scores to [0, 1] via sigmoid over the z-score. With zero
/// variance every score collapses to 0.5.
pub fn normalize_scores(chunks: Vec<CodeChunk>) -> Vec<CodeChunk> {
    if chunks.is_empty() {
        return chunks;
    }

    let count = chunks.len() as f64;
    let sum: f64 = chunks.iter().map(|c| c.score as f64).sum();
    let sum_squares: f64 = chunks.iter().map(|c| (c.score as f64).powi(2)).sum();
    let mean = sum / count;
    let variance = (sum_squares / count) - mean * mean;
    let mut std_dev = variance.max(0.0).sqrt();
    if std_dev == 0.0 {
        std_dev = 1.0;
    }

    chunks
        .into_iter()
        .map(|mut chunk| {
            let z = (chunk.score as f64 - mean) / std_dev;
            chunk.score = (1.0 / (1.0 + (-z).exp())) as f32;
            chunk
        })
        .collect()
}

// ─── De-duplication and ranking ──────────────────────────

fn deduplicate_and_rank(chunks: Vec<CodeChunk>) -> Vec<CodeChunk> {
    if chunks.is_empty() {
        return chunks;
    }

    let mut file_groups: HashMap<String, Vec<CodeChunk>> = HashMap::new();
    for chunk in chunks {
        file_groups
            .entry(chunk.file_path.clone())
            .or_default()
            .push(chunk);
    }

    let mut final_chunks = Vec::new();
    for (_, file_chunks) in file_groups {
        let sources: Vec<SearchSource> = file_chunks.iter().map(|c| c.source).collect();
        let mut deduplicated = deduplicate_file_chunks(file_chunks);
        for chunk in &mut deduplicated {
            chunk.score = apply_boosts(chunk, &sources);
        }
        final_chunks.extend(deduplicated);
    }

    final_chunks.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    final_chunks
}

/// Merge overlapping chunks within one file. Chunks within
/// [`PROXIMITY_LINES`] of each other count as overlapping; the merged chunk
/// takes the union span, the longer content, the max score, and the
/// `Merged` source tag.
pub fn deduplicate_file_chunks(mut chunks: Vec<CodeChunk>) -> Vec<CodeChunk> {
    if chunks.len() <= 1 {
        return chunks;
    }

    chunks.sort_by_key(|c| c.start_line);

    let mut deduplicated: Vec<CodeChunk> = Vec::new();
    for chunk in chunks {
        let mut merged = false;
        for existing in deduplicated.iter_mut().rev() {
            if has_overlap(existing, &chunk) {
                merge_into(existing, &chunk);
                merged = true;
                break;
            }
        }
        if !merged {
            deduplicated.push(chunk);
        }
    }

    deduplicated
}

fn has_overlap(a: &CodeChunk, b: &CodeChunk) -> bool {
    if a.file_path != b.file_path {
        return false;
    }
    a.end_line + PROXIMITY_LINES >= b.start_line
        && a.start_line <= b.end_line + PROXIMITY_LINES
}

fn merge_into(target: &mut CodeChunk, other: &CodeChunk) {
    target.start_line = target.start_line.min(other.start_line);
    target.end_line = target.end_line.max(other.end_line);
    if other.content.len() > target.content.len() {
        target.content = other.content.clone();
    }
    if other.score > target.score {
        target.score = other.score;
    }
    target.source = SearchSource::Merged;
}

// ─── Boosts ──────────────────────────────────────────────

/// Additive boosts and penalties applied after dedup, clamped to [0, 1].
fn apply_boosts(chunk: &CodeChunk, file_sources: &[SearchSource]) -> f32 {
    let mut score = chunk.score;

    let has_lexical = file_sources.iter().any(|s| *s == SearchSource::Lexical);
    let has_semantic = file_sources.iter().any(|s| *s == SearchSource::Semantic);
    if has_lexical && has_semantic {
        score += 0.15;
    }

    let line_span = chunk.end_line.saturating_sub(chunk.start_line) + 1;
    if line_span <= 10 {
        score += 0.05;
    } else if line_span > 50 {
        score -= 0.02;
    }

    if POPULAR_LANGUAGES.contains(&chunk.language.as_str()) {
        score += 0.02;
    }

    if chunk.file_path.contains("_test.")
        || chunk.file_path.contains(".test.")
        || chunk.file_path.contains("test/")
    {
        score -= 0.01;
    }

    if chunk.file_path.contains("main.")
        || chunk.file_path.contains("index.")
        || chunk.file_path.contains("app.")
    {
        score += 0.02;
    }

    let lines: Vec<&str> = chunk.content.lines().collect();
    if !lines.is_empty() {
        let non_empty = lines.iter().filter(|l| !l.trim().is_empty()).count();
        let density = non_empty as f32 / lines.len() as f32;
        if density > 0.7 {
            score += 0.03;
        }
    }

    score.clamp(0.0, 1.0)
}

// ─── Lexical relevance ───────────────────────────────────

/// Assign a base relevance score to each lexical chunk before
/// normalization: occurrences, word-boundary matches, content length, and
/// language all contribute; no matching term means zero.
pub fn score_lexical_relevance(chunks: &mut [CodeChunk], query: &str) {
    let query_lower = query.to_lowercase();
    let terms: Vec<&str> = query_lower.split_whitespace().collect();

    for chunk in chunks {
        let content = chunk.content.to_lowercase();
        let mut score = 0.0f32;
        let mut has_match = false;

        for term in &terms {
            if content.contains(term) {
                has_match = true;
                score += content.matches(term).count() as f32 * 0.1;

                let word_pattern = format!(r"\b{}\b", regex::escape(term));
                if let Ok(re) = Regex::new(&word_pattern) {
                    if re.is_match(&content) {
                        score += 0.2;
                    }
                }
            }
        }

        if !has_match {
            chunk.score = 0.0;
            continue;
        }

        if chunk.content.len() < 200 {
            score += 0.1;
        }
        if POPULAR_LANGUAGES.contains(&chunk.language.as_str()) {
            score += 0.05;
        }
        if chunk.content.len() > 1000 {
            score -= 0.1;
        }

        chunk.score = score.clamp(0.0, 1.0);
    }
}

// ─── Secret redaction ────────────────────────────────────

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#"(?i)(password|pwd|secret|key|token|auth)\s*[:=]\s*["']([^"']{8,})["']"#,
            r#"(?i)(api_key|apikey|access_key)\s*[:=]\s*["']([^"']{8,})["']"#,
            r#"(?i)(private_key|privkey)\s*[:=]\s*["']([^"']{20,})["']"#,
            // Bare base64-looking runs (hardcoded keys, JWT segments)
            r"[A-Za-z0-9+/]{40,}={0,2}",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Replace likely secret values in chunk content with `[REDACTED]`.
/// Orthogonal post-processing; wired into the chat path behind a config
/// flag.
pub fn redact_secrets(chunks: &mut [CodeChunk]) {
    for chunk in chunks {
        let mut content = chunk.content.clone();
        for pattern in secret_patterns() {
            content = pattern
                .replace_all(&content, |caps: &regex::Captures| {
                    let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                    match caps.get(2) {
                        // Labeled assignment: redact only the value
                        Some(value) => whole.replacen(value.as_str(), "[REDACTED]", 1),
                        // No capture group: the whole match is the secret
                        None => "[REDACTED]".to_string(),
                    }
                })
                .into_owned();
        }
        chunk.content = content;
    }
}
