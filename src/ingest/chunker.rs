//! Sliding-window line chunker.
//!
//! Chunk identity is a pure function of `(file_path, start_line, end_line)`,
//! so re-chunking the same file yields identical ids.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::{Chunk, FileRecord};

#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub exclude_patterns: Vec<String>,
    pub include_patterns: Vec<String>,
    /// Files larger than this are skipped entirely (0 = no cap)
    pub max_file_bytes: u64,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            chunk_overlap: 10,
            exclude_patterns: Vec::new(),
            include_patterns: Vec::new(),
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Chunk every eligible file in the manifest. Per-file read failures are
/// logged and skipped; they do not fail the job.
pub fn chunk_files(
    root: &Path,
    repository_id: &str,
    files: &[FileRecord],
    options: &ChunkOptions,
) -> Result<Vec<Chunk>> {
    let exclude = compile_patterns(&options.exclude_patterns);
    let include = compile_patterns(&options.include_patterns);

    let mut all_chunks = Vec::new();

    for file in files {
        if file.is_binary || !file.is_text {
            continue;
        }
        if options.max_file_bytes > 0 && file.size > options.max_file_bytes {
            tracing::debug!(path = %file.path, size = file.size, "skipping oversized file");
            continue;
        }
        if matches_any(&file.path, &exclude) {
            continue;
        }
        if !include.is_empty() && !matches_any(&file.path, &include) {
            continue;
        }

        let content = match std::fs::read_to_string(root.join(&file.path)) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(path = %file.path, %err, "failed to read file for chunking");
                continue;
            }
        };

        all_chunks.extend(chunk_content(
            repository_id,
            &file.path,
            &content,
            &file.language,
            options,
        )?);
    }

    Ok(all_chunks)
}

/// Split `content` into overlapping line windows.
///
/// The window advances by `chunk_size - overlap`. A terminal partial window
/// shorter than 10% of the chunk size is dropped unless it is also the
/// first window (the prior window already covers it via overlap).
/// Whitespace-only windows are dropped.
pub fn chunk_content(
    repository_id: &str,
    file_path: &str,
    content: &str,
    language: &str,
    options: &ChunkOptions,
) -> Result<Vec<Chunk>> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Ok(Vec::new());
    }

    let chunk_size = options.chunk_size;
    let overlap = options.chunk_overlap;
    if overlap >= chunk_size {
        return Err(Error::InvalidArgument(format!(
            "chunk overlap {overlap} must be smaller than chunk size {chunk_size}"
        )));
    }
    let step = chunk_size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < lines.len() {
        let end = (start + chunk_size).min(lines.len());

        // Terminal runt window: already covered by the previous overlap
        if end - start < chunk_size / 10 && start > 0 {
            break;
        }

        let window = lines[start..end].join("\n");
        if !window.trim().is_empty() {
            chunks.push(Chunk {
                id: chunk_id(file_path, start + 1, end),
                repository_id: repository_id.to_string(),
                file_path: file_path.to_string(),
                start_line: start + 1,
                end_line: end,
                size: window.len(),
                hash: hash_content(&window),
                content: window,
                language: language.to_string(),
            });
        }

        if end >= lines.len() {
            break;
        }
        start += step;
    }

    Ok(chunks)
}

/// Stable chunk identity: first 16 hex chars of
/// `sha256("{file_path}:{start_line}-{end_line}")`.
pub fn chunk_id(file_path: &str, start_line: usize, end_line: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{file_path}:{start_line}-{end_line}").as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Compile user-supplied patterns, silently dropping invalid ones.
fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(pattern = %p, %err, "ignoring invalid pattern");
                None
            }
        })
        .collect()
}

fn matches_any(path: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|p| p.is_match(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(size: usize, overlap: usize) -> ChunkOptions {
        ChunkOptions {
            chunk_size: size,
            chunk_overlap: overlap,
            ..Default::default()
        }
    }

    fn numbered_lines(n: usize) -> String {
        (1..=n)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_small_file_is_one_chunk() {
        let content = numbered_lines(5);
        let chunks = chunk_content("repo-1", "a.rs", &content, "rust", &opts(100, 10)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 5);
        assert_eq!(chunks[0].content, content);
    }

    #[test]
    fn test_window_advance_is_size_minus_overlap() {
        let content = numbered_lines(250);
        let chunks = chunk_content("repo-1", "a.rs", &content, "rust", &opts(100, 10)).unwrap();

        assert!(chunks.len() >= 2);
        for pair in chunks.windows(2) {
            if pair[1].end_line < 250 {
                assert_eq!(pair[1].start_line, pair[0].start_line + 90);
            }
        }
    }

    #[test]
    fn test_chunk_ids_are_deterministic() {
        let content = numbered_lines(250);
        let a = chunk_content("repo-1", "a.rs", &content, "rust", &opts(100, 10)).unwrap();
        let b = chunk_content("repo-1", "a.rs", &content, "rust", &opts(100, 10)).unwrap();
        let ids_a: Vec<_> = a.iter().map(|c| c.id.clone()).collect();
        let ids_b: Vec<_> = b.iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn test_chunk_id_shape() {
        let id = chunk_id("src/main.rs", 1, 100);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_coverage_of_nonempty_lines() {
        // Every non-whitespace line must fall inside at least one chunk span
        let content = numbered_lines(437);
        let chunks = chunk_content("repo-1", "a.rs", &content, "rust", &opts(100, 10)).unwrap();

        for line in 1..=437usize {
            let covered = chunks
                .iter()
                .any(|c| c.start_line <= line && line <= c.end_line);
            assert!(covered, "line {line} not covered by any chunk");
        }
    }

    #[test]
    fn test_terminal_runt_window_is_dropped() {
        // Without overlap the window advances by the full chunk size, so a
        // 105-line file leaves a 5-line tail window (< 10% of 100) that is
        // dropped.
        let content = numbered_lines(105);
        let chunks = chunk_content("repo-1", "a.rs", &content, "rust", &opts(100, 0)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].end_line, 100);
    }

    #[test]
    fn test_default_overlap_covers_the_tail() {
        // With the default 10-line overlap the advance is 90, so the tail
        // is always at least 10 lines and never dropped.
        let content = numbered_lines(437);
        let chunks = chunk_content("repo-1", "a.rs", &content, "rust", &opts(100, 10)).unwrap();
        assert_eq!(chunks.last().unwrap().end_line, 437);
    }

    #[test]
    fn test_first_window_is_kept_even_when_short() {
        let content = "one line";
        let chunks = chunk_content("repo-1", "a.rs", content, "rust", &opts(100, 10)).unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_whitespace_only_file_yields_no_chunks() {
        let chunks = chunk_content("repo-1", "a.rs", "   \n\t\n  ", "rust", &opts(100, 10)).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_empty_file_yields_no_chunks() {
        let chunks = chunk_content("repo-1", "a.rs", "", "rust", &opts(100, 10)).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_invalid_patterns_are_ignored() {
        let compiled = compile_patterns(&["[".to_string(), r"\.rs$".to_string()]);
        assert_eq!(compiled.len(), 1);
    }

    #[test]
    fn test_chunk_files_respects_filters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/keep.rs"), "fn keep() {}").unwrap();
        std::fs::write(dir.path().join("src/skip_test.rs"), "fn skip() {}").unwrap();

        let mk = |path: &str| FileRecord {
            path: path.to_string(),
            size: 20,
            language: "rust".to_string(),
            is_text: true,
            is_binary: false,
            line_count: 1,
            modified_at: chrono::Utc::now(),
        };
        let files = vec![mk("src/keep.rs"), mk("src/skip_test.rs")];
        let options = ChunkOptions {
            exclude_patterns: vec!["_test".to_string()],
            ..Default::default()
        };

        let chunks = chunk_files(dir.path(), "repo-1", &files, &options).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].file_path, "src/keep.rs");
    }

    #[test]
    fn test_chunk_files_include_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        std::fs::write(dir.path().join("b.py"), "def b(): pass").unwrap();

        let mk = |path: &str, lang: &str| FileRecord {
            path: path.to_string(),
            size: 20,
            language: lang.to_string(),
            is_text: true,
            is_binary: false,
            line_count: 1,
            modified_at: chrono::Utc::now(),
        };
        let files = vec![mk("a.rs", "rust"), mk("b.py", "python")];
        let options = ChunkOptions {
            include_patterns: vec![r"\.py$".to_string()],
            ..Default::default()
        };

        let chunks = chunk_files(dir.path(), "repo-1", &files, &options).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].file_path, "b.py");
    }

    #[test]
    fn test_oversized_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.rs"), "fn big() {}").unwrap();

        let files = vec![FileRecord {
            path: "big.rs".to_string(),
            size: 1024,
            language: "rust".to_string(),
            is_text: true,
            is_binary: false,
            line_count: 1,
            modified_at: chrono::Utc::now(),
        }];
        let options = ChunkOptions {
            max_file_bytes: 100,
            ..Default::default()
        };

        let chunks = chunk_files(dir.path(), "repo-1", &files, &options).unwrap();
        assert!(chunks.is_empty());
    }
}
