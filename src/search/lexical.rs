//! Lexical search: a ripgrep subprocess over the repository working tree.
//!
//! Queries are compiled into a case-insensitive alternation per term —
//! literal, substring-within-word, synonym expansions, and CamelCase /
//! snake_case variants — then OR-joined across terms. A zero-match exit
//! status is an empty result, not an error.

use serde::Deserialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use crate::error::{Error, Result};
use crate::ingest::extract::detect_language;
use crate::models::{CodeChunk, SearchFilters, SearchSource};

#[derive(Clone)]
pub struct LexicalSearch {
    work_dir: PathBuf,
    max_matches_per_file: usize,
}

// ─── ripgrep JSON output ─────────────────────────────────

#[derive(Deserialize)]
struct RgLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<RgData>,
}

#[derive(Deserialize)]
struct RgData {
    #[serde(default)]
    path: Option<RgText>,
    #[serde(default)]
    lines: Option<RgText>,
    #[serde(default)]
    line_number: Option<usize>,
}

#[derive(Deserialize)]
struct RgText {
    #[serde(default)]
    text: Option<String>,
}

impl LexicalSearch {
    pub fn new(work_dir: PathBuf, max_matches_per_file: usize) -> Self {
        Self {
            work_dir,
            max_matches_per_file,
        }
    }

    /// Run a lexical search over the repository's working tree.
    pub async fn search(
        &self,
        repository_id: &str,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<CodeChunk>> {
        let args = build_rg_args(query, filters, self.max_matches_per_file)?;
        let repo_path = self.work_dir.join(repository_id);

        if !repo_path.is_dir() {
            return Err(Error::NotFound(format!(
                "no working tree for repository {repository_id}"
            )));
        }

        let output = tokio::process::Command::new("rg")
            .args(&args)
            .current_dir(&repo_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::RetrieveFailed(format!("failed to run rg: {e}")))?;

        match output.status.code() {
            // 0 = matches found, 1 = no matches (not an error)
            Some(0) => Ok(parse_rg_output(&output.stdout, repository_id)),
            Some(1) => Ok(Vec::new()),
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(Error::RetrieveFailed(format!(
                    "rg exited with {:?}: {}",
                    output.status.code(),
                    stderr.trim()
                )))
            }
        }
    }

    /// Liveness probe: is the search tool on PATH?
    pub async fn health_check(&self) -> Result<()> {
        let status = tokio::process::Command::new("rg")
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Internal(format!("rg not available: {e}")))?;
        if !status.success() {
            return Err(Error::internal("rg --version failed"));
        }
        Ok(())
    }
}

// ─── Argument construction ───────────────────────────────

fn build_rg_args(query: &str, filters: &SearchFilters, max_count: usize) -> Result<Vec<String>> {
    let mut args: Vec<String> = vec![
        "--json".into(),
        "--line-number".into(),
        "--column".into(),
        "--context".into(),
        "2".into(),
        "--max-count".into(),
        max_count.to_string(),
        "--smart-case".into(),
    ];

    for language in &filters.languages {
        if let Some(rg_type) = rg_type_for_language(language) {
            args.push("--type".into());
            args.push(rg_type.into());
        }
    }
    for pattern in &filters.file_patterns {
        args.push("--glob".into());
        args.push(pattern.clone());
    }
    if let Some(prefix) = &filters.path_prefix {
        args.push("--glob".into());
        args.push(format!("{prefix}*"));
    }

    args.push(query_to_regex(query)?);
    Ok(args)
}

/// Compile the query into one alternation: per whitespace-separated term a
/// group of literal, partial-word, synonym, and case-variant patterns, all
/// groups OR-joined.
pub fn query_to_regex(query: &str) -> Result<String> {
    let terms: Vec<&str> = query.split_whitespace().collect();
    if terms.is_empty() {
        return Err(Error::invalid_argument("empty query"));
    }

    let mut groups = Vec::new();

    for term in terms {
        let term = term.to_lowercase();
        let mut patterns = Vec::new();

        // 1. Literal
        patterns.push(format!("(?i){}", regex::escape(&term)));

        // 2. Substring within a larger word
        if term.len() >= 3 {
            patterns.push(format!(r"(?i)\w*{}\w*", regex::escape(&term)));
        }

        // 3. Fixed fuzzy expansions
        patterns.extend(fuzzy_patterns(&term));

        if patterns.len() > 1 {
            groups.push(format!("({})", patterns.join("|")));
        } else {
            groups.push(patterns.remove(0));
        }
    }

    if groups.len() == 1 {
        Ok(groups.remove(0))
    } else {
        Ok(format!("({})", groups.join("|")))
    }
}

/// Built-in synonym table for common code vocabulary, plus positional
/// CamelCase / snake_case variants for longer terms.
fn fuzzy_patterns(term: &str) -> Vec<String> {
    const SYNONYMS: &[(&str, &[&str])] = &[
        ("auth", &["authentication", "authorization", "authorize", "authenticated", "authenticator"]),
        ("authentication", &["auth", "authenticator", "authenticate"]),
        ("authorization", &["auth", "authorize", "authz"]),
        ("config", &["configuration", "configure", "conf"]),
        ("configuration", &["config", "conf"]),
        ("db", &["database", "data_base"]),
        ("database", &["db", "data_base"]),
        ("api", &["endpoint", "service", "rest", "graphql"]),
        ("endpoint", &["api", "route", "handler"]),
        ("handler", &["handle", "controller", "processor"]),
        ("service", &["svc", "server", "api"]),
        ("server", &["srv", "service", "daemon"]),
        ("client", &["cli", "consumer"]),
        ("response", &["resp", "result", "reply"]),
        ("request", &["req", "query", "input"]),
        ("error", &["err", "exception", "failure"]),
        ("function", &["func", "method", "procedure"]),
        ("method", &["func", "function"]),
        ("variable", &["var", "field", "property"]),
        ("parameter", &["param", "arg", "argument"]),
        ("middleware", &["interceptor", "filter"]),
        ("route", &["router", "routing", "path"]),
        ("controller", &["ctrl", "handler", "processor"]),
        ("model", &["schema", "entity", "data"]),
        ("view", &["template", "render", "display"]),
        ("user", &["users", "account", "profile"]),
        ("password", &["pwd", "pass", "secret"]),
        ("token", &["jwt", "bearer", "session"]),
        ("session", &["sess", "cookie", "token"]),
    ];

    let mut patterns = Vec::new();

    if let Some((_, expansions)) = SYNONYMS.iter().find(|(key, _)| *key == term) {
        for expansion in *expansions {
            patterns.push(format!("(?i){}", regex::escape(expansion)));
        }
    }

    // Reverse direction: the term may itself be an expansion of a key
    for (key, expansions) in SYNONYMS {
        if expansions.contains(&term) {
            patterns.push(format!("(?i){}", regex::escape(key)));
            break;
        }
    }

    if term.len() >= 3 {
        // CamelCase: authHandler, AuthService
        let mut title = term.to_string();
        if let Some(first) = title.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        patterns.push(format!(r"(?i){}[A-Z]\w*", regex::escape(&title)));
        // snake_case: auth_handler, user_auth
        patterns.push(format!(r"(?i)\w*_?{}_?\w*", regex::escape(term)));
    }

    patterns
}

fn rg_type_for_language(language: &str) -> Option<&'static str> {
    match language {
        "go" => Some("go"),
        "javascript" => Some("js"),
        "typescript" => Some("ts"),
        "python" => Some("py"),
        "java" => Some("java"),
        "cpp" => Some("cpp"),
        "c" => Some("c"),
        "csharp" => Some("csharp"),
        "ruby" => Some("ruby"),
        "php" => Some("php"),
        "shell" => Some("sh"),
        "rust" => Some("rust"),
        "kotlin" => Some("kotlin"),
        "swift" => Some("swift"),
        "scala" => Some("scala"),
        "r" => Some("r"),
        "sql" => Some("sql"),
        "html" => Some("html"),
        "css" => Some("css"),
        "json" => Some("json"),
        "xml" => Some("xml"),
        "yaml" => Some("yaml"),
        "markdown" => Some("md"),
        _ => None,
    }
}

// ─── Output parsing ──────────────────────────────────────

/// Parse ripgrep's JSON-lines output. Matches within the same file and the
/// same `line/10` bucket merge into one chunk: content concatenates, the
/// line range extends, and the scalar score takes the max.
pub fn parse_rg_output(stdout: &[u8], repository_id: &str) -> Vec<CodeChunk> {
    let mut buckets: HashMap<(String, usize), CodeChunk> = HashMap::new();

    for line in String::from_utf8_lossy(stdout).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Ok(parsed) = serde_json::from_str::<RgLine>(line) else {
            continue;
        };
        if parsed.kind != "match" {
            continue;
        }
        let Some(data) = parsed.data else { continue };
        let (Some(path), Some(lines), Some(line_number)) = (
            data.path.and_then(|p| p.text),
            data.lines.and_then(|l| l.text),
            data.line_number,
        ) else {
            continue;
        };
        if path.is_empty() || lines.is_empty() {
            continue;
        }

        let file_path = path.trim_start_matches("./").to_string();
        let content = lines.trim_end_matches('\n').to_string();
        let key = (file_path.clone(), line_number / 10);

        match buckets.entry(key) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.content.push('\n');
                existing.content.push_str(&content);
                if line_number > existing.end_line {
                    existing.end_line = line_number;
                }
                if line_number < existing.start_line {
                    existing.start_line = line_number;
                }
            }
            Entry::Vacant(vacant) => {
                let language = detect_language(&file_path);
                vacant.insert(CodeChunk {
                    repository_id: repository_id.to_string(),
                    file_path,
                    start_line: line_number,
                    end_line: line_number,
                    content,
                    language,
                    // Relevance is post-computed by the merger
                    score: 1.0,
                    source: SearchSource::Lexical,
                });
            }
        }
    }

    buckets.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── query_to_regex ──────────────────────────────────

    #[test]
    fn test_empty_query_is_rejected() {
        assert!(query_to_regex("   ").is_err());
    }

    #[test]
    fn test_single_term_contains_literal_and_partial() {
        let pattern = query_to_regex("login").unwrap();
        assert!(pattern.contains("(?i)login"));
        assert!(pattern.contains(r"\w*login\w*"));
    }

    #[test]
    fn test_short_term_skips_partial_pattern() {
        let pattern = query_to_regex("db").unwrap();
        assert!(!pattern.contains(r"\w*db\w*"));
        // But still picks up the synonym expansion
        assert!(pattern.contains("database"));
    }

    #[test]
    fn test_auth_expands_synonyms() {
        let pattern = query_to_regex("auth").unwrap();
        assert!(pattern.contains("authentication"));
        assert!(pattern.contains("authorization"));
    }

    #[test]
    fn test_terms_are_or_joined() {
        let pattern = query_to_regex("login handler").unwrap();
        assert!(pattern.starts_with('('));
        assert!(pattern.contains('|'));
        assert!(pattern.contains("login"));
        assert!(pattern.contains("handler"));
    }

    #[test]
    fn test_case_variants_for_long_terms() {
        let pattern = query_to_regex("auth").unwrap();
        assert!(pattern.contains(r"Auth[A-Z]\w*"));
        assert!(pattern.contains(r"\w*_?auth_?\w*"));
    }

    #[test]
    fn test_regex_metacharacters_are_escaped() {
        let pattern = query_to_regex("a.b*c").unwrap();
        assert!(pattern.contains(r"a\.b\*c"));
        // Compiled pattern must be valid
        assert!(regex::Regex::new(&pattern).is_ok());
    }

    #[test]
    fn test_generated_patterns_compile() {
        for query in ["auth", "database handler", "how does the api serve requests"] {
            let pattern = query_to_regex(query).unwrap();
            assert!(regex::Regex::new(&pattern).is_ok(), "invalid: {pattern}");
        }
    }

    // ─── build_rg_args ───────────────────────────────────

    #[test]
    fn test_base_args() {
        let args = build_rg_args("auth", &SearchFilters::default(), 1000).unwrap();
        assert!(args.contains(&"--json".to_string()));
        assert!(args.contains(&"--smart-case".to_string()));
        assert!(args.contains(&"--max-count".to_string()));
        assert!(args.contains(&"1000".to_string()));
        // Context of 2 lines either side
        let ctx = args.iter().position(|a| a == "--context").unwrap();
        assert_eq!(args[ctx + 1], "2");
    }

    #[test]
    fn test_language_filter_maps_to_type() {
        let filters = SearchFilters {
            languages: vec!["typescript".into(), "klingon".into()],
            ..Default::default()
        };
        let args = build_rg_args("auth", &filters, 1000).unwrap();
        let type_idx = args.iter().position(|a| a == "--type").unwrap();
        assert_eq!(args[type_idx + 1], "ts");
        // Unknown language contributes no --type flag
        assert_eq!(args.iter().filter(|a| *a == "--type").count(), 1);
    }

    #[test]
    fn test_path_prefix_becomes_glob() {
        let filters = SearchFilters {
            path_prefix: Some("src/api".into()),
            ..Default::default()
        };
        let args = build_rg_args("auth", &filters, 1000).unwrap();
        assert!(args.contains(&"src/api*".to_string()));
    }

    // ─── parse_rg_output ─────────────────────────────────

    fn rg_match(path: &str, line_number: usize, text: &str) -> String {
        serde_json::json!({
            "type": "match",
            "data": {
                "path": {"text": path},
                "lines": {"text": format!("{text}\n")},
                "line_number": line_number,
                "absolute_offset": 0,
                "submatches": []
            }
        })
        .to_string()
    }

    #[test]
    fn test_parse_single_match() {
        let out = rg_match("./auth.go", 12, "func Login() {");
        let chunks = parse_rg_output(out.as_bytes(), "repo-1");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].file_path, "auth.go");
        assert_eq!(chunks[0].start_line, 12);
        assert_eq!(chunks[0].end_line, 12);
        assert_eq!(chunks[0].content, "func Login() {");
        assert_eq!(chunks[0].language, "go");
        assert_eq!(chunks[0].source, SearchSource::Lexical);
    }

    #[test]
    fn test_nearby_matches_merge_into_one_bucket() {
        // Lines 12 and 15 share the line/10 == 1 bucket
        let out = format!(
            "{}\n{}",
            rg_match("auth.go", 12, "func Login() {"),
            rg_match("auth.go", 15, "  return token")
        );
        let chunks = parse_rg_output(out.as_bytes(), "repo-1");

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 12);
        assert_eq!(chunks[0].end_line, 15);
        assert!(chunks[0].content.contains("func Login() {"));
        assert!(chunks[0].content.contains("return token"));
    }

    #[test]
    fn test_distant_matches_stay_separate() {
        let out = format!(
            "{}\n{}",
            rg_match("auth.go", 12, "func Login() {"),
            rg_match("auth.go", 95, "func Logout() {")
        );
        let chunks = parse_rg_output(out.as_bytes(), "repo-1");
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn test_non_match_lines_are_skipped() {
        let out = format!(
            "{}\n{}\n{}",
            serde_json::json!({"type": "begin", "data": {"path": {"text": "auth.go"}}}),
            rg_match("auth.go", 12, "func Login() {"),
            serde_json::json!({"type": "end", "data": {"path": {"text": "auth.go"}}}),
        );
        let chunks = parse_rg_output(out.as_bytes(), "repo-1");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_invalid_json_lines_are_skipped() {
        let out = format!("not json at all\n{}", rg_match("a.rs", 3, "fn main() {}"));
        let chunks = parse_rg_output(out.as_bytes(), "repo-1");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_empty_output_is_empty() {
        assert!(parse_rg_output(b"", "repo-1").is_empty());
    }
}
