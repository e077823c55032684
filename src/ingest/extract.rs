//! Repository extraction: materialize a working tree from a git URL or an
//! uploaded archive, then scan it into a classified file manifest.

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::models::{FileRecord, LanguageStats, RepoSource, RepoStats};

/// Everything the pipeline needs from a materialized working tree.
#[derive(Debug)]
pub struct ExtractResult {
    pub repository_path: PathBuf,
    /// Commit SHA for git sources, deterministic content fingerprint for
    /// archives.
    pub content_hash: String,
    pub files: Vec<FileRecord>,
    pub stats: RepoStats,
}

/// Materialize `source` into `target` and scan the result.
///
/// The extractor never partially succeeds: on error the target directory is
/// considered tainted and the caller fails the job.
pub fn extract_repository(
    source: &RepoSource,
    staging_dir: &Path,
    target: &Path,
) -> Result<ExtractResult> {
    std::fs::create_dir_all(target)
        .map_err(|e| Error::ExtractFailed(format!("failed to create target directory: {e}")))?;

    let content_hash = match source {
        RepoSource::Git { url, git_ref, .. } => clone_git(url, git_ref, target)?,
        RepoSource::Archive { filename, .. } => {
            extract_archive(&staging_dir.join(filename), target)?
        }
    };

    let (files, stats) = scan_directory(target)?;

    Ok(ExtractResult {
        repository_path: target.to_path_buf(),
        content_hash,
        files,
        stats,
    })
}

// ─── Git source ──────────────────────────────────────────

/// Shallow-clone `url` at `git_ref` (depth 1) and return the HEAD commit
/// SHA. A failed clone of `main` is retried once against `master`.
pub fn clone_git(url: &str, git_ref: &str, target: &Path) -> Result<String> {
    let git_ref = if git_ref.is_empty() { "main" } else { git_ref };
    tracing::info!(url, git_ref, target = %target.display(), "cloning repository");

    match try_clone(url, git_ref, target) {
        Ok(sha) => Ok(sha),
        Err(err) if git_ref == "main" => {
            let _ = std::fs::remove_dir_all(target);
            std::fs::create_dir_all(target).map_err(|e| {
                Error::ExtractFailed(format!("failed to reset target directory: {e}"))
            })?;
            tracing::warn!(url, "clone of 'main' failed, retrying with 'master'");
            try_clone(url, "master", target).map_err(|_| err)
        }
        Err(err) => Err(err),
    }
}

fn try_clone(url: &str, git_ref: &str, target: &Path) -> Result<String> {
    let mut fetch = git2::FetchOptions::new();
    fetch.depth(1);

    let repo = git2::build::RepoBuilder::new()
        .branch(git_ref)
        .fetch_options(fetch)
        .clone(url, target)
        .map_err(|e| Error::SourceUnreachable(format!("failed to clone {url}: {e}")))?;

    let commit = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .map_err(|e| Error::ExtractFailed(format!("failed to resolve HEAD commit: {e}")))?;

    Ok(commit.id().to_string())
}

// ─── Archive source ──────────────────────────────────────

/// Extract an uploaded archive into `target` and return a deterministic
/// fingerprint over the extracted entries. Symlinks are never extracted.
pub fn extract_archive(archive_path: &Path, target: &Path) -> Result<String> {
    let filename = archive_path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();

    if filename.ends_with(".zip") {
        extract_zip(archive_path, target)?;
    } else if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        let file = open_archive(archive_path)?;
        extract_tar(flate2::read::GzDecoder::new(file), target)?;
    } else if filename.ends_with(".tar") {
        let file = open_archive(archive_path)?;
        extract_tar(file, target)?;
    } else {
        return Err(Error::InvalidArgument(format!(
            "unsupported archive format: {filename}"
        )));
    }

    directory_fingerprint(target)
}

fn open_archive(path: &Path) -> Result<std::fs::File> {
    std::fs::File::open(path)
        .map_err(|e| Error::SourceUnreachable(format!("failed to open {}: {e}", path.display())))
}

fn extract_zip(archive_path: &Path, target: &Path) -> Result<()> {
    let file = open_archive(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::ExtractFailed(format!("invalid zip archive: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::ExtractFailed(format!("corrupt zip entry: {e}")))?;

        // enclosed_name rejects paths escaping the target directory
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let path = target.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&path)
                .map_err(|e| Error::ExtractFailed(e.to_string()))?;
            continue;
        }

        // Symlinks are stored as regular entries with a link mode; skip them
        if let Some(mode) = entry.unix_mode() {
            if mode & 0o170000 == 0o120000 {
                continue;
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::ExtractFailed(e.to_string()))?;
        }
        let mut out =
            std::fs::File::create(&path).map_err(|e| Error::ExtractFailed(e.to_string()))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| Error::ExtractFailed(e.to_string()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o777));
        }
    }

    Ok(())
}

fn extract_tar<R: Read>(reader: R, target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| Error::ExtractFailed(format!("invalid tar archive: {e}")))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| Error::ExtractFailed(format!("corrupt tar entry: {e}")))?;
        let rel = entry
            .path()
            .map_err(|e| Error::ExtractFailed(e.to_string()))?
            .into_owned();

        if rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            continue;
        }
        let path = target.join(&rel);

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&path)
                    .map_err(|e| Error::ExtractFailed(e.to_string()))?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::ExtractFailed(e.to_string()))?;
                }
                // unpack preserves the POSIX mode from the header
                entry
                    .unpack(&path)
                    .map_err(|e| Error::ExtractFailed(e.to_string()))?;
            }
            // Symlinks, hardlinks, and specials are not extracted
            _ => continue,
        }
    }

    Ok(())
}

/// Deterministic 16-hex fingerprint over `(relative_path, mtime, size)` of
/// every extracted entry. Stands in for a commit hash on archive sources.
pub fn directory_fingerprint(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::ExtractFailed(e.to_string()))?;
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());

        if entry.file_type().is_file() {
            let meta = entry
                .metadata()
                .map_err(|e| Error::ExtractFailed(e.to_string()))?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            hasher.update(mtime.to_string().as_bytes());
            hasher.update(meta.len().to_string().as_bytes());
        }
    }

    Ok(format!("{:x}", hasher.finalize())[..16].to_string())
}

// ─── Scanner ─────────────────────────────────────────────

fn builtin_excludes() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\.git/",
            r"node_modules/",
            r"vendor/",
            r"\.DS_Store",
            r"\.(exe|dll|so|dylib|bin)$",
            r"\.(jpg|jpeg|png|gif|bmp|ico|svg)$",
            r"\.(pdf|doc|docx|xls|xlsx|ppt|pptx)$",
            r"\.(zip|tar|gz|rar|7z)$",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// Walk `dir`, classify every surviving file, and accumulate repository
/// statistics. Binary files are dropped from the manifest.
pub fn scan_directory(dir: &Path) -> Result<(Vec<FileRecord>, RepoStats)> {
    let mut files = Vec::new();
    let mut stats = RepoStats::default();
    let mut language_stats: std::collections::HashMap<String, LanguageStats> =
        std::collections::HashMap::new();

    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| Error::ExtractFailed(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();

        if builtin_excludes().iter().any(|p| p.is_match(&rel)) {
            continue;
        }

        let (is_text, is_binary) = detect_file_type(entry.path());
        if is_binary {
            continue;
        }

        let meta = entry
            .metadata()
            .map_err(|e| Error::ExtractFailed(e.to_string()))?;
        let language = detect_language(&rel);
        let line_count = if is_text {
            count_lines(entry.path()).unwrap_or(0)
        } else {
            0
        };
        let modified_at: DateTime<Utc> = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        stats.total_files += 1;
        stats.total_lines += line_count;
        stats.size_bytes += meta.len();
        let lang_entry = language_stats
            .entry(language.clone())
            .or_insert_with(|| LanguageStats {
                language: language.clone(),
                file_count: 0,
                line_count: 0,
            });
        lang_entry.file_count += 1;
        lang_entry.line_count += line_count;

        files.push(FileRecord {
            path: rel,
            size: meta.len(),
            language,
            is_text,
            is_binary,
            line_count,
            modified_at,
        });
    }

    let mut languages: Vec<LanguageStats> = language_stats.into_values().collect();
    languages.sort_by(|a, b| b.file_count.cmp(&a.file_count));
    stats.languages = languages;

    Ok((files, stats))
}

/// Classify a file as text or binary.
///
/// Fast path: extension or basename whitelist. Slow path: sniff the first
/// 512 bytes; valid UTF-8 with a null-byte ratio at or below 30% is text.
/// Empty files are text.
pub fn detect_file_type(path: &Path) -> (bool, bool) {
    const TEXT_EXTENSIONS: &[&str] = &[
        "txt", "md", "json", "js", "ts", "jsx", "tsx", "py", "go", "java", "c", "cpp", "h", "hpp",
        "css", "html", "xml", "yml", "yaml", "toml", "sh", "bash", "sql", "php", "rb", "rs", "env",
        "gitignore", "gitattributes",
    ];
    const TEXT_BASENAMES: &[&str] = &[
        "README",
        "LICENSE",
        "CHANGELOG",
        "Makefile",
        "Dockerfile",
        ".gitignore",
        ".dockerignore",
    ];

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let basename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_default();

    if TEXT_EXTENSIONS.contains(&ext.as_str()) || TEXT_BASENAMES.contains(&basename.as_str()) {
        return (true, false);
    }

    let Ok(mut file) = std::fs::File::open(path) else {
        return (false, true);
    };
    let mut buffer = [0u8; 512];
    let n = match file.read(&mut buffer) {
        Ok(n) => n,
        Err(_) => return (false, true),
    };

    if n == 0 {
        return (true, false);
    }

    let sample = &buffer[..n];
    let utf8_valid = match std::str::from_utf8(sample) {
        Ok(_) => true,
        // A multi-byte sequence cut off by the 512-byte window is fine
        Err(e) => e.error_len().is_none(),
    };
    if !utf8_valid {
        return (false, true);
    }

    let null_count = sample.iter().filter(|&&b| b == 0).count();
    if null_count as f64 / n as f64 > 0.3 {
        return (false, true);
    }

    (true, false)
}

fn count_lines(path: &Path) -> Result<usize> {
    use std::io::BufRead;
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    Ok(reader.lines().map_while(|l| l.ok()).count())
}

/// Extension-driven language table. Detection is purely lexical.
pub fn detect_language(path: &str) -> String {
    let ext = Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "go" => "go",
        "js" => "javascript",
        "ts" => "typescript",
        "py" => "python",
        "java" => "java",
        "cpp" => "cpp",
        "c" | "h" => "c",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "sh" => "shell",
        "rs" => "rust",
        "kt" => "kotlin",
        "swift" => "swift",
        "scala" => "scala",
        "r" => "r",
        "sql" => "sql",
        "html" => "html",
        "css" => "css",
        "scss" => "scss",
        "less" => "less",
        "json" => "json",
        "xml" => "xml",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "txt" => "text",
        _ => "unknown",
    }
    .to_string()
}
