//! Line-window source chunker.
//!
//! Walks an extracted snapshot depth-first and splits every allowed file into
//! overlapping windows of `window_lines` lines (start advances by
//! `window_lines - overlap_lines`). Any window whose text exceeds
//! `max_chunk_chars` is re-split on line boundaries, seeding each piece with
//! a few trailing lines of the previous one so that context survives the
//! cut.
//!
//! Files are skipped (and reported, never fatal) when their extension is not
//! allow-listed, they exceed the per-file size cap, match an exclude glob,
//! are not valid UTF-8, or cannot be read (including directories the walk
//! cannot enter). The number of chunks per repository is unbounded.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Why a file was left out of the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Extension,
    TooLarge(u64),
    Excluded,
    NotText,
    Unreadable(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Extension => write!(f, "extension not allowed"),
            SkipReason::TooLarge(size) => write!(f, "file too large ({} bytes)", size),
            SkipReason::Excluded => write!(f, "matched exclude glob"),
            SkipReason::NotText => write!(f, "not valid UTF-8 text"),
            SkipReason::Unreadable(e) => write!(f, "unreadable: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: String,
    pub reason: SkipReason,
}

/// Output of chunking one snapshot.
#[derive(Debug, Default)]
pub struct ChunkReport {
    pub chunks: Vec<Chunk>,
    /// Files that produced at least one chunk.
    pub files_indexed: usize,
    pub skipped: Vec<SkippedFile>,
}

impl ChunkReport {
    pub fn total_chars(&self) -> u64 {
        self.chunks
            .iter()
            .map(|c| c.content.chars().count() as u64)
            .sum()
    }
}

/// Chunk every eligible file under `root`.
pub fn chunk_tree(root: &Path, config: &ChunkingConfig) -> Result<ChunkReport> {
    let ignored: HashSet<&str> = config.ignored_dirs.iter().map(String::as_str).collect();
    let allowed: HashSet<String> = config
        .extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
        .collect();
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut report = ChunkReport::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e.file_type().is_dir()
                || !ignored.contains(e.file_name().to_string_lossy().as_ref())
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // An unreadable root means there is no snapshot to index.
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| relative_path(root, p))
                    .unwrap_or_default();
                report.skipped.push(SkippedFile {
                    path,
                    reason: SkipReason::Unreadable(e.to_string()),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let rel_str = relative_path(root, path);

        let skip = |reason: SkipReason| SkippedFile {
            path: rel_str.clone(),
            reason,
        };

        let extension = file_extension(path);
        if !allowed.contains(&extension) {
            report.skipped.push(skip(SkipReason::Extension));
            continue;
        }
        if exclude_set.is_match(&rel_str) {
            report.skipped.push(skip(SkipReason::Excluded));
            continue;
        }

        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                report.skipped.push(skip(SkipReason::Unreadable(e.to_string())));
                continue;
            }
        };
        if size > config.max_file_bytes {
            report.skipped.push(skip(SkipReason::TooLarge(size)));
            continue;
        }

        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                report.skipped.push(skip(SkipReason::Unreadable(e.to_string())));
                continue;
            }
        };
        let text = match String::from_utf8(bytes) {
            Ok(t) => t,
            Err(_) => {
                report.skipped.push(skip(SkipReason::NotText));
                continue;
            }
        };

        let chunks = chunk_file(&rel_str, &text, language_for_extension(&extension), config);
        if !chunks.is_empty() {
            report.files_indexed += 1;
            report.chunks.extend(chunks);
        }
    }

    for s in &report.skipped {
        debug!(path = %s.path, reason = %s.reason, "file skipped");
    }

    Ok(report)
}

/// `/`-separated path of `path` relative to `root`.
fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Split one file's text into overlapping line windows.
pub fn chunk_file(file_path: &str, text: &str, language: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let window = config.window_lines.max(1);
    let step = window.saturating_sub(config.overlap_lines).max(1);
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = (start + window).min(lines.len());
        let slice = &lines[start..end];
        let content = slice.join("\n");

        if !content.trim().is_empty() {
            if content.chars().count() > config.max_chunk_chars {
                for (s, e, piece) in split_oversized(
                    slice,
                    config.max_chunk_chars,
                    config.split_seed_lines,
                ) {
                    chunks.push(make_chunk(file_path, start + s + 1, start + e + 1, piece, language));
                }
            } else {
                chunks.push(make_chunk(file_path, start + 1, end, content, language));
            }
        }

        if end == lines.len() {
            break;
        }
        start += step;
    }

    chunks
}

/// Re-split an oversized window on line boundaries.
///
/// Returns `(first, last, text)` with 0-based line offsets into `lines`.
/// A single line longer than `max_chars` is cut into `max_chars` pieces
/// that all report that line.
fn split_oversized(lines: &[&str], max_chars: usize, seed_lines: usize) -> Vec<(usize, usize, String)> {
    let max_chars = max_chars.max(1);
    let lens: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();
    let joined_len = |idx: &[usize]| -> usize {
        idx.iter().map(|&i| lens[i]).sum::<usize>() + idx.len().saturating_sub(1)
    };

    let mut out: Vec<(usize, usize, String)> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    // Highest line offset already emitted; seed lines never form a piece alone.
    let mut emitted_through: Option<usize> = None;

    let flush = |current: &[usize], emitted: &mut Option<usize>, out: &mut Vec<(usize, usize, String)>| {
        let (Some(&first), Some(&last)) = (current.first(), current.last()) else {
            return;
        };
        if emitted.is_some_and(|e| last <= e) {
            return;
        }
        let text = current.iter().map(|&i| lines[i]).collect::<Vec<_>>().join("\n");
        if !text.trim().is_empty() {
            out.push((first, last, text));
        }
        *emitted = Some(last);
    };

    for i in 0..lines.len() {
        if lens[i] > max_chars {
            flush(&current, &mut emitted_through, &mut out);
            current.clear();
            let chars: Vec<char> = lines[i].chars().collect();
            for piece in chars.chunks(max_chars) {
                let text: String = piece.iter().collect();
                if !text.trim().is_empty() {
                    out.push((i, i, text));
                }
            }
            emitted_through = Some(i);
            continue;
        }

        let with_line = if current.is_empty() {
            lens[i]
        } else {
            joined_len(&current) + 1 + lens[i]
        };

        if with_line > max_chars {
            flush(&current, &mut emitted_through, &mut out);
            let keep_from = current.len().saturating_sub(seed_lines);
            let mut seeded: Vec<usize> = current[keep_from..].to_vec();
            while !seeded.is_empty() && joined_len(&seeded) + 1 + lens[i] > max_chars {
                seeded.remove(0);
            }
            current = seeded;
        }
        current.push(i);
    }
    flush(&current, &mut emitted_through, &mut out);

    out
}

fn make_chunk(file_path: &str, start_line: usize, end_line: usize, content: String, language: &str) -> Chunk {
    Chunk {
        file_path: file_path.to_string(),
        start_line,
        end_line,
        content,
        language: language.to_string(),
    }
}

fn file_extension(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if name == "dockerfile" {
        return name;
    }
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Language name for a lowercase extension; `"unknown"` when unmapped.
pub fn language_for_extension(ext: &str) -> &'static str {
    match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "scala" => "scala",
        "rb" => "ruby",
        "php" => "php",
        "cs" => "csharp",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "swift" => "swift",
        "m" | "mm" => "objective-c",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        "html" => "html",
        "css" | "scss" => "css",
        "vue" => "vue",
        "svelte" => "svelte",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        "graphql" => "graphql",
        "proto" => "protobuf",
        "ex" | "exs" => "elixir",
        "erl" => "erlang",
        "hs" => "haskell",
        "lua" => "lua",
        "dart" => "dart",
        "r" => "r",
        "tf" => "terraform",
        "gradle" => "groovy",
        "dockerfile" => "dockerfile",
        _ => "unknown",
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
