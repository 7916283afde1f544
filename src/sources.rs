//! Source enumeration and file/URL reading.
//!
//! Expands the configured source descriptors (directories, single files,
//! URLs) into concrete source ids, reads their bodies with a size cap, and
//! provides the related-file heuristic used by the context assembler.
//!
//! Missing files are a non-fatal "skip" signal; oversized files are skipped
//! with a log line.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{Settings, SourceDescriptor};
use crate::models::strip_url_query_and_fragment;

/// One expanded source: a file path or a URL, plus (optionally) its body.
#[derive(Debug, Clone)]
pub struct CollectedSource {
    pub is_url: bool,
    /// File path, or URL with query/fragment stripped.
    pub source_id: String,
    /// Body text; empty for files (read later) and for URLs unless
    /// `include_url_bodies` was set.
    pub content: String,
}

pub struct SourceProcessor {
    settings: Settings,
}

impl SourceProcessor {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Swap in freshly re-read settings (the `update` path re-reads the
    /// settings file before collecting sources).
    pub fn set_settings(&mut self, settings: Settings) {
        self.settings = settings;
    }

    /// Expand all configured source descriptors.
    ///
    /// Directory entries are walked (respecting `recursive`), filtered by
    /// the extension allow-list and exclude globs, and returned in sorted
    /// order for determinism. URL bodies are fetched only when
    /// `include_url_bodies` is set.
    pub async fn collect_sources(&self, include_url_bodies: bool) -> Result<Vec<CollectedSource>> {
        let mut sources = Vec::new();

        for descriptor in &self.settings.source.paths {
            match descriptor {
                SourceDescriptor::Directory {
                    path,
                    recursive,
                    extensions,
                    exclude,
                } => {
                    self.collect_directory(path, *recursive, extensions, exclude, &mut sources)?;
                }
                SourceDescriptor::File { path } => {
                    if Path::new(path).exists() {
                        sources.push(CollectedSource {
                            is_url: false,
                            source_id: path.clone(),
                            content: String::new(),
                        });
                    } else {
                        warn!(path = %path, "Configured file not found, skipped");
                    }
                }
                SourceDescriptor::Url {
                    url,
                    headers,
                    timeout_ms,
                } => {
                    let source_id = strip_url_query_and_fragment(url).to_string();
                    let content = if include_url_bodies {
                        match fetch_url(url, headers, *timeout_ms).await {
                            Ok(body) => body,
                            Err(e) => {
                                warn!(url = %url, error = %e, "URL fetch failed, skipped");
                                continue;
                            }
                        }
                    } else {
                        String::new()
                    };
                    sources.push(CollectedSource {
                        is_url: true,
                        source_id,
                        content,
                    });
                }
            }
        }

        Ok(sources)
    }

    fn collect_directory(
        &self,
        root: &str,
        recursive: bool,
        extensions: &[String],
        exclude: &[String],
        out: &mut Vec<CollectedSource>,
    ) -> Result<()> {
        let root_path = Path::new(root);
        if !root_path.exists() {
            warn!(root, "Configured directory not found, skipped");
            return Ok(());
        }

        let allowed: Vec<String> = if extensions.is_empty() {
            self.settings.source.default_extensions.clone()
        } else {
            extensions.to_vec()
        };

        let mut patterns: Vec<String> = exclude.to_vec();
        patterns.extend(self.settings.source.global_exclude.iter().cloned());
        let exclude_set = build_globset(&patterns)?;

        let mut found = Vec::new();
        let walker = if recursive {
            WalkDir::new(root_path)
        } else {
            WalkDir::new(root_path).max_depth(1)
        };
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let path_str = path.to_string_lossy();
            let relative = path.strip_prefix(root_path).unwrap_or(path);

            if exclude_set.is_match(relative) || exclude_set.is_match(path) {
                continue;
            }
            if !has_allowed_extension(path, &allowed) {
                continue;
            }
            found.push(path_str.into_owned());
        }

        found.sort();
        out.extend(found.into_iter().map(|p| CollectedSource {
            is_url: false,
            source_id: p,
            content: String::new(),
        }));
        Ok(())
    }

    /// Read a source body by id: a file read with size cap, or a URL
    /// refetch with the descriptor's headers and timeout.
    pub async fn fetch_source(&self, source_id: &str) -> Result<String> {
        if source_id.starts_with("http://") || source_id.starts_with("https://") {
            for descriptor in &self.settings.source.paths {
                if let SourceDescriptor::Url {
                    url,
                    headers,
                    timeout_ms,
                } = descriptor
                {
                    if strip_url_query_and_fragment(url) == source_id {
                        return fetch_url(url, headers, *timeout_ms).await;
                    }
                }
            }
            // Not in config anymore; fetch with defaults.
            return fetch_url(source_id, &Default::default(), 10_000).await;
        }

        let mut content = String::new();
        self.read_file(source_id, &mut content)?;
        Ok(content)
    }

    /// Read a file into `out`. Empty files yield empty content; files over
    /// `source.max_file_size_mb` are an error the caller treats as a skip.
    pub fn read_file(&self, path: &str, out: &mut String) -> Result<()> {
        out.clear();
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat file: {}", path))?;
        let cap = self.settings.source.max_file_size_mb * 1024 * 1024;
        if metadata.len() > cap {
            bail!(
                "File {} exceeds max_file_size_mb ({} > {} bytes)",
                path,
                metadata.len(),
                cap
            );
        }
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read file: {}", path))?;
        *out = String::from_utf8_lossy(&bytes).into_owned();
        Ok(())
    }

    /// Deterministic subset of `candidates` considered related to `target`,
    /// excluding `target` itself.
    ///
    /// A candidate is related when it shares the target's file stem and
    /// either pairs by extension (header ↔ implementation, `.ts` ↔ `.js`),
    /// sits in the same directory, or sits in a sibling `include`/`src`
    /// style directory. Capped at `generation.max_related_per_source`.
    pub fn filter_related_sources(&self, candidates: &[String], target: &str) -> Vec<String> {
        let target_path = Path::new(target);
        let Some(target_stem) = file_stem_lower(target_path) else {
            return Vec::new();
        };
        let target_ext = ext_lower(target_path);
        let target_dir = target_path.parent().map(normalized_dir);

        let mut related = BTreeSet::new();
        for candidate in candidates {
            if candidate == target {
                continue;
            }
            let cand_path = Path::new(candidate);
            let Some(cand_stem) = file_stem_lower(cand_path) else {
                continue;
            };
            if cand_stem != target_stem {
                continue;
            }
            let cand_ext = ext_lower(cand_path);
            let cand_dir = cand_path.parent().map(normalized_dir);

            let paired = paired_extensions(&target_ext, &cand_ext);
            let same_dir = target_dir.is_some() && target_dir == cand_dir;
            let sibling = matches!((&target_dir, &cand_dir), (Some(a), Some(b))
                if sibling_source_dirs(a, b));

            if paired || same_dir || sibling {
                related.insert(candidate.clone());
            }
        }

        let mut result: Vec<String> = related.into_iter().collect();
        result.truncate(self.settings.generation.max_related_per_source);
        debug!(source = %target, count = result.len(), "Related sources resolved");
        result
    }
}

async fn fetch_url(
    url: &str,
    headers: &std::collections::HashMap<String, String>,
    timeout_ms: u64,
) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()?;
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to fetch URL: {}", url))?;
    if !response.status().is_success() {
        bail!("URL {} returned status {}", url, response.status());
    }
    Ok(response.text().await?)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .with_context(|| format!("Invalid exclude pattern: {}", pattern))?,
        );
    }
    Ok(builder.build()?)
}

fn has_allowed_extension(path: &Path, allowed: &[String]) -> bool {
    let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
        return false;
    };
    allowed
        .iter()
        .any(|a| a.trim_start_matches('.').to_lowercase() == ext)
}

fn file_stem_lower(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().to_lowercase())
}

fn ext_lower(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn normalized_dir(dir: &Path) -> String {
    dir.to_string_lossy().replace('\\', "/")
}

const HEADER_EXTS: &[&str] = &["h", "hh", "hpp", "hxx"];
const IMPL_EXTS: &[&str] = &["c", "cc", "cpp", "cxx", "m", "mm"];

fn paired_extensions(a: &str, b: &str) -> bool {
    let header_impl = (HEADER_EXTS.contains(&a) && IMPL_EXTS.contains(&b))
        || (IMPL_EXTS.contains(&a) && HEADER_EXTS.contains(&b));
    let script_pair = matches!(
        (a, b),
        ("ts", "js") | ("js", "ts") | ("tsx", "jsx") | ("jsx", "tsx")
    );
    header_impl || script_pair
}

/// `include/foo.h` and `src/foo.c` style siblings: same grandparent, both
/// directory names from the conventional source-layout family.
fn sibling_source_dirs(a: &str, b: &str) -> bool {
    const FAMILY: &[&str] = &["include", "inc", "src", "source", "lib"];
    let leaf = |d: &str| d.rsplit('/').next().unwrap_or(d).to_lowercase();
    let parent = |d: &str| d.rsplit_once('/').map(|(p, _)| p.to_string()).unwrap_or_default();
    a != b
        && FAMILY.contains(&leaf(a).as_str())
        && FAMILY.contains(&leaf(b).as_str())
        && parent(a) == parent(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use std::io::Write;

    fn settings_with_dir(dir: &Path, extensions: Vec<String>) -> Settings {
        let mut settings = Settings::default();
        settings.source.paths = vec![SourceDescriptor::Directory {
            path: dir.to_string_lossy().into_owned(),
            recursive: true,
            extensions,
            exclude: vec![],
        }];
        settings
    }

    fn write_file(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn collects_directory_filtered_and_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "b.rs", "fn b() {}");
        write_file(tmp.path(), "a.rs", "fn a() {}");
        write_file(tmp.path(), "notes.txt", "skip me");

        let settings = settings_with_dir(tmp.path(), vec![".rs".to_string()]);
        let processor = SourceProcessor::new(settings);
        let sources = processor.collect_sources(false).await.unwrap();

        assert_eq!(sources.len(), 2);
        assert!(sources[0].source_id.ends_with("a.rs"));
        assert!(sources[1].source_id.ends_with("b.rs"));
        assert!(!sources[0].is_url);
    }

    #[tokio::test]
    async fn exclude_patterns_apply() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "keep.rs", "fn k() {}");
        write_file(tmp.path(), "gen/skip.rs", "fn s() {}");

        let mut settings = settings_with_dir(tmp.path(), vec![".rs".to_string()]);
        settings.source.paths = vec![SourceDescriptor::Directory {
            path: tmp.path().to_string_lossy().into_owned(),
            recursive: true,
            extensions: vec![".rs".to_string()],
            exclude: vec!["gen/**".to_string()],
        }];
        let processor = SourceProcessor::new(settings);
        let sources = processor.collect_sources(false).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert!(sources[0].source_id.ends_with("keep.rs"));
    }

    #[tokio::test]
    async fn missing_directory_is_skipped() {
        let mut settings = Settings::default();
        settings.source.paths = vec![SourceDescriptor::Directory {
            path: "/definitely/not/here".to_string(),
            recursive: true,
            extensions: vec![],
            exclude: vec![],
        }];
        let processor = SourceProcessor::new(settings);
        let sources = processor.collect_sources(false).await.unwrap();
        assert!(sources.is_empty());
    }

    #[test]
    fn read_file_caps_size() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "big.txt", &"x".repeat(2048));

        let mut settings = Settings::default();
        settings.source.max_file_size_mb = 0;
        let processor = SourceProcessor::new(settings);
        let mut out = String::new();
        let err = processor.read_file(tmp.path().join("big.txt").to_str().unwrap(), &mut out);
        assert!(err.is_err());
    }

    #[test]
    fn read_empty_file_yields_empty_content() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "empty.md", "");
        let processor = SourceProcessor::new(Settings::default());
        let mut out = String::new();
        processor
            .read_file(tmp.path().join("empty.md").to_str().unwrap(), &mut out)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn related_sources_contract() {
        let processor = SourceProcessor::new(Settings::default());
        let candidates = vec![
            "src/widget.cpp".to_string(),
            "include/widget.h".to_string(),
            "src/other.cpp".to_string(),
            "docs/widget.md".to_string(),
        ];

        let related = processor.filter_related_sources(&candidates, "src/widget.cpp");
        // Deterministic subset excluding the target itself.
        assert!(!related.contains(&"src/widget.cpp".to_string()));
        assert!(related.iter().all(|r| candidates.contains(r)));
        assert!(related.contains(&"include/widget.h".to_string()));
        assert!(!related.contains(&"src/other.cpp".to_string()));

        let again = processor.filter_related_sources(&candidates, "src/widget.cpp");
        assert_eq!(related, again);
    }

    #[test]
    fn related_sources_capped() {
        let mut settings = Settings::default();
        settings.generation.max_related_per_source = 1;
        let processor = SourceProcessor::new(settings);
        let candidates = vec![
            "a/mod.h".to_string(),
            "a/mod.hpp".to_string(),
            "a/mod.cc".to_string(),
        ];
        let related = processor.filter_related_sources(&candidates, "a/mod.cpp");
        assert_eq!(related.len(), 1);
    }

    #[test]
    fn paired_extension_table() {
        assert!(paired_extensions("h", "cpp"));
        assert!(paired_extensions("cc", "hpp"));
        assert!(paired_extensions("ts", "js"));
        assert!(!paired_extensions("rs", "rs"));
        assert!(!paired_extensions("md", "cpp"));
    }
}
