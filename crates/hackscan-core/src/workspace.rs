//! Read-only queries over a checked-out repository
//!
//! Backs the analyzer tools and the planner's route scan. Every path handed
//! in is relative to the checkout root; anything that escapes the root is
//! rejected with `RepositoryError::InvalidPath`.

use crate::error::RepositoryError;
use crate::types::RepositoryStats;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Directories never worth reading: VCS metadata, vendored deps, build output
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    "__pycache__",
    ".venv",
    "venv",
    "vendor",
];

/// Files larger than this are not searched
const MAX_SEARCH_FILE_BYTES: u64 = 1024 * 1024;

/// Directory listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub is_dir: bool,
}

/// One matching line from `search_code`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub line: usize,
    pub text: String,
}

/// Manifest kinds we know how to read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    PackageJson,
    Requirements,
    Pyproject,
    GoMod,
    CargoToml,
}

impl ManifestKind {
    fn from_file_name(name: &str) -> Option<Self> {
        match name {
            "package.json" => Some(Self::PackageJson),
            "requirements.txt" => Some(Self::Requirements),
            "pyproject.toml" => Some(Self::Pyproject),
            "go.mod" => Some(Self::GoMod),
            "Cargo.toml" => Some(Self::CargoToml),
            _ => None,
        }
    }
}

/// A parsed dependency manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub path: String,
    pub kind: ManifestKind,
    pub dependencies: Vec<String>,
    /// Raw script table from `package.json` (name -> command)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<(String, String)>,
}

impl Manifest {
    /// Script command by name (`package.json` only)
    #[must_use]
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, cmd)| cmd.as_str())
    }
}

/// Read-only view of a checkout
#[derive(Debug, Clone)]
pub struct RepoWorkspace {
    root: PathBuf,
}

impl RepoWorkspace {
    /// Workspace rooted at `root`
    #[inline]
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Checkout root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a repository-relative path, refusing escapes
    ///
    /// # Errors
    /// `RepositoryError::InvalidPath` for absolute paths or `..` components
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, RepositoryError> {
        let trimmed = relative.trim().trim_start_matches("./");
        if trimmed.is_empty() || trimmed == "." {
            return Ok(self.root.clone());
        }
        let candidate = Path::new(trimmed);
        let safe = candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(RepositoryError::InvalidPath(relative.to_string()));
        }
        Ok(self.root.join(candidate))
    }

    /// Resolve a path and make sure the file system agrees it stays inside
    /// the checkout
    ///
    /// Symlinks are refused outright, and any symlinked parent directory
    /// that leads out of the root is caught by comparing canonical paths.
    async fn confine(&self, relative: &str, missing: &str) -> Result<PathBuf, RepositoryError> {
        let path = self.resolve(relative)?;
        let outside = || RepositoryError::InvalidPath(format!("{relative}: outside the repository"));
        match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.file_type().is_symlink() => return Err(outside()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::InvalidPath(format!("{relative}: {missing}")));
            }
            Err(e) => return Err(e.into()),
        }
        let root = tokio::fs::canonicalize(&self.root).await?;
        let real = tokio::fs::canonicalize(&path).await?;
        if !real.starts_with(&root) {
            return Err(outside());
        }
        Ok(real)
    }

    /// Read a text file
    ///
    /// # Errors
    /// `InvalidPath` for escapes, symlinks or missing files, `Io` otherwise
    pub async fn read_file(&self, relative: &str) -> Result<String, RepositoryError> {
        let path = self.confine(relative, "no such file").await?;
        let bytes = tokio::fs::read(&path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// List a directory, directories first, names sorted
    ///
    /// Symlinks inside the directory are left out of the listing.
    ///
    /// # Errors
    /// `InvalidPath` for escapes or missing directories
    pub async fn list_dir(&self, relative: &str) -> Result<Vec<ListEntry>, RepositoryError> {
        let path = self.confine(relative, "no such directory").await?;
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|_| RepositoryError::InvalidPath(format!("{relative}: no such directory")))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await?;
            if name == ".git" || file_type.is_symlink() {
                continue;
            }
            entries.push(ListEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    /// Search text files line by line
    ///
    /// An invalid regex is retried as a literal; a pattern too large to
    /// compile either way matches nothing.
    ///
    /// # Errors
    /// `Io` when the walk itself fails
    pub async fn search_code(
        &self,
        pattern: &str,
        max_hits: usize,
    ) -> Result<Vec<SearchHit>, RepositoryError> {
        let Some(regex) = compile_search_pattern(pattern) else {
            return Ok(Vec::new());
        };
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || search_blocking(&root, &regex, max_hits))
            .await
            .map_err(|e| RepositoryError::Io(std::io::Error::other(e)))
    }

    /// Manifests at the root and one directory deep
    ///
    /// # Errors
    /// `Io` when the walk fails; unparsable manifests are skipped
    pub async fn manifests(&self) -> Result<Vec<Manifest>, RepositoryError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || manifests_blocking(&root))
            .await
            .map_err(|e| RepositoryError::Io(std::io::Error::other(e)))
    }

    /// Relative paths of every source file outside skipped directories
    ///
    /// # Errors
    /// `Io` when the blocking walk cannot be joined
    pub async fn source_files(&self) -> Result<Vec<String>, RepositoryError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            walk_files(&root)
                .map(|p| relative_display(&root, &p))
                .collect()
        })
        .await
        .map_err(|e| RepositoryError::Io(std::io::Error::other(e)))
    }

    /// Derive repository statistics
    ///
    /// # Errors
    /// `Io` when the walk fails
    pub async fn stats(&self) -> Result<RepositoryStats, RepositoryError> {
        let manifests = self.manifests().await?;
        let root = self.root.clone();
        let (main_language, file_count, has_tests) =
            tokio::task::spawn_blocking(move || scan_layout(&root))
                .await
                .map_err(|e| RepositoryError::Io(std::io::Error::other(e)))?;

        let dependencies: BTreeSet<String> = manifests
            .into_iter()
            .flat_map(|m| m.dependencies)
            .collect();

        Ok(RepositoryStats {
            main_language,
            file_count,
            has_tests,
            tests_passed: None,
            dependencies: dependencies.into_iter().collect(),
        })
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

fn walk_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(DirEntry::into_path)
}

fn relative_display(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn compile_search_pattern(pattern: &str) -> Option<Regex> {
    let build = |p: &str| RegexBuilder::new(p).size_limit(1 << 20).build();
    build(pattern)
        .or_else(|_| build(&regex::escape(pattern)))
        .ok()
}

fn search_blocking(root: &Path, regex: &Regex, max_hits: usize) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    for path in walk_files(root) {
        let too_big = std::fs::metadata(&path).map_or(true, |m| m.len() > MAX_SEARCH_FILE_BYTES);
        if too_big {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        for (idx, line) in text.lines().enumerate() {
            if regex.is_match(line) {
                hits.push(SearchHit {
                    path: relative_display(root, &path),
                    line: idx + 1,
                    text: line.trim().chars().take(200).collect(),
                });
                if hits.len() >= max_hits {
                    return hits;
                }
            }
        }
    }
    hits
}

fn manifests_blocking(root: &Path) -> Vec<Manifest> {
    let mut manifests: Vec<Manifest> = WalkDir::new(root)
        .max_depth(2)
        .into_iter()
        .filter_entry(|e| !is_skipped(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let kind = ManifestKind::from_file_name(e.file_name().to_str()?)?;
            let raw = std::fs::read_to_string(e.path()).ok()?;
            let (dependencies, scripts) = parse_manifest(kind, &raw)?;
            Some(Manifest {
                path: relative_display(root, e.path()),
                kind,
                dependencies,
                scripts,
            })
        })
        .collect();
    manifests.sort_by(|a, b| {
        let depth = |m: &Manifest| m.path.matches('/').count();
        depth(a).cmp(&depth(b)).then_with(|| a.path.cmp(&b.path))
    });
    manifests
}

type ParsedManifest = (Vec<String>, Vec<(String, String)>);

fn parse_manifest(kind: ManifestKind, raw: &str) -> Option<ParsedManifest> {
    match kind {
        ManifestKind::PackageJson => {
            let value: serde_json::Value = serde_json::from_str(raw).ok()?;
            let keys = |field: &str| {
                value
                    .get(field)
                    .and_then(serde_json::Value::as_object)
                    .map(|o| o.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            };
            let mut deps = keys("dependencies");
            deps.extend(keys("devDependencies"));
            let scripts = value
                .get("scripts")
                .and_then(serde_json::Value::as_object)
                .map(|o| {
                    o.iter()
                        .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            Some((deps, scripts))
        }
        ManifestKind::Requirements => Some((
            raw.lines()
                .map(|l| l.split('#').next().unwrap_or_default().trim())
                .filter(|l| !l.is_empty() && !l.starts_with('-'))
                .filter_map(python_requirement_name)
                .collect(),
            Vec::new(),
        )),
        ManifestKind::Pyproject => {
            let value: toml::Value = toml::from_str(raw).ok()?;
            let mut deps: Vec<String> = value
                .get("project")
                .and_then(|p| p.get("dependencies"))
                .and_then(toml::Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(toml::Value::as_str)
                        .filter_map(python_requirement_name)
                        .collect()
                })
                .unwrap_or_default();
            if let Some(poetry) = value
                .get("tool")
                .and_then(|t| t.get("poetry"))
                .and_then(|p| p.get("dependencies"))
                .and_then(toml::Value::as_table)
            {
                deps.extend(poetry.keys().filter(|k| *k != "python").cloned());
            }
            Some((deps, Vec::new()))
        }
        ManifestKind::GoMod => {
            let mut deps = Vec::new();
            let mut in_block = false;
            for line in raw.lines().map(str::trim) {
                if line.starts_with("require (") {
                    in_block = true;
                } else if in_block && line == ")" {
                    in_block = false;
                } else if in_block {
                    deps.extend(line.split_whitespace().next().map(str::to_string));
                } else if let Some(rest) = line.strip_prefix("require ") {
                    deps.extend(rest.split_whitespace().next().map(str::to_string));
                }
            }
            Some((deps, Vec::new()))
        }
        ManifestKind::CargoToml => {
            let value: toml::Value = toml::from_str(raw).ok()?;
            let deps = ["dependencies", "dev-dependencies"]
                .iter()
                .filter_map(|t| value.get(*t).and_then(toml::Value::as_table))
                .flat_map(|t| t.keys().cloned())
                .collect();
            Some((deps, Vec::new()))
        }
    }
}

fn python_requirement_name(spec: &str) -> Option<String> {
    let name: String = spec
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    (!name.is_empty()).then_some(name)
}

fn language_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "js" | "jsx" | "mjs" | "cjs" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "py" => "Python",
        "go" => "Go",
        "rs" => "Rust",
        "java" | "kt" => "JVM",
        "rb" => "Ruby",
        "php" => "PHP",
        "cs" => "C#",
        "swift" => "Swift",
        "c" | "h" | "cpp" | "cc" | "hpp" => "C/C++",
        _ => return None,
    })
}

fn is_test_path(relative: &str) -> bool {
    let lower = relative.to_ascii_lowercase();
    let mut parts = lower.split('/').collect::<Vec<_>>();
    let file = parts.pop().unwrap_or_default();
    parts
        .iter()
        .any(|d| matches!(*d, "test" | "tests" | "__tests__" | "spec" | "e2e"))
        || file.contains(".test.")
        || file.contains(".spec.")
        || (file.starts_with("test_") && file.ends_with(".py"))
        || file.ends_with("_test.py")
        || file.ends_with("_test.go")
}

fn scan_layout(root: &Path) -> (String, usize, bool) {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    let mut file_count = 0;
    let mut has_tests = false;
    for path in walk_files(root) {
        file_count += 1;
        let relative = relative_display(root, &path);
        has_tests |= is_test_path(&relative);
        if let Some(lang) = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(language_for_extension)
        {
            *counts.entry(lang).or_default() += 1;
        }
    }
    let main_language = counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map_or_else(|| "Unknown".to_string(), |(lang, _)| lang.to_string());
    (main_language, file_count, has_tests)
}
