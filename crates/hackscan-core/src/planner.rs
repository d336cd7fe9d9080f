//! Execution planner
//!
//! Picks the sponsors worth verifying, infers how to install, test and
//! start the project, discovers HTTP routes to probe, and refuses to run
//! projects that look destructive, financial, or dependent on host
//! credentials. A refusal is a plan verdict, not an error.

use crate::error::RepositoryError;
use crate::repository::RepoSnapshot;
use crate::types::{AnalysisResult, RepositoryStats, Sponsor};
use crate::workspace::{Manifest, ManifestKind, RepoWorkspace};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;

/// Most endpoints probed per job
const MAX_ENDPOINTS: usize = 10;

/// Project runtime inferred from manifests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runtime {
    Node,
    Python,
    Go,
    Rust,
    Unknown,
}

impl Runtime {
    fn detect(manifests: &[Manifest], stats: &RepositoryStats) -> Self {
        let root_kind = manifests.first().map(|m| m.kind);
        match root_kind {
            Some(ManifestKind::PackageJson) => Self::Node,
            Some(ManifestKind::Requirements | ManifestKind::Pyproject) => Self::Python,
            Some(ManifestKind::GoMod) => Self::Go,
            Some(ManifestKind::CargoToml) => Self::Rust,
            None => match stats.main_language.as_str() {
                "JavaScript" | "TypeScript" => Self::Node,
                "Python" => Self::Python,
                "Go" => Self::Go,
                "Rust" => Self::Rust,
                _ => Self::Unknown,
            },
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Node => 3000,
            Self::Python => 8000,
            Self::Go | Self::Rust | Self::Unknown => 8080,
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Node => "node",
            Self::Python => "python",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Unknown => "unknown",
        })
    }
}

/// One HTTP probe
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointProbe {
    pub method: String,
    pub path: String,
    pub body: Option<Value>,
    /// Statuses counted as success
    pub accept: Range<u16>,
    /// Sponsors whose evidence files declare this route
    pub sponsors: Vec<Sponsor>,
    /// File declaring the route
    pub source: String,
}

impl EndpointProbe {
    fn new(method: &str, path: &str, source: &str) -> Self {
        let method = method.to_ascii_uppercase();
        let body = matches!(method.as_str(), "POST" | "PUT" | "PATCH")
            .then(|| json!({ "message": "Hello from hackscan" }));
        Self {
            method,
            path: path.to_string(),
            body,
            accept: 200..400,
            sponsors: Vec::new(),
            source: source.to_string(),
        }
    }

    /// Relevant to `sponsor`
    #[inline]
    #[must_use]
    pub fn is_relevant_to(&self, sponsor: Sponsor) -> bool {
        self.sponsors.contains(&sponsor)
    }
}

/// Per-sponsor verdict
#[derive(Debug, Clone, PartialEq)]
pub struct SponsorVerdict {
    pub sponsor: Sponsor,
    pub should_execute: bool,
    /// Why execution was refused
    pub reason: Option<String>,
}

/// How to run the project once for all candidate sponsors
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    pub runtime: Runtime,
    pub install: Vec<String>,
    pub test: Vec<String>,
    pub start: Option<String>,
    pub port: u16,
    pub health_path: String,
    pub endpoints: Vec<EndpointProbe>,
    pub verdicts: Vec<SponsorVerdict>,
}

impl ExecutionPlan {
    /// Sponsors cleared for execution
    pub fn runnable(&self) -> impl Iterator<Item = Sponsor> + '_ {
        self.verdicts
            .iter()
            .filter(|v| v.should_execute)
            .map(|v| v.sponsor)
    }

    /// Whether anything will run
    #[must_use]
    pub fn should_execute(&self) -> bool {
        self.runnable().next().is_some()
    }
}

/// Detected sponsors at or above the score threshold
#[must_use]
pub fn candidates(result: &AnalysisResult, threshold: u8) -> Vec<Sponsor> {
    result
        .detected()
        .filter(|(_, a)| a.integration_score >= threshold)
        .map(|(s, _)| s)
        .collect()
}

struct SafetyRule {
    category: &'static str,
    pattern: &'static str,
}

const SAFETY_RULES: &[SafetyRule] = &[
    SafetyRule {
        category: "destructive operations",
        pattern: r"rm\s+-rf\s+/|(?i:drop\s+(table|database)\s)|(?i:truncate\s+table\s)|mkfs\.|shutil\.rmtree\(\s*['\x22]/",
    },
    SafetyRule {
        category: "wallet or financial operations",
        pattern: r"(?i:mnemonic|seed\s*phrase)|PRIVATE_KEY|sendTransaction|signTransaction|ethers\.Wallet|web3\.eth\.accounts|stripe\.charges\.create|paymentIntents\.create",
    },
    SafetyRule {
        category: "host credentials",
        pattern: r"AWS_SECRET_ACCESS_KEY|GOOGLE_APPLICATION_CREDENTIALS|\.ssh/id_rsa|\.aws/credentials|curl[^|\n]*\|\s*(sudo\s+)?(ba)?sh",
    },
];

struct RouteRule {
    regex: Regex,
    method_group: Option<usize>,
    path_group: usize,
}

static ROUTE_RULES: Lazy<Vec<RouteRule>> = Lazy::new(|| {
    let rules = [
        // express / koa / hono style
        (r#"\b(?:app|router|server|api)\.(get|post|put|patch|delete)\(\s*['"`](/[^'"`]*)['"`]"#, Some(1), 2),
        // fastapi / flask 2 decorators
        (r#"@\w+\.(get|post|put|patch|delete)\(\s*['"](/[^'"]*)['"]"#, Some(1), 2),
        // flask route, GET unless methods= says otherwise (handled below)
        (r#"@\w+\.route\(\s*['"](/[^'"]*)['"]"#, None, 1),
        // net/http
        (r#"HandleFunc\(\s*"(/[^"]*)""#, None, 1),
        // gin / echo
        (r#"\.(GET|POST|PUT|PATCH|DELETE)\(\s*"(/[^"]*)""#, Some(1), 2),
    ];
    rules
        .into_iter()
        .filter_map(|(pattern, method_group, path_group)| {
            Regex::new(pattern).ok().map(|regex| RouteRule {
                regex,
                method_group,
                path_group,
            })
        })
        .collect()
});

static FLASK_METHODS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"methods\s*=\s*\[\s*['"](\w+)['"]"#).ok());

static NEXT_HANDLER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"export\s+(?:async\s+)?function\s+(GET|POST|PUT|PATCH|DELETE)\b").ok());

const SOURCE_EXTENSIONS: &[&str] = &["js", "jsx", "mjs", "cjs", "ts", "tsx", "py", "go"];

/// Builds execution plans
#[derive(Debug, Clone, Copy)]
pub struct ExecutionPlanner {
    threshold: u8,
}

impl ExecutionPlanner {
    #[must_use]
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    /// Plan execution for the result's candidate sponsors
    ///
    /// Returns `None` when no sponsor meets the threshold.
    ///
    /// # Errors
    /// `RepositoryError` when the checkout cannot be scanned
    pub async fn plan(
        &self,
        result: &AnalysisResult,
        snapshot: &RepoSnapshot,
    ) -> Result<Option<ExecutionPlan>, RepositoryError> {
        let sponsors = candidates(result, self.threshold);
        if sponsors.is_empty() {
            return Ok(None);
        }

        let workspace = snapshot.workspace();
        let manifests = workspace.manifests().await?;
        let runtime = Runtime::detect(&manifests, &result.repository_stats);
        let (install, test, start, port) =
            commands_for(runtime, &manifests, &result.repository_stats, &workspace).await;

        let refusal = match safety_violation(&workspace).await? {
            Some(reason) => Some(reason),
            None if runtime == Runtime::Unknown => Some("no supported runtime detected".to_string()),
            None => None,
        };

        let mut endpoints = discover_endpoints(&workspace).await?;
        for endpoint in &mut endpoints {
            endpoint.sponsors = sponsors
                .iter()
                .copied()
                .filter(|s| {
                    result
                        .sponsor(*s)
                        .is_some_and(|a| a.evidence.files.iter().any(|f| same_file(f, &endpoint.source)))
                })
                .collect();
        }

        let verdicts = sponsors
            .into_iter()
            .map(|sponsor| SponsorVerdict {
                sponsor,
                should_execute: refusal.is_none(),
                reason: refusal.clone(),
            })
            .collect();

        tracing::debug!(%runtime, endpoints = endpoints.len(), refused = refusal.is_some(), "execution planned");
        Ok(Some(ExecutionPlan {
            runtime,
            install,
            test,
            start,
            port,
            health_path: "/".to_string(),
            endpoints,
            verdicts,
        }))
    }
}

fn same_file(evidence: &str, source: &str) -> bool {
    let normalize = |p: &str| p.trim().trim_start_matches("./").trim_start_matches('/').to_string();
    normalize(evidence) == normalize(source)
}

async fn commands_for(
    runtime: Runtime,
    manifests: &[Manifest],
    stats: &RepositoryStats,
    workspace: &RepoWorkspace,
) -> (Vec<String>, Vec<String>, Option<String>, u16) {
    let mut port = runtime.default_port();
    let exists = |path: &'static str| workspace.resolve(path).is_ok_and(|p| p.is_file());
    let (install, test, start) = match runtime {
        Runtime::Node => {
            let package = manifests.iter().find(|m| m.kind == ManifestKind::PackageJson);
            let install = if exists("package-lock.json") { "npm ci" } else { "npm install" };
            let has_real_test = package
                .and_then(|m| m.script("test"))
                .is_some_and(|s| !s.contains("no test specified"));
            let start = package.and_then(|m| {
                if m.script("start").is_some() {
                    Some("npm start".to_string())
                } else if m.script("dev").is_some() {
                    Some("npm run dev".to_string())
                } else {
                    None
                }
            });
            let start = start.or_else(|| {
                ["server.js", "index.js", "app.js"]
                    .into_iter()
                    .find(|&f| exists(f))
                    .map(|f| format!("node {f}"))
            });
            (
                vec![install.to_string()],
                if has_real_test { vec!["npm test".to_string()] } else { Vec::new() },
                start,
            )
        }
        Runtime::Python => {
            let install = if exists("requirements.txt") {
                vec!["pip install -r requirements.txt".to_string()]
            } else if exists("pyproject.toml") {
                vec!["pip install .".to_string()]
            } else {
                Vec::new()
            };
            let uses = |dep: &str| stats.dependencies.iter().any(|d| d.eq_ignore_ascii_case(dep));
            let entry = ["main.py", "app.py", "server.py"].into_iter().find(|&f| exists(f));
            let start = entry.map(|file| {
                if uses("fastapi") || uses("uvicorn") {
                    let module = file.trim_end_matches(".py");
                    format!("uvicorn {module}:app --host 0.0.0.0 --port {port}")
                } else {
                    if uses("flask") {
                        port = 5000;
                    }
                    format!("python {file}")
                }
            });
            let test = if stats.has_tests {
                vec!["python -m pytest -q".to_string()]
            } else {
                Vec::new()
            };
            (install, test, start)
        }
        Runtime::Go => (
            vec!["go mod download".to_string()],
            if stats.has_tests { vec!["go test ./...".to_string()] } else { Vec::new() },
            Some("go run .".to_string()),
        ),
        Runtime::Rust => (
            vec!["cargo fetch".to_string()],
            vec!["cargo test".to_string()],
            Some("cargo run".to_string()),
        ),
        Runtime::Unknown => (Vec::new(), Vec::new(), None),
    };
    (install, test, start.map(|cmd| format!("PORT={port} {cmd}")), port)
}

async fn safety_violation(workspace: &RepoWorkspace) -> Result<Option<String>, RepositoryError> {
    for rule in SAFETY_RULES {
        if let Some(hit) = workspace.search_code(rule.pattern, 1).await?.into_iter().next() {
            tracing::info!(category = rule.category, file = %hit.path, "execution refused");
            return Ok(Some(format!(
                "Execution skipped: {} detected in {}:{}",
                rule.category, hit.path, hit.line
            )));
        }
    }
    Ok(None)
}

fn has_path_params(path: &str) -> bool {
    path.contains([':', '{', '[', '<', '*'])
}

/// Route declared by a Next.js file path (`pages/api/*`, `app/api/**/route.*`)
fn next_route(relative: &str) -> Option<String> {
    let trimmed = relative.strip_prefix("src/").unwrap_or(relative);
    let (stem, _) = trimmed.rsplit_once('.')?;
    if let Some(rest) = stem.strip_prefix("pages/api/") {
        let rest = rest.strip_suffix("/index").unwrap_or(rest);
        return Some(if rest == "index" { "/api".to_string() } else { format!("/api/{rest}") });
    }
    if let Some(rest) = stem.strip_prefix("app/api/") {
        if rest == "route" {
            return Some("/api".to_string());
        }
        let dir = rest.strip_suffix("/route")?;
        return Some(format!("/api/{dir}"));
    }
    None
}

fn routes_in_file(relative: &str, text: &str) -> Vec<EndpointProbe> {
    let mut found = Vec::new();
    for line in text.lines() {
        for rule in ROUTE_RULES.iter() {
            for caps in rule.regex.captures_iter(line) {
                let Some(path) = caps.get(rule.path_group).map(|m| m.as_str()) else {
                    continue;
                };
                let method = match rule.method_group {
                    Some(group) => caps.get(group).map_or("GET", |m| m.as_str()).to_string(),
                    None => FLASK_METHODS
                        .as_ref()
                        .and_then(|re| re.captures(line))
                        .and_then(|c| c.get(1))
                        .map_or_else(|| "GET".to_string(), |m| m.as_str().to_string()),
                };
                let probe = EndpointProbe::new(&method, path, relative);
                if !found
                    .iter()
                    .any(|p: &EndpointProbe| p.method == probe.method && p.path == probe.path)
                {
                    found.push(probe);
                }
            }
        }
    }

    if let Some(route) = next_route(relative) {
        let methods: Vec<String> = NEXT_HANDLER
            .as_ref()
            .map(|re| re.captures_iter(text).filter_map(|c| Some(c.get(1)?.as_str().to_string())).collect())
            .unwrap_or_default();
        if methods.is_empty() {
            found.push(EndpointProbe::new("GET", &route, relative));
        } else {
            found.extend(methods.iter().map(|m| EndpointProbe::new(m, &route, relative)));
        }
    }
    found
}

async fn discover_endpoints(workspace: &RepoWorkspace) -> Result<Vec<EndpointProbe>, RepositoryError> {
    let mut files = workspace.source_files().await?;
    files.retain(|f| {
        f.rsplit_once('.')
            .is_some_and(|(_, ext)| SOURCE_EXTENSIONS.contains(&ext))
    });
    files.sort();

    let mut seen = BTreeSet::new();
    let mut endpoints = Vec::new();
    for file in files {
        let Ok(text) = workspace.read_file(&file).await else {
            continue;
        };
        for probe in routes_in_file(&file, &text) {
            if has_path_params(&probe.path) || !seen.insert((probe.method.clone(), probe.path.clone())) {
                continue;
            }
            endpoints.push(probe);
            if endpoints.len() >= MAX_ENDPOINTS {
                return Ok(endpoints);
            }
        }
    }
    Ok(endpoints)
}
