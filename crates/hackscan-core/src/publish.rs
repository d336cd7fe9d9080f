//! Result persistence
//!
//! Called once per job after synthesis. A publish failure does not undo the
//! analysis; the pipeline keeps the result and records a warning.

use crate::error::PublishError;
use crate::types::{AnalysisResult, TeamMember};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Where a published document ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub document_id: String,
    pub location: Option<PathBuf>,
}

#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, result: &AnalysisResult, members: &[TeamMember]) -> Result<PublishReceipt, PublishError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectDocument<'a> {
    id: &'a str,
    team_members: &'a [TeamMember],
    result: &'a AnalysisResult,
}

/// Slug for a project name: lowercase alphanumerics joined by single hyphens
#[must_use]
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let out = out.trim_end_matches('-');
    if out.is_empty() {
        "project".to_string()
    } else {
        out.to_string()
    }
}

/// Writes `<dir>/<project-slug>.json`
#[derive(Debug, Clone)]
pub struct JsonFilePublisher {
    dir: PathBuf,
}

impl JsonFilePublisher {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ResultPublisher for JsonFilePublisher {
    async fn publish(&self, result: &AnalysisResult, members: &[TeamMember]) -> Result<PublishReceipt, PublishError> {
        let id = slug(&result.project_name);
        let document = ProjectDocument {
            id: &id,
            team_members: members,
            result,
        };
        let body = serde_json::to_vec_pretty(&document)?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{id}.json"));
        // write-then-rename so readers never see a partial document
        let staging = self.dir.join(format!(".{id}.json.tmp"));
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &path).await?;

        tracing::info!(document = %id, path = %path.display(), "analysis published");
        Ok(PublishReceipt {
            document_id: id,
            location: Some(path),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnalysisRequest, RepositoryStats};

    #[test]
    fn slugs() {
        assert_eq!(slug("My Cool App!"), "my-cool-app");
        assert_eq!(slug("  --AI__Helper-- "), "ai-helper");
        assert_eq!(slug("???"), "project");
    }

    #[tokio::test]
    async fn writes_document() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = JsonFilePublisher::new(dir.path().join("out"));
        let request = AnalysisRequest::new("https://github.com/t/app", "Team", "Cool App");
        let result = AnalysisResult::empty(&request, RepositoryStats::default());
        let members = vec![TeamMember::new("Ada").with_email("ada@example.com")];

        let receipt = publisher.publish(&result, &members).await.unwrap();
        assert_eq!(receipt.document_id, "cool-app");

        let raw = std::fs::read_to_string(receipt.location.unwrap()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["teamMembers"][0]["name"], "Ada");
        assert_eq!(doc["result"]["projectName"], "Cool App");
        assert_eq!(doc["result"]["sponsors"].as_object().unwrap().len(), 6);
    }
}
