//! Manifest collaborator interface
//!
//! Parsing manifest files is left to the host; the cache only consumes the
//! resulting list of declared libraries.

use crate::error::Result;
use crate::types::DeclaredLibrary;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn list_declared_libraries(&self, project_path: &str) -> Result<Vec<DeclaredLibrary>>;
}

/// Fixed declarations per project
#[derive(Debug, Clone, Default)]
pub struct StaticManifest {
    projects: HashMap<String, Vec<DeclaredLibrary>>,
}

impl StaticManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(
        mut self,
        project_path: impl Into<String>,
        libraries: Vec<DeclaredLibrary>,
    ) -> Self {
        self.projects.insert(project_path.into(), libraries);
        self
    }

    /// Parse `name@version` specs (`react@18`, `tokio`)
    pub fn parse_specs<S: AsRef<str>>(specs: &[S]) -> Vec<DeclaredLibrary> {
        specs
            .iter()
            .map(|spec| {
                let spec = spec.as_ref().trim();
                match spec.rsplit_once('@') {
                    Some((name, version)) if !name.is_empty() => {
                        DeclaredLibrary::new(name, Some(version))
                    }
                    _ => DeclaredLibrary::new(spec, None),
                }
            })
            .filter(|lib| !lib.library_id.is_empty())
            .collect()
    }
}

#[async_trait]
impl ManifestSource for StaticManifest {
    async fn list_declared_libraries(&self, project_path: &str) -> Result<Vec<DeclaredLibrary>> {
        Ok(self.projects.get(project_path).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_specs() {
        let libs = StaticManifest::parse_specs(&["react@18", "tokio", "@types/node@20", ""]);
        assert_eq!(
            libs,
            vec![
                DeclaredLibrary::new("react", Some("18")),
                DeclaredLibrary::new("tokio", None),
                DeclaredLibrary::new("@types/node", Some("20")),
            ]
        );
    }

    #[tokio::test]
    async fn test_static_manifest_lookup() {
        let manifest = StaticManifest::new().with_project(
            "/work/app",
            vec![DeclaredLibrary::new("rails", Some("7"))],
        );

        let declared = manifest.list_declared_libraries("/work/app").await.unwrap();
        assert_eq!(declared.len(), 1);
        assert!(manifest
            .list_declared_libraries("/elsewhere")
            .await
            .unwrap()
            .is_empty());
    }
}
