//! The build description (`modvault.toml`): repositories, projects and their
//! configurations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use modvault_schema::ModuleComponentId;
use serde::Deserialize;
use thiserror::Error;

use crate::cache::ModuleCaches;
use crate::repository::{FileRepository, ModuleRepository};
use crate::resolver::{
    ArtifactVerificationOperation, CachePolicy, DependencyResolver, ResolveError, ResolvedConfiguration,
};

/// Name of the build description at the workspace root.
pub const BUILD_FILE: &str = "modvault.toml";

/// Errors raised while loading a workspace or resolving its configurations.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    /// The build description could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// The build description is not valid TOML for this schema.
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying failure.
        source: toml::de::Error,
    },

    /// The project declares no such configuration.
    #[error("Project '{project}' has no configuration '{configuration}'")]
    UnknownConfiguration {
        /// Project name.
        project: String,
        /// Requested configuration.
        configuration: String,
    },

    /// The configuration is declared with `can-be-resolved = false`.
    #[error("Configuration '{configuration}' of '{project}' cannot be resolved")]
    NotResolvable {
        /// Project name.
        project: String,
        /// Requested configuration.
        configuration: String,
    },

    /// Dependency resolution failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Contents of `modvault.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildDescription {
    /// `[[repository]]` tables.
    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryDecl>,
    /// `[[project]]` tables.
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectDecl>,
}

/// A directory repository to resolve modules from.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryDecl {
    /// Name used in logs.
    pub name: String,
    /// Relative paths are taken from the workspace root.
    pub path: PathBuf,
}

/// A project and its configurations.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectDecl {
    /// Project name.
    pub name: String,
    /// Configurations by name.
    #[serde(default)]
    pub configurations: BTreeMap<String, ConfigurationDecl>,
}

/// A named set of root dependencies.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigurationDecl {
    /// Root dependencies as `group:name:version`.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether the configuration may be resolved. Defaults to true.
    #[serde(default = "resolvable_by_default")]
    pub can_be_resolved: bool,
}

fn resolvable_by_default() -> bool {
    true
}

impl BuildDescription {
    /// Parse the description at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or is not a valid description.
    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let text = std::fs::read_to_string(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| WorkspaceError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// A project whose configurations can be resolved.
pub trait Project: Send + Sync {
    /// Project name.
    fn name(&self) -> &str;

    /// Configurations that can safely be resolved, in name order.
    fn resolvable_configurations(&self) -> Vec<String>;

    /// Resolve `configuration`, reporting artifacts to `observer`.
    ///
    /// # Errors
    ///
    /// Fails for unknown or non-resolvable configurations and on resolution
    /// failures.
    fn resolve_configuration(
        &self,
        configuration: &str,
        observer: Option<&dyn ArtifactVerificationOperation>,
    ) -> Result<ResolvedConfiguration, WorkspaceError>;
}

/// The projects of a build.
pub trait BuildTree: Send + Sync {
    /// All projects in declaration order.
    fn projects(&self) -> Vec<Arc<dyn Project>>;
}

struct DeclaredProject {
    decl: ProjectDecl,
    resolver: Arc<DependencyResolver>,
}

impl Project for DeclaredProject {
    fn name(&self) -> &str {
        &self.decl.name
    }

    fn resolvable_configurations(&self) -> Vec<String> {
        self.decl
            .configurations
            .iter()
            .filter(|(_, c)| c.can_be_resolved)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn resolve_configuration(
        &self,
        configuration: &str,
        observer: Option<&dyn ArtifactVerificationOperation>,
    ) -> Result<ResolvedConfiguration, WorkspaceError> {
        let decl = self
            .decl
            .configurations
            .get(configuration)
            .ok_or_else(|| WorkspaceError::UnknownConfiguration {
                project: self.decl.name.clone(),
                configuration: configuration.to_string(),
            })?;
        if !decl.can_be_resolved {
            return Err(WorkspaceError::NotResolvable {
                project: self.decl.name.clone(),
                configuration: configuration.to_string(),
            });
        }
        let roots = decl
            .dependencies
            .iter()
            .map(|d| d.parse::<ModuleComponentId>().map_err(ResolveError::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.resolver.resolve(configuration, &roots, observer)?)
    }
}

/// A loaded workspace: its description bound to repositories and caches.
pub struct Workspace {
    root: PathBuf,
    projects: Vec<Arc<dyn Project>>,
    repositories: Vec<Arc<dyn ModuleRepository>>,
}

impl Workspace {
    /// Load `<root>/modvault.toml`.
    ///
    /// # Errors
    ///
    /// Fails when the description cannot be read or parsed.
    pub fn load(root: &Path, caches: Arc<ModuleCaches>, policy: CachePolicy) -> Result<Self, WorkspaceError> {
        let description = BuildDescription::load(&root.join(BUILD_FILE))?;
        Ok(Self::from_description(root, description, caches, policy))
    }

    /// Bind an already parsed description. Repository paths are joined
    /// onto `root`.
    pub fn from_description(
        root: &Path,
        description: BuildDescription,
        caches: Arc<ModuleCaches>,
        policy: CachePolicy,
    ) -> Self {
        let repositories: Vec<Arc<dyn ModuleRepository>> = description
            .repositories
            .iter()
            .map(|r| Arc::new(FileRepository::new(&r.name, root.join(&r.path))) as Arc<dyn ModuleRepository>)
            .collect();
        let resolver = Arc::new(DependencyResolver::new(repositories.clone(), caches, policy));
        let projects = description
            .projects
            .into_iter()
            .map(|decl| {
                Arc::new(DeclaredProject {
                    decl,
                    resolver: Arc::clone(&resolver),
                }) as Arc<dyn Project>
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            projects,
            repositories,
        }
    }

    /// Workspace root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Declared repositories in declaration order.
    pub fn repositories(&self) -> &[Arc<dyn ModuleRepository>] {
        &self.repositories
    }

    /// The project called `name`, if declared.
    pub fn project(&self, name: &str) -> Option<Arc<dyn Project>> {
        self.projects.iter().find(|p| p.name() == name).cloned()
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("root", &self.root)
            .field("projects", &self.projects.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("repositories", &self.repositories.iter().map(|r| r.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl BuildTree for Workspace {
    fn projects(&self) -> Vec<Arc<dyn Project>> {
        self.projects.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::fs;
    use tempfile::TempDir;

    const BUILD: &str = r#"
[[repository]]
name = "local"
path = "repo"

[[project]]
name = "app"

[project.configurations.compile]
dependencies = ["org.example:lib:1.0"]

[project.configurations.api]
can-be-resolved = false
"#;

    fn workspace(dir: &TempDir) -> Workspace {
        fs::write(dir.path().join(BUILD_FILE), BUILD).unwrap();
        let lib = dir.path().join("repo/org/example/lib/1.0");
        fs::create_dir_all(&lib).unwrap();
        fs::write(
            lib.join("lib-1.0.module.json"),
            r#"{ "id": { "group": "org.example", "module": "lib", "version": "1.0" }, "artifacts": [ { "name": "lib" } ] }"#,
        )
        .unwrap();
        fs::write(lib.join("lib-1.0.jar"), b"lib").unwrap();
        let caches = Arc::new(ModuleCaches::new(&dir.path().join("cache"), Arc::new(SystemClock)));
        Workspace::load(dir.path(), caches, CachePolicy::default()).unwrap()
    }

    #[test]
    fn parses_description() {
        let description: BuildDescription = toml::from_str(BUILD).unwrap();
        assert_eq!(description.repositories[0].name, "local");
        let configs = &description.projects[0].configurations;
        assert!(configs["compile"].can_be_resolved);
        assert!(!configs["api"].can_be_resolved);
    }

    #[test]
    fn resolves_declared_configurations() {
        let dir = TempDir::new().unwrap();
        let ws = workspace(&dir);
        let project = ws.project("app").unwrap();
        assert_eq!(project.resolvable_configurations(), ["compile"]);

        let resolved = project.resolve_configuration("compile", None).unwrap();
        assert_eq!(resolved.artifacts[0].id.file_name(), "lib-1.0.jar");

        assert!(matches!(
            project.resolve_configuration("api", None),
            Err(WorkspaceError::NotResolvable { .. })
        ));
        assert!(matches!(
            project.resolve_configuration("nope", None),
            Err(WorkspaceError::UnknownConfiguration { .. })
        ));
    }

    #[test]
    fn missing_build_file() {
        let dir = TempDir::new().unwrap();
        let caches = Arc::new(ModuleCaches::new(dir.path(), Arc::new(SystemClock)));
        assert!(matches!(
            Workspace::load(dir.path(), caches, CachePolicy::default()),
            Err(WorkspaceError::Io { .. })
        ));
    }
}
