//! Dependency resolution over module repositories, backed by the module
//! caches.
//!
//! Resolution walks the dependency graph breadth first. When two versions of
//! one module are requested, the highest wins; the final graph only keeps
//! modules reachable through selected versions.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use modvault_schema::{
    ArtifactIdentifier, CoordinateError, DescriptorHash, ModuleComponentId, ModuleDescriptor, ModuleId,
};
use thiserror::Error;

use crate::cache::{CacheError, ModuleCaches, ModuleSource};
use crate::repository::{ModuleRepository, RepositoryError, descriptor_artifact};

/// What an observed file is to its component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    /// The module descriptor.
    Metadata,
    /// A published file such as a jar.
    Artifact,
}

/// Locates the detached signature of an artifact, on demand.
pub type SignatureFileFactory = Box<dyn FnOnce() -> Option<PathBuf> + Send>;

/// Notified for every file a resolution brings in.
pub trait ArtifactVerificationOperation: Send + Sync {
    /// `file` is the local copy of `id`, served by the named repository.
    /// May be called concurrently and more than once for the same file.
    fn on_artifact(
        &self,
        kind: ArtifactKind,
        id: &ArtifactIdentifier,
        file: &Path,
        signature_file: SignatureFileFactory,
        repository_name: &str,
        repository_id: &str,
    );
}

/// Failures of a resolution.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The module caches failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A repository failed to serve a descriptor or file.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// A dependency notation is malformed.
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),

    /// No repository has the module.
    #[error("Could not find {0} in any repository")]
    NotFound(ModuleComponentId),

    /// The descriptor lists a file the repository does not have.
    #[error("Artifact {0} is declared but not published")]
    MissingArtifact(ArtifactIdentifier),
}

/// How long cached answers stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Age after which a changing module is fetched again.
    pub changing_module_ttl: Duration,
    /// Age after which a known-missing module is looked for again.
    pub missing_module_ttl: Duration,
    /// Ignore cached entries.
    pub refresh: bool,
    /// Never consult repositories for modules not cached.
    pub offline: bool,
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            changing_module_ttl: DAY,
            missing_module_ttl: DAY,
            refresh: false,
            offline: false,
        }
    }
}

fn older_than(age_millis: i64, ttl: Duration) -> bool {
    u128::try_from(age_millis).is_ok_and(|age| age > ttl.as_millis())
}

/// Compare dotted versions part by part: numerically when both parts are
/// numbers, textually otherwise.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| v.split(['.', '-']).map(str::to_owned).collect::<Vec<_>>();
    let (left, right) = (split(a), split(b));
    for (l, r) in left.iter().zip(&right) {
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

struct LocatedModule {
    repository: Arc<dyn ModuleRepository>,
    descriptor: ModuleDescriptor,
    hash: DescriptorHash,
}

/// A file brought in by a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Coordinates.
    pub id: ArtifactIdentifier,
    /// Local copy.
    pub file: PathBuf,
    /// Name of the repository that served it.
    pub repository: String,
}

/// Outcome of resolving one configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedConfiguration {
    /// Selected components, in breadth-first order.
    pub components: Vec<ModuleComponentId>,
    /// Artifacts of the selected components.
    pub artifacts: Vec<ResolvedArtifact>,
}

/// Resolves module graphs against repositories, in declaration order.
pub struct DependencyResolver {
    repositories: Vec<Arc<dyn ModuleRepository>>,
    caches: Arc<ModuleCaches>,
    policy: CachePolicy,
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let repositories: Vec<&str> = self.repositories.iter().map(|r| r.name()).collect();
        f.debug_struct("DependencyResolver")
            .field("repositories", &repositories)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl DependencyResolver {
    /// Resolve against `repositories` through `caches`.
    pub fn new(
        repositories: Vec<Arc<dyn ModuleRepository>>,
        caches: Arc<ModuleCaches>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            repositories,
            caches,
            policy,
        }
    }

    /// Cache validity rules in effect.
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Resolve `roots` and their transitive dependencies for `context`,
    /// reporting each descriptor and artifact to `observer`.
    ///
    /// # Errors
    ///
    /// Fails when a module cannot be found, a declared artifact is not
    /// published, or the cache cannot be read or written.
    pub fn resolve(
        &self,
        context: &str,
        roots: &[ModuleComponentId],
        observer: Option<&dyn ArtifactVerificationOperation>,
    ) -> Result<ResolvedConfiguration, ResolveError> {
        let mut selected: BTreeMap<ModuleId, ModuleComponentId> = BTreeMap::new();
        let mut located: HashMap<ModuleComponentId, LocatedModule> = HashMap::new();
        let mut queue: VecDeque<ModuleComponentId> = roots.iter().cloned().collect();

        while let Some(id) = queue.pop_front() {
            let module = id.module_id();
            if let Some(current) = selected.get(&module) {
                if compare_versions(&current.version, &id.version) != Ordering::Less {
                    continue;
                }
                tracing::debug!("{module}: {} replaces {}", id.version, current.version);
            }
            selected.insert(module, id.clone());
            if !located.contains_key(&id) {
                let found = self.locate(&id)?;
                located.insert(id.clone(), found);
            }
            if let Some(found) = located.get(&id) {
                queue.extend(found.descriptor.dependencies.iter().map(|d| d.component_id()));
            }
        }

        // Keep only what selected versions still reach.
        let mut result = ResolvedConfiguration::default();
        let mut seen = HashSet::new();
        let mut walk: VecDeque<ModuleId> = roots.iter().map(ModuleComponentId::module_id).collect();
        while let Some(module) = walk.pop_front() {
            if !seen.insert(module.clone()) {
                continue;
            }
            let Some(id) = selected.get(&module) else {
                continue;
            };
            let Some(found) = located.get(id) else {
                continue;
            };
            result.components.push(id.clone());
            walk.extend(found.descriptor.dependencies.iter().map(|d| d.component_id().module_id()));
            self.fetch_files(context, found, observer, &mut result)?;
        }
        tracing::info!(
            "Resolved {context}: {} components, {} artifacts",
            result.components.len(),
            result.artifacts.len()
        );
        Ok(result)
    }

    fn locate(&self, id: &ModuleComponentId) -> Result<LocatedModule, ResolveError> {
        let metadata = &self.caches.metadata;
        for repository in &self.repositories {
            if !self.policy.refresh {
                if let Some(cached) = metadata.get_cached_module_descriptor(repository.id(), id)? {
                    let expired = if cached.is_missing() {
                        older_than(cached.age_millis(), self.policy.missing_module_ttl)
                    } else {
                        cached.is_changing() && older_than(cached.age_millis(), self.policy.changing_module_ttl)
                    };
                    if self.policy.offline || !expired {
                        match cached.module_version() {
                            None => {
                                tracing::debug!("{id} cached as missing from {}", repository.name());
                                continue;
                            }
                            Some(descriptor) => {
                                tracing::debug!("{id} found in cache for {}", repository.name());
                                return Ok(LocatedModule {
                                    repository: Arc::clone(repository),
                                    descriptor: descriptor.clone(),
                                    hash: cached.descriptor_hash().clone(),
                                });
                            }
                        }
                    }
                    tracing::debug!("Cached entry for {id} in {} expired", repository.name());
                }
            }
            if self.policy.offline {
                continue;
            }
            match repository.fetch_descriptor(id)? {
                None => {
                    metadata.cache_missing(repository.id(), id)?;
                }
                Some(fetched) => {
                    let source = ModuleSource {
                        repository_name: repository.name().to_string(),
                        descriptor_location: fetched.file.display().to_string(),
                        snapshot_timestamp: None,
                    };
                    let cached = metadata.cache_meta_data(repository.id(), &fetched.descriptor, source)?;
                    return Ok(LocatedModule {
                        repository: Arc::clone(repository),
                        hash: cached.descriptor_hash().clone(),
                        descriptor: fetched.descriptor,
                    });
                }
            }
        }
        Err(ResolveError::NotFound(id.clone()))
    }

    fn artifacts_for(
        &self,
        context: &str,
        found: &LocatedModule,
    ) -> Result<Vec<ArtifactIdentifier>, ResolveError> {
        let repo_id = found.repository.id();
        let id = &found.descriptor.id;
        if !self.policy.refresh {
            if let Some(cached) = self.caches.artifacts.get_cached_artifacts(repo_id, id, context)? {
                if *cached.descriptor_hash() == found.hash {
                    return Ok(cached.artifacts().iter().cloned().collect());
                }
            }
        }
        let artifacts = found.descriptor.artifacts_for_context(context);
        self.caches
            .artifacts
            .cache_artifacts(repo_id, id, context, &found.hash, artifacts.clone())?;
        Ok(artifacts.into_iter().collect())
    }

    fn fetch_files(
        &self,
        context: &str,
        found: &LocatedModule,
        observer: Option<&dyn ArtifactVerificationOperation>,
        result: &mut ResolvedConfiguration,
    ) -> Result<(), ResolveError> {
        let repository = &found.repository;
        let metadata_id = descriptor_artifact(&found.descriptor.id);
        let mut files = vec![(ArtifactKind::Metadata, metadata_id)];
        files.extend(
            self.artifacts_for(context, found)?
                .into_iter()
                .map(|a| (ArtifactKind::Artifact, a)),
        );

        for (kind, artifact) in files {
            let Some(source) = repository.fetch_artifact(&artifact)? else {
                if kind == ArtifactKind::Metadata {
                    tracing::debug!("No descriptor file for {} in {}", artifact.component, repository.name());
                    continue;
                }
                return Err(ResolveError::MissingArtifact(artifact));
            };
            let file_name = artifact.file_name();
            let stored = self.caches.files.put(&artifact.component, &file_name, &source)?;
            if let Some(observer) = observer {
                let factory = self.signature_factory(repository, &artifact.component, &file_name);
                observer.on_artifact(kind, &artifact, &stored, factory, repository.name(), repository.id());
            }
            if kind == ArtifactKind::Artifact {
                result.artifacts.push(ResolvedArtifact {
                    id: artifact,
                    file: stored,
                    repository: repository.name().to_string(),
                });
            }
        }
        Ok(())
    }

    fn signature_factory(
        &self,
        repository: &Arc<dyn ModuleRepository>,
        component: &ModuleComponentId,
        file_name: &str,
    ) -> SignatureFileFactory {
        let repository = Arc::clone(repository);
        let caches = Arc::clone(&self.caches);
        let component = component.clone();
        let file_name = file_name.to_string();
        Box::new(move || {
            let source = match repository.fetch_signature(&component, &file_name) {
                Ok(source) => source?,
                Err(e) => {
                    tracing::warn!("Failed to fetch signature of {file_name}: {e}");
                    return None;
                }
            };
            let signature_name = format!("{file_name}.{}", crate::repository::SIGNATURE_EXTENSION);
            match caches.files.put(&component, &signature_name, &source) {
                Ok(stored) => Some(stored),
                Err(e) => {
                    tracing::warn!("Failed to store signature {signature_name}: {e}");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        repo_root: PathBuf,
        clock: Arc<ManualClock>,
        caches: Arc<ModuleCaches>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let repo_root = dir.path().join("repo");
            let clock = Arc::new(ManualClock::new(1_000_000));
            let caches = Arc::new(ModuleCaches::new(&dir.path().join("cache"), clock.clone()));
            Self {
                _dir: dir,
                repo_root,
                clock,
                caches,
            }
        }

        fn publish(&self, group: &str, module: &str, version: &str, deps: &[&str]) {
            let dir = self.repo_root.join(group.replace('.', "/")).join(module).join(version);
            fs::create_dir_all(&dir).unwrap();
            let deps: Vec<String> = deps
                .iter()
                .map(|d| {
                    let parts: Vec<&str> = d.split(':').collect();
                    format!(
                        r#"{{ "group": "{}", "module": "{}", "version": "{}" }}"#,
                        parts[0], parts[1], parts[2]
                    )
                })
                .collect();
            let json = format!(
                r#"{{ "id": {{ "group": "{group}", "module": "{module}", "version": "{version}" }},
                      "dependencies": [{}], "artifacts": [ {{ "name": "{module}" }} ] }}"#,
                deps.join(",")
            );
            fs::write(dir.join(format!("{module}-{version}.module.json")), json).unwrap();
            fs::write(dir.join(format!("{module}-{version}.jar")), format!("{module} {version}")).unwrap();
        }

        fn resolver(&self, policy: CachePolicy) -> DependencyResolver {
            let repo: Arc<dyn ModuleRepository> =
                Arc::new(crate::repository::FileRepository::new("local", &self.repo_root));
            DependencyResolver::new(vec![repo], Arc::clone(&self.caches), policy)
        }
    }

    fn id(s: &str) -> ModuleComponentId {
        s.parse().unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(ArtifactKind, String)>>,
    }

    impl ArtifactVerificationOperation for Recorder {
        fn on_artifact(
            &self,
            kind: ArtifactKind,
            id: &ArtifactIdentifier,
            file: &Path,
            _signature_file: SignatureFileFactory,
            repository_name: &str,
            _repository_id: &str,
        ) {
            assert!(file.exists());
            assert_eq!(repository_name, "local");
            self.seen.lock().unwrap().push((kind, id.file_name()));
        }
    }

    #[test]
    fn version_ordering() {
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "2.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0-rc1", "1.0-rc2"), Ordering::Less);
        assert_eq!(compare_versions("1.0", "1.0"), Ordering::Equal);
    }

    #[test]
    fn highest_version_wins_and_evicted_dependencies_drop() {
        let f = Fixture::new();
        f.publish("org.a", "app", "1.0", &["org.a:util:1.0", "org.a:core:1.0"]);
        f.publish("org.a", "util", "1.0", &["org.a:core:2.0"]);
        f.publish("org.a", "core", "1.0", &["org.a:legacy:1.0"]);
        f.publish("org.a", "core", "2.0", &[]);
        f.publish("org.a", "legacy", "1.0", &[]);

        let resolved = f
            .resolver(CachePolicy::default())
            .resolve("compile", &[id("org.a:app:1.0")], None)
            .unwrap();
        let names: Vec<String> = resolved.components.iter().map(ToString::to_string).collect();
        assert_eq!(names, ["org.a:app:1.0", "org.a:util:1.0", "org.a:core:2.0"]);
        assert_eq!(resolved.artifacts.len(), 3);
    }

    #[test]
    fn observer_sees_descriptors_and_artifacts() {
        let f = Fixture::new();
        f.publish("org.a", "lib", "1.0", &[]);
        let recorder = Recorder::default();
        f.resolver(CachePolicy::default())
            .resolve("compile", &[id("org.a:lib:1.0")], Some(&recorder))
            .unwrap();
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (ArtifactKind::Metadata, "lib-1.0.module.json".to_string()),
                (ArtifactKind::Artifact, "lib-1.0.jar".to_string()),
            ]
        );
    }

    #[test]
    fn missing_modules_are_cached_until_the_ttl() {
        let f = Fixture::new();
        let resolver = f.resolver(CachePolicy::default());
        assert!(matches!(
            resolver.resolve("compile", &[id("org.a:late:1.0")], None),
            Err(ResolveError::NotFound(_))
        ));

        f.publish("org.a", "late", "1.0", &[]);
        assert!(resolver.resolve("compile", &[id("org.a:late:1.0")], None).is_err());

        f.clock.advance(i64::try_from(DAY.as_millis()).unwrap() + 1);
        assert!(resolver.resolve("compile", &[id("org.a:late:1.0")], None).is_ok());
    }

    #[test]
    fn refresh_ignores_cached_misses() {
        let f = Fixture::new();
        let _ = f.resolver(CachePolicy::default()).resolve("compile", &[id("org.a:late:1.0")], None);
        f.publish("org.a", "late", "1.0", &[]);
        let policy = CachePolicy {
            refresh: true,
            ..CachePolicy::default()
        };
        assert!(f.resolver(policy).resolve("compile", &[id("org.a:late:1.0")], None).is_ok());
    }

    #[test]
    fn offline_uses_only_the_cache() {
        let f = Fixture::new();
        f.publish("org.a", "lib", "1.0", &[]);
        let offline = CachePolicy {
            offline: true,
            ..CachePolicy::default()
        };
        assert!(f.resolver(offline).resolve("compile", &[id("org.a:lib:1.0")], None).is_err());
        f.resolver(CachePolicy::default())
            .resolve("compile", &[id("org.a:lib:1.0")], None)
            .unwrap();
        assert!(f.resolver(offline).resolve("compile", &[id("org.a:lib:1.0")], None).is_ok());
    }

    #[test]
    fn artifact_sets_are_cached_per_context() {
        let f = Fixture::new();
        f.publish("org.a", "lib", "1.0", &[]);
        let resolver = f.resolver(CachePolicy::default());
        resolver.resolve("compile", &[id("org.a:lib:1.0")], None).unwrap();
        let repo_id = crate::repository::FileRepository::new("local", &f.repo_root).id().to_string();
        let cached = f
            .caches
            .artifacts
            .get_cached_artifacts(&repo_id, &id("org.a:lib:1.0"), "compile")
            .unwrap()
            .unwrap();
        assert_eq!(cached.artifacts().len(), 1);
        assert!(f
            .caches
            .artifacts
            .get_cached_artifacts(&repo_id, &id("org.a:lib:1.0"), "runtime")
            .unwrap()
            .is_none());
    }
}
