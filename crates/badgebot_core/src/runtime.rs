use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::render_default_config;
use crate::replica::META_DB_FILENAME;

pub const STATE_DIR_NAME: &str = ".badgebot";
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub replica_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub output_dir: PathBuf,
    pub replica_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub output_source: ValueSource,
    pub replica_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\noutput_dir={} ({})\nreplica_dir={} ({})\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.output_dir),
            self.output_source.as_str(),
            normalize_for_display(&self.replica_dir),
            self.replica_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub output_dir_exists: bool,
    pub replica_dir_exists: bool,
    pub meta_db_exists: bool,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> RuntimeStatus {
    let state_dir_exists = paths.state_dir.exists();
    let output_dir_exists = paths.output_dir.exists();
    let replica_dir_exists = paths.replica_dir.exists();
    let meta_db_exists = paths.replica_dir.join(META_DB_FILENAME).exists();
    let config_exists = paths.config_path.exists();

    let mut warnings = Vec::new();
    if !config_exists {
        warnings.push(format!(
            "{} is missing; built-in defaults apply (run `badgebot init` to write one)",
            normalize_for_display(&paths.config_path)
        ));
    }
    if !meta_db_exists {
        warnings.push(format!(
            "replica project list {} is missing; `badgebot run` has nothing to process",
            normalize_for_display(&paths.replica_dir.join(META_DB_FILENAME))
        ));
    }

    RuntimeStatus {
        state_dir_exists,
        output_dir_exists,
        replica_dir_exists,
        meta_db_exists,
        config_exists,
        warnings,
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| lookup_env(key).filter(|value| !value.trim().is_empty());
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (output_dir, output_source) = resolve_dir(
        overrides.output_dir.as_deref(),
        lookup("BADGEBOT_OUTPUT_DIR"),
        project_root.join("output"),
        &project_root,
    );
    let (replica_dir, replica_source) = resolve_dir(
        overrides.replica_dir.as_deref(),
        lookup("BADGEBOT_REPLICA_DIR"),
        state_dir.join("replica"),
        &project_root,
    );
    let (config_path, config_source) = resolve_dir(
        overrides.config.as_deref(),
        lookup("BADGEBOT_CONFIG"),
        state_dir.join(CONFIG_FILENAME),
        &project_root,
    );

    Ok(ResolvedPaths {
        project_root,
        state_dir,
        output_dir,
        replica_dir,
        config_path,
        root_source,
        output_source,
        replica_source,
        config_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.output_dir, &paths.replica_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(&paths.config_path, &render_default_config()?, options.force)?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

fn resolve_dir(
    flag: Option<&Path>,
    env_value: Option<String>,
    default: PathBuf,
    project_root: &Path,
) -> (PathBuf, ValueSource) {
    if let Some(path) = flag {
        (absolutize(path, project_root), ValueSource::Flag)
    } else if let Some(value) = env_value {
        (
            absolutize(Path::new(value.trim()), project_root),
            ValueSource::Env,
        )
    } else {
        (default, ValueSource::Default)
    }
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = lookup_env("BADGEBOT_PROJECT_ROOT") {
        return (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        );
    }

    match detect_project_root(&context.cwd, context.executable_dir.as_deref()) {
        Some(root) => (root, ValueSource::Heuristic),
        None => (context.cwd.clone(), ValueSource::Default),
    }
}

/// Nearest ancestor of the working directory, then of the executable, holding a state dir.
fn detect_project_root(cwd: &Path, executable_dir: Option<&Path>) -> Option<PathBuf> {
    let mut seen = HashSet::new();
    let mut candidates = ancestors(cwd);
    if let Some(exe_dir) = executable_dir {
        candidates.extend(ancestors(exe_dir));
    }
    candidates
        .into_iter()
        .filter(|candidate| seen.insert(normalize_for_display(candidate)))
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
}

fn ancestors(path: &Path) -> Vec<PathBuf> {
    path.ancestors().map(Path::to_path_buf).collect()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource, init_layout, inspect_runtime,
        resolve_paths_with_lookup,
    };
    use crate::config::{BotConfig, load_config};

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext {
            cwd: cwd.clone(),
            executable_dir: None,
        };

        let env = HashMap::from([(
            "BADGEBOT_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.output_dir, from_flag.join("output"));
        assert_eq!(resolved.output_source, ValueSource::Default);
    }

    #[test]
    fn env_directories_resolve_relative_to_project_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let context = ResolutionContext {
            cwd: temp.path().to_path_buf(),
            executable_dir: None,
        };
        let env = HashMap::from([
            ("BADGEBOT_PROJECT_ROOT".to_string(), root.to_string_lossy().to_string()),
            ("BADGEBOT_REPLICA_DIR".to_string(), "snapshots".to_string()),
            ("BADGEBOT_OUTPUT_DIR".to_string(), "  ".to_string()),
        ]);

        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| {
            env.get(key).cloned()
        })
        .expect("resolve paths");
        assert_eq!(resolved.root_source, ValueSource::Env);
        assert_eq!(resolved.replica_dir, root.join("snapshots"));
        assert_eq!(resolved.replica_source, ValueSource::Env);
        assert_eq!(resolved.output_source, ValueSource::Default);
        assert_eq!(resolved.config_path, root.join(".badgebot").join("config.toml"));
    }

    #[test]
    fn project_root_is_detected_from_state_dir() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join(".badgebot")).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");

        let context = ResolutionContext {
            cwd: nested,
            executable_dir: None,
        };
        let resolved =
            resolve_paths_with_lookup(&context, &PathOverrides::default(), |_| None).expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn init_layout_creates_expected_dirs_and_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");

        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert_eq!(report.created_dirs.len(), 3);
        assert!(report.wrote_config);
        assert!(paths.output_dir.exists());
        assert!(paths.replica_dir.exists());
        let config = load_config(&paths.config_path).expect("load written config");
        assert_eq!(config, BotConfig::default());

        let again = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(again.created_dirs.is_empty());
        assert!(!again.wrote_config);
    }

    #[test]
    fn inspect_runtime_warns_about_missing_replica() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let context = ResolutionContext {
            cwd: root.clone(),
            executable_dir: None,
        };
        let overrides = PathOverrides {
            project_root: Some(root),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");
        init_layout(&paths, &InitOptions::default()).expect("init");

        let status = inspect_runtime(&paths);
        assert!(status.config_exists);
        assert!(!status.meta_db_exists);
        assert_eq!(status.warnings.len(), 1);
    }
}
