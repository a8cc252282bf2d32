use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::metadata::UserIdentity;
use crate::pipeline::DEFAULT_ARCHIVE_NAME;

pub const CONFIG_FILE: &str = "market-docgen.toml";
pub const CONFIG_ENV: &str = "MARKET_DOCGEN_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub templates: TemplatesSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub bulk: BulkSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub metadata: MetadataSection,
    #[serde(default)]
    pub user: UserSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TemplatesSection {
    /// Directory holding the seven template assets. Relative to the config file.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct OutputSection {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct BulkSection {
    /// Rendering threads; unset or 0 uses one per core.
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub archive_name: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct LoggingSection {
    /// Default filter directive, e.g. "info" or "market_docgen=debug".
    /// `RUST_LOG` takes precedence.
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct MetadataSection {
    /// JSON-lines log of generated documents and bulk jobs. Unset discards records.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct UserSection {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Command-line values that take precedence over the config file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub templates_dir: Option<PathBuf>,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub role: Option<String>,
}

/// Settings after merging defaults, the config file and overrides.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// The config file in effect, if one was found.
    pub config_path: Option<PathBuf>,
    pub templates_dir: PathBuf,
    pub output_dir: PathBuf,
    pub bulk_threads: Option<usize>,
    pub archive_name: String,
    pub log_level: String,
    pub log_json: bool,
    pub metadata_log: Option<PathBuf>,
    pub user: UserIdentity,
}

impl RunConfig {
    /// `workdir` is the directory of the input file, searched for a config
    /// after the current directory.
    pub fn resolve(workdir: &Path, overrides: Overrides) -> anyhow::Result<Self> {
        let cfg_file = overrides
            .config
            .clone()
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .or_else(|| find_default_config(workdir, CONFIG_FILE));

        let mut file_cfg = AppConfig::default();
        let mut config_path = None;
        if let Some(p) = cfg_file {
            if p.exists() {
                file_cfg = load_config(&p)?;
                config_path = Some(p);
            } else if overrides.config.is_some() {
                anyhow::bail!("config not found: {}", p.display());
            }
        }
        let base = config_path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let relative = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };

        let templates_dir = match overrides.templates_dir {
            Some(dir) => dir,
            None => relative(
                file_cfg
                    .templates
                    .dir
                    .unwrap_or_else(|| PathBuf::from("templates")),
            ),
        };
        let output_dir = file_cfg
            .output
            .dir
            .map(&relative)
            .unwrap_or_else(|| PathBuf::from("."));
        let metadata_log = file_cfg.metadata.log_path.map(&relative);

        let defaults = UserIdentity::default();
        let user = UserIdentity {
            id: overrides
                .user_id
                .or(file_cfg.user.id)
                .unwrap_or(defaults.id),
            username: overrides
                .username
                .or(file_cfg.user.username)
                .unwrap_or(defaults.username),
            role: overrides.role.or(file_cfg.user.role).unwrap_or(defaults.role),
        };

        Ok(Self {
            config_path,
            templates_dir,
            output_dir,
            bulk_threads: file_cfg.bulk.threads.filter(|n| *n > 0),
            archive_name: file_cfg
                .bulk
                .archive_name
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string()),
            log_level: file_cfg
                .logging
                .level
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "info".to_string()),
            log_json: file_cfg.logging.json.unwrap_or(false),
            metadata_log,
            user,
        })
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(p) = find_file_upwards(&cwd, filename, 8) {
            return Some(p);
        }
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text)
        .with_context(|| format!("parse config toml: {}", path.display()))?;
    Ok(cfg)
}

const DEFAULT_CONFIG_TOML: &str = r#"# market-docgen configuration.
# Relative paths are resolved against the directory of this file.

[templates]
# Must contain global_template.docx, country_template.docx and one
# <region>_region_template.docx per region.
dir = "templates"

[output]
dir = "."

[bulk]
# threads = 4
archive_name = "generated_documents.zip"

[logging]
# Overridden by RUST_LOG when set.
level = "info"
json = false

[metadata]
# JSON-lines record of every generated document and bulk job.
# log_path = "metadata/records.jsonl"

[user]
# id = "local"
# username = "local"
# role = "user"
"#;

/// Writes a commented default config into `dir`. An existing file is kept
/// unless `force` is set.
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create config dir: {}", dir.display()))?;
    let cfg_path = dir.join(CONFIG_FILE);
    if cfg_path.exists() && !force {
        anyhow::bail!(
            "config already exists: {} (use --force to overwrite)",
            cfg_path.display()
        );
    }
    std::fs::write(&cfg_path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", cfg_path.display()))?;
    let templates = dir.join("templates");
    std::fs::create_dir_all(&templates)
        .with_context(|| format!("create templates dir: {}", templates.display()))?;
    Ok(cfg_path)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{find_file_upwards, init_default_config, load_config, Overrides, RunConfig};

    #[test]
    fn default_config_parses_and_refuses_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = init_default_config(dir.path(), false).expect("init");
        assert!(dir.path().join("templates").is_dir());

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.templates.dir, Some(PathBuf::from("templates")));
        assert_eq!(cfg.logging.level.as_deref(), Some("info"));
        assert!(cfg.metadata.log_path.is_none());

        assert!(init_default_config(dir.path(), false).is_err());
        assert!(init_default_config(dir.path(), true).is_ok());
    }

    #[test]
    fn relative_paths_follow_the_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[templates]\ndir = \"tpl\"\n[metadata]\nlog_path = \"meta/log.jsonl\"\n[bulk]\nthreads = 0\n[user]\nusername = \"analyst\"\n",
        )
        .expect("write");

        let run = RunConfig::resolve(
            dir.path(),
            Overrides {
                config: Some(path.clone()),
                role: Some("admin".into()),
                ..Overrides::default()
            },
        )
        .expect("resolve");
        assert_eq!(run.config_path.as_deref(), Some(path.as_path()));
        assert_eq!(run.templates_dir, dir.path().join("tpl"));
        assert_eq!(run.metadata_log, Some(dir.path().join("meta/log.jsonl")));
        assert_eq!(run.bulk_threads, None);
        assert_eq!(run.archive_name, "generated_documents.zip");
        assert_eq!(run.user.username, "analyst");
        assert_eq!(run.user.role, "admin");
        assert_eq!(run.user.id, "local");
    }

    #[test]
    fn templates_override_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.toml");
        std::fs::write(&path, "[templates]\ndir = \"tpl\"\n").expect("write");
        let run = RunConfig::resolve(
            dir.path(),
            Overrides {
                config: Some(path),
                templates_dir: Some(PathBuf::from("/srv/templates")),
                ..Overrides::default()
            },
        )
        .expect("resolve");
        assert_eq!(run.templates_dir, PathBuf::from("/srv/templates"));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = RunConfig::resolve(
            dir.path(),
            Overrides {
                config: Some(dir.path().join("absent.toml")),
                ..Overrides::default()
            },
        );
        assert!(err.is_err());
    }

    #[test]
    fn upward_search_finds_parent_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("x.toml"), "").expect("write");
        assert_eq!(
            find_file_upwards(&nested, "x.toml", 8),
            Some(dir.path().join("x.toml"))
        );
        assert_eq!(find_file_upwards(&nested, "x.toml", 1), None);
    }
}
