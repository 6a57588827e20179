use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

pub const MARKUP_DOMAIN: &str = "django";
pub const SCRIPT_DOMAIN: &str = "djangojs";
pub const DEFAULT_IGNORE_PATTERNS: [&str; 4] = ["CVS", ".*", "*~", "*.pyc"];

pub const MATERIALIZED_CONFIG: &str = r#"# transync configuration (materialized by `transync init`)

[catalog]
domains = ["django", "djangojs"]
ignore_patterns = []
use_default_ignore_patterns = true
follow_symlinks = false
make_backups = true
# base_dir = "/srv/site"
locale_paths = []
# reference_locale_dir = "/usr/lib/python3/site-packages/django/conf/locale"
languages = []
no_obsolete = false
keep_pot = false
no_wrap = false
no_location = false

[tools]
backend = "gettext"
xgettext = "xgettext"
msguniq = "msguniq"
msgmerge = "msgmerge"
stderr_policy = "warnings-allowed"
fuzzy_matching = true

# [domains.django]
# extensions = ["html", "txt"]
# source_extensions = ["py"]
# transform = "templatize"
# language = "Python"
# keywords = []
# reference_domains = ["django"]
"#;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TransyncConfig {
    #[serde(default)]
    pub catalog: CatalogSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CatalogSection {
    pub domains: Option<Vec<String>>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    pub use_default_ignore_patterns: Option<bool>,
    #[serde(default)]
    pub follow_symlinks: bool,
    pub make_backups: Option<bool>,
    pub base_dir: Option<String>,
    #[serde(default)]
    pub locale_paths: Vec<String>,
    pub reference_locale_dir: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub no_obsolete: bool,
    #[serde(default)]
    pub keep_pot: bool,
    #[serde(default)]
    pub no_wrap: bool,
    #[serde(default)]
    pub no_location: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ToolsSection {
    pub backend: Option<ToolBackend>,
    pub xgettext: Option<String>,
    pub msguniq: Option<String>,
    pub msgmerge: Option<String>,
    pub stderr_policy: Option<StderrPolicy>,
    pub fuzzy_matching: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DomainSection {
    pub extensions: Option<Vec<String>>,
    pub source_extensions: Option<Vec<String>>,
    pub transform: Option<TransformKind>,
    pub language: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub reference_domains: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolBackend {
    #[default]
    Gettext,
    Native,
}

impl ToolBackend {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gettext" => Ok(Self::Gettext),
            "native" => Ok(Self::Native),
            other => Err(SyncError::configuration(format!(
                "unknown tool backend `{other}` (expected `gettext` or `native`)"
            ))
            .into()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gettext => "gettext",
            Self::Native => "native",
        }
    }
}

/// How diagnostics on a tool's error stream are treated.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StderrPolicy {
    /// Output made only of `warning:` lines is logged and tolerated.
    #[default]
    WarningsAllowed,
    /// Any output on the error stream fails the run.
    Strict,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Templatize,
    Pythonize,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub name: String,
    /// Extensions (with leading dot) of files rewritten before extraction.
    pub extensions: Vec<String>,
    /// Extensions handed to the extractor unchanged.
    pub source_extensions: Vec<String>,
    pub transform: TransformKind,
    pub language: String,
    pub keywords: Vec<String>,
    pub reference_domains: Vec<String>,
}

impl DomainSpec {
    fn builtin(name: &str) -> Option<Self> {
        match name {
            MARKUP_DOMAIN => Some(Self {
                name: name.to_string(),
                extensions: vec![".html".to_string(), ".txt".to_string()],
                source_extensions: vec![".py".to_string()],
                transform: TransformKind::Templatize,
                language: "Python".to_string(),
                keywords: Vec::new(),
                reference_domains: vec![MARKUP_DOMAIN.to_string()],
            }),
            SCRIPT_DOMAIN => Some(Self {
                name: name.to_string(),
                extensions: vec![".js".to_string()],
                source_extensions: Vec::new(),
                transform: TransformKind::Pythonize,
                language: "Perl".to_string(),
                keywords: Vec::new(),
                reference_domains: vec![SCRIPT_DOMAIN.to_string(), MARKUP_DOMAIN.to_string()],
            }),
            _ => None,
        }
    }

    fn resolve(name: &str, section: Option<&DomainSection>) -> Result<Self> {
        let mut spec = match (Self::builtin(name), section) {
            (Some(spec), _) => spec,
            (None, Some(_)) => Self {
                name: name.to_string(),
                extensions: Vec::new(),
                source_extensions: Vec::new(),
                transform: TransformKind::None,
                language: "Python".to_string(),
                keywords: Vec::new(),
                reference_domains: vec![name.to_string()],
            },
            (None, None) => {
                return Err(SyncError::configuration(format!(
                    "domain `{name}` is neither built in nor configured under [domains.{name}]"
                ))
                .into());
            }
        };

        if let Some(section) = section {
            if let Some(extensions) = &section.extensions {
                spec.extensions = normalize_extensions(extensions);
            }
            if let Some(extensions) = &section.source_extensions {
                spec.source_extensions = normalize_extensions(extensions);
            }
            if let Some(transform) = section.transform {
                spec.transform = transform;
            }
            if let Some(language) = &section.language {
                spec.language = language.clone();
            }
            spec.keywords.extend(section.keywords.iter().cloned());
            if let Some(reference_domains) = &section.reference_domains {
                spec.reference_domains = reference_domains.clone();
            }
        }

        // Python sources never go through a transform.
        if spec.extensions.iter().any(|ext| ext == ".py") {
            spec.extensions.retain(|ext| ext != ".py");
            if !spec.source_extensions.iter().any(|ext| ext == ".py") {
                spec.source_extensions.push(".py".to_string());
            }
        }
        if spec.transform == TransformKind::None {
            let moved = std::mem::take(&mut spec.extensions);
            for ext in moved {
                if !spec.source_extensions.contains(&ext) {
                    spec.source_extensions.push(ext);
                }
            }
        }
        if spec.extensions.is_empty() && spec.source_extensions.is_empty() {
            return Err(SyncError::configuration(format!(
                "domain `{name}` has no extensions to scan"
            ))
            .into());
        }
        Ok(spec)
    }

    pub fn handles(&self, filename: &str) -> bool {
        self.needs_transform(filename) || self.is_plain_source(filename)
    }

    pub fn needs_transform(&self, filename: &str) -> bool {
        has_extension(filename, &self.extensions)
    }

    pub fn is_plain_source(&self, filename: &str) -> bool {
        has_extension(filename, &self.source_extensions)
    }
}

fn has_extension(filename: &str, extensions: &[String]) -> bool {
    match filename.rfind('.') {
        Some(index) if index > 0 => extensions.iter().any(|ext| ext == &filename[index..]),
        _ => false,
    }
}

/// Splits comma-separated entries, trims them, and prefixes a dot where
/// missing. Duplicates are dropped, first occurrence wins.
pub fn normalize_extensions(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        for part in value.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let ext = if part.starts_with('.') {
                part.to_string()
            } else {
                format!(".{part}")
            };
            if !out.contains(&ext) {
                out.push(ext);
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSettings {
    pub backend: ToolBackend,
    pub xgettext: String,
    pub msguniq: String,
    pub msgmerge: String,
    pub stderr_policy: StderrPolicy,
    pub fuzzy_matching: bool,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            backend: ToolBackend::Gettext,
            xgettext: "xgettext".to_string(),
            msguniq: "msguniq".to_string(),
            msgmerge: "msgmerge".to_string(),
            stderr_policy: StderrPolicy::WarningsAllowed,
            fuzzy_matching: true,
        }
    }
}

/// Configuration resolved once per invocation and threaded through the
/// pipeline components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub domains: Vec<String>,
    pub domain_specs: BTreeMap<String, DomainSpec>,
    pub ignore_patterns: Vec<String>,
    pub follow_symlinks: bool,
    pub make_backups: bool,
    pub base_dir: Option<PathBuf>,
    pub locale_paths: Vec<PathBuf>,
    pub reference_locale_dir: Option<PathBuf>,
    pub languages: Vec<String>,
    pub no_obsolete: bool,
    pub keep_pot: bool,
    pub no_wrap: bool,
    pub no_location: bool,
    pub tools: ToolSettings,
}

impl Settings {
    pub fn resolve<F>(config: &TransyncConfig, project_root: &Path, lookup_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let catalog = &config.catalog;
        let domains = catalog
            .domains
            .clone()
            .unwrap_or_else(|| vec![MARKUP_DOMAIN.to_string(), SCRIPT_DOMAIN.to_string()]);

        let mut domain_specs = BTreeMap::new();
        let names = domains.iter().chain(config.domains.keys());
        for name in names {
            if domain_specs.contains_key(name) {
                continue;
            }
            let spec = DomainSpec::resolve(name, config.domains.get(name))
                .with_context(|| format!("invalid configuration for domain `{name}`"))?;
            domain_specs.insert(name.clone(), spec);
        }

        let mut ignore_patterns = Vec::new();
        if catalog.use_default_ignore_patterns.unwrap_or(true) {
            ignore_patterns.extend(DEFAULT_IGNORE_PATTERNS.iter().map(|p| p.to_string()));
        }
        for pattern in &catalog.ignore_patterns {
            if !ignore_patterns.contains(pattern) {
                ignore_patterns.push(pattern.clone());
            }
        }

        let mut tools = ToolSettings::default();
        let section = &config.tools;
        if let Some(backend) = section.backend {
            tools.backend = backend;
        }
        if let Some(value) = lookup_env("TRANSYNC_TOOL_BACKEND")
            && !value.trim().is_empty()
        {
            tools.backend = ToolBackend::parse(&value)?;
        }
        if let Some(program) = &section.xgettext {
            tools.xgettext = program.clone();
        }
        if let Some(program) = &section.msguniq {
            tools.msguniq = program.clone();
        }
        if let Some(program) = &section.msgmerge {
            tools.msgmerge = program.clone();
        }
        if let Some(policy) = section.stderr_policy {
            tools.stderr_policy = policy;
        }
        if let Some(fuzzy) = section.fuzzy_matching {
            tools.fuzzy_matching = fuzzy;
        }

        let project_path = |value: &str| {
            let path = Path::new(value);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                project_root.join(path)
            }
        };

        Ok(Self {
            domains,
            domain_specs,
            ignore_patterns,
            follow_symlinks: catalog.follow_symlinks,
            make_backups: catalog.make_backups.unwrap_or(true),
            base_dir: catalog.base_dir.as_deref().map(project_path),
            locale_paths: catalog
                .locale_paths
                .iter()
                .map(|value| project_path(value))
                .collect(),
            reference_locale_dir: catalog.reference_locale_dir.as_deref().map(project_path),
            languages: catalog.languages.clone(),
            no_obsolete: catalog.no_obsolete,
            keep_pot: catalog.keep_pot,
            no_wrap: catalog.no_wrap,
            no_location: catalog.no_location,
            tools,
        })
    }

    pub fn defaults(project_root: &Path) -> Result<Self> {
        Self::resolve(&TransyncConfig::default(), project_root, |_| None)
    }

    pub fn domain(&self, name: &str) -> Result<&DomainSpec> {
        self.domain_specs.get(name).ok_or_else(|| {
            SyncError::configuration(format!("unknown domain `{name}`")).into()
        })
    }

    /// Domains selected for a run; an empty request means every configured
    /// domain.
    pub fn select_domains(&self, requested: &[String]) -> Result<Vec<&DomainSpec>> {
        let names = if requested.is_empty() {
            self.domains.as_slice()
        } else {
            requested
        };
        names.iter().map(|name| self.domain(name)).collect()
    }

    pub fn render_options(&self) -> crate::catalog::RenderOptions {
        crate::catalog::RenderOptions {
            wrap_width: if self.no_wrap {
                None
            } else {
                Some(crate::catalog::DEFAULT_WRAP_WIDTH)
            },
            include_locations: !self.no_location,
        }
    }
}

/// Load and parse the config file. Returns the default config if the file
/// doesn't exist.
pub fn load_config(config_path: &Path) -> Result<TransyncConfig> {
    if !config_path.exists() {
        return Ok(TransyncConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: TransyncConfig = toml::from_str(&content)
        .map_err(|error| SyncError::configuration(error.to_string()))
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        MATERIALIZED_CONFIG, Settings, StderrPolicy, ToolBackend, TransformKind, TransyncConfig,
        load_config, normalize_extensions,
    };
    use crate::error::classify;

    #[test]
    fn missing_config_file_yields_defaults() {
        let temp = tempdir().expect("tempdir");
        let config = load_config(&temp.path().join("absent.toml")).expect("load");
        assert_eq!(config, TransyncConfig::default());

        let settings = Settings::defaults(temp.path()).expect("settings");
        assert_eq!(settings.domains, vec!["django", "djangojs"]);
        assert_eq!(settings.ignore_patterns, vec!["CVS", ".*", "*~", "*.pyc"]);
        assert!(settings.make_backups);
        assert_eq!(settings.tools.backend, ToolBackend::Gettext);
        assert_eq!(settings.tools.stderr_policy, StderrPolicy::WarningsAllowed);

        let markup = settings.domain("django").expect("django");
        assert_eq!(markup.extensions, vec![".html", ".txt"]);
        assert_eq!(markup.source_extensions, vec![".py"]);
        assert_eq!(markup.transform, TransformKind::Templatize);
        let script = settings.domain("djangojs").expect("djangojs");
        assert_eq!(script.language, "Perl");
        assert_eq!(script.reference_domains, vec!["djangojs", "django"]);
    }

    #[test]
    fn materialized_config_parses_to_default_settings() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, MATERIALIZED_CONFIG).expect("write");
        let config = load_config(&path).expect("load");
        let settings = Settings::resolve(&config, temp.path(), |_| None).expect("resolve");
        assert_eq!(settings, Settings::defaults(temp.path()).expect("defaults"));
    }

    #[test]
    fn domain_tables_override_builtins_and_normalize_extensions() {
        let config: TransyncConfig = toml::from_str(
            r#"
[catalog]
domains = ["django"]
ignore_patterns = ["node_modules", "CVS"]
locale_paths = ["apps/shop/locale"]
no_wrap = true

[tools]
backend = "native"
stderr_policy = "strict"

[domains.django]
extensions = ["html, txt", ".xml", "py"]
keywords = ["gettext_noop"]
"#,
        )
        .expect("parse");
        let root = Path::new("/srv/site");
        let settings = Settings::resolve(&config, root, |_| None).expect("resolve");

        let markup = settings.domain("django").expect("django");
        assert_eq!(markup.extensions, vec![".html", ".txt", ".xml"]);
        assert_eq!(markup.source_extensions, vec![".py"]);
        assert_eq!(markup.keywords, vec!["gettext_noop"]);
        assert!(markup.needs_transform("base.xml"));
        assert!(markup.is_plain_source("views.py"));
        assert!(!markup.handles(".html"));

        assert_eq!(
            settings.ignore_patterns,
            vec!["CVS", ".*", "*~", "*.pyc", "node_modules"]
        );
        assert_eq!(settings.locale_paths, vec![root.join("apps/shop/locale")]);
        assert_eq!(settings.tools.backend, ToolBackend::Native);
        assert_eq!(settings.tools.stderr_policy, StderrPolicy::Strict);
        assert_eq!(settings.render_options().wrap_width, None);
    }

    #[test]
    fn env_backend_override_and_unknown_domain_are_configuration_errors() {
        let env = HashMap::from([("TRANSYNC_TOOL_BACKEND".to_string(), "native".to_string())]);
        let settings = Settings::resolve(&TransyncConfig::default(), Path::new("/p"), |key| {
            env.get(key).cloned()
        })
        .expect("resolve");
        assert_eq!(settings.tools.backend, ToolBackend::Native);

        let bad = HashMap::from([("TRANSYNC_TOOL_BACKEND".to_string(), "babel".to_string())]);
        let error = Settings::resolve(&TransyncConfig::default(), Path::new("/p"), |key| {
            bad.get(key).cloned()
        })
        .expect_err("must fail");
        assert_eq!(classify(&error).map(|e| e.kind()), Some("configuration"));

        let error = settings
            .select_domains(&["mobile".to_string()])
            .expect_err("unknown domain");
        assert_eq!(classify(&error).map(|e| e.kind()), Some("configuration"));
    }

    #[test]
    fn normalize_extensions_splits_and_dedupes() {
        let values = vec!["js, .jsx".to_string(), "js".to_string()];
        assert_eq!(normalize_extensions(&values), vec![".js", ".jsx"]);
    }
}
