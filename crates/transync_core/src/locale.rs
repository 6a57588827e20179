use std::fmt;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::runtime::normalize_for_display;

pub const MESSAGES_DIR: &str = "LC_MESSAGES";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RootKind {
    /// `<project>/conf/locale`: the catalogs of the framework itself.
    Framework,
    Application,
    Fallback,
}

impl RootKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Framework => "framework",
            Self::Application => "application",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocaleRoot {
    pub path: PathBuf,
    pub kind: RootKind,
    pub parent_dir: String,
}

impl LocaleRoot {
    pub fn new(project_root: &Path, path: PathBuf, kind: RootKind) -> Self {
        let parent_dir = locale_parent_dir(project_root, &path);
        Self {
            path,
            kind,
            parent_dir,
        }
    }

    pub fn catalog_path(&self, language: &str, domain: &str) -> PathBuf {
        catalog_path(&self.path, language, domain, "po")
    }

    pub fn template_path(&self, language: &str, domain: &str) -> PathBuf {
        catalog_path(&self.path, language, domain, "pot")
    }
}

/// Identity of one catalog file, and of the store records rendered into it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CatalogScope {
    pub language: String,
    pub domain: String,
    pub locale_parent_dir: String,
}

impl CatalogScope {
    pub fn new(
        language: impl Into<String>,
        domain: impl Into<String>,
        locale_parent_dir: impl Into<String>,
    ) -> Self {
        Self {
            language: language.into(),
            domain: domain.into(),
            locale_parent_dir: locale_parent_dir.into(),
        }
    }

    pub fn catalog_path(&self, project_root: &Path) -> PathBuf {
        let root = resolve_parent_dir(project_root, &self.locale_parent_dir);
        catalog_path(&root, &self.language, &self.domain, "po")
    }
}

impl fmt::Display for CatalogScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.locale_parent_dir, self.language, self.domain
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogLocation {
    pub scope: CatalogScope,
    pub path: PathBuf,
}

pub fn catalog_path(root: &Path, language: &str, domain: &str, extension: &str) -> PathBuf {
    root.join(language)
        .join(MESSAGES_DIR)
        .join(format!("{domain}.{extension}"))
}

/// Picks the catalog root a `make` run writes into.
pub fn select_locale_root(project_root: &Path, base_dir: Option<&Path>) -> Result<LocaleRoot> {
    let framework = project_root.join("conf").join("locale");
    if framework.is_dir() {
        return Ok(LocaleRoot::new(project_root, framework, RootKind::Framework));
    }
    let application = project_root.join("locale");
    if application.is_dir() {
        return Ok(LocaleRoot::new(
            project_root,
            application,
            RootKind::Application,
        ));
    }
    if let Some(base_dir) = base_dir {
        let fallback = base_dir.join("locale");
        if fallback.is_dir() {
            return Ok(LocaleRoot::new(project_root, fallback, RootKind::Fallback));
        }
    }
    Err(SyncError::configuration(format!(
        "no locale directory found under {}; create `locale/` (or `conf/locale/`) or set catalog.base_dir",
        normalize_for_display(project_root)
    ))
    .into())
}

/// Catalog root expressed relative to the project root, `/`-separated.
/// Roots outside the project keep their absolute form.
pub fn locale_parent_dir(project_root: &Path, root: &Path) -> String {
    match root.strip_prefix(project_root) {
        Ok(relative) if relative.as_os_str().is_empty() => ".".to_string(),
        Ok(relative) => normalize_for_display(relative),
        Err(_) => normalize_for_display(root),
    }
}

pub fn resolve_parent_dir(project_root: &Path, parent_dir: &str) -> PathBuf {
    let path = Path::new(parent_dir);
    if path.is_absolute() {
        path.to_path_buf()
    } else if parent_dir == "." {
        project_root.to_path_buf()
    } else {
        project_root.join(path)
    }
}

/// Language directories present under a catalog root, sorted.
pub fn discover_languages(root: &Path) -> Result<Vec<String>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut languages = Vec::new();
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("failed to read {}", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", root.display()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        languages.push(name);
    }
    languages.sort();
    Ok(languages)
}

/// Locale directory names use `ll` or `ll_CC` shapes; `pt-br` style names
/// are language codes, not locale names.
pub fn is_valid_locale_name(name: &str) -> bool {
    let (language, rest) = match name.split_once('_') {
        Some((language, rest)) => (language, Some(rest)),
        None => (name, None),
    };
    let language_ok = (2..=3).contains(&language.len())
        && language.chars().all(|c| c.is_ascii_lowercase());
    let rest_ok = match rest {
        None => true,
        Some(rest) => {
            let (region, modifier) = match rest.split_once('@') {
                Some((region, modifier)) => (region, Some(modifier)),
                None => (rest, None),
            };
            !region.is_empty()
                && region.chars().all(|c| c.is_ascii_alphanumeric())
                && region.chars().next().is_some_and(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
                && modifier.is_none_or(|modifier| !modifier.is_empty())
        }
    };
    language_ok && rest_ok && !name.contains('-')
}

/// Every `<lang>/LC_MESSAGES/<domain>.po` under `root`, sorted by path.
pub fn enumerate_catalogs(project_root: &Path, root: &Path) -> Result<Vec<CatalogLocation>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let parent_dir = locale_parent_dir(project_root, root);
    let mut out = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("po") {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let parts: Vec<&str> = relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(value) => value.to_str(),
                _ => None,
            })
            .collect();
        let [language, messages_dir, file_name] = parts.as_slice() else {
            continue;
        };
        if *messages_dir != MESSAGES_DIR {
            continue;
        }
        let Some(domain) = file_name.strip_suffix(".po") else {
            continue;
        };
        out.push(CatalogLocation {
            scope: CatalogScope::new(*language, domain, parent_dir.clone()),
            path: path.to_path_buf(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        CatalogScope, RootKind, discover_languages, enumerate_catalogs, is_valid_locale_name,
        locale_parent_dir, select_locale_root,
    };
    use crate::error::classify;

    fn write_file(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    #[test]
    fn select_locale_root_prefers_framework_then_application_then_base_dir() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        let base = temp.path().join("base");
        fs::create_dir_all(base.join("locale")).expect("base locale");
        fs::create_dir_all(&project).expect("project");

        let root = select_locale_root(&project, Some(&base)).expect("fallback");
        assert_eq!(root.kind, RootKind::Fallback);
        assert_eq!(root.path, base.join("locale"));

        fs::create_dir_all(project.join("locale")).expect("app locale");
        let root = select_locale_root(&project, Some(&base)).expect("application");
        assert_eq!(root.kind, RootKind::Application);
        assert_eq!(root.parent_dir, "locale");

        fs::create_dir_all(project.join("conf").join("locale")).expect("framework locale");
        let root = select_locale_root(&project, Some(&base)).expect("framework");
        assert_eq!(root.kind, RootKind::Framework);
        assert_eq!(root.parent_dir, "conf/locale");
    }

    #[test]
    fn select_locale_root_without_candidates_is_configuration_error() {
        let temp = tempdir().expect("tempdir");
        let error = select_locale_root(temp.path(), None).expect_err("must fail");
        assert_eq!(classify(&error).map(|e| e.kind()), Some("configuration"));
    }

    #[test]
    fn locale_parent_dir_is_relative_when_inside_project() {
        let project = Path::new("/srv/site");
        assert_eq!(
            locale_parent_dir(project, Path::new("/srv/site/apps/shop/locale")),
            "apps/shop/locale"
        );
        assert_eq!(
            locale_parent_dir(project, Path::new("/opt/shared/locale")),
            "/opt/shared/locale"
        );
    }

    #[test]
    fn enumerate_catalogs_lists_po_files_by_scope() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path();
        let root = project.join("locale");
        write_file(&root.join("fr/LC_MESSAGES/django.po"), "");
        write_file(&root.join("fr/LC_MESSAGES/djangojs.po"), "");
        write_file(&root.join("de/LC_MESSAGES/django.po"), "");
        write_file(&root.join("de/LC_MESSAGES/django.pot"), "");
        write_file(&root.join("de/other/django.po"), "");

        let catalogs = enumerate_catalogs(project, &root).expect("enumerate");
        let scopes: Vec<CatalogScope> = catalogs.into_iter().map(|c| c.scope).collect();
        assert_eq!(
            scopes,
            vec![
                CatalogScope::new("de", "django", "locale"),
                CatalogScope::new("fr", "django", "locale"),
                CatalogScope::new("fr", "djangojs", "locale"),
            ]
        );
        assert_eq!(
            discover_languages(&root).expect("languages"),
            vec!["de", "fr"]
        );
    }

    #[test]
    fn locale_names_follow_ll_cc_shape() {
        assert!(is_valid_locale_name("fr"));
        assert!(is_valid_locale_name("pt_BR"));
        assert!(is_valid_locale_name("sr_Latn"));
        assert!(is_valid_locale_name("ca_ES@valencia"));
        assert!(!is_valid_locale_name("pt-br"));
        assert!(!is_valid_locale_name("PT"));
        assert!(!is_valid_locale_name("pt_br"));
    }
}
