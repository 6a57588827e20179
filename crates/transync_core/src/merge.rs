use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{
    Catalog, seed_plural_forms, strip_obsolete_blocks, without_creation_date, write_atomic,
};
use crate::config::DomainSpec;
use crate::extract::IntermediateCatalog;
use crate::locale::{LocaleRoot, RootKind, catalog_path};
use crate::tools::CatalogTools;

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub keep_pot: bool,
    pub no_obsolete: bool,
    pub reference_locale_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogChange {
    Created,
    Updated,
    Unchanged,
    NoMessages,
}

impl CatalogChange {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
            Self::NoMessages => "no_messages",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogUpdate {
    pub language: String,
    pub domain: String,
    pub path: PathBuf,
    pub change: CatalogChange,
    pub plural_forms_seeded: bool,
}

/// Removes the transient template when the merge step ends, however it ends.
struct TemplateGuard {
    path: PathBuf,
    keep: bool,
}

impl Drop for TemplateGuard {
    fn drop(&mut self) {
        if self.keep || !self.path.exists() {
            return;
        }
        if let Err(error) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %error, "failed to remove template");
        }
    }
}

/// `Plural-Forms` value of the first reference catalog found for the
/// language among the domain's reference domains.
pub fn reference_plural_forms(
    reference_dir: &Path,
    language: &str,
    domain: &DomainSpec,
) -> Option<String> {
    for reference_domain in &domain.reference_domains {
        let path = catalog_path(reference_dir, language, reference_domain, "po");
        if !path.is_file() {
            continue;
        }
        match Catalog::read(&path) {
            Ok(catalog) => {
                if let Some(value) = catalog.header_field("Plural-Forms") {
                    return Some(value);
                }
            }
            Err(error) => {
                debug!(path = %path.display(), error = %format!("{error:#}"), "unreadable reference catalog");
            }
        }
    }
    None
}

pub struct MergeEngine<'a> {
    tools: &'a dyn CatalogTools,
    options: MergeOptions,
}

impl<'a> MergeEngine<'a> {
    pub fn new(tools: &'a dyn CatalogTools, options: MergeOptions) -> Self {
        Self { tools, options }
    }

    /// Deduplicates `intermediate`, merges it into the language's catalog
    /// under `root` and commits the result.
    pub fn write_catalog(
        &self,
        root: &LocaleRoot,
        language: &str,
        domain: &DomainSpec,
        intermediate: &IntermediateCatalog,
    ) -> Result<CatalogUpdate> {
        let catalog = root.catalog_path(language, &domain.name);
        let mut update = CatalogUpdate {
            language: language.to_string(),
            domain: domain.name.clone(),
            path: catalog.clone(),
            change: CatalogChange::NoMessages,
            plural_forms_seeded: false,
        };
        if intermediate.is_empty() {
            debug!(language, domain = %domain.name, "no messages extracted");
            return Ok(update);
        }

        let template = root.template_path(language, &domain.name);
        let parent = template
            .parent()
            .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", template.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
        if template.exists() {
            fs::remove_file(&template)
                .with_context(|| format!("failed to remove stale {}", template.display()))?;
        }
        let _guard = TemplateGuard {
            path: template.clone(),
            keep: self.options.keep_pot,
        };
        fs::write(&template, &intermediate.text)
            .with_context(|| format!("failed to write {}", template.display()))?;

        let deduplicated = self.tools.uniq(&template)?;
        fs::write(&template, &deduplicated)
            .with_context(|| format!("failed to write {}", template.display()))?;

        let existing = if catalog.exists() {
            Some(
                fs::read_to_string(&catalog)
                    .with_context(|| format!("failed to read {}", catalog.display()))?,
            )
        } else {
            None
        };

        let mut merged = match existing {
            Some(_) => self.tools.merge(&catalog, &template)?,
            None => deduplicated,
        };
        if existing.is_none()
            && root.kind != RootKind::Framework
            && let Some(reference_dir) = &self.options.reference_locale_dir
            && let Some(plural_forms) = reference_plural_forms(reference_dir, language, domain)
        {
            merged = seed_plural_forms(&merged, &plural_forms);
            update.plural_forms_seeded = true;
        }
        if self.options.no_obsolete {
            merged = strip_obsolete_blocks(&merged);
        }

        update.change = match &existing {
            Some(previous) if without_creation_date(previous) == without_creation_date(&merged) => {
                CatalogChange::Unchanged
            }
            Some(_) => CatalogChange::Updated,
            None => CatalogChange::Created,
        };
        if update.change != CatalogChange::Unchanged {
            write_atomic(&catalog, &merged)?;
        }
        info!(
            language,
            domain = %domain.name,
            change = update.change.as_str(),
            path = %catalog.display(),
            "processed catalog"
        );
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{CatalogChange, MergeEngine, MergeOptions};
    use crate::catalog::{Catalog, RenderOptions};
    use crate::config::{Settings, ToolSettings};
    use crate::extract::IntermediateCatalog;
    use crate::locale::{LocaleRoot, RootKind};
    use crate::native::NativeTools;

    fn write_file(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn intermediate(created: &str, body: &str) -> IntermediateCatalog {
        IntermediateCatalog {
            domain: "django".to_string(),
            text: format!(
                "#, fuzzy\nmsgid \"\"\nmsgstr \"\"\n\"POT-Creation-Date: {created}\\n\"\n\"Content-Type: text/plain; charset=UTF-8\\n\"\n\"Plural-Forms: nplurals=INTEGER; plural=EXPRESSION;\\n\"\n\n{body}"
            ),
            files_processed: 1,
            files_with_messages: 1,
        }
    }

    #[test]
    fn new_catalog_is_created_with_seeded_plural_forms_and_template_removed() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        let reference = temp.path().join("reference");
        write_file(
            &reference.join("fr/LC_MESSAGES/django.po"),
            "msgid \"\"\nmsgstr \"\"\n\"Plural-Forms: nplurals=2; plural=(n > 1);\\n\"\n",
        );
        fs::create_dir_all(project.join("locale")).expect("locale");
        let root = LocaleRoot::new(&project, project.join("locale"), RootKind::Application);

        let settings = Settings::defaults(&project).expect("settings");
        let tools = NativeTools::new(ToolSettings::default(), RenderOptions::default());
        let engine = MergeEngine::new(
            &tools,
            MergeOptions {
                reference_locale_dir: Some(reference),
                ..MergeOptions::default()
            },
        );
        let update = engine
            .write_catalog(
                &root,
                "fr",
                settings.domain("django").expect("django"),
                &intermediate(
                    "2026-10-18 10:00+0000",
                    "#: a.py:1\nmsgid \"Save\"\nmsgstr \"\"\n\n#: b.py:2\nmsgid \"Save\"\nmsgstr \"\"\n",
                ),
            )
            .expect("write");

        assert_eq!(update.change, CatalogChange::Created);
        assert!(update.plural_forms_seeded);
        assert!(!root.template_path("fr", "django").exists());
        let catalog = Catalog::read(&update.path).expect("read");
        assert_eq!(catalog.messages.len(), 1);
        assert_eq!(catalog.messages[0].references, vec!["a.py:1", "b.py:2"]);
        assert_eq!(
            catalog.header_field("Plural-Forms").as_deref(),
            Some("nplurals=2; plural=(n > 1);")
        );
    }

    #[test]
    fn framework_root_is_not_seeded_and_keep_pot_keeps_template() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        let reference = temp.path().join("reference");
        write_file(
            &reference.join("de/LC_MESSAGES/django.po"),
            "msgid \"\"\nmsgstr \"\"\n\"Plural-Forms: nplurals=2; plural=(n != 1);\\n\"\n",
        );
        let root = LocaleRoot::new(&project, project.join("conf/locale"), RootKind::Framework);
        let settings = Settings::defaults(&project).expect("settings");
        let tools = NativeTools::new(ToolSettings::default(), RenderOptions::default());
        let engine = MergeEngine::new(
            &tools,
            MergeOptions {
                keep_pot: true,
                reference_locale_dir: Some(reference),
                ..MergeOptions::default()
            },
        );
        let update = engine
            .write_catalog(
                &root,
                "de",
                settings.domain("django").expect("django"),
                &intermediate("2026-10-18 10:00+0000", "msgid \"Hi\"\nmsgstr \"\"\n"),
            )
            .expect("write");
        assert!(!update.plural_forms_seeded);
        assert!(root.template_path("de", "django").exists());
        let text = fs::read_to_string(&update.path).expect("read");
        assert!(text.contains("nplurals=INTEGER"));
    }

    #[test]
    fn rerun_with_only_a_new_creation_date_leaves_catalog_untouched() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        let root = LocaleRoot::new(&project, project.join("locale"), RootKind::Application);
        let settings = Settings::defaults(&project).expect("settings");
        let domain = settings.domain("django").expect("django");
        let tools = NativeTools::new(ToolSettings::default(), RenderOptions::default());
        let engine = MergeEngine::new(&tools, MergeOptions::default());
        let body = "#: a.py:1\nmsgid \"Save\"\nmsgstr \"\"\n";

        let first = engine
            .write_catalog(&root, "fr", domain, &intermediate("2026-10-18 10:00+0000", body))
            .expect("first");
        assert_eq!(first.change, CatalogChange::Created);
        let before = fs::read_to_string(&first.path).expect("read");

        let second = engine
            .write_catalog(&root, "fr", domain, &intermediate("2026-10-19 08:30+0000", body))
            .expect("second");
        assert_eq!(second.change, CatalogChange::Unchanged);
        assert_eq!(fs::read_to_string(&second.path).expect("read"), before);
    }

    #[test]
    fn removed_messages_become_obsolete_or_are_stripped() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        let root = LocaleRoot::new(&project, project.join("locale"), RootKind::Application);
        write_file(
            &root.catalog_path("fr", "django"),
            "msgid \"\"\nmsgstr \"\"\n\"Content-Type: text/plain; charset=UTF-8\\n\"\n\nmsgid \"Save\"\nmsgstr \"Enregistrer\"\n\nmsgid \"Old\"\nmsgstr \"Ancien\"\n",
        );
        let settings = Settings::defaults(&project).expect("settings");
        let domain = settings.domain("django").expect("django");
        let tools = NativeTools::new(ToolSettings::default(), RenderOptions::default());
        let body = "#: a.py:1\nmsgid \"Save\"\nmsgstr \"\"\n";

        let keep = MergeEngine::new(&tools, MergeOptions::default())
            .write_catalog(&root, "fr", domain, &intermediate("2026-10-18 10:00+0000", body))
            .expect("merge");
        assert_eq!(keep.change, CatalogChange::Updated);
        let text = fs::read_to_string(&keep.path).expect("read");
        assert!(text.contains("#~ msgid \"Old\"\n#~ msgstr \"Ancien\"\n"));
        assert!(text.contains("msgid \"Save\"\nmsgstr \"Enregistrer\"\n"));

        let strip = MergeEngine::new(
            &tools,
            MergeOptions {
                no_obsolete: true,
                ..MergeOptions::default()
            },
        )
        .write_catalog(&root, "fr", domain, &intermediate("2026-10-18 10:00+0000", body))
        .expect("merge stripped");
        let text = fs::read_to_string(&strip.path).expect("read");
        assert!(!text.contains("#~"));
        assert!(text.contains("msgstr \"Enregistrer\""));
    }

    #[test]
    fn empty_intermediate_writes_nothing() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        let root = LocaleRoot::new(&project, project.join("locale"), RootKind::Application);
        let settings = Settings::defaults(&project).expect("settings");
        let tools = NativeTools::new(ToolSettings::default(), RenderOptions::default());
        let update = MergeEngine::new(&tools, MergeOptions::default())
            .write_catalog(
                &root,
                "fr",
                settings.domain("django").expect("django"),
                &IntermediateCatalog::default(),
            )
            .expect("noop");
        assert_eq!(update.change, CatalogChange::NoMessages);
        assert!(!update.path.exists());
    }
}
