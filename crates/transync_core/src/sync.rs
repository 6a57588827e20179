use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backup::snapshot;
use crate::catalog::{
    Catalog, Message, PLURAL_FORMS_PLACEHOLDER, current_header_timestamp, template_header,
    write_atomic,
};
use crate::config::Settings;
use crate::error::{SyncError, classify};
use crate::locale::{CatalogScope, enumerate_catalogs, select_locale_root};
use crate::merge::reference_plural_forms;
use crate::runtime::normalize_for_display;
use crate::store::{IngestStats, TranslationPolicy, TranslationStore};

#[derive(Debug, Clone, Serialize)]
pub struct IngestedCatalog {
    pub scope: CatalogScope,
    pub path: String,
    pub stats: IngestStats,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestFailure {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub catalogs: Vec<IngestedCatalog>,
    pub failures: Vec<IngestFailure>,
}

impl IngestReport {
    pub fn entry_count(&self) -> usize {
        self.catalogs.iter().map(|catalog| catalog.stats.entries).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompiledCatalog {
    pub scope: CatalogScope,
    pub path: String,
    pub entries: usize,
    pub written: bool,
    pub backup_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompileReport {
    pub catalogs: Vec<CompiledCatalog>,
}

impl CompileReport {
    pub fn written_count(&self) -> usize {
        self.catalogs.iter().filter(|catalog| catalog.written).count()
    }
}

/// Catalog roots kept in sync with the store: the root `make` writes into,
/// when one exists, followed by the configured extra locale paths.
pub fn synchronized_roots(project_root: &Path, settings: &Settings) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(root) = select_locale_root(project_root, settings.base_dir.as_deref()) {
        roots.push(root.path);
    }
    for path in &settings.locale_paths {
        if !roots.contains(path) {
            roots.push(path.clone());
        }
    }
    roots
}

/// Parses one catalog file and upserts its entries under `scope`.
pub fn store_to_db<S: TranslationStore + ?Sized>(
    store: &mut S,
    po_path: &Path,
    scope: &CatalogScope,
    policy: TranslationPolicy,
) -> Result<IngestStats> {
    let catalog = Catalog::read(po_path).map_err(|error| SyncError::Ingestion {
        path: normalize_for_display(po_path),
        message: format!("{error:#}"),
    })?;
    let stats = store
        .ingest(scope, &catalog.messages, policy)
        .with_context(|| format!("failed to store {}", normalize_for_display(po_path)))?;
    debug!(scope = %scope, entries = stats.entries, "ingested catalog");
    Ok(stats)
}

/// Final step of `make`: ingests every catalog under `roots`. A catalog that
/// cannot be parsed is reported and does not stop the others.
pub fn postprocess<S: TranslationStore + ?Sized>(
    store: &mut S,
    project_root: &Path,
    roots: &[PathBuf],
) -> Result<IngestReport> {
    ingest_roots(store, project_root, roots)
}

/// On-demand ingestion with the same per-file failure reporting.
pub fn load_from_po<S: TranslationStore + ?Sized>(
    store: &mut S,
    project_root: &Path,
    roots: &[PathBuf],
) -> Result<IngestReport> {
    ingest_roots(store, project_root, roots)
}

fn ingest_roots<S: TranslationStore + ?Sized>(
    store: &mut S,
    project_root: &Path,
    roots: &[PathBuf],
) -> Result<IngestReport> {
    let mut report = IngestReport::default();
    for root in roots {
        for location in enumerate_catalogs(project_root, root)? {
            match store_to_db(
                store,
                &location.path,
                &location.scope,
                TranslationPolicy::PreserveStored,
            ) {
                Ok(stats) => report.catalogs.push(IngestedCatalog {
                    scope: location.scope,
                    path: normalize_for_display(&location.path),
                    stats,
                }),
                Err(error) if matches!(classify(&error), Some(SyncError::Ingestion { .. })) => {
                    warn!(path = %location.path.display(), error = %format!("{error:#}"), "skipped catalog");
                    report.failures.push(IngestFailure {
                        path: normalize_for_display(&location.path),
                        message: format!("{error:#}"),
                    });
                }
                Err(error) => return Err(error),
            }
        }
    }
    info!(
        catalogs = report.catalogs.len(),
        entries = report.entry_count(),
        failures = report.failures.len(),
        "synchronized catalogs into store"
    );
    Ok(report)
}

fn default_header(settings: &Settings, scope: &CatalogScope) -> Message {
    let plural_forms = settings
        .reference_locale_dir
        .as_deref()
        .zip(settings.domain(&scope.domain).ok())
        .and_then(|(dir, domain)| reference_plural_forms(dir, &scope.language, domain))
        .unwrap_or_else(|| PLURAL_FORMS_PLACEHOLDER.to_string());
    let mut header = template_header(
        &current_header_timestamp(),
        "UTF-8",
        &scope.language,
        Some(&plural_forms),
    );
    header.remove_flag("fuzzy");
    header
}

/// Renders the store's records back into catalog files, one per scope of
/// `language` (or of every language).
pub fn update_po_from_db<S: TranslationStore + ?Sized>(
    store: &mut S,
    project_root: &Path,
    settings: &Settings,
    language: Option<&str>,
) -> Result<CompileReport> {
    let mut report = CompileReport::default();
    let options = settings.render_options();

    for scope in store.catalog_scopes(language)? {
        let entries = store.catalog_entries(&scope)?;
        let path = scope.catalog_path(project_root);
        let existing = if path.exists() {
            Some(
                fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
            )
        } else {
            None
        };
        let header = match &existing {
            Some(text) => {
                let parsed = Catalog::parse(text).map_err(|error| SyncError::Ingestion {
                    path: normalize_for_display(&path),
                    message: format!("{error:#}"),
                })?;
                parsed.header.unwrap_or_else(|| default_header(settings, &scope))
            }
            None => default_header(settings, &scope),
        };

        let mut catalog = Catalog {
            header: Some(header),
            messages: entries.iter().map(|entry| entry.to_message()).collect(),
        };
        let rendered = catalog.render(&options);
        let mut compiled = CompiledCatalog {
            scope: scope.clone(),
            path: normalize_for_display(&path),
            entries: entries.len(),
            written: false,
            backup_id: None,
        };

        if existing.as_deref() != Some(rendered.as_str()) {
            if settings.make_backups
                && let Some(previous) = &existing
            {
                compiled.backup_id = Some(snapshot(store, &scope, previous)?.id);
            }
            catalog.set_header_field("PO-Revision-Date", &current_header_timestamp());
            write_atomic(&path, &catalog.render(&options))?;
            compiled.written = true;
            info!(scope = %scope, path = %path.display(), "rendered catalog from store");
        } else {
            debug!(scope = %scope, "catalog already matches store");
        }
        store.clear_dirty(&scope)?;
        report.catalogs.push(compiled);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{load_from_po, postprocess, store_to_db, synchronized_roots, update_po_from_db};
    use crate::catalog::{Catalog, Message, RenderOptions};
    use crate::config::Settings;
    use crate::locale::CatalogScope;
    use crate::store::{SqliteStore, TranslationPolicy, TranslationStore};

    fn write_file(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn sample_catalog() -> String {
        let mut catalog = Catalog::default();
        catalog.set_header_field("Language", "fr");
        catalog.set_header_field("Content-Type", "text/plain; charset=UTF-8");
        let mut save = Message::new("Save");
        save.references = vec!["app/views.py:1".to_string()];
        save.msgstr = vec!["Enregistrer".to_string()];
        let mut cancel = Message::new("Cancel");
        cancel.references = vec!["app/views.py:2".to_string()];
        catalog.messages = vec![save, cancel];
        catalog.render(&RenderOptions::default())
    }

    #[test]
    fn unchanged_store_leaves_catalog_alone_and_edits_are_written_with_backup() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path();
        let po = project.join("locale/fr/LC_MESSAGES/django.po");
        write_file(&po, &sample_catalog());
        let settings = Settings::defaults(project).expect("settings");
        let mut store = SqliteStore::open(&project.join(".transync/data/translations.db"))
            .expect("store");
        let scope = CatalogScope::new("fr", "django", "locale");
        store_to_db(&mut store, &po, &scope, TranslationPolicy::PreserveStored).expect("ingest");

        let report = update_po_from_db(&mut store, project, &settings, Some("fr")).expect("compile");
        assert_eq!(report.written_count(), 0);
        assert_eq!(fs::read_to_string(&po).expect("read"), sample_catalog());

        let cancel = store
            .catalog_entries(&scope)
            .expect("entries")
            .into_iter()
            .find(|entry| entry.original == "Cancel")
            .expect("cancel");
        store
            .set_translation(cancel.id, "Annuler", None)
            .expect("edit");
        let report = update_po_from_db(&mut store, project, &settings, None).expect("compile");
        assert_eq!(report.written_count(), 1);
        let backup_id = report.catalogs[0].backup_id.expect("backup taken");
        let backup = store.load_backup(backup_id).expect("load").expect("present");
        assert_eq!(backup.content, sample_catalog());

        let written = Catalog::read(&po).expect("read");
        assert_eq!(
            written.find(None, "Cancel").map(|m| m.translation()),
            Some("Annuler")
        );
        assert!(written.header_field("PO-Revision-Date").is_some());
        assert!(
            store
                .catalog_entries(&scope)
                .expect("entries")
                .iter()
                .all(|entry| !entry.is_dirty)
        );
    }

    #[test]
    fn missing_catalog_is_rendered_with_default_header() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path().join("project");
        let reference = temp.path().join("reference");
        write_file(
            &reference.join("de/LC_MESSAGES/django.po"),
            "msgid \"\"\nmsgstr \"\"\n\"Plural-Forms: nplurals=2; plural=(n != 1);\\n\"\n",
        );
        let mut settings = Settings::defaults(&project).expect("settings");
        settings.reference_locale_dir = Some(reference);
        let mut store = SqliteStore::open(&temp.path().join("translations.db")).expect("store");
        let mut hello = Message::new("Hello");
        hello.msgstr = vec!["Hallo".to_string()];
        store
            .ingest(
                &CatalogScope::new("de", "django", "locale"),
                &[hello],
                TranslationPolicy::PreserveStored,
            )
            .expect("ingest");

        let report = update_po_from_db(&mut store, &project, &settings, None).expect("compile");
        assert_eq!(report.catalogs.len(), 1);
        assert_eq!(report.catalogs[0].backup_id, None);
        let written = Catalog::read(&project.join("locale/de/LC_MESSAGES/django.po")).expect("read");
        assert_eq!(written.header_field("Language").as_deref(), Some("de"));
        assert_eq!(
            written.header_field("Plural-Forms").as_deref(),
            Some("nplurals=2; plural=(n != 1);")
        );
        assert_eq!(
            written.find(None, "Hello").map(|m| m.translation()),
            Some("Hallo")
        );
    }

    #[test]
    fn broken_catalog_is_reported_without_blocking_the_others() {
        let temp = tempdir().expect("tempdir");
        let project = temp.path();
        write_file(
            &project.join("locale/de/LC_MESSAGES/django.po"),
            "msgid \"Broken\nmsgstr \"\"\n",
        );
        write_file(
            &project.join("apps/shop/locale/fr/LC_MESSAGES/django.po"),
            &sample_catalog(),
        );
        let mut settings = Settings::defaults(project).expect("settings");
        settings.locale_paths = vec![project.join("apps/shop/locale")];
        let roots = synchronized_roots(project, &settings);
        assert_eq!(roots.len(), 2);

        let mut store = SqliteStore::open(&project.join("translations.db")).expect("store");
        let report = postprocess(&mut store, project, &roots).expect("postprocess");
        assert_eq!(report.catalogs.len(), 1);
        assert_eq!(report.entry_count(), 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].path.ends_with("locale/de/LC_MESSAGES/django.po"));
        let shop = CatalogScope::new("fr", "django", "apps/shop/locale");
        assert_eq!(store.catalog_entries(&shop).expect("entries").len(), 2);

        let reloaded = load_from_po(&mut store, project, &roots).expect("load");
        assert_eq!(reloaded.catalogs.len(), 1);
        assert_eq!(reloaded.failures, report.failures);
    }
}
