use std::env;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::backup::{self, RestoreReport};
use crate::config::{Settings, ToolBackend, load_config};
use crate::extract::Extractor;
use crate::lock::{LockStatus, RunGuard, lock_status};
use crate::locale::{discover_languages, is_valid_locale_name, select_locale_root};
use crate::merge::{CatalogUpdate, MergeEngine, MergeOptions};
use crate::native::NativeTools;
use crate::process::SystemRunner;
use crate::runtime::{ResolvedPaths, normalize_for_display};
use crate::scanner::{ScanOptions, scan_source_tree};
use crate::store::{BackupSummary, EntryFilter, SqliteStore, StoredEntry, TranslationStore};
use crate::sync::{
    CompileReport, IngestReport, load_from_po, postprocess, synchronized_roots, update_po_from_db,
};
use crate::tools::{CatalogTools, GettextTools};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LocaleSelection {
    /// Every locale directory under the selected root.
    #[default]
    All,
    Only(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct MakeRequest {
    pub domains: Vec<String>,
    pub locales: LocaleSelection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum RunOutcome<T> {
    Completed(T),
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct DomainReport {
    pub domain: String,
    pub files_processed: usize,
    pub files_with_messages: usize,
    pub catalogs: Vec<CatalogUpdate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MakeReport {
    pub locale_root: String,
    pub root_kind: String,
    pub toolchain: String,
    pub languages: Vec<String>,
    pub skipped_locales: Vec<String>,
    pub backups: usize,
    pub files_scanned: usize,
    pub domains: Vec<DomainReport>,
    pub ingest: IngestReport,
}

pub fn build_tools(settings: &Settings) -> Box<dyn CatalogTools> {
    match settings.tools.backend {
        ToolBackend::Gettext => Box::new(GettextTools::new(
            SystemRunner,
            settings.tools.clone(),
            settings.render_options(),
        )),
        ToolBackend::Native => Box::new(NativeTools::new(
            settings.tools.clone(),
            settings.render_options(),
        )),
    }
}

/// Entry point for every command: holds the resolved layout, the settings
/// and the toolchain they select.
pub struct Manager {
    paths: ResolvedPaths,
    settings: Settings,
    tools: Box<dyn CatalogTools>,
}

impl Manager {
    pub fn open(paths: ResolvedPaths) -> Result<Self> {
        let config = load_config(&paths.config_path)?;
        let settings = Settings::resolve(&config, &paths.project_root, |key| env::var(key).ok())?;
        let tools = build_tools(&settings);
        Ok(Self::with_tools(paths, settings, tools))
    }

    pub fn with_tools(
        paths: ResolvedPaths,
        settings: Settings,
        tools: Box<dyn CatalogTools>,
    ) -> Self {
        Self {
            paths,
            settings,
            tools,
        }
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.paths.db_path)
    }

    /// Extracts every selected domain from the source tree, merges it into
    /// each selected locale's catalog and ingests the results.
    pub fn make(&self, request: &MakeRequest) -> Result<RunOutcome<MakeReport>> {
        let Some(_guard) = RunGuard::try_acquire(&self.paths.lock_path)? else {
            warn!("make is already running");
            return Ok(RunOutcome::AlreadyRunning);
        };
        let project_root = &self.paths.project_root;

        let root = select_locale_root(project_root, self.settings.base_dir.as_deref())?;
        let domains = self.settings.select_domains(&request.domains)?;
        let toolchain = self.tools.check_version()?;

        let (languages, skipped_locales) = self.select_languages(&request.locales, &root.path)?;

        let roots = synchronized_roots(project_root, &self.settings);
        let mut store = self.open_store()?;
        let backups = if self.settings.make_backups {
            backup::backup_po_to_db(&mut store, project_root, &roots)?.len()
        } else {
            0
        };

        let files = scan_source_tree(
            project_root,
            &ScanOptions {
                ignore_patterns: self.settings.ignore_patterns.clone(),
                follow_symlinks: self.settings.follow_symlinks,
            },
        )?;
        let extractor = Extractor::new(self.tools.as_ref(), project_root);
        let engine = MergeEngine::new(
            self.tools.as_ref(),
            MergeOptions {
                keep_pot: self.settings.keep_pot,
                no_obsolete: self.settings.no_obsolete,
                reference_locale_dir: self.settings.reference_locale_dir.clone(),
            },
        );

        let mut domain_reports = Vec::with_capacity(domains.len());
        for domain in domains {
            let intermediate = extractor.extract_domain(domain, &files)?;
            let mut catalogs = Vec::with_capacity(languages.len());
            for language in &languages {
                catalogs.push(engine.write_catalog(&root, language, domain, &intermediate)?);
            }
            domain_reports.push(DomainReport {
                domain: domain.name.clone(),
                files_processed: intermediate.files_processed,
                files_with_messages: intermediate.files_with_messages,
                catalogs,
            });
        }

        let ingest = postprocess(&mut store, project_root, &roots)?;
        info!(
            root = %normalize_for_display(&root.path),
            languages = languages.len(),
            files = files.len(),
            "make finished"
        );
        Ok(RunOutcome::Completed(MakeReport {
            locale_root: normalize_for_display(&root.path),
            root_kind: root.kind.as_str().to_string(),
            toolchain,
            languages,
            skipped_locales,
            backups,
            files_scanned: files.len(),
            domains: domain_reports,
            ingest,
        }))
    }

    fn select_languages(
        &self,
        selection: &LocaleSelection,
        root: &Path,
    ) -> Result<(Vec<String>, Vec<String>)> {
        let candidates = match selection {
            LocaleSelection::Only(locales) => locales.clone(),
            LocaleSelection::All => {
                let mut found = discover_languages(root)?;
                for language in &self.settings.languages {
                    if !found.contains(language) {
                        found.push(language.clone());
                    }
                }
                found.sort();
                found
            }
        };
        let mut selected = Vec::new();
        let mut skipped = Vec::new();
        for locale in candidates {
            if is_valid_locale_name(&locale) {
                selected.push(locale);
            } else {
                let suggestion = locale.replace('-', "_");
                warn!(locale = %locale, suggestion = %suggestion, "invalid locale name, skipping");
                skipped.push(locale);
            }
        }
        Ok((selected, skipped))
    }

    /// Renders the store back into catalog files.
    pub fn compile(&self, language: Option<&str>) -> Result<RunOutcome<CompileReport>> {
        let Some(_guard) = RunGuard::try_acquire(&self.paths.lock_path)? else {
            warn!("a run is already in progress");
            return Ok(RunOutcome::AlreadyRunning);
        };
        let mut store = self.open_store()?;
        let report = update_po_from_db(
            &mut store,
            &self.paths.project_root,
            &self.settings,
            language,
        )?;
        Ok(RunOutcome::Completed(report))
    }

    /// Reads every catalog into the store. Guarded so it never sees a
    /// catalog half way through a `make` or `compile` write.
    pub fn load_from_po(&self) -> Result<RunOutcome<IngestReport>> {
        let Some(_guard) = RunGuard::try_acquire(&self.paths.lock_path)? else {
            warn!("a run is already in progress");
            return Ok(RunOutcome::AlreadyRunning);
        };
        let mut store = self.open_store()?;
        let roots = synchronized_roots(&self.paths.project_root, &self.settings);
        Ok(RunOutcome::Completed(load_from_po(
            &mut store,
            &self.paths.project_root,
            &roots,
        )?))
    }

    pub fn status(&self) -> Result<LockStatus> {
        lock_status(&self.paths.lock_path)
    }

    pub fn backup_all(&self) -> Result<RunOutcome<Vec<BackupSummary>>> {
        let Some(_guard) = RunGuard::try_acquire(&self.paths.lock_path)? else {
            warn!("a run is already in progress");
            return Ok(RunOutcome::AlreadyRunning);
        };
        let mut store = self.open_store()?;
        let roots = synchronized_roots(&self.paths.project_root, &self.settings);
        Ok(RunOutcome::Completed(backup::backup_po_to_db(
            &mut store,
            &self.paths.project_root,
            &roots,
        )?))
    }

    pub fn list_backups(&self) -> Result<Vec<BackupSummary>> {
        backup::list(&self.open_store()?)
    }

    pub fn restore(&self, id: i64) -> Result<RunOutcome<RestoreReport>> {
        let Some(_guard) = RunGuard::try_acquire(&self.paths.lock_path)? else {
            return Ok(RunOutcome::AlreadyRunning);
        };
        let mut store = self.open_store()?;
        Ok(RunOutcome::Completed(backup::restore(
            &mut store,
            &self.paths.project_root,
            id,
        )?))
    }

    pub fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<StoredEntry>> {
        self.open_store()?.list_entries(filter)
    }

    /// The edit path for translators: stores the text and marks the entry
    /// dirty until the next compile renders it.
    pub fn set_translation(
        &self,
        id: i64,
        translation: &str,
        plural_translations: Option<&[String]>,
    ) -> Result<StoredEntry> {
        self.open_store()?
            .set_translation(id, translation, plural_translations)
    }
}
