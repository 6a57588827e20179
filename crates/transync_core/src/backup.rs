use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::write_atomic;
use crate::error::SyncError;
use crate::locale::{CatalogScope, enumerate_catalogs};
use crate::runtime::normalize_for_display;
use crate::store::{BackupSummary, IngestStats, TranslationPolicy, TranslationStore};
use crate::sync::store_to_db;

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup: BackupSummary,
    pub path: String,
    pub stats: IngestStats,
}

/// Stores one Backup Record per catalog file found under `roots`.
pub fn backup_po_to_db<S: TranslationStore + ?Sized>(
    store: &mut S,
    project_root: &Path,
    roots: &[PathBuf],
) -> Result<Vec<BackupSummary>> {
    let mut created = Vec::new();
    for root in roots {
        for location in enumerate_catalogs(project_root, root)? {
            let content = fs::read_to_string(&location.path)
                .with_context(|| format!("failed to read {}", location.path.display()))?;
            created.push(snapshot(store, &location.scope, &content)?);
        }
    }
    info!(backups = created.len(), "backed up catalogs");
    Ok(created)
}

pub fn snapshot<S: TranslationStore + ?Sized>(
    store: &mut S,
    scope: &CatalogScope,
    content: &str,
) -> Result<BackupSummary> {
    let summary = store.insert_backup(scope, content)?;
    debug!(scope = %scope, id = summary.id, hash = %summary.content_hash, "stored backup");
    Ok(summary)
}

/// Writes the backed-up content over its catalog file, then re-ingests the
/// file letting its translations win over the store's.
pub fn restore<S: TranslationStore + ?Sized>(
    store: &mut S,
    project_root: &Path,
    id: i64,
) -> Result<RestoreReport> {
    let record = store
        .load_backup(id)?
        .ok_or_else(|| SyncError::configuration(format!("no backup with id {id}")))?;
    let scope = record.scope();
    let path = scope.catalog_path(project_root);
    write_atomic(&path, &record.content)?;
    let stats = store_to_db(store, &path, &scope, TranslationPolicy::Overwrite)?;
    info!(id, scope = %scope, path = %path.display(), "restored backup");
    Ok(RestoreReport {
        backup: record.summary,
        path: normalize_for_display(&path),
        stats,
    })
}

pub fn list<S: TranslationStore + ?Sized>(store: &S) -> Result<Vec<BackupSummary>> {
    store.list_backups()
}
