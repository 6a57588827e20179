use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::catalog::{Message, split_context};
use crate::locale::CatalogScope;

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    original TEXT NOT NULL,
    original_plural TEXT,
    translation TEXT NOT NULL DEFAULT '',
    plural_translations TEXT NOT NULL DEFAULT '[]',
    language TEXT NOT NULL,
    domain TEXT NOT NULL,
    locale_parent_dir TEXT NOT NULL,
    occurrences TEXT NOT NULL DEFAULT '[]',
    hint TEXT NOT NULL DEFAULT '',
    translator_comment TEXT NOT NULL DEFAULT '',
    flags TEXT NOT NULL DEFAULT '[]',
    is_obsolete INTEGER NOT NULL DEFAULT 0,
    position INTEGER NOT NULL DEFAULT 0,
    is_dirty INTEGER NOT NULL DEFAULT 0,
    updated_at_unix INTEGER NOT NULL,
    UNIQUE (original, language, domain, locale_parent_dir)
);
CREATE INDEX IF NOT EXISTS idx_entries_scope ON entries(language, domain, locale_parent_dir);

CREATE TABLE IF NOT EXISTS backups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    language TEXT NOT NULL,
    domain TEXT NOT NULL,
    locale_parent_dir TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_unix INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_backups_scope ON backups(language, domain, locale_parent_dir);
"#;

const MIN_PLURAL_FORMS: usize = 2;

const ENTRY_COLUMNS: &str = "id, original, original_plural, translation, plural_translations, \
     language, domain, locale_parent_dir, occurrences, hint, translator_comment, flags, \
     is_obsolete, position, is_dirty";

/// How an ingested catalog treats translations already in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationPolicy {
    /// Catalog translations fill the store, but never blank a stored
    /// translation or replace one edited in the store and not yet compiled.
    PreserveStored,
    /// The catalog wins and dirty flags are cleared.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEntry {
    pub id: i64,
    pub original: String,
    pub original_plural: Option<String>,
    pub translation: String,
    pub plural_translations: Vec<String>,
    pub language: String,
    pub domain: String,
    pub locale_parent_dir: String,
    pub occurrences: Vec<String>,
    pub hint: String,
    pub translator_comment: String,
    pub flags: Vec<String>,
    pub is_obsolete: bool,
    pub position: i64,
    pub is_dirty: bool,
}

impl StoredEntry {
    pub fn scope(&self) -> CatalogScope {
        CatalogScope::new(&self.language, &self.domain, &self.locale_parent_dir)
    }

    pub fn is_translated(&self) -> bool {
        if self.original_plural.is_some() {
            !self.plural_translations.is_empty()
                && self.plural_translations.iter().all(|value| !value.is_empty())
        } else {
            !self.translation.is_empty()
        }
    }

    /// Catalog message carrying this record's text and metadata.
    pub fn to_message(&self) -> Message {
        let (context, msgid) = split_context(&self.original);
        let msgstr = match &self.original_plural {
            Some(_) if !self.plural_translations.is_empty() => self.plural_translations.clone(),
            Some(_) => vec![self.translation.clone(), String::new()],
            None => vec![self.translation.clone()],
        };
        Message {
            translator_comments: split_lines(&self.translator_comment),
            extracted_comments: split_lines(&self.hint),
            references: self.occurrences.clone(),
            flags: self.flags.clone(),
            previous: Vec::new(),
            context: context.map(str::to_string),
            msgid: msgid.to_string(),
            msgid_plural: self.original_plural.clone(),
            msgstr,
            obsolete: self.is_obsolete,
        }
    }
}

fn split_lines(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value.split('\n').map(str::to_string).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub entries: usize,
    pub obsoleted: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub language: Option<String>,
    pub domain: Option<String>,
    pub locale_parent_dir: Option<String>,
    pub search: Option<String>,
    pub untranslated_only: bool,
    pub include_obsolete: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub id: i64,
    pub language: String,
    pub domain: String,
    pub locale_parent_dir: String,
    pub content_hash: String,
    pub bytes: usize,
    pub created_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub summary: BackupSummary,
    pub content: String,
}

impl BackupRecord {
    pub fn scope(&self) -> CatalogScope {
        CatalogScope::new(
            &self.summary.language,
            &self.summary.domain,
            &self.summary.locale_parent_dir,
        )
    }
}

/// Persistence the synchronizer and backup manager need.
pub trait TranslationStore {
    /// Upserts every non-header message of one catalog file in one
    /// transaction, then reconciles records of the scope the file no longer
    /// carries.
    fn ingest(
        &mut self,
        scope: &CatalogScope,
        messages: &[Message],
        policy: TranslationPolicy,
    ) -> Result<IngestStats>;

    /// Records of one scope, in render order: live before obsolete, then by
    /// position and original.
    fn catalog_entries(&self, scope: &CatalogScope) -> Result<Vec<StoredEntry>>;

    fn catalog_scopes(&self, language: Option<&str>) -> Result<Vec<CatalogScope>>;

    fn clear_dirty(&mut self, scope: &CatalogScope) -> Result<usize>;

    fn set_translation(
        &mut self,
        id: i64,
        translation: &str,
        plural_translations: Option<&[String]>,
    ) -> Result<StoredEntry>;

    fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<StoredEntry>>;

    fn insert_backup(&mut self, scope: &CatalogScope, content: &str) -> Result<BackupSummary>;

    fn load_backup(&self, id: i64) -> Result<Option<BackupRecord>>;

    /// Newest first.
    fn list_backups(&self) -> Result<Vec<BackupSummary>>;
}

pub struct SqliteStore {
    db_path: PathBuf,
    connection: Connection,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let parent = db_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create database parent directory {}",
                parent.display()
            )
        })?;
        let connection = open_connection(db_path)?;
        initialize_schema(&connection)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            connection,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn load_entry(&self, id: i64) -> Result<Option<StoredEntry>> {
        self.connection
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?1"),
                [id],
                entry_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load entry {id}"))
    }
}

impl TranslationStore for SqliteStore {
    fn ingest(
        &mut self,
        scope: &CatalogScope,
        messages: &[Message],
        policy: TranslationPolicy,
    ) -> Result<IngestStats> {
        let now = i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?;
        let overwrite = policy == TranslationPolicy::Overwrite;
        let transaction = self
            .connection
            .transaction()
            .context("failed to start ingestion transaction")?;
        let mut stats = IngestStats::default();
        let mut seen = HashSet::new();

        {
            let mut upsert = transaction
                .prepare(
                    "INSERT INTO entries (
                        original, original_plural, translation, plural_translations,
                        language, domain, locale_parent_dir, occurrences, hint,
                        translator_comment, flags, is_obsolete, position, is_dirty,
                        updated_at_unix
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, ?14)
                    ON CONFLICT (original, language, domain, locale_parent_dir) DO UPDATE SET
                        original_plural = excluded.original_plural,
                        occurrences = excluded.occurrences,
                        hint = excluded.hint,
                        translator_comment = excluded.translator_comment,
                        flags = excluded.flags,
                        is_obsolete = excluded.is_obsolete,
                        position = excluded.position,
                        translation = CASE
                            WHEN ?15 = 1 OR (?16 = 1 AND entries.is_dirty = 0)
                            THEN excluded.translation ELSE entries.translation END,
                        plural_translations = CASE
                            WHEN ?15 = 1 OR (?16 = 1 AND entries.is_dirty = 0)
                            THEN excluded.plural_translations ELSE entries.plural_translations END,
                        is_dirty = CASE WHEN ?15 = 1 THEN 0 ELSE entries.is_dirty END,
                        updated_at_unix = excluded.updated_at_unix",
                )
                .context("failed to prepare entries upsert")?;

            for (position, message) in messages
                .iter()
                .filter(|message| !message.is_header())
                .enumerate()
            {
                let original = message.key();
                let plural_translations = if message.msgid_plural.is_some() {
                    message.msgstr.clone()
                } else {
                    Vec::new()
                };
                let incoming_translated = message.msgstr.iter().any(|value| !value.is_empty());
                upsert
                    .execute(params![
                        original,
                        message.msgid_plural,
                        message.translation(),
                        to_json(&plural_translations)?,
                        scope.language,
                        scope.domain,
                        scope.locale_parent_dir,
                        to_json(&message.references)?,
                        message.extracted_comments.join("\n"),
                        message.translator_comments.join("\n"),
                        to_json(&message.flags)?,
                        message.obsolete,
                        i64::try_from(position).context("position does not fit into i64")?,
                        now,
                        overwrite,
                        incoming_translated,
                    ])
                    .with_context(|| format!("failed to upsert entry {original:?} of {scope}"))?;
                seen.insert(original);
                stats.entries += 1;
            }

            let mut statement = transaction
                .prepare(
                    "SELECT id, original, original_plural, translation, plural_translations
                     FROM entries
                     WHERE language = ?1 AND domain = ?2 AND locale_parent_dir = ?3",
                )
                .context("failed to prepare scope query")?;
            let rows = statement
                .query_map(
                    params![scope.language, scope.domain, scope.locale_parent_dir],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .context("failed to query scope entries")?;
            let mut missing = Vec::new();
            for row in rows {
                let (id, original, original_plural, translation, plurals) =
                    row.context("failed to decode scope entry")?;
                if seen.contains(&original) {
                    continue;
                }
                let plurals: Vec<String> = from_json(&plurals)?;
                let translated = if original_plural.is_some() {
                    plurals.iter().any(|value| !value.is_empty())
                } else {
                    !translation.is_empty()
                };
                missing.push((id, translated));
            }
            drop(statement);

            for (id, translated) in missing {
                if translated {
                    transaction
                        .execute(
                            "UPDATE entries SET is_obsolete = 1, occurrences = '[]', updated_at_unix = ?2
                             WHERE id = ?1",
                            params![id, now],
                        )
                        .with_context(|| format!("failed to mark entry {id} obsolete"))?;
                    stats.obsoleted += 1;
                } else {
                    transaction
                        .execute("DELETE FROM entries WHERE id = ?1", [id])
                        .with_context(|| format!("failed to delete entry {id}"))?;
                    stats.deleted += 1;
                }
            }
        }

        transaction
            .commit()
            .context("failed to commit ingestion transaction")?;
        Ok(stats)
    }

    fn catalog_entries(&self, scope: &CatalogScope) -> Result<Vec<StoredEntry>> {
        let mut statement = self
            .connection
            .prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries
                 WHERE language = ?1 AND domain = ?2 AND locale_parent_dir = ?3
                 ORDER BY is_obsolete ASC, position ASC, original ASC"
            ))
            .context("failed to prepare catalog entries query")?;
        let rows = statement
            .query_map(
                params![scope.language, scope.domain, scope.locale_parent_dir],
                entry_from_row,
            )
            .context("failed to query catalog entries")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode entry row")?);
        }
        Ok(entries)
    }

    fn catalog_scopes(&self, language: Option<&str>) -> Result<Vec<CatalogScope>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT DISTINCT language, domain, locale_parent_dir FROM entries
                 WHERE ?1 IS NULL OR language = ?1
                 ORDER BY locale_parent_dir, language, domain",
            )
            .context("failed to prepare scope listing")?;
        let rows = statement
            .query_map([language], |row| {
                Ok(CatalogScope::new(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("failed to list scopes")?;
        let mut scopes = Vec::new();
        for row in rows {
            scopes.push(row.context("failed to decode scope row")?);
        }
        Ok(scopes)
    }

    fn clear_dirty(&mut self, scope: &CatalogScope) -> Result<usize> {
        self.connection
            .execute(
                "UPDATE entries SET is_dirty = 0
                 WHERE language = ?1 AND domain = ?2 AND locale_parent_dir = ?3 AND is_dirty = 1",
                params![scope.language, scope.domain, scope.locale_parent_dir],
            )
            .with_context(|| format!("failed to clear dirty flags of {scope}"))
    }

    fn set_translation(
        &mut self,
        id: i64,
        translation: &str,
        plural_translations: Option<&[String]>,
    ) -> Result<StoredEntry> {
        let Some(mut entry) = self.load_entry(id)? else {
            bail!("no translation entry with id {id}");
        };
        match plural_translations {
            Some(values) => {
                if entry.original_plural.is_none() {
                    bail!("entry {id} has no plural form");
                }
                entry.plural_translations = values.to_vec();
                entry.translation = values.first().cloned().unwrap_or_default();
            }
            None => {
                entry.translation = translation.to_string();
                if entry.original_plural.is_some() {
                    match entry.plural_translations.first_mut() {
                        Some(first) => *first = translation.to_string(),
                        None => entry.plural_translations = vec![translation.to_string()],
                    }
                    // The store does not know the catalog's nplurals; never
                    // shrink a plural entry below singular and plural.
                    if entry.plural_translations.len() < MIN_PLURAL_FORMS {
                        entry
                            .plural_translations
                            .resize(MIN_PLURAL_FORMS, String::new());
                    }
                }
            }
        }
        entry.flags.retain(|flag| flag != "fuzzy");
        entry.is_dirty = true;

        let now = i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?;
        self.connection
            .execute(
                "UPDATE entries
                 SET translation = ?2, plural_translations = ?3, flags = ?4, is_dirty = 1,
                     updated_at_unix = ?5
                 WHERE id = ?1",
                params![
                    id,
                    entry.translation,
                    to_json(&entry.plural_translations)?,
                    to_json(&entry.flags)?,
                    now
                ],
            )
            .with_context(|| format!("failed to update entry {id}"))?;
        Ok(entry)
    }

    fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<StoredEntry>> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        for (column, value) in [
            ("language", &filter.language),
            ("domain", &filter.domain),
            ("locale_parent_dir", &filter.locale_parent_dir),
        ] {
            if let Some(value) = value {
                values.push(value.clone());
                clauses.push(format!("{column} = ?{}", values.len()));
            }
        }
        if let Some(search) = &filter.search {
            values.push(format!("%{search}%"));
            let index = values.len();
            clauses.push(format!("(original LIKE ?{index} OR translation LIKE ?{index})"));
        }
        if filter.untranslated_only {
            clauses.push("translation = ''".to_string());
        }
        if !filter.include_obsolete {
            clauses.push("is_obsolete = 0".to_string());
        }

        let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM entries");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY locale_parent_dir, language, domain, is_obsolete, position, original");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare entry listing")?;
        let rows = statement
            .query_map(params_from_iter(values.iter()), entry_from_row)
            .context("failed to list entries")?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.context("failed to decode entry row")?);
        }
        Ok(entries)
    }

    fn insert_backup(&mut self, scope: &CatalogScope, content: &str) -> Result<BackupSummary> {
        let created_unix =
            i64::try_from(unix_timestamp()?).context("timestamp does not fit into i64")?;
        let content_hash = compute_hash(content);
        self.connection
            .execute(
                "INSERT INTO backups (language, domain, locale_parent_dir, content, content_hash, created_unix)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    scope.language,
                    scope.domain,
                    scope.locale_parent_dir,
                    content,
                    content_hash,
                    created_unix
                ],
            )
            .with_context(|| format!("failed to insert backup of {scope}"))?;
        Ok(BackupSummary {
            id: self.connection.last_insert_rowid(),
            language: scope.language.clone(),
            domain: scope.domain.clone(),
            locale_parent_dir: scope.locale_parent_dir.clone(),
            content_hash,
            bytes: content.len(),
            created_unix,
        })
    }

    fn load_backup(&self, id: i64) -> Result<Option<BackupRecord>> {
        self.connection
            .query_row(
                "SELECT id, language, domain, locale_parent_dir, content_hash, created_unix, content
                 FROM backups WHERE id = ?1",
                [id],
                |row| {
                    let content: String = row.get(6)?;
                    Ok(BackupRecord {
                        summary: backup_summary_from_row(row, content.len())?,
                        content,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load backup {id}"))
    }

    fn list_backups(&self) -> Result<Vec<BackupSummary>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT id, language, domain, locale_parent_dir, content_hash, created_unix,
                        length(CAST(content AS BLOB))
                 FROM backups
                 ORDER BY created_unix DESC, id DESC",
            )
            .context("failed to prepare backup listing")?;
        let rows = statement
            .query_map([], |row| {
                let bytes: i64 = row.get(6)?;
                backup_summary_from_row(row, usize::try_from(bytes).unwrap_or_default())
            })
            .context("failed to list backups")?;
        let mut backups = Vec::new();
        for row in rows {
            backups.push(row.context("failed to decode backup row")?);
        }
        Ok(backups)
    }
}

fn backup_summary_from_row(row: &Row<'_>, bytes: usize) -> rusqlite::Result<BackupSummary> {
    Ok(BackupSummary {
        id: row.get(0)?,
        language: row.get(1)?,
        domain: row.get(2)?,
        locale_parent_dir: row.get(3)?,
        content_hash: row.get(4)?,
        bytes,
        created_unix: row.get(5)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<StoredEntry> {
    Ok(StoredEntry {
        id: row.get(0)?,
        original: row.get(1)?,
        original_plural: row.get(2)?,
        translation: row.get(3)?,
        plural_translations: json_column(row, 4)?,
        language: row.get(5)?,
        domain: row.get(6)?,
        locale_parent_dir: row.get(7)?,
        occurrences: json_column(row, 8)?,
        hint: row.get(9)?,
        translator_comment: row.get(10)?,
        flags: json_column(row, 11)?,
        is_obsolete: row.get(12)?,
        position: row.get(13)?,
        is_dirty: row.get(14)?,
    })
}

fn json_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(error))
    })
}

fn to_json(values: &[String]) -> Result<String> {
    serde_json::to_string(values).context("failed to encode list column")
}

fn from_json(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw).context("failed to decode list column")
}

fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(STORE_SCHEMA_SQL)
        .context("failed to initialize store schema")
}

/// First eight bytes of the SHA-256 digest, hex encoded.
pub fn compute_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut output = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| duration.as_secs())
}
