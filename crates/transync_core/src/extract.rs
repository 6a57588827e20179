use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::catalog::strip_header_block;
use crate::config::DomainSpec;
use crate::scanner::SourceFile;
use crate::tools::{CatalogTools, ToolStage, tool_error};
use crate::transform;

/// Locale-independent catalog text for one domain, ready for the merge step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntermediateCatalog {
    pub domain: String,
    pub text: String,
    pub files_processed: usize,
    pub files_with_messages: usize,
}

impl IntermediateCatalog {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Transformed copy of a source file, written beside it and removed on drop.
struct TemporaryCopy {
    path: PathBuf,
}

impl TemporaryCopy {
    fn create(path: PathBuf, content: &str) -> Result<Self> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                return Err(tool_error(
                    ToolStage::Extract,
                    "extract",
                    &path.to_string_lossy(),
                    format!(
                        "refusing to overwrite existing file {}; rename it or add it to the ignore patterns",
                        path.display()
                    ),
                ));
            }
            Err(error) => {
                return Err(error).with_context(|| format!("failed to create {}", path.display()));
            }
        };
        let guard = Self { path };
        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to write {}", guard.path.display()))?;
        Ok(guard)
    }
}

impl Drop for TemporaryCopy {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %error, "failed to remove temporary copy");
        }
    }
}

/// Points `#:` references at the original file instead of its temporary copy.
fn rewrite_references(text: &str, temporary: &str, original: &str) -> String {
    let prefix = format!("{temporary}:");
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let Some(rest) = line.strip_prefix("#:") else {
            out.push_str(line);
            continue;
        };
        out.push_str("#:");
        let (body, newline) = match rest.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (rest, ""),
        };
        for token in body.split(' ') {
            if token.is_empty() {
                continue;
            }
            out.push(' ');
            if token == temporary {
                out.push_str(original);
            } else if let Some(line_number) = token.strip_prefix(&prefix) {
                out.push_str(original);
                out.push(':');
                out.push_str(line_number);
            } else {
                out.push_str(token);
            }
        }
        out.push_str(newline);
    }
    out
}

pub struct Extractor<'a> {
    tools: &'a dyn CatalogTools,
    source_root: &'a Path,
}

impl<'a> Extractor<'a> {
    pub fn new(tools: &'a dyn CatalogTools, source_root: &'a Path) -> Self {
        Self { tools, source_root }
    }

    /// Runs the extractor over every file of `files` the domain handles and
    /// concatenates the results into one template.
    pub fn extract_domain(
        &self,
        domain: &DomainSpec,
        files: &[SourceFile],
    ) -> Result<IntermediateCatalog> {
        let mut catalog = IntermediateCatalog {
            domain: domain.name.clone(),
            ..IntermediateCatalog::default()
        };

        for file in files {
            let output = if domain.needs_transform(&file.filename) {
                self.extract_transformed(domain, file)?
            } else if domain.is_plain_source(&file.filename) {
                debug!(domain = %domain.name, file = %file.relative_path(), "processing file");
                self.tools
                    .extract(domain, self.source_root, &file.relative_path())?
            } else {
                continue;
            };
            catalog.files_processed += 1;
            if output.trim().is_empty() {
                continue;
            }
            catalog.files_with_messages += 1;

            if catalog.text.is_empty() {
                catalog
                    .text
                    .push_str(&output.replace("charset=CHARSET", "charset=UTF-8"));
            } else {
                catalog.text.push_str(strip_header_block(&output));
            }
        }

        info!(
            domain = %domain.name,
            files = catalog.files_processed,
            with_messages = catalog.files_with_messages,
            "extracted domain"
        );
        Ok(catalog)
    }

    fn extract_transformed(&self, domain: &DomainSpec, file: &SourceFile) -> Result<String> {
        let relative = file.relative_path();
        debug!(domain = %domain.name, file = %relative, "processing file");
        let path = file.path(self.source_root);
        let source =
            fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let rewritten = transform::apply(domain.transform, &source, &relative)?;

        let temporary_relative = format!("{relative}.py");
        let temporary_path = self.source_root.join(&temporary_relative);
        let _copy = TemporaryCopy::create(temporary_path, &rewritten)?;
        let output = self
            .tools
            .extract(domain, self.source_root, &temporary_relative)?;
        Ok(rewrite_references(&output, &temporary_relative, &relative))
    }
}
