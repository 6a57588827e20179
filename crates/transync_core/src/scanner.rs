use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::runtime::normalize_for_display;

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub ignore_patterns: Vec<String>,
    pub follow_symlinks: bool,
}

/// A file found under the source root. `directory` is relative to the root,
/// `.` for the root itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SourceFile {
    pub directory: String,
    pub filename: String,
}

impl SourceFile {
    pub fn relative_path(&self) -> String {
        if self.directory == "." {
            self.filename.clone()
        } else {
            format!("{}/{}", self.directory, self.filename)
        }
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        if self.directory == "." {
            root.join(&self.filename)
        } else {
            root.join(&self.directory).join(&self.filename)
        }
    }
}

struct IgnoreMatcher {
    files: GlobSet,
    dirs: GlobSet,
}

impl IgnoreMatcher {
    fn new(patterns: &[String]) -> Result<Self> {
        let mut files = GlobSetBuilder::new();
        let mut dirs = GlobSetBuilder::new();
        for pattern in patterns {
            files.add(compile_pattern(pattern)?);
            // `static/*` ignores the whole `static` directory.
            let dir_pattern = pattern.strip_suffix("/*").unwrap_or(pattern);
            dirs.add(compile_pattern(dir_pattern)?);
        }
        Ok(Self {
            files: files.build().context("failed to build ignore pattern set")?,
            dirs: dirs.build().context("failed to build ignore pattern set")?,
        })
    }

    fn ignores_file(&self, relative: &str, name: &str) -> bool {
        self.files.is_match(relative) || self.files.is_match(name)
    }

    fn ignores_dir(&self, relative: &str, name: &str) -> bool {
        self.dirs.is_match(relative) || self.dirs.is_match(name)
    }
}

fn compile_pattern(pattern: &str) -> Result<Glob> {
    Glob::new(pattern).map_err(|error| {
        SyncError::configuration(format!("invalid ignore pattern `{pattern}`: {error}")).into()
    })
}

/// Lists every file under `root` that no ignore pattern matches, sorted by
/// directory then filename.
pub fn scan_source_tree(root: &Path, options: &ScanOptions) -> Result<Vec<SourceFile>> {
    let metadata = fs::metadata(root)
        .with_context(|| format!("failed to read source root {}", root.display()))?;
    if !metadata.is_dir() {
        bail!("source root is not a directory: {}", root.display());
    }
    fs::read_dir(root).with_context(|| format!("failed to read source root {}", root.display()))?;

    let matcher = IgnoreMatcher::new(&options.ignore_patterns)?;
    let mut visited = HashSet::new();
    let mut files = Vec::new();

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name()
        .into_iter();
    while let Some(next) = walker.next() {
        let entry = match next {
            Ok(entry) => entry,
            Err(error) => {
                debug!(error = %error, "skipping unreadable path during scan");
                continue;
            }
        };
        if entry.depth() == 0 {
            if options.follow_symlinks
                && let Ok(canonical) = fs::canonicalize(entry.path())
            {
                visited.insert(canonical);
            }
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = normalize_for_display(relative);
        let name = entry.file_name().to_string_lossy().to_string();

        if entry.file_type().is_dir() {
            if matcher.ignores_dir(&relative, &name) {
                walker.skip_current_dir();
                continue;
            }
            if options.follow_symlinks {
                let first_visit = fs::canonicalize(entry.path())
                    .map(|canonical| visited.insert(canonical))
                    .unwrap_or(false);
                if !first_visit {
                    debug!(path = %relative, "directory already visited, not descending");
                    walker.skip_current_dir();
                }
            }
            continue;
        }

        let is_file = entry.file_type().is_file()
            || (entry.path_is_symlink() && entry.path().is_file());
        if !is_file || matcher.ignores_file(&relative, &name) {
            continue;
        }

        let directory = match relative.rsplit_once('/') {
            Some((directory, _)) => directory.to_string(),
            None => ".".to_string(),
        };
        files.push(SourceFile {
            directory,
            filename: name,
        });
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{ScanOptions, SourceFile, scan_source_tree};
    use crate::config::DEFAULT_IGNORE_PATTERNS;

    fn write_file(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, content).expect("write");
    }

    fn default_options() -> ScanOptions {
        ScanOptions {
            ignore_patterns: DEFAULT_IGNORE_PATTERNS.iter().map(|p| p.to_string()).collect(),
            follow_symlinks: false,
        }
    }

    fn relative_paths(files: &[SourceFile]) -> Vec<String> {
        files.iter().map(SourceFile::relative_path).collect()
    }

    #[test]
    fn scan_sorts_by_directory_then_name_and_applies_default_ignores() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("views.py"), "");
        write_file(&root.join("app/templates/base.html"), "");
        write_file(&root.join("app/forms.py"), "");
        write_file(&root.join("app/forms.pyc"), "");
        write_file(&root.join("app/notes.txt~"), "");
        write_file(&root.join(".git/config"), "");
        write_file(&root.join("app/.hidden/secret.html"), "");
        write_file(&root.join("CVS/Entries"), "");

        let files = scan_source_tree(root, &default_options()).expect("scan");
        assert_eq!(
            relative_paths(&files),
            vec!["views.py", "app/forms.py", "app/templates/base.html"]
        );
        assert_eq!(files[0].directory, ".");
        assert_eq!(files[2].directory, "app/templates");
    }

    #[test]
    fn scan_matches_patterns_across_separators_and_prunes_directories() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        write_file(&root.join("static/js/app.js"), "");
        write_file(&root.join("node/lib/x.js"), "");
        write_file(&root.join("src/main.js"), "");

        let options = ScanOptions {
            ignore_patterns: vec!["static/*".to_string(), "node*x.js".to_string()],
            follow_symlinks: false,
        };
        let files = scan_source_tree(root, &options).expect("scan");
        assert_eq!(relative_paths(&files), vec!["src/main.js"]);
    }

    #[test]
    fn scan_of_missing_root_fails() {
        let temp = tempdir().expect("tempdir");
        let error = scan_source_tree(&temp.path().join("absent"), &default_options())
            .expect_err("must fail");
        assert!(error.to_string().contains("failed to read source root"));
    }

    #[test]
    fn invalid_ignore_pattern_is_reported() {
        let temp = tempdir().expect("tempdir");
        let options = ScanOptions {
            ignore_patterns: vec!["[unclosed".to_string()],
            follow_symlinks: false,
        };
        let error = scan_source_tree(temp.path(), &options).expect_err("must fail");
        assert!(error.to_string().contains("invalid ignore pattern"));
    }

    #[cfg(unix)]
    #[test]
    fn scan_follows_symlinked_directories_once() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        write_file(&root.join("shared/label.html"), "");
        write_file(&root.join("real.txt"), "");
        symlink(root.join("shared"), root.join("linked")).expect("dir link");
        symlink(&root, root.join("shared").join("loop")).expect("loop link");
        symlink(root.join("real.txt"), root.join("alias.txt")).expect("file link");

        let without = scan_source_tree(&root, &default_options()).expect("scan");
        assert_eq!(
            relative_paths(&without),
            vec!["alias.txt", "real.txt", "shared/label.html"]
        );

        let options = ScanOptions {
            follow_symlinks: true,
            ..default_options()
        };
        let with = scan_source_tree(&root, &options).expect("scan with links");
        assert_eq!(
            relative_paths(&with),
            vec!["alias.txt", "real.txt", "linked/label.html"]
        );
    }
}
