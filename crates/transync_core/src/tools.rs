use std::path::Path;

use anyhow::Result;
use tracing::{debug, warn};

use crate::catalog::RenderOptions;
use crate::config::{DomainSpec, StderrPolicy, ToolBackend, ToolSettings};
use crate::error::SyncError;
use crate::process::{Invocation, ProcessOutput, ProcessRunner};

/// Oldest gettext release whose tools understand every option we pass.
pub const MIN_GETTEXT_VERSION: (u32, u32) = (0, 15);

const PYTHON_KEYWORDS: [&str; 10] = [
    "gettext_noop",
    "gettext_lazy",
    "ngettext_lazy:1,2",
    "ugettext_noop",
    "ugettext_lazy",
    "ungettext_lazy:1,2",
    "pgettext:1c,2",
    "npgettext:1c,2,3",
    "pgettext_lazy:1c,2",
    "npgettext_lazy:1c,2,3",
];

const SCRIPT_KEYWORDS: [&str; 5] = [
    "gettext_noop",
    "gettext_lazy",
    "ngettext_lazy:1,2",
    "pgettext:1c,2",
    "npgettext:1c,2,3",
];

/// Extra keywords handed to the extractor for a domain, in `name:args` form.
pub fn extraction_keywords(domain: &DomainSpec) -> Vec<String> {
    let base: &[&str] = if domain.language.eq_ignore_ascii_case("python") {
        &PYTHON_KEYWORDS
    } else {
        &SCRIPT_KEYWORDS
    };
    let mut keywords: Vec<String> = base.iter().map(|k| k.to_string()).collect();
    for keyword in &domain.keywords {
        if !keywords.contains(keyword) {
            keywords.push(keyword.clone());
        }
    }
    keywords
}

/// The three catalog primitives the pipeline is built from.
pub trait CatalogTools {
    fn backend(&self) -> ToolBackend;

    /// Fails with a configuration error when the toolchain is unusable.
    fn check_version(&self) -> Result<String>;

    /// Extracts `relative_file` (relative to `working_dir`) and returns catalog
    /// text whose references are relative to `working_dir`. Returns an empty
    /// string when the file holds no translatable strings.
    fn extract(&self, domain: &DomainSpec, working_dir: &Path, relative_file: &str)
    -> Result<String>;

    /// Collapses duplicate messages of a template into one entry each.
    fn uniq(&self, template: &Path) -> Result<String>;

    /// Merges a template into an existing translated catalog.
    fn merge(&self, catalog: &Path, template: &Path) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToolStage {
    Extract,
    Merge,
}

pub(crate) fn tool_error(
    stage: ToolStage,
    command: &str,
    path: &str,
    message: impl Into<String>,
) -> anyhow::Error {
    let (command, path, message) = (command.to_string(), path.to_string(), message.into());
    match stage {
        ToolStage::Extract => SyncError::Extraction {
            command,
            path,
            message,
        }
        .into(),
        ToolStage::Merge => SyncError::Merge {
            command,
            path,
            message,
        }
        .into(),
    }
}

/// True when every line of `stderr` belongs to a gettext warning: a line
/// carrying `warning:` or an indented continuation of one.
pub fn only_warnings(stderr: &str) -> bool {
    let mut in_warning = false;
    let mut saw_any = false;
    for line in stderr.lines() {
        if line.trim().is_empty() {
            continue;
        }
        saw_any = true;
        if line.contains("warning:") {
            in_warning = true;
        } else if !(in_warning && line.starts_with(char::is_whitespace)) {
            return false;
        }
    }
    saw_any
}

/// Applies the exit status and the stderr policy to a finished tool run.
pub(crate) fn check_tool_output(
    output: &ProcessOutput,
    stage: ToolStage,
    command: &str,
    path: &str,
    policy: StderrPolicy,
) -> Result<()> {
    let stderr = output.stderr.trim();
    if !output.success() {
        let message = if stderr.is_empty() {
            match output.exit_code {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by a signal".to_string(),
            }
        } else {
            stderr.to_string()
        };
        return Err(tool_error(stage, command, path, message));
    }
    if stderr.is_empty() {
        return Ok(());
    }
    match policy {
        StderrPolicy::WarningsAllowed if only_warnings(stderr) => {
            warn!(command, path, "{stderr}");
            Ok(())
        }
        _ => Err(tool_error(stage, command, path, stderr)),
    }
}

/// Parses the `(major, minor)` version from the first line of a gettext
/// tool's `--version` output.
pub fn parse_gettext_version(output: &str) -> Option<(u32, u32)> {
    let first = output.lines().next()?;
    let token = first.split_whitespace().last()?;
    let mut parts = token.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()
        .map(|minor| {
            minor
                .chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
        })
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0);
    Some((major, minor))
}

/// The GNU gettext command line tools driven through a [`ProcessRunner`].
pub struct GettextTools<R> {
    runner: R,
    settings: ToolSettings,
    format: RenderOptions,
}

impl<R: ProcessRunner> GettextTools<R> {
    pub fn new(runner: R, settings: ToolSettings, format: RenderOptions) -> Self {
        Self {
            runner,
            settings,
            format,
        }
    }

    fn format_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.format.wrap_width.is_none() {
            args.push("--no-wrap".to_string());
        }
        if !self.format.include_locations {
            args.push("--no-location".to_string());
        }
        args
    }

    fn run_checked(&self, invocation: &Invocation, stage: ToolStage, path: &str) -> Result<String> {
        let command = invocation.command_line();
        let output = self.runner.run(invocation)?;
        check_tool_output(&output, stage, &command, path, self.settings.stderr_policy)?;
        Ok(output.stdout)
    }
}

impl<R: ProcessRunner> CatalogTools for GettextTools<R> {
    fn backend(&self) -> ToolBackend {
        ToolBackend::Gettext
    }

    fn check_version(&self) -> Result<String> {
        let invocation = Invocation::new(&self.settings.xgettext).arg("--version");
        let output = self.runner.run(&invocation)?;
        let version = parse_gettext_version(&output.stdout);
        match version {
            Some(found) if output.success() && found >= MIN_GETTEXT_VERSION => {
                let line = output.stdout.lines().next().unwrap_or_default().to_string();
                debug!(version = %line, "gettext toolchain detected");
                Ok(line)
            }
            _ => Err(SyncError::configuration(format!(
                "internationalization requires GNU gettext {}.{} or newer ({} reported: {})",
                MIN_GETTEXT_VERSION.0,
                MIN_GETTEXT_VERSION.1,
                self.settings.xgettext,
                output.stdout.lines().next().unwrap_or("nothing").trim()
            ))
            .into()),
        }
    }

    fn extract(
        &self,
        domain: &DomainSpec,
        working_dir: &Path,
        relative_file: &str,
    ) -> Result<String> {
        let invocation = Invocation::new(&self.settings.xgettext)
            .args(["-d", domain.name.as_str(), "-L", domain.language.as_str()])
            .args(
                extraction_keywords(domain)
                    .into_iter()
                    .map(|keyword| format!("--keyword={keyword}")),
            )
            .args(["--from-code=UTF-8", "--add-comments=Translators"])
            .args(self.format_args())
            .args(["-o", "-", relative_file])
            .current_dir(working_dir);
        self.run_checked(&invocation, ToolStage::Extract, relative_file)
    }

    fn uniq(&self, template: &Path) -> Result<String> {
        let path = template.to_string_lossy().to_string();
        let invocation = Invocation::new(&self.settings.msguniq)
            .arg("--to-code=utf-8")
            .args(self.format_args())
            .arg(path.clone());
        self.run_checked(&invocation, ToolStage::Merge, &path)
    }

    fn merge(&self, catalog: &Path, template: &Path) -> Result<String> {
        let path = catalog.to_string_lossy().to_string();
        let mut invocation = Invocation::new(&self.settings.msgmerge)
            .arg("-q")
            .args(self.format_args());
        if !self.settings.fuzzy_matching {
            invocation = invocation.arg("--no-fuzzy-matching");
        }
        let invocation = invocation
            .arg(path.clone())
            .arg(template.to_string_lossy().to_string());
        self.run_checked(&invocation, ToolStage::Merge, &path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::Path;

    use anyhow::Result;

    use super::{
        CatalogTools, GettextTools, only_warnings, parse_gettext_version,
    };
    use crate::catalog::RenderOptions;
    use crate::config::{Settings, StderrPolicy, ToolSettings};
    use crate::error::classify;
    use crate::process::{Invocation, ProcessOutput, ProcessRunner};

    /// Replays canned outputs and records every invocation.
    #[derive(Default)]
    pub(crate) struct RecordingRunner {
        pub calls: RefCell<Vec<Invocation>>,
        pub outputs: RefCell<VecDeque<ProcessOutput>>,
    }

    impl RecordingRunner {
        pub(crate) fn with_outputs(outputs: Vec<ProcessOutput>) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                outputs: RefCell::new(outputs.into()),
            }
        }
    }

    impl ProcessRunner for &RecordingRunner {
        fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
            self.calls.borrow_mut().push(invocation.clone());
            Ok(self.outputs.borrow_mut().pop_front().unwrap_or(ProcessOutput {
                exit_code: Some(0),
                ..ProcessOutput::default()
            }))
        }
    }

    pub(crate) fn ok(stdout: &str, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(0),
        }
    }

    fn tools(runner: &RecordingRunner, policy: StderrPolicy) -> GettextTools<&RecordingRunner> {
        GettextTools::new(
            runner,
            ToolSettings {
                stderr_policy: policy,
                ..ToolSettings::default()
            },
            RenderOptions::default(),
        )
    }

    #[test]
    fn extract_builds_xgettext_command_for_domain() {
        let runner = RecordingRunner::with_outputs(vec![ok("msgid \"\"\n", "")]);
        let settings = Settings::defaults(Path::new("/p")).expect("settings");
        let domain = settings.domain("djangojs").expect("djangojs");

        let text = tools(&runner, StderrPolicy::WarningsAllowed)
            .extract(domain, Path::new("/p"), "static/app.js.py")
            .expect("extract");
        assert_eq!(text, "msgid \"\"\n");

        let calls = runner.calls.borrow();
        let call = &calls[0];
        assert_eq!(call.program, "xgettext");
        assert_eq!(call.working_dir.as_deref(), Some(Path::new("/p")));
        let line = call.command_line();
        assert!(line.starts_with("xgettext -d djangojs -L Perl --keyword=gettext_noop"));
        assert!(line.contains("--keyword=ngettext_lazy:1,2"));
        assert!(line.ends_with("--add-comments=Translators -o - static/app.js.py"));
    }

    #[test]
    fn warnings_are_tolerated_unless_strict() {
        let stderr = "views.py:3: warning: 'msgid' format string with unnamed arguments cannot be properly localized:\n  The translator cannot reorder the arguments.\n";
        assert!(only_warnings(stderr));
        assert!(!only_warnings("msgmerge: cannot open file\n"));

        let settings = Settings::defaults(Path::new("/p")).expect("settings");
        let domain = settings.domain("django").expect("django");

        let runner = RecordingRunner::with_outputs(vec![ok("out", stderr)]);
        let text = tools(&runner, StderrPolicy::WarningsAllowed)
            .extract(domain, Path::new("/p"), "views.py")
            .expect("warnings allowed");
        assert_eq!(text, "out");

        let runner = RecordingRunner::with_outputs(vec![ok("out", stderr)]);
        let error = tools(&runner, StderrPolicy::Strict)
            .extract(domain, Path::new("/p"), "views.py")
            .expect_err("strict");
        let classified = classify(&error).expect("taxonomy");
        assert_eq!(classified.kind(), "extraction");
        assert!(classified.to_string().contains("views.py"));
    }

    #[test]
    fn merge_failure_is_merge_error() {
        let runner = RecordingRunner::with_outputs(vec![ProcessOutput {
            stdout: String::new(),
            stderr: "msgmerge: fr.po:3: end-of-line within string\n".to_string(),
            exit_code: Some(1),
        }]);
        let error = tools(&runner, StderrPolicy::WarningsAllowed)
            .merge(Path::new("fr.po"), Path::new("django.pot"))
            .expect_err("must fail");
        assert_eq!(classify(&error).map(|e| e.kind()), Some("merge"));
        assert_eq!(
            runner.calls.borrow()[0].command_line(),
            "msgmerge -q fr.po django.pot"
        );
    }

    #[test]
    fn version_check_requires_minimum_release() {
        assert_eq!(
            parse_gettext_version("xgettext (GNU gettext-tools) 0.21.1\nCopyright"),
            Some((0, 21))
        );
        assert_eq!(parse_gettext_version("xgettext 0.14"), Some((0, 14)));

        let runner = RecordingRunner::with_outputs(vec![ok("xgettext (GNU gettext-tools) 0.14.5\n", "")]);
        let error = tools(&runner, StderrPolicy::WarningsAllowed)
            .check_version()
            .expect_err("too old");
        assert_eq!(classify(&error).map(|e| e.kind()), Some("configuration"));

        let runner = RecordingRunner::with_outputs(vec![ok("xgettext (GNU gettext-tools) 0.22\n", "")]);
        let version = tools(&runner, StderrPolicy::WarningsAllowed)
            .check_version()
            .expect("new enough");
        assert!(version.ends_with("0.22"));
    }
}
