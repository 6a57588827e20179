use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use time::OffsetDateTime;

/// Separator gettext places between msgctxt and msgid when a message is
/// addressed by a single key.
pub const CONTEXT_SEPARATOR: char = '\u{4}';

pub const DEFAULT_WRAP_WIDTH: usize = 79;
pub const PLURAL_FORMS_PLACEHOLDER: &str = "nplurals=INTEGER; plural=EXPRESSION;";

const TEMPLATE_HEADER_COMMENTS: [&str; 5] = [
    "SOME DESCRIPTIVE TITLE.",
    "Copyright (C) YEAR THE PACKAGE'S COPYRIGHT HOLDER",
    "This file is distributed under the same license as the PACKAGE package.",
    "FIRST AUTHOR <EMAIL@ADDRESS>, YEAR.",
    "",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub translator_comments: Vec<String>,
    pub extracted_comments: Vec<String>,
    pub references: Vec<String>,
    pub flags: Vec<String>,
    pub previous: Vec<String>,
    pub context: Option<String>,
    pub msgid: String,
    pub msgid_plural: Option<String>,
    pub msgstr: Vec<String>,
    pub obsolete: bool,
}

impl Message {
    pub fn new(msgid: impl Into<String>) -> Self {
        Self {
            msgid: msgid.into(),
            msgstr: vec![String::new()],
            ..Self::default()
        }
    }

    pub fn is_header(&self) -> bool {
        self.msgid.is_empty() && self.context.is_none() && !self.obsolete
    }

    /// Single-string identity: msgid, prefixed by `msgctxt` and EOT when the
    /// message has a context.
    pub fn key(&self) -> String {
        join_context(self.context.as_deref(), &self.msgid)
    }

    pub fn translation(&self) -> &str {
        self.msgstr.first().map(String::as_str).unwrap_or("")
    }

    pub fn is_translated(&self) -> bool {
        !self.msgstr.is_empty() && self.msgstr.iter().all(|value| !value.is_empty())
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|item| item == flag)
    }

    pub fn add_flag(&mut self, flag: &str) {
        if !self.has_flag(flag) {
            self.flags.push(flag.to_string());
        }
    }

    pub fn remove_flag(&mut self, flag: &str) {
        self.flags.retain(|item| item != flag);
    }
}

pub fn join_context(context: Option<&str>, msgid: &str) -> String {
    match context {
        Some(context) => format!("{context}{CONTEXT_SEPARATOR}{msgid}"),
        None => msgid.to_string(),
    }
}

pub fn split_context(original: &str) -> (Option<&str>, &str) {
    match original.split_once(CONTEXT_SEPARATOR) {
        Some((context, msgid)) => (Some(context), msgid),
        None => (None, original),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub wrap_width: Option<usize>,
    pub include_locations: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wrap_width: Some(DEFAULT_WRAP_WIDTH),
            include_locations: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub header: Option<Message>,
    pub messages: Vec<Message>,
}

impl Catalog {
    pub fn read(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut catalog = Catalog::default();
        let mut pending = PendingMessage::default();

        for (index, raw_line) in text.lines().enumerate() {
            let line_number = index + 1;
            let line = raw_line.trim();
            if line.is_empty() {
                pending.finish_into(&mut catalog);
                continue;
            }

            if let Some(rest) = line.strip_prefix("#~") {
                if let Some(previous) = rest.strip_prefix('|') {
                    if pending.has_msgstr {
                        pending.finish_into(&mut catalog);
                    }
                    pending
                        .message
                        .previous
                        .push(previous.trim_start().to_string());
                    continue;
                }
                let rest = rest.trim_start();
                if rest.is_empty() {
                    continue;
                }
                pending.message.obsolete = true;
                pending.keyword_line(rest, line_number, &mut catalog)?;
                continue;
            }

            if let Some(comment) = line.strip_prefix('#') {
                if pending.has_msgstr {
                    pending.finish_into(&mut catalog);
                }
                pending.comment_line(comment);
                continue;
            }

            pending.keyword_line(line, line_number, &mut catalog)?;
        }
        pending.finish_into(&mut catalog);

        Ok(catalog)
    }

    pub fn render(&self, options: &RenderOptions) -> String {
        let mut blocks = Vec::with_capacity(self.messages.len() + 1);
        if let Some(header) = &self.header {
            blocks.push(render_message(header, options));
        }
        for message in &self.messages {
            blocks.push(render_message(message, options));
        }
        blocks.join("\n")
    }

    pub fn header_field(&self, name: &str) -> Option<String> {
        let header = self.header.as_ref()?;
        header_field_value(header.translation(), name)
    }

    pub fn set_header_field(&mut self, name: &str, value: &str) {
        let header = self.header.get_or_insert_with(|| Message::new(""));
        if header.msgstr.is_empty() {
            header.msgstr.push(String::new());
        }
        let mut lines: Vec<String> = header.msgstr[0]
            .split_terminator('\n')
            .map(str::to_string)
            .collect();
        let prefix = format!("{name}:");
        let replacement = format!("{name}: {value}");
        match lines.iter_mut().find(|line| line.starts_with(&prefix)) {
            Some(line) => *line = replacement,
            None => lines.push(replacement),
        }
        let mut joined = lines.join("\n");
        joined.push('\n');
        header.msgstr[0] = joined;
    }

    pub fn find(&self, context: Option<&str>, msgid: &str) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.context.as_deref() == context && message.msgid == msgid)
    }

    pub fn live_count(&self) -> usize {
        self.messages.iter().filter(|message| !message.obsolete).count()
    }

    pub fn obsolete_count(&self) -> usize {
        self.messages.iter().filter(|message| message.obsolete).count()
    }
}

fn header_field_value(header_text: &str, name: &str) -> Option<String> {
    let prefix = format!("{name}:");
    header_text
        .split('\n')
        .find_map(|line| line.strip_prefix(&prefix))
        .map(|value| value.trim().to_string())
}

/// Header of a freshly extracted template, in the shape xgettext emits.
pub fn template_header(
    creation_date: &str,
    charset: &str,
    language: &str,
    plural_forms: Option<&str>,
) -> Message {
    let mut fields = vec![
        "Project-Id-Version: PACKAGE VERSION".to_string(),
        "Report-Msgid-Bugs-To: ".to_string(),
        format!("POT-Creation-Date: {creation_date}"),
        "PO-Revision-Date: YEAR-MO-DA HO:MI+ZONE".to_string(),
        "Last-Translator: FULL NAME <EMAIL@ADDRESS>".to_string(),
        "Language-Team: LANGUAGE <LL@li.org>".to_string(),
        format!("Language: {language}"),
        "MIME-Version: 1.0".to_string(),
        format!("Content-Type: text/plain; charset={charset}"),
        "Content-Transfer-Encoding: 8bit".to_string(),
    ];
    if let Some(plural_forms) = plural_forms {
        fields.push(format!("Plural-Forms: {plural_forms}"));
    }
    let mut msgstr = fields.join("\n");
    msgstr.push('\n');

    Message {
        translator_comments: TEMPLATE_HEADER_COMMENTS
            .iter()
            .map(|line| line.to_string())
            .collect(),
        flags: vec!["fuzzy".to_string()],
        msgstr: vec![msgstr],
        ..Message::default()
    }
}

pub fn header_timestamp(now: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}+0000",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute()
    )
}

pub fn current_header_timestamp() -> String {
    header_timestamp(OffsetDateTime::now_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Context,
    Id,
    IdPlural,
    Str(usize),
}

#[derive(Debug)]
struct PendingMessage {
    message: Message,
    field: Field,
    has_msgid: bool,
    has_msgstr: bool,
}

impl Default for PendingMessage {
    fn default() -> Self {
        Self {
            message: Message::default(),
            field: Field::None,
            has_msgid: false,
            has_msgstr: false,
        }
    }
}

impl PendingMessage {
    fn comment_line(&mut self, comment: &str) {
        if let Some(rest) = comment.strip_prefix(':') {
            self.message
                .references
                .extend(rest.split_whitespace().map(str::to_string));
        } else if let Some(rest) = comment.strip_prefix(',') {
            for flag in rest.split(',') {
                let flag = flag.trim();
                if !flag.is_empty() {
                    self.message.add_flag(flag);
                }
            }
        } else if let Some(rest) = comment.strip_prefix('.') {
            self.message
                .extracted_comments
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else if let Some(rest) = comment.strip_prefix('|') {
            self.message
                .previous
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        } else {
            self.message
                .translator_comments
                .push(comment.strip_prefix(' ').unwrap_or(comment).to_string());
        }
    }

    fn keyword_line(&mut self, line: &str, line_number: usize, catalog: &mut Catalog) -> Result<()> {
        if line.starts_with('"') {
            let value = parse_quoted(line, line_number)?;
            match self.field {
                Field::None => bail!("line {line_number}: string continuation without a keyword"),
                Field::Context => self
                    .message
                    .context
                    .get_or_insert_with(String::new)
                    .push_str(&value),
                Field::Id => self.message.msgid.push_str(&value),
                Field::IdPlural => self
                    .message
                    .msgid_plural
                    .get_or_insert_with(String::new)
                    .push_str(&value),
                Field::Str(index) => self.message.msgstr[index].push_str(&value),
            }
            return Ok(());
        }

        let (keyword, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| anyhow::anyhow!("line {line_number}: expected keyword and string"))?;
        let value = parse_quoted(rest, line_number)?;

        match keyword {
            "msgctxt" => {
                if self.has_msgid {
                    let obsolete = self.message.obsolete;
                    self.finish_into(catalog);
                    self.message.obsolete = obsolete;
                }
                self.message.context = Some(value);
                self.field = Field::Context;
            }
            "msgid" => {
                if self.has_msgid {
                    let obsolete = self.message.obsolete;
                    self.finish_into(catalog);
                    self.message.obsolete = obsolete;
                }
                self.message.msgid = value;
                self.has_msgid = true;
                self.field = Field::Id;
            }
            "msgid_plural" => {
                if !self.has_msgid {
                    bail!("line {line_number}: msgid_plural before msgid");
                }
                self.message.msgid_plural = Some(value);
                self.field = Field::IdPlural;
            }
            "msgstr" => {
                if !self.has_msgid {
                    bail!("line {line_number}: msgstr before msgid");
                }
                self.message.msgstr = vec![value];
                self.has_msgstr = true;
                self.field = Field::Str(0);
            }
            other => {
                let index = other
                    .strip_prefix("msgstr[")
                    .and_then(|rest| rest.strip_suffix(']'))
                    .and_then(|digits| digits.parse::<usize>().ok())
                    .ok_or_else(|| anyhow::anyhow!("line {line_number}: unknown keyword `{other}`"))?;
                if !self.has_msgid {
                    bail!("line {line_number}: {other} before msgid");
                }
                if !self.has_msgstr {
                    self.message.msgstr.clear();
                }
                if self.message.msgstr.len() <= index {
                    self.message.msgstr.resize(index + 1, String::new());
                }
                self.message.msgstr[index] = value;
                self.has_msgstr = true;
                self.field = Field::Str(index);
            }
        }
        Ok(())
    }

    fn finish_into(&mut self, catalog: &mut Catalog) {
        let pending = std::mem::take(self);
        if !pending.has_msgid {
            return;
        }
        let mut message = pending.message;
        if message.msgstr.is_empty() {
            message.msgstr.push(String::new());
        }
        if message.is_header() && catalog.header.is_none() && catalog.messages.is_empty() {
            catalog.header = Some(message);
        } else {
            catalog.messages.push(message);
        }
    }
}

fn parse_quoted(raw: &str, line_number: usize) -> Result<String> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| anyhow::anyhow!("line {line_number}: expected a quoted string"))?;
    if trimmed.len() < 2 {
        bail!("line {line_number}: expected a quoted string");
    }

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            if ch == '"' {
                bail!("line {line_number}: unescaped quote inside string");
            }
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('a') => out.push('\u{7}'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => bail!("line {line_number}: dangling escape at end of string"),
        }
    }
    Ok(out)
}

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{7}' => out.push_str("\\a"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\u{b}' => out.push_str("\\v"),
            _ => out.push(ch),
        }
    }
    out
}

fn render_message(message: &Message, options: &RenderOptions) -> String {
    let mut out = String::new();
    let prefix = if message.obsolete { "#~ " } else { "" };

    for comment in &message.translator_comments {
        if comment.is_empty() {
            out.push_str("#\n");
        } else {
            out.push_str(&format!("# {comment}\n"));
        }
    }
    for comment in &message.extracted_comments {
        out.push_str(&format!("#. {comment}\n"));
    }
    if options.include_locations && !message.obsolete && !message.references.is_empty() {
        render_references(&mut out, &message.references, options.wrap_width);
    }
    if !message.flags.is_empty() {
        out.push_str(&format!("#, {}\n", message.flags.join(", ")));
    }
    for previous in &message.previous {
        if message.obsolete {
            out.push_str(&format!("#~| {previous}\n"));
        } else {
            out.push_str(&format!("#| {previous}\n"));
        }
    }

    if let Some(context) = &message.context {
        render_field(&mut out, prefix, "msgctxt", context, options.wrap_width);
    }
    render_field(&mut out, prefix, "msgid", &message.msgid, options.wrap_width);
    match &message.msgid_plural {
        Some(plural) => {
            render_field(&mut out, prefix, "msgid_plural", plural, options.wrap_width);
            let forms = if message.msgstr.is_empty() {
                vec![String::new(), String::new()]
            } else {
                message.msgstr.clone()
            };
            for (index, value) in forms.iter().enumerate() {
                render_field(
                    &mut out,
                    prefix,
                    &format!("msgstr[{index}]"),
                    value,
                    options.wrap_width,
                );
            }
        }
        None => {
            render_field(
                &mut out,
                prefix,
                "msgstr",
                message.translation(),
                options.wrap_width,
            );
        }
    }
    out
}

fn render_references(out: &mut String, references: &[String], wrap_width: Option<usize>) {
    let mut line = String::from("#:");
    for reference in references {
        let candidate_len = line.chars().count() + 1 + reference.chars().count();
        if let Some(width) = wrap_width
            && line.len() > 2
            && candidate_len > width
        {
            out.push_str(&line);
            out.push('\n');
            line = String::from("#:");
        }
        line.push(' ');
        line.push_str(reference);
    }
    out.push_str(&line);
    out.push('\n');
}

fn render_field(
    out: &mut String,
    prefix: &str,
    keyword: &str,
    value: &str,
    wrap_width: Option<usize>,
) {
    let segments = split_after_newlines(value);
    let single = format!("{prefix}{keyword} \"{}\"", escape(value));
    let fits = match wrap_width {
        Some(width) => single.chars().count() <= width,
        None => true,
    };
    if segments.len() <= 1 && fits {
        out.push_str(&single);
        out.push('\n');
        return;
    }

    out.push_str(&format!("{prefix}{keyword} \"\"\n"));
    let chunk_width = wrap_width.map(|width| width.saturating_sub(prefix.len() + 2).max(1));
    for segment in segments {
        for chunk in wrap_escaped(&escape(segment), chunk_width) {
            out.push_str(&format!("{prefix}\"{chunk}\"\n"));
        }
    }
}

fn split_after_newlines(value: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0usize;
    for (index, ch) in value.char_indices() {
        if ch == '\n' {
            segments.push(&value[start..index + 1]);
            start = index + 1;
        }
    }
    if start < value.len() {
        segments.push(&value[start..]);
    }
    segments
}

fn wrap_escaped(escaped: &str, width: Option<usize>) -> Vec<String> {
    let Some(width) = width else {
        return vec![escaped.to_string()];
    };
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for piece in escaped.split_inclusive(' ') {
        let piece_len = piece.chars().count();
        if current_len > 0 && current_len + piece_len > width {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(piece);
        current_len += piece_len;
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Drops the leading header block (every line up to the first blank one) of
/// a tool's output; the blank separator and everything after it are kept.
pub fn strip_header_block(text: &str) -> &str {
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']).is_empty() {
            return &text[offset..];
        }
        offset += line.len();
    }
    ""
}

/// Removes `#~` blocks from catalog text without re-rendering the rest.
pub fn strip_obsolete_blocks(text: &str) -> String {
    let mut kept: Vec<Vec<&str>> = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            if !block.is_empty() {
                kept.push(std::mem::take(&mut block));
            }
            continue;
        }
        block.push(line);
    }
    if !block.is_empty() {
        kept.push(block);
    }

    let mut out = String::with_capacity(text.len());
    let mut first = true;
    for block in kept {
        let is_obsolete = block
            .iter()
            .any(|line| line.starts_with("#~"))
            && block.iter().all(|line| line.starts_with('#'));
        if is_obsolete {
            continue;
        }
        if !first {
            out.push('\n');
        }
        first = false;
        for line in block {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Catalog text with the `POT-Creation-Date` header line removed; two
/// catalogs that compare equal here differ only by extraction time.
pub fn without_creation_date(text: &str) -> String {
    text.lines()
        .filter(|line| !line.starts_with("\"POT-Creation-Date:"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Writes a `Plural-Forms` header line into catalog text. A Plural-Forms line
/// already present in the header block is replaced; otherwise the line is
/// added as the last header field.
pub fn seed_plural_forms(text: &str, plural_forms: &str) -> String {
    let replacement = format!("\"Plural-Forms: {plural_forms}\\n\"");
    let mut out = Vec::new();
    let mut in_header = true;
    let mut seeded = false;

    for line in text.split('\n') {
        if in_header && !seeded {
            if line.starts_with("\"Plural-Forms:") {
                out.push(replacement.clone());
                seeded = true;
                continue;
            }
            if line.is_empty() {
                out.push(replacement.clone());
                seeded = true;
                in_header = false;
            }
        }
        out.push(line.to_string());
    }
    if !seeded {
        if out.last().is_some_and(|line| line.is_empty()) {
            out.pop();
            out.push(replacement);
            out.push(String::new());
        } else {
            out.push(replacement);
        }
    }
    out.join("\n")
}

/// Replaces the file through a sibling temporary file and a rename so readers
/// never observe a half-written catalog.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?;
    let temporary = parent.join(format!(".{file_name}.tmp"));
    fs::write(&temporary, content)
        .with_context(|| format!("failed to write {}", temporary.display()))?;
    fs::rename(&temporary, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            temporary.display(),
            path.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;
    use time::macros::datetime;

    use super::{
        Catalog, Message, RenderOptions, header_timestamp, seed_plural_forms, split_context,
        strip_header_block, strip_obsolete_blocks, template_header, without_creation_date,
        write_atomic,
    };

    const SAMPLE: &str = r#"# French translations.
#, fuzzy
msgid ""
msgstr ""
"Project-Id-Version: demo\n"
"Content-Type: text/plain; charset=UTF-8\n"
"Plural-Forms: nplurals=2; plural=(n > 1);\n"

#. Translators: button label
#: app/views.py:10 templates/base.html:4
#, python-format
msgid "Hello %(name)s"
msgstr "Bonjour %(name)s"

msgctxt "menu"
msgid "File"
msgstr "Fichier"

#: app/models.py:3
msgid "apple"
msgid_plural "apples"
msgstr[0] "pomme"
msgstr[1] "pommes"

msgid ""
"Line one\n"
"Line two"
msgstr ""

# kept for history
#~ msgid "Old"
#~ msgstr "Ancien"
"#;

    #[test]
    fn parse_reads_header_messages_and_obsolete_entries() {
        let catalog = Catalog::parse(SAMPLE).expect("parse");
        assert_eq!(
            catalog.header_field("Plural-Forms").as_deref(),
            Some("nplurals=2; plural=(n > 1);")
        );
        assert_eq!(catalog.messages.len(), 5);

        let hello = &catalog.messages[0];
        assert_eq!(hello.msgid, "Hello %(name)s");
        assert_eq!(hello.translation(), "Bonjour %(name)s");
        assert_eq!(
            hello.references,
            vec!["app/views.py:10".to_string(), "templates/base.html:4".to_string()]
        );
        assert_eq!(hello.extracted_comments, vec!["Translators: button label"]);
        assert!(hello.has_flag("python-format"));

        let file = catalog.find(Some("menu"), "File").expect("context entry");
        assert_eq!(file.translation(), "Fichier");
        assert_eq!(split_context(&file.key()), (Some("menu"), "File"));

        let apple = &catalog.messages[2];
        assert_eq!(apple.msgid_plural.as_deref(), Some("apples"));
        assert_eq!(apple.msgstr, vec!["pomme".to_string(), "pommes".to_string()]);

        assert_eq!(catalog.messages[3].msgid, "Line one\nLine two");

        let old = &catalog.messages[4];
        assert!(old.obsolete);
        assert_eq!(old.translator_comments, vec!["kept for history"]);
        assert_eq!(old.translation(), "Ancien");
        assert_eq!(catalog.live_count(), 4);
        assert_eq!(catalog.obsolete_count(), 1);
    }

    #[test]
    fn render_reproduces_canonical_catalog_text() {
        let catalog = Catalog::parse(SAMPLE).expect("parse");
        let rendered = catalog.render(&RenderOptions::default());
        assert_eq!(rendered, SAMPLE);
    }

    #[test]
    fn render_wraps_long_strings_at_spaces() {
        let mut catalog = Catalog::default();
        let long = "This sentence is deliberately long so that the renderer has to wrap it over several lines.";
        catalog.messages.push(Message::new(long));
        let rendered = catalog.render(&RenderOptions::default());

        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "msgid \"\"");
        assert!(lines.iter().all(|line| line.chars().count() <= 79));
        let reparsed = Catalog::parse(&rendered).expect("reparse");
        assert_eq!(reparsed.messages[0].msgid, long);

        let unwrapped = catalog.render(&RenderOptions {
            wrap_width: None,
            include_locations: true,
        });
        assert!(unwrapped.starts_with(&format!("msgid \"{long}\"")));
    }

    #[test]
    fn render_skips_locations_when_disabled() {
        let mut message = Message::new("Save");
        message.references.push("app/forms.py:3".to_string());
        let catalog = Catalog {
            header: None,
            messages: vec![message],
        };
        let rendered = catalog.render(&RenderOptions {
            wrap_width: Some(79),
            include_locations: false,
        });
        assert_eq!(rendered, "msgid \"Save\"\nmsgstr \"\"\n");
    }

    #[test]
    fn parse_reports_line_of_malformed_string() {
        let error = Catalog::parse("msgid \"ok\"\nmsgstr \"broken\n").expect_err("must fail");
        assert!(error.to_string().contains("line 2"));
    }

    #[test]
    fn set_header_field_replaces_or_appends() {
        let mut catalog = Catalog::parse(SAMPLE).expect("parse");
        catalog.set_header_field("Plural-Forms", "nplurals=3; plural=0;");
        catalog.set_header_field("Language", "fr");
        assert_eq!(
            catalog.header_field("Plural-Forms").as_deref(),
            Some("nplurals=3; plural=0;")
        );
        assert_eq!(catalog.header_field("Language").as_deref(), Some("fr"));
    }

    #[test]
    fn strip_header_block_keeps_separator_and_entries() {
        let text = "msgid \"\"\nmsgstr \"\"\n\"Content-Type: text/plain; charset=UTF-8\\n\"\n\n#: a.py:1\nmsgid \"A\"\nmsgstr \"\"\n";
        assert_eq!(
            strip_header_block(text),
            "\n#: a.py:1\nmsgid \"A\"\nmsgstr \"\"\n"
        );
        assert_eq!(strip_header_block("msgid \"\"\nmsgstr \"\"\n"), "");
    }

    #[test]
    fn strip_obsolete_blocks_drops_only_obsolete_entries() {
        let stripped = strip_obsolete_blocks(SAMPLE);
        let catalog = Catalog::parse(&stripped).expect("parse stripped");
        assert_eq!(catalog.obsolete_count(), 0);
        assert_eq!(catalog.live_count(), 4);
        assert!(!stripped.contains("kept for history"));
    }

    #[test]
    fn seed_plural_forms_replaces_placeholder_or_appends_field() {
        let with_placeholder = "msgid \"\"\nmsgstr \"\"\n\"Plural-Forms: nplurals=INTEGER; plural=EXPRESSION;\\n\"\n\nmsgid \"A\"\nmsgstr \"\"\n";
        let seeded = seed_plural_forms(with_placeholder, "nplurals=2; plural=(n > 1);");
        assert!(seeded.contains("\"Plural-Forms: nplurals=2; plural=(n > 1);\\n\"\n\nmsgid \"A\""));
        assert!(!seeded.contains("INTEGER"));

        let without = "msgid \"\"\nmsgstr \"\"\n\"Language: \\n\"\n\nmsgid \"A\"\nmsgstr \"\"\n";
        let seeded = seed_plural_forms(without, "nplurals=2; plural=(n > 1);");
        assert_eq!(
            seeded,
            "msgid \"\"\nmsgstr \"\"\n\"Language: \\n\"\n\"Plural-Forms: nplurals=2; plural=(n > 1);\\n\"\n\nmsgid \"A\"\nmsgstr \"\"\n"
        );
    }

    #[test]
    fn without_creation_date_ignores_extraction_time() {
        let left = template_header("2026-01-01 10:00+0000", "UTF-8", "", None);
        let right = template_header("2026-02-02 11:30+0000", "UTF-8", "", None);
        let render = |message: Message| {
            Catalog {
                header: Some(message),
                messages: Vec::new(),
            }
            .render(&RenderOptions::default())
        };
        let (left, right) = (render(left), render(right));
        assert_ne!(left, right);
        assert_eq!(without_creation_date(&left), without_creation_date(&right));
    }

    #[test]
    fn header_timestamp_uses_gettext_layout() {
        assert_eq!(
            header_timestamp(datetime!(2026-10-18 09:05 UTC)),
            "2026-10-18 09:05+0000"
        );
    }

    #[test]
    fn write_atomic_replaces_file_contents() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("fr").join("LC_MESSAGES").join("django.po");
        write_atomic(&path, "first").expect("first write");
        write_atomic(&path, "second").expect("second write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .collect();
        assert_eq!(leftovers.len(), 1);
    }
}
