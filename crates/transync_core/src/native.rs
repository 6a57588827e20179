//! In-process implementation of the catalog primitives, for hosts without
//! the GNU gettext tools.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use similar::TextDiff;
use tracing::debug;

use crate::catalog::{
    Catalog, Message, PLURAL_FORMS_PLACEHOLDER, RenderOptions, current_header_timestamp,
    template_header,
};
use crate::config::{DomainSpec, ToolBackend, ToolSettings};
use crate::tools::{CatalogTools, ToolStage, extraction_keywords, tool_error};

/// Minimum similarity for an old translation to seed a new message as fuzzy.
pub const FUZZY_THRESHOLD: f32 = 0.6;

const DEFAULT_KEYWORDS: [&str; 11] = [
    "gettext",
    "_",
    "ugettext",
    "dgettext:2",
    "dcgettext:2",
    "ngettext:1,2",
    "ungettext:1,2",
    "dngettext:2,3",
    "dcngettext:2,3",
    "pgettext:1c,2",
    "npgettext:1c,2,3",
];

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeywordSpec {
    singular: usize,
    plural: Option<usize>,
    context: Option<usize>,
}

fn parse_keyword(spec: &str) -> (String, KeywordSpec) {
    let (name, args) = match spec.split_once(':') {
        Some((name, args)) => (name, args),
        None => (spec, ""),
    };
    let mut parsed = KeywordSpec {
        singular: 1,
        plural: None,
        context: None,
    };
    let mut positions = Vec::new();
    for part in args.split(',') {
        let part = part.trim();
        if let Some(number) = part.strip_suffix('c') {
            if let Ok(number) = number.parse() {
                parsed.context = Some(number);
            }
        } else if let Ok(number) = part.parse::<usize>() {
            positions.push(number);
        }
    }
    if let Some(first) = positions.first() {
        parsed.singular = *first;
    }
    parsed.plural = positions.get(1).copied();
    (name.to_string(), parsed)
}

fn keyword_table(domain: &DomainSpec) -> HashMap<String, KeywordSpec> {
    DEFAULT_KEYWORDS
        .iter()
        .map(|k| k.to_string())
        .chain(extraction_keywords(domain))
        .map(|spec| parse_keyword(&spec))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Python,
    Script,
}

impl Dialect {
    fn for_language(language: &str) -> Self {
        if language.eq_ignore_ascii_case("python") {
            Self::Python
        } else {
            Self::Script
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lexeme {
    Ident(String),
    Str(String),
    Open(char),
    Close,
    Comma,
    Plus,
    Other,
}

#[derive(Debug, Clone)]
struct Token {
    lexeme: Lexeme,
    line: usize,
}

#[derive(Debug, Clone)]
struct Comment {
    first_line: usize,
    last_line: usize,
    text: String,
}

#[derive(Debug)]
struct LexError {
    line: usize,
    message: String,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    dialect: Dialect,
    tokens: Vec<Token>,
    comments: Vec<Comment>,
}

impl Lexer {
    fn new(source: &str, dialect: Dialect) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            dialect,
            tokens: Vec::new(),
            comments: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, lexeme: Lexeme, line: usize) {
        self.tokens.push(Token { lexeme, line });
    }

    fn run(mut self) -> std::result::Result<(Vec<Token>, Vec<Comment>), LexError> {
        while let Some(ch) = self.peek(0) {
            match ch {
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                c if c.is_whitespace() => self.pos += 1,
                '#' => self.line_comment(1),
                '/' if self.dialect == Dialect::Script && self.peek(1) == Some('/') => {
                    self.line_comment(2)
                }
                '/' if self.dialect == Dialect::Script && self.peek(1) == Some('*') => {
                    self.block_comment()
                }
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '"' | '\'' => {
                    let line = self.line;
                    let value = self.string(false)?;
                    self.push(Lexeme::Str(value), line);
                }
                '`' if self.dialect == Dialect::Script => {
                    let line = self.line;
                    let value = self.string(true)?;
                    // Template literals with substitutions are not constant.
                    let lexeme = if value.contains("${") {
                        Lexeme::Other
                    } else {
                        Lexeme::Str(value)
                    };
                    self.push(lexeme, line);
                }
                c if c.is_alphabetic() || c == '_' || c == '$' => self.identifier()?,
                '(' | '[' | '{' => {
                    self.push(Lexeme::Open(ch), self.line);
                    self.pos += 1;
                }
                ')' | ']' | '}' => {
                    self.push(Lexeme::Close, self.line);
                    self.pos += 1;
                }
                ',' => {
                    self.push(Lexeme::Comma, self.line);
                    self.pos += 1;
                }
                '+' | '.' if self.dialect == Dialect::Script || ch == '+' => {
                    self.push(Lexeme::Plus, self.line);
                    self.pos += 1;
                }
                _ => {
                    self.push(Lexeme::Other, self.line);
                    self.pos += 1;
                }
            }
        }
        Ok((self.tokens, self.comments))
    }

    fn line_comment(&mut self, marker_len: usize) {
        let start = self.pos + marker_len;
        let mut end = start;
        while end < self.chars.len() && self.chars[end] != '\n' {
            end += 1;
        }
        let text: String = self.chars[start..end].iter().collect();
        self.comments.push(Comment {
            first_line: self.line,
            last_line: self.line,
            text: text.trim().to_string(),
        });
        self.pos = end;
    }

    fn block_comment(&mut self) {
        let first_line = self.line;
        let start = self.pos + 2;
        let mut end = start;
        while end < self.chars.len()
            && !(self.chars[end] == '*' && self.chars.get(end + 1) == Some(&'/'))
        {
            if self.chars[end] == '\n' {
                self.line += 1;
            }
            end += 1;
        }
        let text: String = self.chars[start..end.min(self.chars.len())].iter().collect();
        let text = text
            .lines()
            .map(|line| line.trim().trim_start_matches('*').trim())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        self.comments.push(Comment {
            first_line,
            last_line: self.line,
            text,
        });
        self.pos = (end + 2).min(self.chars.len());
    }

    fn identifier(&mut self) -> std::result::Result<(), LexError> {
        let line = self.line;
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let ident: String = self.chars[start..self.pos].iter().collect();
        let next = self.peek(0);
        if self.dialect == Dialect::Python
            && matches!(next, Some('"') | Some('\''))
            && is_string_prefix(&ident)
        {
            let raw = ident.to_ascii_lowercase().contains('r');
            let value = self.string(raw)?;
            self.push(Lexeme::Str(value), line);
            return Ok(());
        }
        self.push(Lexeme::Ident(ident), line);
        Ok(())
    }

    /// Reads a quoted literal starting at the opening quote.
    fn string(&mut self, raw: bool) -> std::result::Result<String, LexError> {
        let start_line = self.line;
        let quote = self.chars[self.pos];
        let triple = self.dialect == Dialect::Python
            && self.peek(1) == Some(quote)
            && self.peek(2) == Some(quote);
        let multiline = triple || quote == '`';
        self.pos += if triple { 3 } else { 1 };

        let unterminated = || LexError {
            line: start_line,
            message: "unterminated string literal".to_string(),
        };
        let mut out = String::new();
        loop {
            let Some(ch) = self.peek(0) else {
                return Err(unterminated());
            };
            if ch == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(out);
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(out);
                }
            }
            if ch == '\n' {
                if !multiline {
                    return Err(unterminated());
                }
                self.line += 1;
            }
            if ch == '\\' && !raw {
                let Some(next) = self.peek(1) else {
                    return Err(unterminated());
                };
                self.pos += 2;
                match next {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'a' => out.push('\u{7}'),
                    'b' => out.push('\u{8}'),
                    'f' => out.push('\u{c}'),
                    'v' => out.push('\u{b}'),
                    '0' => out.push('\0'),
                    '\\' | '\'' | '"' | '`' => out.push(next),
                    '\n' => self.line += 1,
                    'x' => self.hex_escape('x', 2, &mut out),
                    'u' => self.hex_escape('u', 4, &mut out),
                    'U' => self.hex_escape('U', 8, &mut out),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
                continue;
            }
            if ch == '\\' && raw {
                out.push(ch);
                if let Some(next) = self.peek(1)
                    && (next == quote || next == '\\')
                {
                    out.push(next);
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                continue;
            }
            out.push(ch);
            self.pos += 1;
        }
    }

    fn hex_escape(&mut self, letter: char, digits: usize, out: &mut String) {
        let end = (self.pos + digits).min(self.chars.len());
        let text: String = self.chars[self.pos..end].iter().collect();
        match u32::from_str_radix(&text, 16).ok().and_then(char::from_u32) {
            Some(ch) if text.len() == digits => {
                out.push(ch);
                self.pos = end;
            }
            _ => {
                out.push('\\');
                out.push(letter);
            }
        }
    }
}

fn is_string_prefix(ident: &str) -> bool {
    matches!(
        ident.to_ascii_lowercase().as_str(),
        "r" | "u" | "b" | "f" | "rb" | "br" | "fr" | "rf"
    )
}

/// True when `value` holds at least one printf-style directive and no
/// malformed one.
pub fn is_python_format(value: &str) -> bool {
    let chars: Vec<char> = value.chars().collect();
    let mut index = 0usize;
    let mut found = false;
    while index < chars.len() {
        if chars[index] != '%' {
            index += 1;
            continue;
        }
        index += 1;
        if chars.get(index) == Some(&'%') {
            index += 1;
            continue;
        }
        if chars.get(index) == Some(&'(') {
            match chars[index..].iter().position(|c| *c == ')') {
                Some(close) => index += close + 1,
                None => return false,
            }
        }
        while chars
            .get(index)
            .is_some_and(|c| matches!(c, '#' | '0' | '-' | ' ' | '+'))
        {
            index += 1;
        }
        while chars.get(index).is_some_and(|c| c.is_ascii_digit() || *c == '*') {
            index += 1;
        }
        if chars.get(index) == Some(&'.') {
            index += 1;
            while chars.get(index).is_some_and(|c| c.is_ascii_digit() || *c == '*') {
                index += 1;
            }
        }
        while chars.get(index).is_some_and(|c| matches!(c, 'h' | 'l' | 'L')) {
            index += 1;
        }
        match chars.get(index) {
            Some(c) if "diouxXeEfFgGcrsa".contains(*c) => {
                found = true;
                index += 1;
            }
            _ => return false,
        }
    }
    found
}

fn format_flag(language: &str) -> Option<&'static str> {
    match language.to_ascii_lowercase().as_str() {
        "python" => Some("python-format"),
        "perl" => Some("perl-format"),
        "javascript" => Some("javascript-format"),
        _ => None,
    }
}

/// Concatenation of an argument made only of string literals.
fn literal_argument(tokens: &[&Token]) -> Option<(String, usize)> {
    let first = tokens.first()?;
    let mut value = String::new();
    let mut expect_string = true;
    for token in tokens {
        match (&token.lexeme, expect_string) {
            (Lexeme::Str(part), _) => {
                value.push_str(part);
                expect_string = false;
            }
            (Lexeme::Plus, false) => expect_string = true,
            _ => return None,
        }
    }
    (!expect_string).then_some((value, first.line))
}

fn call_arguments(tokens: &[Token], open: usize) -> Option<Vec<Vec<&Token>>> {
    let mut args: Vec<Vec<&Token>> = vec![Vec::new()];
    let mut depth = 0usize;
    for token in &tokens[open + 1..] {
        match token.lexeme {
            Lexeme::Open(_) => depth += 1,
            Lexeme::Close if depth == 0 => return Some(args),
            Lexeme::Close => depth -= 1,
            Lexeme::Comma if depth == 0 => {
                args.push(Vec::new());
                continue;
            }
            _ => {}
        }
        if let Some(current) = args.last_mut() {
            current.push(token);
        }
    }
    None
}

/// Comment text attached to a call on `line`: the contiguous run of comments
/// ending on that line or the one before, from its first `Translators` line.
fn translator_comments(comments: &[Comment], line: usize) -> Vec<String> {
    let mut block: Vec<&Comment> = Vec::new();
    let mut expected = line;
    for comment in comments.iter().rev() {
        if comment.first_line > line {
            continue;
        }
        let adjacent = comment.last_line == expected
            || comment.last_line + 1 == expected
            || (block.is_empty() && comment.last_line == line);
        if !adjacent {
            break;
        }
        block.push(comment);
        expected = comment.first_line;
    }
    block.reverse();
    let lines: Vec<String> = block
        .iter()
        .flat_map(|comment| comment.text.lines().map(str::to_string))
        .collect();
    match lines.iter().position(|line| line.starts_with("Translators")) {
        Some(start) => lines[start..].to_vec(),
        None => Vec::new(),
    }
}

#[derive(Default)]
struct MessageCollector {
    messages: Vec<Message>,
    index: HashMap<(Option<String>, String), usize>,
}

impl MessageCollector {
    fn add(&mut self, message: Message) {
        let key = (message.context.clone(), message.msgid.clone());
        match self.index.get(&key) {
            Some(&position) => merge_duplicate(&mut self.messages[position], message),
            None => {
                self.index.insert(key, self.messages.len());
                self.messages.push(message);
            }
        }
    }
}

fn merge_duplicate(target: &mut Message, incoming: Message) {
    for reference in incoming.references {
        if !target.references.contains(&reference) {
            target.references.push(reference);
        }
    }
    for comment in incoming.extracted_comments {
        if !target.extracted_comments.contains(&comment) {
            target.extracted_comments.push(comment);
        }
    }
    for comment in incoming.translator_comments {
        if !target.translator_comments.contains(&comment) {
            target.translator_comments.push(comment);
        }
    }
    for flag in incoming.flags {
        target.add_flag(&flag);
    }
    if target.msgid_plural.is_none() {
        target.msgid_plural = incoming.msgid_plural;
        if target.msgid_plural.is_some() && target.msgstr.len() < 2 {
            target.msgstr = vec![String::new(), String::new()];
        }
    }
    if !target.is_translated() && incoming.msgstr.iter().any(|s| !s.is_empty()) {
        target.msgstr = incoming.msgstr;
    }
}

/// Extracts messages from source text. `reference_path` is the path written
/// into `#:` lines.
pub fn extract_messages(
    source: &str,
    reference_path: &str,
    domain: &DomainSpec,
) -> std::result::Result<Vec<Message>, String> {
    let dialect = Dialect::for_language(&domain.language);
    let (tokens, comments) = Lexer::new(source, dialect)
        .run()
        .map_err(|error| format!("{reference_path}:{}: {}", error.line, error.message))?;
    let keywords = keyword_table(domain);
    let flag = format_flag(&domain.language);

    let mut collector = MessageCollector::default();
    for (index, token) in tokens.iter().enumerate() {
        let Lexeme::Ident(name) = &token.lexeme else {
            continue;
        };
        let Some(spec) = keywords.get(name) else {
            continue;
        };
        if tokens.get(index + 1).map(|t| &t.lexeme) != Some(&Lexeme::Open('(')) {
            continue;
        }
        let Some(args) = call_arguments(&tokens, index + 1) else {
            continue;
        };
        let argument = |position: usize| {
            args.get(position.checked_sub(1)?)
                .and_then(|tokens| literal_argument(tokens))
        };

        let Some((msgid, line)) = argument(spec.singular) else {
            continue;
        };
        if msgid.is_empty() {
            continue;
        }
        let context = match spec.context {
            Some(position) => match argument(position) {
                Some((context, _)) => Some(context),
                None => continue,
            },
            None => None,
        };
        let msgid_plural = match spec.plural {
            Some(position) => match argument(position) {
                Some((plural, _)) => Some(plural),
                None => continue,
            },
            None => None,
        };

        let mut message = Message::new(msgid);
        message.context = context;
        message.references.push(format!("{reference_path}:{line}"));
        message.extracted_comments = translator_comments(&comments, token.line);
        if let Some(flag) = flag {
            let formatted = is_python_format(&message.msgid)
                || msgid_plural.as_deref().is_some_and(is_python_format);
            if formatted {
                message.add_flag(flag);
            }
        }
        if msgid_plural.is_some() {
            message.msgstr = vec![String::new(), String::new()];
        }
        message.msgid_plural = msgid_plural;
        collector.add(message);
    }
    Ok(collector.messages)
}

fn nplurals(catalog: &Catalog) -> usize {
    catalog
        .header_field("Plural-Forms")
        .and_then(|value| {
            value.split(';').find_map(|part| {
                part.trim()
                    .strip_prefix("nplurals=")
                    .and_then(|n| n.trim().parse::<usize>().ok())
            })
        })
        .filter(|n| *n > 0)
        .unwrap_or(2)
}

/// Merges the messages of `template` into `existing` the way msgmerge does:
/// exact matches keep their translation, unmatched old messages become
/// obsolete, new messages arrive untranslated or, with `fuzzy` set, seeded
/// from the closest unused old translation and flagged fuzzy.
pub fn merge_catalogs(existing: &Catalog, template: &Catalog, fuzzy: bool) -> Catalog {
    let mut merged_catalog = Catalog {
        header: existing.header.clone(),
        messages: Vec::new(),
    };
    if merged_catalog.header.is_some()
        && let Some(date) = template.header_field("POT-Creation-Date")
    {
        merged_catalog.set_header_field("POT-Creation-Date", &date);
    }
    let plural_count = nplurals(existing);

    let index: HashMap<(Option<&str>, &str), usize> = existing
        .messages
        .iter()
        .enumerate()
        .map(|(position, message)| ((message.context.as_deref(), message.msgid.as_str()), position))
        .collect();
    let mut used = vec![false; existing.messages.len()];
    let mut messages = Vec::with_capacity(template.messages.len());

    for incoming in template.messages.iter().filter(|message| !message.obsolete) {
        let mut merged = incoming.clone();
        merged.obsolete = false;
        merged.translator_comments.clear();
        merged.remove_flag("fuzzy");

        let key = (incoming.context.as_deref(), incoming.msgid.as_str());
        if let Some(&position) = index.get(&key) {
            used[position] = true;
            let old = &existing.messages[position];
            merged.translator_comments = old.translator_comments.clone();
            merged.msgstr = shape_translations(&old.msgstr, incoming, plural_count);
            if old.has_flag("fuzzy") {
                merged.add_flag("fuzzy");
            }
            if old.msgid_plural.is_some() != incoming.msgid_plural.is_some() && old.is_translated()
            {
                merged.add_flag("fuzzy");
            }
            messages.push(merged);
            continue;
        }

        merged.msgstr = if incoming.msgid_plural.is_some() {
            vec![String::new(); plural_count]
        } else {
            vec![String::new()]
        };
        if fuzzy
            && let Some(position) = closest_translation(existing, &used, incoming)
        {
            let old = &existing.messages[position];
            debug!(msgid = %incoming.msgid, previous = %old.msgid, "fuzzy match");
            merged.msgstr = shape_translations(&old.msgstr, incoming, plural_count);
            merged.add_flag("fuzzy");
        }
        messages.push(merged);
    }

    for (position, old) in existing.messages.iter().enumerate() {
        if used[position] {
            continue;
        }
        if !old.obsolete && !old.is_translated() && !old.msgstr.iter().any(|s| !s.is_empty()) {
            continue;
        }
        let mut obsolete = old.clone();
        obsolete.obsolete = true;
        obsolete.references.clear();
        messages.push(obsolete);
    }

    merged_catalog.messages = messages;
    merged_catalog
}

fn shape_translations(old: &[String], incoming: &Message, plural_count: usize) -> Vec<String> {
    if incoming.msgid_plural.is_none() {
        return vec![old.first().cloned().unwrap_or_default()];
    }
    let mut shaped = old.to_vec();
    shaped.resize(plural_count.max(1), String::new());
    if shaped.len() > 1 && shaped[1..].iter().all(String::is_empty) && !shaped[0].is_empty() {
        let first = shaped[0].clone();
        for slot in shaped.iter_mut().skip(1) {
            slot.clone_from(&first);
        }
    }
    shaped
}

fn closest_translation(existing: &Catalog, used: &[bool], incoming: &Message) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (position, old) in existing.messages.iter().enumerate() {
        if used[position] || old.obsolete || !old.is_translated() || old.context != incoming.context
        {
            continue;
        }
        let ratio = TextDiff::from_chars(old.msgid.as_str(), incoming.msgid.as_str()).ratio();
        if ratio >= FUZZY_THRESHOLD && best.is_none_or(|(_, score)| ratio > score) {
            best = Some((position, ratio));
        }
    }
    best.map(|(position, _)| position)
}

/// Collapses duplicate `(msgctxt, msgid)` messages of a concatenated
/// template, unioning their references, comments and flags.
pub fn uniq_catalog(catalog: &Catalog) -> Catalog {
    let mut collector = MessageCollector::default();
    for message in &catalog.messages {
        collector.add(message.clone());
    }
    let mut header = catalog.header.clone();
    if let Some(current) = header.as_mut()
        && let Some(text) = current.msgstr.first_mut()
    {
        *text = text.replace("charset=CHARSET", "charset=UTF-8");
    }
    Catalog {
        header,
        messages: collector.messages,
    }
}

/// [`CatalogTools`] implemented without external programs.
pub struct NativeTools {
    settings: ToolSettings,
    format: RenderOptions,
}

impl NativeTools {
    pub fn new(settings: ToolSettings, format: RenderOptions) -> Self {
        Self { settings, format }
    }
}

impl CatalogTools for NativeTools {
    fn backend(&self) -> ToolBackend {
        ToolBackend::Native
    }

    fn check_version(&self) -> Result<String> {
        Ok(format!("transync native {}", env!("CARGO_PKG_VERSION")))
    }

    fn extract(
        &self,
        domain: &DomainSpec,
        working_dir: &Path,
        relative_file: &str,
    ) -> Result<String> {
        let path = working_dir.join(relative_file);
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let source = String::from_utf8(bytes).map_err(|_| {
            tool_error(
                ToolStage::Extract,
                "native extract",
                relative_file,
                format!("{relative_file}: invalid UTF-8 input"),
            )
        })?;
        let messages = extract_messages(&source, relative_file, domain).map_err(|message| {
            tool_error(ToolStage::Extract, "native extract", relative_file, message)
        })?;
        if messages.is_empty() {
            return Ok(String::new());
        }

        let has_plural = messages.iter().any(|m| m.msgid_plural.is_some());
        let catalog = Catalog {
            header: Some(template_header(
                &current_header_timestamp(),
                "CHARSET",
                "",
                has_plural.then_some(PLURAL_FORMS_PLACEHOLDER),
            )),
            messages,
        };
        Ok(catalog.render(&self.format))
    }

    fn uniq(&self, template: &Path) -> Result<String> {
        let path = template.to_string_lossy().to_string();
        let catalog = Catalog::read(template)
            .map_err(|error| tool_error(ToolStage::Merge, "native uniq", &path, format!("{error:#}")))?;
        Ok(uniq_catalog(&catalog).render(&self.format))
    }

    fn merge(&self, catalog: &Path, template: &Path) -> Result<String> {
        let path = catalog.to_string_lossy().to_string();
        let existing = Catalog::read(catalog)
            .map_err(|error| tool_error(ToolStage::Merge, "native merge", &path, format!("{error:#}")))?;
        let incoming = Catalog::read(template)
            .map_err(|error| tool_error(ToolStage::Merge, "native merge", &path, format!("{error:#}")))?;
        let merged = merge_catalogs(&existing, &incoming, self.settings.fuzzy_matching);
        Ok(merged.render(&self.format))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{NativeTools, extract_messages, is_python_format, merge_catalogs, uniq_catalog};
    use crate::catalog::{Catalog, RenderOptions};
    use crate::config::{Settings, ToolSettings};
    use crate::error::classify;
    use crate::tools::CatalogTools;

    fn settings() -> Settings {
        Settings::defaults(Path::new("/p")).expect("settings")
    }

    #[test]
    fn extracts_python_calls_with_context_plural_and_comments() {
        let source = r#"from django.utils.translation import gettext as _

# Translators: label of the save button
LABEL = _("Save")
TITLE = pgettext("menu", 'File')
COUNT = ngettext("%(n)s apple", "%(n)s apples", n)
LAZY = gettext_lazy(
    "Multi "
    "part"
)
DOC = _(r"raw\n") + _(name)
AGAIN = _("Save")
"#;
        let settings = settings();
        let domain = settings.domain("django").expect("django");
        let messages = extract_messages(source, "app/views.py", domain).expect("extract");

        let ids: Vec<&str> = messages.iter().map(|m| m.msgid.as_str()).collect();
        assert_eq!(
            ids,
            vec!["Save", "File", "%(n)s apple", "Multi part", "raw\\n"]
        );
        let save = &messages[0];
        assert_eq!(save.references, vec!["app/views.py:4", "app/views.py:12"]);
        assert_eq!(
            save.extracted_comments,
            vec!["Translators: label of the save button"]
        );
        assert_eq!(messages[1].context.as_deref(), Some("menu"));
        assert_eq!(messages[2].msgid_plural.as_deref(), Some("%(n)s apples"));
        assert!(messages[2].has_flag("python-format"));
        assert_eq!(messages[3].references, vec!["app/views.py:8"]);
    }

    #[test]
    fn extracts_pythonized_script_sources() {
        let source = "# Translators: shown in the header\nvar title = gettext('Welcome');\nvar n = ngettext(\"one item\", \"many items\", count);\n/* plain */ interpolate(gettext(\"Hi \" + \"there\"), []);\n";
        let settings = settings();
        let domain = settings.domain("djangojs").expect("djangojs");
        let messages = extract_messages(source, "static/app.js", domain).expect("extract");
        let ids: Vec<&str> = messages.iter().map(|m| m.msgid.as_str()).collect();
        assert_eq!(ids, vec!["Welcome", "one item", "Hi there"]);
        assert_eq!(messages[0].extracted_comments, vec!["Translators: shown in the header"]);
        assert_eq!(messages[2].references, vec!["static/app.js:4"]);
    }

    #[test]
    fn unterminated_string_is_extraction_error() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("broken.py"), "x = _(\"oops\n").expect("write");
        let settings = settings();
        let tools = NativeTools::new(ToolSettings::default(), RenderOptions::default());
        let error = tools
            .extract(settings.domain("django").expect("django"), temp.path(), "broken.py")
            .expect_err("must fail");
        let classified = classify(&error).expect("taxonomy");
        assert_eq!(classified.kind(), "extraction");
        assert!(classified.to_string().contains("broken.py:1: unterminated string literal"));
    }

    #[test]
    fn python_format_detection() {
        assert!(is_python_format("%(name)s has %d items"));
        assert!(is_python_format("%.2f%%"));
        assert!(!is_python_format("100%% sure"));
        assert!(!is_python_format("plain"));
        assert!(!is_python_format("50%!"));
    }

    #[test]
    fn uniq_collapses_duplicates_and_fixes_charset() {
        let text = "msgid \"\"\nmsgstr \"\"\n\"Content-Type: text/plain; charset=CHARSET\\n\"\n\n#: a.py:1\nmsgid \"Save\"\nmsgstr \"\"\n\n#: b.html:2\n#, python-format\nmsgid \"Save\"\nmsgstr \"\"\n\n#: b.html:3\nmsgid \"Cancel\"\nmsgstr \"\"\n";
        let catalog = uniq_catalog(&Catalog::parse(text).expect("parse"));
        assert_eq!(catalog.messages.len(), 2);
        assert_eq!(catalog.messages[0].references, vec!["a.py:1", "b.html:2"]);
        assert!(catalog.messages[0].has_flag("python-format"));
        assert_eq!(
            catalog.header_field("Content-Type").as_deref(),
            Some("text/plain; charset=UTF-8")
        );
    }

    #[test]
    fn merge_keeps_translations_obsoletes_removed_and_fuzzes_similar() {
        let existing = Catalog::parse(
            "msgid \"\"\nmsgstr \"\"\n\"Plural-Forms: nplurals=2; plural=(n > 1);\\n\"\n\n# reviewed\nmsgid \"Save\"\nmsgstr \"Enregistrer\"\n\nmsgid \"Delete the file\"\nmsgstr \"Supprimer le fichier\"\n\nmsgid \"Gone\"\nmsgstr \"Parti\"\n\nmsgid \"Untranslated\"\nmsgstr \"\"\n",
        )
        .expect("existing");
        let template = Catalog::parse(
            "msgid \"\"\nmsgstr \"\"\n\"POT-Creation-Date: 2026-10-18 10:00+0000\\n\"\n\n#: a.py:1\nmsgid \"Save\"\nmsgstr \"\"\n\n#: a.py:2\nmsgid \"Delete the files\"\nmsgstr \"\"\n\n#: a.py:3\nmsgid \"apple\"\nmsgid_plural \"apples\"\nmsgstr[0] \"\"\nmsgstr[1] \"\"\n",
        )
        .expect("template");

        let merged = merge_catalogs(&existing, &template, true);
        let save = merged.find(None, "Save").expect("save");
        assert_eq!(save.translation(), "Enregistrer");
        assert_eq!(save.translator_comments, vec!["reviewed"]);
        assert_eq!(save.references, vec!["a.py:1"]);

        let fuzzy = merged.find(None, "Delete the files").expect("fuzzy");
        assert!(fuzzy.has_flag("fuzzy"));
        assert_eq!(fuzzy.translation(), "Supprimer le fichier");

        let apple = merged.find(None, "apple").expect("apple");
        assert_eq!(apple.msgstr, vec![String::new(), String::new()]);

        let gone = merged.find(None, "Gone").expect("gone");
        assert!(gone.obsolete);
        assert!(merged.find(None, "Untranslated").is_none());
        assert_eq!(
            merged.header_field("POT-Creation-Date").as_deref(),
            Some("2026-10-18 10:00+0000")
        );

        let strict = merge_catalogs(&existing, &template, false);
        let plain = strict.find(None, "Delete the files").expect("plain");
        assert!(!plain.has_flag("fuzzy"));
        assert_eq!(plain.translation(), "");
    }
}
