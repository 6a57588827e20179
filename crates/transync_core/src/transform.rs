//! Source rewrites that let a Python-oriented extractor read files it does
//! not understand natively.
//!
//! Both rewrites keep every newline of the input so the line numbers the
//! extractor reports still point into the original file.

use anyhow::Result;
use tracing::debug;

use crate::config::TransformKind;
use crate::error::SyncError;

const TRANSLATOR_COMMENT_MARK: &str = "Translators";

pub fn apply(kind: TransformKind, source: &str, path: &str) -> Result<String> {
    match kind {
        TransformKind::Templatize => templatize(source).map_err(|error| {
            SyncError::Transform {
                path: path.to_string(),
                message: error.to_string(),
            }
            .into()
        }),
        TransformKind::Pythonize => Ok(pythonize(source)),
        TransformKind::None => Ok(source.to_string()),
    }
}

/// Turns `//` line comments into `#` comments so the source reads as a
/// language whose comment syntax the extractor knows.
pub fn pythonize(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_start();
        match trimmed.strip_prefix("//") {
            Some(rest) => {
                out.push('#');
                out.push_str(rest);
            }
            None => out.push_str(line),
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (line {})", self.message, self.line)
    }
}

impl std::error::Error for TemplateError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Text,
    Var,
    Block,
    Comment,
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    raw: &'a str,
    contents: &'a str,
    line: usize,
}

fn lex(source: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut line = 1usize;
    let mut text_start = 0usize;
    let mut index = 0usize;

    while index + 1 < bytes.len() {
        let kind = match (bytes[index], bytes[index + 1]) {
            (b'{', b'%') => Some((TokenKind::Block, "%}")),
            (b'{', b'{') => Some((TokenKind::Var, "}}")),
            (b'{', b'#') => Some((TokenKind::Comment, "#}")),
            _ => None,
        };
        let Some((kind, closer)) = kind else {
            index += 1;
            continue;
        };
        let rest = &source[index + 2..];
        let line_end = rest.find('\n').unwrap_or(rest.len());
        let Some(close) = rest[..line_end].find(closer) else {
            index += 1;
            continue;
        };

        if text_start < index {
            let raw = &source[text_start..index];
            tokens.push(Token {
                kind: TokenKind::Text,
                raw,
                contents: raw,
                line,
            });
            line += raw.matches('\n').count();
        }
        let end = index + 2 + close + 2;
        tokens.push(Token {
            kind,
            raw: &source[index..end],
            contents: rest[..close].trim(),
            line,
        });
        index = end;
        text_start = end;
    }
    if text_start < source.len() {
        let raw = &source[text_start..];
        tokens.push(Token {
            kind: TokenKind::Text,
            raw,
            contents: raw,
            line,
        });
    }
    tokens
}

fn blankout(raw: &str, replacement: char) -> String {
    raw.chars()
        .map(|c| if c.is_whitespace() { c } else { replacement })
        .collect()
}

fn newlines_of(raw: &str) -> String {
    "\n".repeat(raw.matches('\n').count())
}

fn py_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

/// Splits tag contents on whitespace, keeping quoted sections intact.
fn split_tag_bits(contents: &str) -> Vec<String> {
    let mut bits = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for ch in contents.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == '\\' {
                    escaped = true;
                } else if ch == q {
                    quote = None;
                }
            }
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                current.push(ch);
            }
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    bits.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }
    if !current.is_empty() {
        bits.push(current);
    }
    bits
}

/// Literal text of a quoted tag argument such as `"Save"` or `'Save'|upper`.
fn quoted_literal(bit: &str) -> Option<&str> {
    let quote = bit.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let body = &bit[1..];
    let end = body.find(quote)?;
    Some(&body[..end])
}

/// `_("...")` constants embedded in a variable or block tag, verbatim.
fn constant_calls(contents: &str) -> Vec<&str> {
    let mut calls = Vec::new();
    let mut search = 0usize;
    while let Some(found) = contents[search..].find("_(") {
        let start = search + found;
        let after = &contents[start + 2..];
        let matched = after.chars().next().and_then(|quote| {
            if quote != '"' && quote != '\'' {
                return None;
            }
            let close = after[1..].find(quote)? + 1;
            after[close + 1..]
                .starts_with(')')
                .then_some(start + 2 + close + 2)
        });
        match matched {
            Some(end) => {
                calls.push(&contents[start..end]);
                search = end;
            }
            None => search = start + 2,
        }
    }
    calls
}

fn trim_whitespace(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (index, line) in value.trim().split('\n').enumerate() {
        if index > 0 {
            out.push(' ');
        }
        out.push_str(line.trim());
    }
    out
}

#[derive(Debug, Default)]
struct BlockTrans {
    line: usize,
    context: Option<String>,
    counted: bool,
    trimmed: bool,
    in_plural: bool,
    singular: Vec<String>,
    plural: Vec<String>,
    raw: String,
}

impl BlockTrans {
    fn open(bits: &[String], line: usize) -> Self {
        let mut block = Self {
            line,
            ..Self::default()
        };
        let mut index = 1usize;
        while index < bits.len() {
            match bits[index].as_str() {
                "count" => block.counted = true,
                "trimmed" => block.trimmed = true,
                "context" => {
                    if let Some(value) = bits.get(index + 1) {
                        block.context = quoted_literal(value).map(str::to_string);
                        index += 1;
                    }
                }
                _ => {}
            }
            index += 1;
        }
        block
    }

    fn push(&mut self, part: String) {
        if self.in_plural {
            self.plural.push(part);
        } else {
            self.singular.push(part);
        }
    }

    fn render(self) -> String {
        let join = |parts: &[String]| {
            let joined = parts.concat();
            if self.trimmed {
                trim_whitespace(&joined)
            } else {
                joined
            }
        };
        let singular = py_literal(&join(&self.singular));
        let call = if self.counted {
            let plural = py_literal(&join(&self.plural));
            match &self.context {
                Some(context) => format!(
                    " npgettext({}, {singular}, {plural}, count) ",
                    py_literal(context)
                ),
                None => format!(" ngettext({singular}, {plural}, count) "),
            }
        } else {
            match &self.context {
                Some(context) => format!(" pgettext({}, {singular}) ", py_literal(context)),
                None => format!(" gettext({singular}) "),
            }
        };
        format!("{call}{}", blankout(&self.raw, 'S'))
    }
}

/// Rewrites a markup template into pseudo-Python in which every translatable
/// string appears as a gettext-family call on its original line.
pub fn templatize(source: &str) -> std::result::Result<String, TemplateError> {
    let tokens = lex(source);
    let mut out = String::with_capacity(source.len());
    let mut block: Option<BlockTrans> = None;
    let mut comment: Option<String> = None;

    for (index, token) in tokens.iter().enumerate() {
        if let Some(buffer) = comment.as_mut() {
            if token.kind == TokenKind::Block && token.contents == "endcomment" {
                out.push_str(&render_comment_block(buffer));
                comment = None;
            } else {
                buffer.push_str(token.raw);
            }
            continue;
        }

        if let Some(open) = block.as_mut() {
            match token.kind {
                TokenKind::Block => {
                    let bits = split_tag_bits(token.contents);
                    match bits.first().map(String::as_str) {
                        Some("endblocktrans" | "endblocktranslate") => {
                            open.raw.push_str(token.raw);
                            if let Some(finished) = block.take() {
                                out.push_str(&finished.render());
                            }
                        }
                        Some("plural") if open.counted && !open.in_plural => {
                            open.in_plural = true;
                            open.raw.push_str(token.raw);
                        }
                        _ => {
                            return Err(TemplateError {
                                line: token.line,
                                message: format!(
                                    "Translation blocks must not include other block tags: {}",
                                    token.contents
                                ),
                            });
                        }
                    }
                }
                TokenKind::Var => {
                    open.push(format!("%({})s", token.contents));
                    open.raw.push_str(token.raw);
                }
                TokenKind::Text => {
                    open.push(token.contents.replace('%', "%%"));
                    open.raw.push_str(token.raw);
                }
                TokenKind::Comment => open.raw.push_str(token.raw),
            }
            continue;
        }

        match token.kind {
            TokenKind::Text => out.push_str(&blankout(token.raw, 'X')),
            TokenKind::Comment => {
                let is_translator_note = token.contents.starts_with(TRANSLATOR_COMMENT_MARK);
                if is_translator_note && ends_its_line(&tokens, index) {
                    out.push_str(&format!("# {}", token.contents));
                } else {
                    if is_translator_note {
                        debug!(
                            line = token.line,
                            "translator comment ignored because it is not the last item on its line"
                        );
                    }
                    out.push_str(&blankout(token.raw, 'X'));
                }
            }
            TokenKind::Var => {
                for call in constant_calls(token.contents) {
                    out.push_str(&format!(" {call} "));
                }
                out.push_str(&newlines_of(token.raw));
            }
            TokenKind::Block => {
                let bits = split_tag_bits(token.contents);
                match bits.first().map(String::as_str) {
                    Some("trans" | "translate") => {
                        out.push_str(&render_trans(&bits));
                        out.push_str(&newlines_of(token.raw));
                    }
                    Some("blocktrans" | "blocktranslate") => {
                        let mut opened = BlockTrans::open(&bits, token.line);
                        opened.raw.push_str(token.raw);
                        block = Some(opened);
                    }
                    Some("comment") => comment = Some(String::new()),
                    Some("plural") => {
                        return Err(TemplateError {
                            line: token.line,
                            message: "`plural` tag outside of a blocktrans block".to_string(),
                        });
                    }
                    _ => {
                        for call in constant_calls(token.contents) {
                            out.push_str(&format!(" {call} "));
                        }
                        out.push_str(&newlines_of(token.raw));
                    }
                }
            }
        }
    }

    if let Some(open) = block {
        return Err(TemplateError {
            line: open.line,
            message: "Unclosed blocktrans tag".to_string(),
        });
    }
    if let Some(buffer) = comment {
        out.push_str(&blankout(&buffer, 'X'));
    }
    Ok(out)
}

fn render_trans(bits: &[String]) -> String {
    let Some(value) = bits.get(1).and_then(|bit| quoted_literal(bit)) else {
        return String::new();
    };
    let message = value.replace('%', "%%");
    let mut context = None;
    let mut index = 2usize;
    while index < bits.len() {
        if bits[index] == "context" {
            context = bits.get(index + 1).and_then(|bit| quoted_literal(bit));
            index += 1;
        }
        index += 1;
    }
    match context {
        Some(context) => format!(
            " pgettext({}, {}) ",
            py_literal(context),
            py_literal(&message)
        ),
        None => format!(" gettext({}) ", py_literal(&message)),
    }
}

fn ends_its_line(tokens: &[Token<'_>], index: usize) -> bool {
    match tokens.get(index + 1) {
        None => true,
        Some(next) if next.kind == TokenKind::Text => match next.raw.split_once('\n') {
            Some((rest_of_line, _)) => rest_of_line.trim().is_empty(),
            None => next.raw.trim().is_empty() && index + 2 >= tokens.len(),
        },
        Some(_) => false,
    }
}

/// Lines of a `{% comment %}` block from the last one starting with the
/// translator mark onward become `#` comments; the rest is blanked.
fn render_comment_block(content: &str) -> String {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let start = lines
        .iter()
        .rposition(|line| line.trim_start().starts_with(TRANSLATOR_COMMENT_MARK));
    let mut out = String::with_capacity(content.len());
    for (index, line) in lines.iter().enumerate() {
        if start.is_some_and(|start| index >= start) {
            out.push_str(" # ");
            out.push_str(line.trim_start());
        } else {
            out.push_str(&blankout(line, 'X'));
        }
    }
    out
}
