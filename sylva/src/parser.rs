//! The native text format: parse and unparse.
//!
//! Code is written as parenthesized opcode trees: `(+ 1 2 3)`. A `#label`
//! token attaches a label to the node that follows it; `;` comments run to
//! end of line and attach to the next node. Round-trips preserve labels,
//! comments, node kinds, and numeric precision to the last ULP (numbers are
//! printed with the shortest representation that re-parses equal).

use std::sync::Arc;

use crate::intern::{self, SymbolId};
use crate::node::{NodeId, NodeKind};
use crate::node_manager::NodeManager;

/// Parse failure with source position.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    manager: &'a Arc<NodeManager>,
    source_name: &'a str,
    debug_sources: bool,
}

/// Parses one expression from `text` into nodes owned by `manager`.
///
/// With `debug_sources` set, each node's comment gains a first line recording
/// `source_name:line:col`, which stack traces and diagnostics surface later.
pub fn parse(
    text: &str,
    manager: &Arc<NodeManager>,
    source_name: &str,
    debug_sources: bool,
) -> Result<NodeId, ParseError> {
    let mut p = Parser {
        chars: text.chars().collect(),
        pos: 0,
        line: 1,
        col: 1,
        manager,
        source_name,
        debug_sources,
    };
    let node = p.parse_node()?;
    p.skip_trivia(&mut String::new());
    if p.pos < p.chars.len() {
        return Err(p.error("trailing input after expression"));
    }
    match node {
        Some(n) => Ok(n),
        None => Err(p.error("empty input")),
    }
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            line: self.line,
            col: self.col,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    /// Skips whitespace, collecting `;` comment text into `comment`.
    fn skip_trivia(&mut self, comment: &mut String) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some(';') => {
                    self.bump();
                    let mut line = String::new();
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        line.push(c);
                        self.bump();
                    }
                    if !comment.is_empty() {
                        comment.push('\n');
                    }
                    comment.push_str(line.strip_prefix(' ').unwrap_or(&line));
                }
                _ => return,
            }
        }
    }

    fn parse_node(&mut self) -> Result<Option<NodeId>, ParseError> {
        let mut comment = String::new();
        self.skip_trivia(&mut comment);

        let mut labels: Vec<String> = Vec::new();
        while self.peek() == Some('#') {
            self.bump();
            labels.push(self.read_token());
            self.skip_trivia(&mut comment);
        }

        let (src_line, src_col) = (self.line, self.col);
        let node = match self.peek() {
            None => return Ok(None),
            Some('(') => self.parse_composite()?,
            Some('"') => {
                let s = self.read_string()?;
                self.manager.alloc_string(&s)
            }
            Some(')') => return Err(self.error("unexpected ')'")),
            Some(_) => self.parse_atom()?,
        };

        for label in labels {
            self.manager.add_label(node, &label);
        }
        let full_comment = if self.debug_sources {
            let loc = format!("{}:{}:{}", self.source_name, src_line, src_col);
            if comment.is_empty() {
                loc
            } else {
                format!("{}\n{}", loc, comment)
            }
        } else {
            comment
        };
        if !full_comment.is_empty() {
            self.manager
                .set_comment_handoff(node, intern::intern(&full_comment));
        }
        Ok(Some(node))
    }

    fn parse_composite(&mut self) -> Result<NodeId, ParseError> {
        self.bump(); // consume '('
        self.skip_trivia(&mut String::new());
        let head = self.read_token();
        if head.is_empty() {
            return Err(self.error("expected opcode name after '('"));
        }
        let kind = NodeKind::from_name(&head)
            .ok_or_else(|| self.error(&format!("unknown opcode '{}'", head)))?;

        let node = self.manager.alloc(kind);
        let mut all_idempotent = true;

        if kind.uses_mapped_children() {
            loop {
                self.skip_trivia(&mut String::new());
                if self.peek() == Some(')') {
                    self.bump();
                    break;
                }
                let key = self.parse_key()?;
                let value = match self.parse_node()? {
                    Some(v) => v,
                    None => return Err(self.error("missing value for assoc key")),
                };
                all_idempotent &= self.manager.is_idempotent(value);
                self.manager
                    .set_mapped_child(node, intern::intern(&key), value);
            }
        } else if kind.is_immediate() {
            // `(number 3)` / `(string "x")` style literals.
            self.skip_trivia(&mut String::new());
            if self.peek() != Some(')') {
                match kind {
                    NodeKind::Number => {
                        let tok = self.read_token();
                        let v = parse_number(&tok)
                            .ok_or_else(|| self.error(&format!("invalid number '{}'", tok)))?;
                        self.manager.set_number(node, v);
                    }
                    NodeKind::String | NodeKind::Symbol => {
                        let text = if self.peek() == Some('"') {
                            self.read_string()?
                        } else {
                            self.read_token()
                        };
                        self.manager.set_symbol_handoff(node, intern::intern(&text));
                    }
                    _ => return Err(self.error("constant opcode takes no operands")),
                }
                self.skip_trivia(&mut String::new());
            }
            if self.bump() != Some(')') {
                return Err(self.error("expected ')'"));
            }
        } else {
            loop {
                self.skip_trivia(&mut String::new());
                if self.peek() == Some(')') {
                    self.bump();
                    break;
                }
                match self.parse_node()? {
                    Some(child) => {
                        all_idempotent &= self.manager.is_idempotent(child);
                        self.manager.push_child(node, child);
                    }
                    None => return Err(self.error("unterminated expression")),
                }
            }
        }

        if kind.is_potentially_idempotent() && all_idempotent {
            self.manager.set_idempotent(node, true);
        }
        Ok(node)
    }

    fn parse_key(&mut self) -> Result<String, ParseError> {
        if self.peek() == Some('"') {
            return self.read_string();
        }
        let tok = self.read_token();
        if tok.is_empty() {
            return Err(self.error("expected assoc key"));
        }
        Ok(tok)
    }

    fn parse_atom(&mut self) -> Result<NodeId, ParseError> {
        let tok = self.read_token();
        if tok.is_empty() {
            return Err(self.error("expected expression"));
        }
        let node = match tok.as_str() {
            "true" => self.manager.alloc(NodeKind::True),
            "false" => self.manager.alloc(NodeKind::False),
            "null" => self.manager.alloc(NodeKind::Null),
            _ => match parse_number(&tok) {
                Some(v) => self.manager.alloc_number(v),
                None => self.manager.alloc_symbol(&tok),
            },
        };
        if self.manager.kind_of(node) != NodeKind::Symbol {
            self.manager.set_idempotent(node, true);
        }
        Ok(node)
    }

    fn read_token(&mut self) -> String {
        let mut tok = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == '(' || c == ')' || c == '"' || c == ';' {
                break;
            }
            tok.push(c);
            self.bump();
        }
        tok
    }

    fn read_string(&mut self) -> Result<String, ParseError> {
        self.bump(); // opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some('"') => return Ok(s),
                Some('\\') => match self.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some('\\') => s.push('\\'),
                    Some('"') => s.push('"'),
                    Some(other) => s.push(other),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) => s.push(c),
            }
        }
    }
}

/// Parses the extended number syntax: ordinary floats plus `.nan`,
/// `.infinity`, and `-.infinity`.
pub fn parse_number(tok: &str) -> Option<f64> {
    match tok {
        ".nan" => Some(f64::NAN),
        ".infinity" => Some(f64::INFINITY),
        "-.infinity" => Some(f64::NEG_INFINITY),
        _ => {
            // Reject symbols like `-` or `+x` that str::parse would not take
            // anyway, but keep leading-dot forms (".5") working.
            tok.parse::<f64>().ok()
        }
    }
}

// ---------------------------------------------------------------------------
// Unparser
// ---------------------------------------------------------------------------

/// Prints `node` back to the native text format.
pub fn unparse(
    manager: &Arc<NodeManager>,
    node: NodeId,
    pretty: bool,
    emit_comments: bool,
    sort_keys: bool,
) -> String {
    let mut out = String::new();
    let mut visiting = Vec::new();
    write_node(
        manager,
        node,
        pretty,
        emit_comments,
        sort_keys,
        0,
        &mut visiting,
        &mut out,
    );
    if pretty {
        out.push('\n');
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn write_node(
    manager: &Arc<NodeManager>,
    node: NodeId,
    pretty: bool,
    emit_comments: bool,
    sort_keys: bool,
    indent: usize,
    visiting: &mut Vec<NodeId>,
    out: &mut String,
) {
    // A node currently being printed above us means a cycle; emit a null
    // placeholder rather than recursing forever.
    if visiting.contains(&node) {
        out.push_str("(null)");
        return;
    }

    if emit_comments {
        let comment = manager.comment_of(node);
        if !comment.is_none() {
            for line in intern::text(comment).lines() {
                out.push(';');
                out.push_str(line);
                out.push('\n');
                push_indent(out, indent, pretty);
            }
        }
    }

    for label in manager.labels_of(node) {
        out.push('#');
        out.push_str(&intern::text(label));
        out.push(' ');
    }

    let kind = manager.kind_of(node);
    match kind {
        NodeKind::Number => out.push_str(&format_number(manager.number_of(node))),
        NodeKind::String => {
            write_quoted(&intern::text(manager.symbol_of(node)), out);
        }
        NodeKind::Symbol => out.push_str(&intern::text(manager.symbol_of(node))),
        NodeKind::True => out.push_str("(true)"),
        NodeKind::False => out.push_str("(false)"),
        NodeKind::Null => out.push_str("(null)"),
        _ => {
            visiting.push(node);
            out.push('(');
            out.push_str(kind.name());
            if kind.uses_mapped_children() {
                let entries = if sort_keys {
                    manager.mapped_entries_sorted(node)
                } else {
                    manager.mapped_entries(node)
                };
                for (key, value) in entries {
                    separate(out, indent + 1, pretty);
                    write_key(&intern::text(key), out);
                    out.push(' ');
                    write_node(
                        manager,
                        value,
                        pretty,
                        emit_comments,
                        sort_keys,
                        indent + 1,
                        visiting,
                        out,
                    );
                }
            } else {
                for child in manager.children_of(node) {
                    separate(out, indent + 1, pretty);
                    write_node(
                        manager,
                        child,
                        pretty,
                        emit_comments,
                        sort_keys,
                        indent + 1,
                        visiting,
                        out,
                    );
                }
            }
            out.push(')');
            visiting.pop();
        }
    }
}

fn separate(out: &mut String, indent: usize, pretty: bool) {
    if pretty {
        out.push('\n');
        push_indent(out, indent, true);
    } else {
        out.push(' ');
    }
}

fn push_indent(out: &mut String, indent: usize, pretty: bool) {
    if pretty {
        for _ in 0..indent {
            out.push_str("  ");
        }
    }
}

fn write_quoted(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

fn write_key(key: &str, out: &mut String) {
    let bare = !key.is_empty()
        && key.chars().all(|c| {
            c.is_alphanumeric() || c == '_' || c == '.' || c == '-' || c == '!'
        })
        && NodeKind::from_name(key).is_none();
    if bare {
        out.push_str(key);
    } else {
        write_quoted(key, out);
    }
}

/// Shortest representation that re-parses to the same bits.
pub fn format_number(v: f64) -> String {
    if v.is_nan() {
        ".nan".to_string()
    } else if v == f64::INFINITY {
        ".infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-.infinity".to_string()
    } else {
        format!("{}", v)
    }
}

/// Resolves a key id back to text, quoting only when needed. Used by error
/// reporting and the JSON translator.
pub fn key_text(key: SymbolId) -> String {
    intern::text(key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr() -> Arc<NodeManager> {
        Arc::new(NodeManager::new())
    }

    #[test]
    fn parses_arithmetic() {
        let m = mgr();
        let n = parse("(+ 1 2 3)", &m, "test", false).unwrap();
        assert_eq!(m.kind_of(n), NodeKind::Add);
        assert_eq!(m.child_count(n), 3);
        assert_eq!(m.number_of(m.child(n, 0).unwrap()), 1.0);
    }

    #[test]
    fn parses_assoc_pairs() {
        let m = mgr();
        let n = parse(r#"(assoc "x" 10 y 20)"#, &m, "test", false).unwrap();
        assert_eq!(m.kind_of(n), NodeKind::Assoc);
        assert_eq!(m.mapped_len(n), 2);
        let x = intern::pool().id_if_exists("x").unwrap();
        assert_eq!(m.number_of(m.mapped_get(n, x).unwrap()), 10.0);
    }

    #[test]
    fn labels_attach_to_following_node() {
        let m = mgr();
        let n = parse("(list #answer 42)", &m, "test", false).unwrap();
        let child = m.child(n, 0).unwrap();
        let labels = m.labels_of(child);
        assert_eq!(labels.len(), 1);
        assert_eq!(intern::text(labels[0]), "answer");
    }

    #[test]
    fn comments_attach_to_following_node() {
        let m = mgr();
        let n = parse("; doubles the input\n(lambda (* (current_value) 2))", &m, "t", false)
            .unwrap();
        assert_eq!(intern::text(m.comment_of(n)), "doubles the input");
    }

    #[test]
    fn debug_sources_prepend_location() {
        let m = mgr();
        let n = parse("(null)", &m, "main.syl", true).unwrap();
        let comment = intern::text(m.comment_of(n));
        assert!(comment.starts_with("main.syl:1:1"), "got {:?}", comment);
    }

    #[test]
    fn string_escapes_roundtrip() {
        let m = mgr();
        let n = parse(r#"(string "a\"b\nc")"#, &m, "t", false).unwrap();
        assert_eq!(intern::text(m.symbol_of(n)), "a\"b\nc");
        let text = unparse(&m, n, false, false, false);
        let n2 = parse(&text, &m, "t", false).unwrap();
        assert_eq!(intern::text(m.symbol_of(n2)), "a\"b\nc");
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let m = mgr();
        let err = parse("(frobnicate 1)", &m, "t", false).unwrap_err();
        assert!(err.message.contains("frobnicate"));
    }

    #[test]
    fn special_numbers() {
        let m = mgr();
        for (text, check) in [
            (".nan", f64::is_nan as fn(f64) -> bool),
            (".infinity", |v| v == f64::INFINITY),
            ("-.infinity", |v| v == f64::NEG_INFINITY),
        ] {
            let n = parse(text, &m, "t", false).unwrap();
            assert!(check(m.number_of(n)), "failed for {}", text);
        }
    }

    #[test]
    fn numbers_roundtrip_to_last_ulp() {
        let m = mgr();
        for v in [0.1, 1.0 / 3.0, 6.02214076e23, -0.0, 123456789.123456789] {
            let text = format_number(v);
            let n = parse(&text, &m, "t", false).unwrap();
            assert_eq!(m.number_of(n).to_bits(), v.to_bits(), "ulp drift for {}", v);
        }
    }

    #[test]
    fn sorted_unparse_is_canonical() {
        let m = mgr();
        let a = parse(r#"(assoc b 2 a 1)"#, &m, "t", false).unwrap();
        let b = parse(r#"(assoc a 1 b 2)"#, &m, "t", false).unwrap();
        assert_eq!(
            unparse(&m, a, false, false, true),
            unparse(&m, b, false, false, true)
        );
    }

    #[test]
    fn cyclic_graph_does_not_hang_unparse() {
        let m = mgr();
        let list = m.alloc(NodeKind::List);
        m.push_child(list, list);
        m.set_need_cycle_check(list, true);
        let text = unparse(&m, list, false, false, false);
        assert_eq!(text, "(list (null))");
    }
}
