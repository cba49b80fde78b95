//! ARCHIVIST - Load Statement Parser
//! Splits a statement stream on `;` and parses the small DDL/DML dialect
//! a bulk load accepts:
//!
//! ```text
//! CREATE DATABASE [IF NOT EXISTS] db
//! CREATE TABLE [IF NOT EXISTS] [db.]t (col TYPE [PRIMARY KEY] [NOT NULL | NULL], ...,
//!                                      [PRIMARY KEY (a, b)], [FAMILY [name] (a, b)])
//! INSERT INTO [db.]t [(a, b)] VALUES (...), (...)
//! ```
//! Types: INT, FLOAT, STRING, BYTES, BOOL (and common aliases).
//! Literals: integers, floats, 'quoted strings', TRUE, FALSE, NULL.

use std::collections::VecDeque;
use std::io::BufRead;

use serde::{Deserialize, Serialize};

use crate::error::{ArchivistError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Float,
    String,
    Bytes,
    Bool,
}

impl ColumnType {
    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "INT" | "INTEGER" | "INT8" | "INT4" | "BIGINT" | "SMALLINT" => Some(ColumnType::Int),
            "FLOAT" | "FLOAT8" | "DOUBLE" | "REAL" => Some(ColumnType::Float),
            "STRING" | "TEXT" | "VARCHAR" | "CHAR" => Some(ColumnType::String),
            "BYTES" | "BYTEA" | "BLOB" => Some(ColumnType::Bytes),
            "BOOL" | "BOOLEAN" => Some(ColumnType::Bool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateDatabase {
        name: String,
        if_not_exists: bool,
    },
    CreateTable {
        database: Option<String>,
        name: String,
        if_not_exists: bool,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    },
    Insert {
        database: Option<String>,
        table: String,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Literal>>,
    },
}

fn input_error(statement: usize, message: impl Into<String>) -> ArchivistError {
    ArchivistError::Input {
        statement: Some(statement),
        message: message.into(),
    }
}

/// Splits a byte stream into `;`-terminated statements, numbered from 1.
///
/// Semicolons inside quotes do not terminate a statement and `--` comments
/// are dropped. Empty statements are skipped without consuming a number.
pub struct StatementReader<R> {
    reader: R,
    buf: String,
    line: String,
    in_quote: Option<char>,
    pending: VecDeque<String>,
    count: usize,
    done: bool,
}

impl<R: BufRead> StatementReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: String::new(),
            line: String::new(),
            in_quote: None,
            pending: VecDeque::new(),
            count: 0,
            done: false,
        }
    }

    fn push_statement(&mut self) {
        let stmt = self.buf.trim();
        if !stmt.is_empty() {
            self.pending.push_back(stmt.to_string());
        }
        self.buf.clear();
    }

    fn consume_line(&mut self) {
        let line = std::mem::take(&mut self.line);
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match self.in_quote {
                Some(q) => {
                    self.buf.push(c);
                    if c == q {
                        self.in_quote = None;
                    }
                }
                None => match c {
                    '\'' | '"' => {
                        self.in_quote = Some(c);
                        self.buf.push(c);
                    }
                    ';' => self.push_statement(),
                    '-' if chars.peek() == Some(&'-') => break,
                    _ => self.buf.push(c),
                },
            }
        }
        if !self.buf.is_empty() && !self.buf.ends_with('\n') {
            self.buf.push('\n');
        }
        self.line = line;
        self.line.clear();
    }
}

impl<R: BufRead> Iterator for StatementReader<R> {
    type Item = Result<(usize, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(stmt) = self.pending.pop_front() {
                self.count += 1;
                return Some(Ok((self.count, stmt)));
            }
            if self.done {
                return None;
            }
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.done = true;
                    if self.in_quote.is_some() {
                        return Some(Err(input_error(self.count + 1, "unterminated quoted string")));
                    }
                    self.push_statement();
                }
                Ok(_) => self.consume_line(),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Number(String),
    Str(String),
    Symbol(char),
}

fn tokenize(sql: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else if c.is_ascii_digit() || c == '-' || c == '+' {
            let mut num = String::new();
            num.push(c);
            chars.next();
            while let Some(&c) = chars.peek() {
                let exponent_sign = (c == '-' || c == '+') && num.ends_with(|c: char| c == 'e' || c == 'E');
                if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign {
                    num.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if num == "-" || num == "+" {
                return Err(format!("unexpected '{}'", num));
            }
            tokens.push(Token::Number(num));
        } else if c == '\'' || c == '"' {
            let quote = c;
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == quote => {
                        // A doubled quote is an escaped quote.
                        if chars.peek() == Some(&quote) {
                            text.push(quote);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    Some(c) => text.push(c),
                    None => return Err("unterminated quoted string".into()),
                }
            }
            tokens.push(if quote == '\'' {
                Token::Str(text)
            } else {
                Token::Quoted(text)
            });
        } else if "(),.*".contains(c) {
            tokens.push(Token::Symbol(c));
            chars.next();
        } else {
            return Err(format!("unexpected character '{}'", c));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult<T> = std::result::Result<T, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn is_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.is_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> ParseResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(format!("expected {}, found {}", kw, self.describe()))
        }
    }

    fn eat_symbol(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Symbol(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_symbol(&mut self, sym: char) -> ParseResult<()> {
        if self.eat_symbol(sym) {
            Ok(())
        } else {
            Err(format!("expected '{}', found {}", sym, self.describe()))
        }
    }

    fn describe(&self) -> String {
        match self.peek() {
            None => "end of statement".into(),
            Some(Token::Word(w)) | Some(Token::Number(w)) => format!("'{}'", w),
            Some(Token::Quoted(q)) => format!("\"{}\"", q),
            Some(Token::Str(s)) => format!("string '{}'", s),
            Some(Token::Symbol(c)) => format!("'{}'", c),
        }
    }

    fn ident(&mut self) -> ParseResult<String> {
        match self.advance() {
            Some(Token::Word(w)) => Ok(w.to_ascii_lowercase()),
            Some(Token::Quoted(q)) => Ok(q),
            _ => {
                self.pos -= 1;
                Err(format!("expected identifier, found {}", self.describe()))
            }
        }
    }

    /// `name` or `db.name`.
    fn qualified_name(&mut self) -> ParseResult<(Option<String>, String)> {
        let first = self.ident()?;
        if self.eat_symbol('.') {
            let second = self.ident()?;
            Ok((Some(first), second))
        } else {
            Ok((None, first))
        }
    }

    fn ident_list(&mut self) -> ParseResult<Vec<String>> {
        self.expect_symbol('(')?;
        let mut names = vec![self.ident()?];
        while self.eat_symbol(',') {
            names.push(self.ident()?);
        }
        self.expect_symbol(')')?;
        Ok(names)
    }

    fn if_not_exists(&mut self) -> ParseResult<bool> {
        if self.eat_keyword("IF") {
            self.expect_keyword("NOT")?;
            self.expect_keyword("EXISTS")?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn finish(&self) -> ParseResult<()> {
        if self.pos < self.tokens.len() {
            Err(format!("unexpected trailing {}", self.describe()))
        } else {
            Ok(())
        }
    }

    fn statement(&mut self) -> ParseResult<Statement> {
        if self.eat_keyword("CREATE") {
            if self.eat_keyword("DATABASE") {
                let if_not_exists = self.if_not_exists()?;
                let name = self.ident()?;
                return Ok(Statement::CreateDatabase {
                    name,
                    if_not_exists,
                });
            }
            self.expect_keyword("TABLE")?;
            return self.create_table();
        }
        if self.eat_keyword("INSERT") {
            self.expect_keyword("INTO")?;
            return self.insert();
        }
        Err(format!("unsupported statement starting with {}", self.describe()))
    }

    fn create_table(&mut self) -> ParseResult<Statement> {
        let if_not_exists = self.if_not_exists()?;
        let (database, name) = self.qualified_name()?;
        self.expect_symbol('(')?;

        let mut columns = Vec::new();
        let mut primary_key = Vec::new();
        loop {
            if self.eat_keyword("PRIMARY") {
                self.expect_keyword("KEY")?;
                if !primary_key.is_empty() {
                    return Err("multiple primary keys".into());
                }
                primary_key = self.ident_list()?;
            } else if self.eat_keyword("FAMILY") {
                // Column families do not affect the key layout.
                if !matches!(self.peek(), Some(Token::Symbol('('))) {
                    self.ident()?;
                }
                self.ident_list()?;
            } else {
                let column = self.ident()?;
                let type_name = self.ident()?;
                let ty = ColumnType::parse(&type_name)
                    .ok_or_else(|| format!("unsupported column type '{}'", type_name))?;
                // VARCHAR(n) and friends.
                if self.eat_symbol('(') {
                    match self.advance() {
                        Some(Token::Number(_)) => {}
                        _ => return Err("expected type width".into()),
                    }
                    self.expect_symbol(')')?;
                }
                let mut nullable = true;
                loop {
                    if self.eat_keyword("PRIMARY") {
                        self.expect_keyword("KEY")?;
                        if !primary_key.is_empty() {
                            return Err("multiple primary keys".into());
                        }
                        primary_key = vec![column.clone()];
                        nullable = false;
                    } else if self.eat_keyword("NOT") {
                        self.expect_keyword("NULL")?;
                        nullable = false;
                    } else if !self.eat_keyword("NULL") {
                        break;
                    }
                }
                columns.push(ColumnDef {
                    name: column,
                    ty,
                    nullable,
                });
            }
            if !self.eat_symbol(',') {
                break;
            }
        }
        self.expect_symbol(')')?;

        Ok(Statement::CreateTable {
            database,
            name,
            if_not_exists,
            columns,
            primary_key,
        })
    }

    fn literal(&mut self) -> ParseResult<Literal> {
        match self.advance() {
            Some(Token::Number(n)) => {
                if let Ok(i) = n.parse::<i64>() {
                    Ok(Literal::Int(i))
                } else {
                    n.parse::<f64>()
                        .map(Literal::Float)
                        .map_err(|_| format!("invalid number '{}'", n))
                }
            }
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("NULL") => Ok(Literal::Null),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("TRUE") => Ok(Literal::Bool(true)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("FALSE") => Ok(Literal::Bool(false)),
            _ => {
                self.pos -= 1;
                Err(format!("expected literal, found {}", self.describe()))
            }
        }
    }

    fn insert(&mut self) -> ParseResult<Statement> {
        let (database, table) = self.qualified_name()?;
        let columns = if matches!(self.peek(), Some(Token::Symbol('('))) {
            Some(self.ident_list()?)
        } else {
            None
        };
        self.expect_keyword("VALUES")?;

        let mut rows = Vec::new();
        loop {
            self.expect_symbol('(')?;
            let mut row = vec![self.literal()?];
            while self.eat_symbol(',') {
                row.push(self.literal()?);
            }
            self.expect_symbol(')')?;
            rows.push(row);
            if !self.eat_symbol(',') {
                break;
            }
        }

        Ok(Statement::Insert {
            database,
            table,
            columns,
            rows,
        })
    }
}

/// Parse one statement; `index` is its 1-based position in the stream.
pub fn parse(index: usize, sql: &str) -> Result<Statement> {
    let tokens = tokenize(sql).map_err(|m| input_error(index, m))?;
    let mut parser = Parser { tokens, pos: 0 };
    let stmt = parser.statement().map_err(|m| input_error(index, m))?;
    parser.finish().map_err(|m| input_error(index, m))?;
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements(input: &str) -> Vec<(usize, String)> {
        StatementReader::new(input.as_bytes())
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_split_respects_quotes_and_comments() {
        let input = "CREATE DATABASE bench;\n-- a comment; with semicolon\nINSERT INTO t VALUES ('a;b');;\n  ";
        let stmts = statements(input);
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0], (1, "CREATE DATABASE bench".to_string()));
        assert_eq!(stmts[1].0, 2);
        assert!(stmts[1].1.contains("'a;b'"));
    }

    #[test]
    fn test_trailing_statement_without_semicolon() {
        let stmts = statements("CREATE DATABASE a;\nCREATE DATABASE b");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].1, "CREATE DATABASE b");
    }

    #[test]
    fn test_unterminated_quote() {
        let results: Vec<_> = StatementReader::new("INSERT INTO t VALUES ('abc".as_bytes()).collect();
        assert!(matches!(
            results.last(),
            Some(Err(ArchivistError::Input { statement: Some(1), .. }))
        ));
    }

    #[test]
    fn test_parse_create_table() {
        let stmt = parse(
            1,
            "CREATE TABLE bench.bank (id INT PRIMARY KEY, balance INT, payload STRING, FAMILY (id, balance, payload))",
        )
        .unwrap();
        match stmt {
            Statement::CreateTable {
                database,
                name,
                columns,
                primary_key,
                ..
            } => {
                assert_eq!(database.as_deref(), Some("bench"));
                assert_eq!(name, "bank");
                assert_eq!(columns.len(), 3);
                assert_eq!(columns[0].ty, ColumnType::Int);
                assert!(!columns[0].nullable);
                assert_eq!(columns[2].ty, ColumnType::String);
                assert_eq!(primary_key, vec!["id".to_string()]);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_parse_composite_key() {
        let stmt = parse(1, "create table t (a int, b varchar(10) not null, c bool, primary key (a, b))").unwrap();
        match stmt {
            Statement::CreateTable { primary_key, columns, .. } => {
                assert_eq!(primary_key, vec!["a".to_string(), "b".to_string()]);
                assert!(!columns[1].nullable);
                assert!(columns[2].nullable);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_parse_insert() {
        let stmt = parse(4, "INSERT INTO bank (id, payload) VALUES (1, 'it''s'), (-2, NULL), (3, 1.5e3)").unwrap();
        assert_eq!(
            stmt,
            Statement::Insert {
                database: None,
                table: "bank".into(),
                columns: Some(vec!["id".into(), "payload".into()]),
                rows: vec![
                    vec![Literal::Int(1), Literal::Str("it's".into())],
                    vec![Literal::Int(-2), Literal::Null],
                    vec![Literal::Int(3), Literal::Float(1500.0)],
                ],
            }
        );
    }

    #[test]
    fn test_parse_errors_carry_statement_index() {
        let err = parse(7, "INSERT INTO t VALUES (1,").unwrap_err();
        assert!(matches!(err, ArchivistError::Input { statement: Some(7), .. }));
        assert!(parse(1, "DROP TABLE t").is_err());
        assert!(parse(1, "CREATE TABLE t (a BLOBBY)").is_err());
        assert!(parse(1, "CREATE DATABASE a b").is_err());
    }
}
