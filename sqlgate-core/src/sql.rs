//! Statement classification heuristics.
//!
//! This is not a SQL parser. It strips comments and looks at the first
//! keyword, which is enough to decide whether a statement's output should be
//! shown as result rows or as an affected-row count.

/// How a statement's output is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Starts with `SELECT`; returned rows are results to display.
    Read,
    /// Anything else; the affected-row count is reported.
    Write,
}

#[derive(Clone, Copy)]
enum Scan {
    Code,
    LineComment,
    BlockComment,
    Quoted,
}

/// Remove `--` line comments and `/* */` block comments.
///
/// Comment markers inside single-quoted string literals are kept. Block
/// comments do not nest. Each removed comment is replaced by one space so
/// tokens on either side stay separated.
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut scan = Scan::Code;

    while let Some(c) = chars.next() {
        match scan {
            Scan::Code => match c {
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    scan = Scan::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    scan = Scan::BlockComment;
                }
                '\'' => {
                    out.push(c);
                    scan = Scan::Quoted;
                }
                _ => out.push(c),
            },
            Scan::LineComment => {
                if c == '\n' {
                    out.push('\n');
                    scan = Scan::Code;
                }
            }
            Scan::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push(' ');
                    scan = Scan::Code;
                }
            }
            Scan::Quoted => {
                out.push(c);
                // A doubled quote is an escaped quote and keeps us inside.
                if c == '\'' {
                    if chars.peek() == Some(&'\'') {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else {
                        scan = Scan::Code;
                    }
                }
            }
        }
    }

    out
}

pub fn classify(sql: &str) -> StatementKind {
    if strip_comments(sql)
        .trim()
        .to_uppercase()
        .starts_with("SELECT")
    {
        StatementKind::Read
    } else {
        StatementKind::Write
    }
}

/// True when the statement, once comments are removed, begins with `SELECT`.
pub fn is_read_query(sql: &str) -> bool {
    classify(sql) == StatementKind::Read
}
