//! Control connection replies
//!
//! A reply is a three digit code followed by text. Multi-line replies put
//! `DDD-` on the first line, send the middle lines verbatim and close with
//! `DDD ` on the last line.

use std::fmt;

/// One (possibly multi-line) reply on the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three digit reply code
    pub code: u16,
    /// Reply text, one entry per line; never empty
    pub lines: Vec<String>,
}

impl Reply {
    /// Creates a single-line reply.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// Creates a multi-line reply. An empty `lines` yields a bare code.
    pub fn multi<I, S>(code: u16, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            lines.push(String::new());
        }
        Self { code, lines }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            if i == 0 && last > 0 {
                write!(f, "{}-{}\r\n", self.code, line)?;
            } else if i == last {
                write!(f, "{} {}\r\n", self.code, line)?;
            } else {
                write!(f, "{}\r\n", line)?;
            }
        }
        Ok(())
    }
}
