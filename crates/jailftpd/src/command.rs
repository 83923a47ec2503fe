//! Control command table and parsing
//!
//! Commands live in a static table sorted by name. Lookup is a
//! case-insensitive binary search. Every entry declares three independent
//! preconditions that are checked before its handler runs.

use std::cmp::Ordering;
use std::fmt;

use crate::reply::Reply;

/// Longest accepted control line, terminator included.
pub const MAX_COMMAND_LINE: usize = 1024;

/// Handler selector for a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Verb {
    Abor,
    Acct,
    Allo,
    Cdup,
    Clnt,
    Cwd,
    Dele,
    Feat,
    List,
    Mdtm,
    Mkd,
    Noop,
    Opts,
    Pass,
    Pasv,
    Pwd,
    Quit,
    Rest,
    Retr,
    Rmd,
    Size,
    Stor,
    Syst,
    Type,
    User,
}

/// One entry of the command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Upper-case command name
    pub name: &'static str,
    /// Handler to run
    pub verb: Verb,
    /// Session must be logged in
    pub needs_login: bool,
    /// A passive listener must be open
    pub needs_data: bool,
    /// Argument must be non-empty
    pub needs_arg: bool,
}

const fn cmd(
    name: &'static str,
    verb: Verb,
    needs_login: bool,
    needs_data: bool,
    needs_arg: bool,
) -> CommandSpec {
    CommandSpec {
        name,
        verb,
        needs_login,
        needs_data,
        needs_arg,
    }
}

/// The command table, sorted by name.
pub static COMMANDS: [CommandSpec; 25] = [
    //   name    verb          login  data   arg
    cmd("ABOR", Verb::Abor, true, false, false),
    cmd("ACCT", Verb::Acct, true, false, false),
    cmd("ALLO", Verb::Allo, true, false, false),
    cmd("CDUP", Verb::Cdup, true, false, false),
    cmd("CLNT", Verb::Clnt, true, false, false),
    cmd("CWD", Verb::Cwd, true, false, true),
    cmd("DELE", Verb::Dele, true, false, true),
    cmd("FEAT", Verb::Feat, false, false, false),
    cmd("LIST", Verb::List, true, true, false),
    cmd("MDTM", Verb::Mdtm, true, false, true),
    cmd("MKD", Verb::Mkd, true, false, true),
    cmd("NOOP", Verb::Noop, false, false, false),
    cmd("OPTS", Verb::Opts, false, false, false),
    cmd("PASS", Verb::Pass, false, false, false),
    cmd("PASV", Verb::Pasv, true, false, false),
    cmd("PWD", Verb::Pwd, true, false, false),
    cmd("QUIT", Verb::Quit, false, false, false),
    cmd("REST", Verb::Rest, true, false, true),
    cmd("RETR", Verb::Retr, true, true, true),
    cmd("RMD", Verb::Rmd, true, false, true),
    cmd("SIZE", Verb::Size, true, false, true),
    cmd("STOR", Verb::Stor, true, true, true),
    cmd("SYST", Verb::Syst, false, false, false),
    cmd("TYPE", Verb::Type, true, false, true),
    cmd("USER", Verb::User, false, false, false),
];

fn cmp_ignore_case(name: &str, key: &str) -> Ordering {
    name.bytes().cmp(key.bytes().map(|b| b.to_ascii_uppercase()))
}

/// Finds the table entry for `verb`, ignoring case.
pub fn lookup(verb: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .binary_search_by(|spec| cmp_ignore_case(spec.name, verb))
        .ok()
        .map(|idx| &COMMANDS[idx])
}

/// A precondition that stopped a command before its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Not logged in
    Login,
    /// No passive listener
    Data,
    /// Empty argument
    Argument,
}

impl Precondition {
    /// Canned reply for the failed check.
    pub fn reply(self) -> Reply {
        match self {
            Precondition::Login => Reply::new(530, "You're not logged in"),
            Precondition::Data => Reply::new(425, "Cannot open data connection"),
            Precondition::Argument => Reply::new(501, "Missing argument"),
        }
    }
}

impl CommandSpec {
    /// Checks login, data and argument requirements in that order.
    pub fn check(&self, logged_in: bool, has_data: bool, arg: &str) -> Result<(), Precondition> {
        if self.needs_login && !logged_in {
            return Err(Precondition::Login);
        }
        if self.needs_data && !has_data {
            return Err(Precondition::Data);
        }
        if self.needs_arg && arg.is_empty() {
            return Err(Precondition::Argument);
        }
        Ok(())
    }
}

/// A control line split into verb and argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLine<'a> {
    /// Command name as sent
    pub verb: &'a str,
    /// Argument with leading whitespace removed; empty when absent
    pub arg: &'a str,
}

impl<'a> CommandLine<'a> {
    /// Splits a line at the first space. The line terminator may be CRLF or
    /// a bare LF.
    pub fn parse(line: &'a str) -> Self {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);
        match line.split_once(' ') {
            Some((verb, arg)) => Self {
                verb,
                arg: arg.trim_start(),
            },
            None => Self { verb: line, arg: "" },
        }
    }
}

impl fmt::Display for CommandLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.verb.eq_ignore_ascii_case("PASS") {
            write!(f, "{} *******", self.verb)
        } else {
            write!(f, "{} {}", self.verb, self.arg)
        }
    }
}
