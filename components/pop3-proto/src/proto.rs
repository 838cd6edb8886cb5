use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{bail, Result};

/// The verb of a POP3 command line, independent of its arguments.
///
/// Unlike the historical POP3 command set, this server never offers APOP or
/// AUTH: there is no shared-secret or SASL story for an adapter-backed
/// mailstore, so those verbs are simply never valid and fall through to
/// `Invalid command` like any other unrecognized token.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// CAPA lists the capabilities the server supports, terminated by a
    /// `.` line. Valid in both AUTHORIZATION and TRANSACTION (RFC 2449 §5).
    Capa,
    /// QUIT ends the session. In AUTHORIZATION it just closes; in
    /// TRANSACTION it first commits any pending deletions (RFC 1939 §7,
    /// §4).
    Quit,
    /// USER names the mailbox to log into. Only valid in AUTHORIZATION,
    /// before a PASS has succeeded (RFC 1939 §7).
    User,
    /// PASS supplies the password for the username given by the most
    /// recent USER command (RFC 1939 §7).
    Pass,
    /// NOOP does nothing but keep the connection alive (RFC 1939 §5).
    Noop,
    /// STAT returns the number of undeleted messages and their total size
    /// in octets (RFC 1939 §5).
    Stat,
    /// LIST returns the size of one message, or of all undeleted messages
    /// (RFC 1939 §5).
    List,
    /// RETR sends the full contents of one message (RFC 1939 §5).
    Retr,
    /// DELE marks one message as deleted. The mark is undone by RSET or a
    /// session that ends without a clean QUIT (RFC 1939 §5).
    Dele,
    /// RSET unmarks every message previously marked as deleted in this
    /// session (RFC 1939 §5).
    Rset,
    /// TOP sends the headers of one message plus its first `n` body
    /// lines (RFC 1939 §7).
    Top,
    /// UIDL returns a unique, session-stable identifier for one message or
    /// for all undeleted messages (RFC 1939 §7).
    Uidl,
    /// UTF8 switches the session to UTF-8 command/response encoding
    /// (RFC 6856).
    Utf8,
    /// LANG lists or selects the language of human-readable response text
    /// (RFC 5184 / RFC 6856 §3).
    Lang,
    /// XPRO is a non-standard extension that downgrades the session to
    /// read-only mode for the remainder of its lifetime. It exists so a
    /// client can opt out of DELE/RSET/commit side effects without the
    /// server needing a second listening port.
    Xpro,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(verb: &str) -> Result<Self> {
        Ok(match verb.to_ascii_uppercase().as_str() {
            "CAPA" => Command::Capa,
            "QUIT" => Command::Quit,
            "USER" => Command::User,
            "PASS" => Command::Pass,
            "NOOP" => Command::Noop,
            "STAT" => Command::Stat,
            "LIST" => Command::List,
            "RETR" => Command::Retr,
            "DELE" => Command::Dele,
            "RSET" => Command::Rset,
            "TOP" => Command::Top,
            "UIDL" => Command::Uidl,
            "UTF8" => Command::Utf8,
            "LANG" => Command::Lang,
            "XPRO" => Command::Xpro,
            other => bail!("unrecognized command verb: {other}"),
        })
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let verb = match self {
            Command::Capa => "CAPA",
            Command::Quit => "QUIT",
            Command::User => "USER",
            Command::Pass => "PASS",
            Command::Noop => "NOOP",
            Command::Stat => "STAT",
            Command::List => "LIST",
            Command::Retr => "RETR",
            Command::Dele => "DELE",
            Command::Rset => "RSET",
            Command::Top => "TOP",
            Command::Uidl => "UIDL",
            Command::Utf8 => "UTF8",
            Command::Lang => "LANG",
            Command::Xpro => "XPRO",
        };
        f.write_str(verb)
    }
}

/// Extended response codes (RFC 2449 §8). Appear bracketed between the
/// `+OK `/`-ERR ` prefix and the human-readable text, e.g. `-ERR [AUTH] ...`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResponseCode {
    /// Login failed, or a command that requires a login was sent before
    /// one succeeded.
    Auth,
    /// A transient, probably-retryable server-side failure.
    SysTemp,
    /// A permanent server-side failure.
    SysPerm,
    /// Added to an otherwise-ASCII `-ERR` when the session encoding can't
    /// represent the intended response text, or when a client requested
    /// an unsupported character encoding.
    Utf8,
    /// The requested operation is unavailable because the session is in
    /// read-only mode.
    ReadOnly,
    /// Login was rejected because the account is already locked by another
    /// read-write session.
    InUse,
}

impl ResponseCode {
    pub fn wire(self) -> &'static str {
        match self {
            ResponseCode::Auth => "AUTH",
            ResponseCode::SysTemp => "SYS/TEMP",
            ResponseCode::SysPerm => "SYS/PERM",
            ResponseCode::Utf8 => "UTF8",
            ResponseCode::ReadOnly => "X-POP3SF-READ-ONLY",
            ResponseCode::InUse => "IN-USE",
        }
    }
}

/// Splits a command line into its uppercased verb and whitespace-separated
/// arguments. Runs of whitespace collapse, so `PASS  a   b` and
/// `PASS a b` parse identically.
pub fn tokenize(line: &str) -> (String, Vec<String>) {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or("").to_ascii_uppercase();
    let args = parts.map(str::to_string).collect();
    (verb, args)
}
