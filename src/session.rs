/// The session's character encoding. Starts at `Ascii` and can only move
/// towards `Utf8` (RFC 6856 UTF8 command), never back; there's no verb to
/// downgrade a session once it has opted in.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Encoding {
    Ascii,
    Utf8,
}

impl Encoding {
    pub fn as_label(self) -> &'static str {
        match self {
            Encoding::Ascii => "ascii",
            Encoding::Utf8 => "utf-8",
        }
    }
}

/// Per-connection POP3 state. Mutated only by the dispatcher and the
/// connection handler, never by an adapter, which only ever sees the
/// derived `(username, read_only)` pair passed to `login_successful`.
///
/// Invariants: `authenticated` implies `username` is set and
/// vice versa; `encoding` only transitions ascii -> utf-8.
#[derive(Debug)]
pub struct SessionState {
    pub authenticated: bool,
    pub username: Option<String>,
    /// Set by USER, consumed and cleared by a successful PASS. Cleared (not
    /// reused) so a stale staged username can't be replayed into a second
    /// authentication attempt.
    pub staged_username: Option<String>,
    pub read_only: bool,
    pub encoding: Encoding,
    pub language: Option<String>,
    pub invalid_command_count: u64,
    pub invalid_password_count: u64,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState {
            authenticated: false,
            username: None,
            staged_username: None,
            read_only: false,
            encoding: Encoding::Ascii,
            language: None,
            invalid_command_count: 0,
            invalid_password_count: 0,
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::new()
    }
}
