use pop3_proto::{split_lines_keep_empty, ResponseCode};

use crate::session::SessionState;

/// One POP3 response, built by the dispatcher and encoded by the
/// connection handler. Carries only the data half of a response; the
/// control-flow half (deciding whether a command handler returns early)
/// lives in `dispatcher`'s `Abort` type instead.
#[derive(Debug, Clone)]
pub struct Response {
    success: bool,
    code: Option<ResponseCode>,
    message: String,
    human_readable: bool,
    multiline: Option<String>,
    force_crlf_before_terminator: bool,
    close_after_send: bool,
}

impl Response {
    /// A human-readable `+OK`, e.g. command acknowledgements.
    pub fn ok(message: impl Into<String>) -> Self {
        Response {
            success: true,
            code: None,
            message: message.into(),
            human_readable: true,
            multiline: None,
            force_crlf_before_terminator: false,
            close_after_send: false,
        }
    }

    /// A `+OK` whose first-line text is machine-readable data (STAT, LIST
    /// and UIDL's single-message forms), so no language tag is prepended.
    pub fn ok_human_unreadable(message: impl Into<String>) -> Self {
        let mut r = Response::ok(message);
        r.human_readable = false;
        r
    }

    /// A `+OK` followed by a multiline body terminated by `CRLF.CRLF`.
    pub fn ok_multiline(message: impl Into<String>, body: impl Into<String>) -> Self {
        let mut r = Response::ok(message);
        r.multiline = Some(body.into());
        r
    }

    /// Like [`Response::ok_multiline`], but always inserts a CRLF before the
    /// terminating dot even if the body already ends in one. TOP with `n =
    /// 0` needs this: its body is headers plus a trailing blank line, and
    /// without forcing, a body that already ends `\r\n` would have the
    /// blank line swallowed by the ordinary "already ends with CRLF" check.
    pub fn ok_multiline_force_crlf(message: impl Into<String>, body: impl Into<String>) -> Self {
        let mut r = Response::ok_multiline(message, body);
        r.force_crlf_before_terminator = true;
        r
    }

    pub fn err(message: impl Into<String>) -> Self {
        Response {
            success: false,
            code: None,
            message: message.into(),
            human_readable: true,
            multiline: None,
            force_crlf_before_terminator: false,
            close_after_send: false,
        }
    }

    pub fn err_code(message: impl Into<String>, code: ResponseCode) -> Self {
        let mut r = Response::err(message);
        r.code = Some(code);
        r
    }

    /// A generic server-side failure: a bad adapter-supplied unique id or a
    /// UIDL collision. The message is deliberately generic so it never
    /// leaks adapter internals to the client.
    pub fn err_internal() -> Self {
        Response::err_code("Internal server error", ResponseCode::SysTemp)
    }

    pub fn err_read_only() -> Self {
        Response::err_code(
            "The mailbox access mode is set to read-only",
            ResponseCode::ReadOnly,
        )
    }

    pub fn close(mut self) -> Self {
        self.close_after_send = true;
        self
    }

    pub fn closes_connection(&self) -> bool {
        self.close_after_send
    }

    /// Renders the response under `session`'s encoding and language,
    /// falling back to an ASCII-only `-ERR [UTF8]` if the real response
    /// can't be represented, which can only happen in ASCII mode, since
    /// UTF-8 can encode anything a `String` holds.
    pub fn encode(&self, session: &SessionState) -> Vec<u8> {
        let rendered = self.render(session.language.as_deref());
        match encode_for_session(&rendered, session) {
            Some(bytes) => bytes,
            None => {
                let fallback = Response::err_code(
                    "The sent data contains a non-ASCII character (the UTF-8 mode is not enabled)",
                    ResponseCode::Utf8,
                );
                let rendered = fallback.render(session.language.as_deref());
                encode_for_session(&rendered, session)
                    .expect("fallback response text is pure ASCII")
            }
        }
    }

    fn render(&self, language: Option<&str>) -> String {
        let mut out = self.first_line(language);
        if let Some(body) = &self.multiline {
            out.push_str(&stuff_body(body));
            if self.force_crlf_before_terminator || !out.ends_with("\r\n") {
                out.push_str("\r\n");
            }
            out.push_str(".\r\n");
        }
        out
    }

    fn first_line(&self, language: Option<&str>) -> String {
        let mut line = String::from(if self.success { "+OK " } else { "-ERR " });
        if let Some(code) = self.code {
            line.push('[');
            line.push_str(code.wire());
            line.push_str("] ");
        }
        // RFC 2449/6856 don't specify an ordering between the response code
        // and the language tag; this implementation puts the code first.
        if self.human_readable {
            if let Some(lang) = language {
                line.push_str(lang);
                line.push(' ');
            }
        }
        line.push_str(&self.message);
        line.push_str("\r\n");
        line
    }
}

/// Byte-stuffs every line beginning with `.` and normalizes all line
/// endings to CRLF, joining with CRLF but adding no trailing terminator.
fn stuff_body(body: &str) -> String {
    split_lines_keep_empty(body)
        .into_iter()
        .map(|line| if line.starts_with('.') { format!(".{line}") } else { line.to_string() })
        .collect::<Vec<_>>()
        .join("\r\n")
}

fn encode_for_session(rendered: &str, session: &SessionState) -> Option<Vec<u8>> {
    match session.encoding {
        crate::session::Encoding::Ascii => {
            if rendered.is_ascii() {
                Some(rendered.as_bytes().to_vec())
            } else {
                None
            }
        }
        crate::session::Encoding::Utf8 => Some(rendered.as_bytes().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[test]
    fn simple_ok_has_crlf() {
        let session = SessionState::new();
        let bytes = Response::ok("greetings").encode(&session);
        assert_eq!(bytes, b"+OK greetings\r\n");
    }

    #[test]
    fn code_precedes_language() {
        let mut session = SessionState::new();
        session.language = Some("en".to_string());
        let bytes = Response::err_code("nope", ResponseCode::Auth).encode(&session);
        assert_eq!(bytes, b"-ERR [AUTH] en nope\r\n");
    }

    #[test]
    fn human_unreadable_skips_language() {
        let mut session = SessionState::new();
        session.language = Some("en".to_string());
        let bytes = Response::ok_human_unreadable("2 320").encode(&session);
        assert_eq!(bytes, b"+OK 2 320\r\n");
    }

    #[test]
    fn multiline_byte_stuffs_and_terminates() {
        let session = SessionState::new();
        let bytes = Response::ok_multiline("body", ".hello\r\nworld").encode(&session);
        assert_eq!(bytes, b"+OK body\r\n..hello\r\nworld\r\n.\r\n");
    }

    #[test]
    fn force_crlf_adds_extra_terminator_line() {
        let session = SessionState::new();
        let bytes = Response::ok_multiline_force_crlf("top", "From: a\r\nSubject: b\r\n").encode(&session);
        assert_eq!(bytes, b"+OK top\r\nFrom: a\r\nSubject: b\r\n\r\n.\r\n");
    }

    #[test]
    fn ascii_encode_failure_falls_back_to_utf8_error() {
        let session = SessionState::new();
        let bytes = Response::ok("café").encode(&session);
        assert_eq!(
            bytes,
            b"-ERR [UTF8] The sent data contains a non-ASCII character (the UTF-8 mode is not enabled)\r\n"
        );
    }
}
