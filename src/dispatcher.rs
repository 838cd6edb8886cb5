use std::time::Duration;

use std::str::FromStr;

use pop3_proto::{normalize_crlf, split_lines_keep_empty, Command, ResponseCode};

use crate::adapter::{AdapterError, AdapterResult};
use crate::error::Fatal;
use crate::registry::ExclusivityRegistry;
use crate::response::Response;
use crate::serializer::SerializedAdapter;
use crate::session::{Encoding, SessionState};

/// Per-session rate limits and delays the dispatcher enforces. Lifted out
/// of [`crate::config::Config`] so the dispatcher doesn't need the whole
/// configuration surface (adapter factory included) just to apply them.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_invalid_commands_per_session: i64,
    pub max_invalid_passwords_per_session: i64,
    pub failed_login_delay: Duration,
}

/// Drives the POP3 command state machine for one session. Holds only
/// borrowed references: the session, the process-wide adapter gate (via
/// the adapter instance it wraps), and the exclusivity registry. Owned by
/// the connection handler for the lifetime of one `dispatch` call.
pub struct Dispatcher<'a> {
    pub connection_id: u64,
    pub session: &'a mut SessionState,
    pub adapter: &'a mut SerializedAdapter,
    pub registry: &'a ExclusivityRegistry,
    pub limits: Limits,
}

/// Carries a command handler's early exit: either a hard session abort
/// (the adapter asked to close the connection) or an ordinary response
/// that should be sent without terminating the command loop. Folds both
/// kinds of early return into one value so `?` can do the conversion
/// inline from either an adapter error or a response.
enum Abort {
    Fatal(Fatal),
    Respond(Box<Response>),
}

impl From<Response> for Abort {
    fn from(r: Response) -> Self {
        Abort::Respond(Box::new(r))
    }
}

trait IntoOutcome<T> {
    fn into_outcome(self) -> Result<T, Abort>;
}

impl<T> IntoOutcome<T> for AdapterResult<T> {
    fn into_outcome(self) -> Result<T, Abort> {
        self.map_err(|e| match e {
            AdapterError::CloseConnection(msg) => Abort::Fatal(Fatal::AdapterClosed(msg)),
            AdapterError::Other(_) => Abort::Respond(Box::new(Response::err_internal())),
        })
    }
}

impl<'a> Dispatcher<'a> {
    /// Dispatches one already-tokenized command line. Every path through
    /// this function and the handlers it calls produces exactly one
    /// outcome, enforced by the return type: there is no path that can
    /// fall through without producing a `Response` or a `Fatal`.
    pub async fn dispatch(&mut self, verb: &str, args: &[String]) -> Result<Response, Fatal> {
        let outcome = match Command::from_str(verb).ok() {
            Some(command) if self.allowed_in_current_state(command) => self.run(command, args).await,
            _ => Ok(self.invalid_command()),
        };

        match outcome {
            Ok(response) => Ok(response),
            Err(Abort::Fatal(f)) => Err(f),
            Err(Abort::Respond(r)) => Ok(*r),
        }
    }

    fn allowed_in_current_state(&self, command: Command) -> bool {
        use Command::*;
        if self.session.authenticated {
            matches!(command, Capa | Lang | Noop | Quit | Stat | List | Uidl | Retr | Top | Dele | Rset)
        } else {
            matches!(command, Capa | Quit | Xpro | Utf8 | Lang | User | Pass)
        }
    }

    async fn run(&mut self, command: Command, args: &[String]) -> Result<Response, Abort> {
        use Command::*;
        match command {
            Capa => self.cmd_capa(args).await,
            Quit => self.cmd_quit(args).await,
            Xpro => self.cmd_xpro(args).await,
            Utf8 => self.cmd_utf8(args).await,
            Lang => self.cmd_lang(args),
            User => self.cmd_user(args),
            Pass => self.cmd_pass(args).await,
            Noop => self.cmd_noop(args),
            Stat => self.cmd_stat(args).await,
            List => self.cmd_list(args).await,
            Uidl => self.cmd_uidl(args).await,
            Retr => self.cmd_retr(args).await,
            Top => self.cmd_top(args).await,
            Dele => self.cmd_dele(args).await,
            Rset => self.cmd_rset(args).await,
        }
    }

    /// A verb that's unrecognized, or valid only in the other state. Bad
    /// input is counted and, past the configured maximum, ends the
    /// session; this is the same counter/threshold shape as the invalid
    /// password punishment below, just for protocol noise instead of
    /// credential guessing.
    fn invalid_command(&mut self) -> Response {
        if self.limits.max_invalid_commands_per_session >= 0 {
            self.session.invalid_command_count += 1;
            if self.session.invalid_command_count as i64 > self.limits.max_invalid_commands_per_session {
                return Response::err("Too many invalid commands").close();
            }
        }
        Response::err("Invalid command")
    }

    fn check_arity(args: &[String], allowed: &[usize]) -> Result<(), Abort> {
        if allowed.contains(&args.len()) {
            Ok(())
        } else {
            Err(Response::err("Invalid argument count").into())
        }
    }

    async fn cmd_capa(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0])?;

        let mut capabilities = vec![
            "USER".to_string(),
            "TOP".to_string(),
            "UIDL".to_string(),
            "RESP-CODES".to_string(),
            "AUTH-RESP-CODE".to_string(),
            "UTF8 USER".to_string(),
            "LANG".to_string(),
            "IMPLEMENTATION pop3d".to_string(),
        ];
        if self.adapter.read_only_mode_allowed().await.into_outcome()? {
            capabilities.push("X-POP3SF-READ-ONLY".to_string());
        }

        Ok(Response::ok_multiline("Listing all capabilities", capabilities.join("\r\n")))
    }

    async fn cmd_quit(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0])?;

        if !self.session.authenticated {
            return Ok(Response::ok("Session is ending (nobody was logged in)").close());
        }

        if !self.session.read_only {
            self.adapter.commit_deletions().await.into_outcome()?;
        }
        Ok(Response::ok("Session is ending (an user was logged in)").close())
    }

    async fn cmd_xpro(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0])?;

        if !self.adapter.read_only_mode_allowed().await.into_outcome()? {
            return Ok(Response::err_code(
                "Read-only mailbox access mode is not allowed",
                ResponseCode::ReadOnly,
            ));
        }
        self.session.read_only = true;
        Ok(Response::ok("Mailbox access mode switched to read-only"))
    }

    async fn cmd_utf8(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0])?;
        self.session.encoding = Encoding::Utf8;
        Ok(Response::ok("UTF-8 support was enabled for this connection"))
    }

    fn cmd_lang(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0, 1])?;

        if args.is_empty() {
            return Ok(Response::ok_multiline("Listing all languages", "en English"));
        }
        if args[0] == "*" || args[0] == "en" {
            self.session.language = Some("en".to_string());
            return Ok(Response::ok("The response text language was changed to English"));
        }
        Ok(Response::err("Invalid language tag"))
    }

    fn cmd_noop(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0])?;
        Ok(Response::ok("Nothing happened"))
    }

    fn cmd_user(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[1])?;
        // Always accepted, valid username or not, so a probing client can't
        // tell which usernames exist from the USER response alone.
        self.session.staged_username = Some(args[0].clone());
        Ok(Response::ok("Username accepted"))
    }

    async fn cmd_pass(&mut self, args: &[String]) -> Result<Response, Abort> {
        // Arity is deliberately unchecked here: a password may itself
        // contain spaces, so PASS takes any number of arguments and joins
        // them back with single spaces.
        let username = match self.session.staged_username.clone() {
            Some(u) => u,
            None => {
                return Ok(Response::err_code(
                    "No username was sent using the USER command",
                    ResponseCode::Auth,
                ))
            }
        };

        let password = args.join(" ");
        if password.is_empty() {
            return Ok(Response::err_code("Empty password", ResponseCode::Auth));
        }

        let verified = self.adapter.verify_login_credentials(&username, &password).await.into_outcome()?;
        if !verified {
            return Ok(self.invalid_password().await);
        }

        if !self.registry.try_insert(self.connection_id, &username, self.session.read_only) {
            return Ok(Response::err_code(
                "This user is logged in in another session",
                ResponseCode::InUse,
            ));
        }

        self.session.authenticated = true;
        self.session.username = Some(username.clone());
        self.session.staged_username = None;
        self.adapter.login_successful(&username, self.session.read_only).await.into_outcome()?;

        let mut message = "User successfully logged in".to_string();
        if self.session.read_only {
            message.push_str(" (read-only)");
        }
        Ok(Response::ok(message))
    }

    /// Sleeps the configured delay, then applies the invalid-password
    /// counter and its threshold. Always returns a response: either the
    /// ordinary credential-rejection message, or, past the threshold, a
    /// session-ending one.
    async fn invalid_password(&mut self) -> Response {
        tokio::time::sleep(self.limits.failed_login_delay).await;

        if self.limits.max_invalid_passwords_per_session >= 0 {
            self.session.invalid_password_count += 1;
            if self.session.invalid_password_count as i64 > self.limits.max_invalid_passwords_per_session {
                return Response::err_code("Too many incorrect passwords", ResponseCode::Auth).close();
            }
        }
        Response::err_code("Incorrect username or password", ResponseCode::Auth)
    }

    async fn cmd_stat(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0])?;

        let count = self.adapter.get_message_count().await.into_outcome()?;
        let mut undeleted = 0usize;
        let mut total = 0usize;
        for index in 0..count {
            if !self.is_marked_deleted(index).await? {
                undeleted += 1;
                total += self.message_size(index).await?;
            }
        }
        Ok(Response::ok_human_unreadable(format!("{undeleted} {total}")))
    }

    async fn cmd_list(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0, 1])?;

        if args.is_empty() {
            let mut lines = Vec::new();
            let count = self.adapter.get_message_count().await.into_outcome()?;
            for index in 0..count {
                if !self.is_marked_deleted(index).await? {
                    let size = self.message_size(index).await?;
                    lines.push(format!("{} {}", index + 1, size));
                }
            }
            return Ok(Response::ok_multiline("Listing all messages' sizes", lines.join("\r\n")));
        }

        let index = self.parse_message_index(&args[0]).await?;
        let size = self.message_size(index).await?;
        Ok(Response::ok_human_unreadable(format!("{} {}", index + 1, size)))
    }

    async fn cmd_uidl(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0, 1])?;

        if args.is_empty() {
            let count = self.adapter.get_message_count().await.into_outcome()?;
            let mut entries = Vec::new();
            for index in 0..count {
                if !self.is_marked_deleted(index).await? {
                    entries.push((index, self.message_unique_id(index).await?));
                }
            }
            let mut ids: Vec<&str> = entries.iter().map(|(_, id)| id.as_str()).collect();
            ids.sort_unstable();
            if ids.windows(2).any(|w| w[0] == w[1]) {
                return Ok(Response::err_internal());
            }
            let lines: Vec<String> = entries.iter().map(|(i, id)| format!("{} {}", i + 1, id)).collect();
            return Ok(Response::ok_multiline("Listing all messages' unique IDs", lines.join("\r\n")));
        }

        let index = self.parse_message_index(&args[0]).await?;
        let unique_id = self.message_unique_id(index).await?;
        Ok(Response::ok_human_unreadable(format!("{} {}", index + 1, unique_id)))
    }

    async fn cmd_retr(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[1])?;
        let index = self.parse_message_index(&args[0]).await?;
        let content = self.message_content(index).await?;
        Ok(Response::ok_multiline("Sending the message's content", content))
    }

    async fn cmd_top(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[2])?;
        let index = self.parse_message_index(&args[0]).await?;
        let n = Self::parse_line_count(&args[1])?;

        let content = self.message_content(index).await?;
        let body = top_content(&content, n);
        Ok(if n == 0 {
            Response::ok_multiline_force_crlf("Sending the message's partial content", body)
        } else {
            Response::ok_multiline("Sending the message's partial content", body)
        })
    }

    async fn cmd_dele(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[1])?;
        if self.session.read_only {
            return Ok(Response::err_read_only());
        }
        let index = self.parse_message_index(&args[0]).await?;
        self.adapter.mark_message_as_deleted(index).await.into_outcome()?;
        Ok(Response::ok("The message was marked as deleted"))
    }

    async fn cmd_rset(&mut self, args: &[String]) -> Result<Response, Abort> {
        Self::check_arity(args, &[0])?;
        if self.session.read_only {
            return Ok(Response::err_read_only());
        }
        self.adapter.unmark_messages_marked_as_deleted().await.into_outcome()?;
        Ok(Response::ok("Messages marked as deleted were unmarked"))
    }

    /// In read-only mode, DELE and RSET are refused before reaching the
    /// adapter, so a mark can never exist; short-circuit without a call.
    async fn is_marked_deleted(&mut self, index: usize) -> Result<bool, Abort> {
        if self.session.read_only {
            return Ok(false);
        }
        self.adapter.is_message_marked_as_deleted(index).await.into_outcome()
    }

    async fn parse_message_index(&mut self, raw: &str) -> Result<usize, Abort> {
        let number: i64 = raw
            .parse()
            .map_err(|_| Response::err("Invalid message number (must be an integer)"))?;
        let index = number - 1;
        let count = self.adapter.get_message_count().await.into_outcome()? as i64;
        if index < 0 || index >= count {
            return Err(Response::err("Invalid message number (out of range)").into());
        }
        let index = index as usize;
        if self.is_marked_deleted(index).await? {
            return Err(Response::err("Invalid message number (message marked as deleted)").into());
        }
        Ok(index)
    }

    fn parse_line_count(raw: &str) -> Result<u64, Abort> {
        let n: i64 = raw
            .parse()
            .map_err(|_| Response::err("Invalid number of lines (must be an integer)"))?;
        if n < 0 {
            return Err(Response::err("Invalid number of lines (out of range)").into());
        }
        Ok(n as u64)
    }

    async fn message_content(&mut self, index: usize) -> Result<String, Abort> {
        self.adapter
            .get_message_content(index, self.session.encoding.as_label())
            .await
            .into_outcome()
    }

    async fn message_unique_id(&mut self, index: usize) -> Result<String, Abort> {
        let id = self.adapter.get_message_unique_id(index).await.into_outcome()?;
        if id.is_empty() || id.len() > 70 || !id.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
            return Err(Response::err_internal().into());
        }
        Ok(id)
    }

    async fn message_size(&mut self, index: usize) -> Result<usize, Abort> {
        let content = self.message_content(index).await?;
        let normalized = normalize_crlf(&content);
        match self.session.encoding {
            Encoding::Ascii if !normalized.is_ascii() => Err(Response::err_code(
                "The message, whose size was obtained, contains a non-ASCII character (the UTF-8 mode is not enabled)",
                ResponseCode::Utf8,
            )
            .into()),
            _ => Ok(normalized.len()),
        }
    }
}

/// The TOP algorithm: consume lines up to and including the first blank
/// line as headers (if the content has no blank-line separator, the
/// headers run to the end of the content, and there's no separator line
/// to include), then take up to `n` body lines.
fn top_content(content: &str, n: u64) -> String {
    let lines = split_lines_keep_empty(content);
    let mut idx = 0usize;
    let mut out: Vec<&str> = Vec::new();

    while idx < lines.len() && !lines[idx].is_empty() {
        out.push(lines[idx]);
        idx += 1;
    }
    if idx < lines.len() {
        out.push(lines[idx]);
        idx += 1;
    }

    let mut taken = 0u64;
    while idx < lines.len() && taken < n {
        out.push(lines[idx]);
        idx += 1;
        taken += 1;
    }

    out.join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_support::MockAdapter;
    use crate::serializer::new_gate;

    fn limits() -> Limits {
        Limits {
            max_invalid_commands_per_session: -1,
            max_invalid_passwords_per_session: 3,
            failed_login_delay: Duration::from_millis(0),
        }
    }

    fn dispatcher<'a>(
        session: &'a mut SessionState,
        adapter: &'a mut SerializedAdapter,
        registry: &'a ExclusivityRegistry,
    ) -> Dispatcher<'a> {
        Dispatcher {
            connection_id: 1,
            session,
            adapter,
            registry,
            limits: limits(),
        }
    }

    #[tokio::test]
    async fn capa_before_login_lists_capabilities() {
        let mut session = SessionState::new();
        let mock = MockAdapter::new("alice", "hunter2", vec![]);
        let mut adapter = SerializedAdapter::new(new_gate(), Box::new(mock));
        let registry = ExclusivityRegistry::new();
        let mut d = dispatcher(&mut session, &mut adapter, &registry);

        let resp = d.dispatch("CAPA", &[]).await.unwrap();
        let bytes = resp.encode(&SessionState::new());
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("+OK"));
        assert!(text.contains("USER"));
        assert!(text.contains("TOP"));
        assert!(text.contains("UIDL"));
        assert!(text.contains("RESP-CODES"));
        assert!(text.contains("AUTH-RESP-CODE"));
        assert!(text.contains("UTF8 USER"));
        assert!(text.contains("LANG"));
        assert!(text.contains("IMPLEMENTATION"));
        assert!(text.ends_with(".\r\n"));
    }

    #[tokio::test]
    async fn pass_without_user_fails_auth() {
        let mut session = SessionState::new();
        let mock = MockAdapter::new("alice", "hunter2", vec![]);
        let mut adapter = SerializedAdapter::new(new_gate(), Box::new(mock));
        let registry = ExclusivityRegistry::new();
        let mut d = dispatcher(&mut session, &mut adapter, &registry);

        let resp = d.dispatch("PASS", &["secret".to_string()]).await.unwrap();
        let text = String::from_utf8(resp.encode(&SessionState::new())).unwrap();
        assert_eq!(text, "-ERR [AUTH] No username was sent using the USER command\r\n");
    }

    #[tokio::test]
    async fn password_arguments_are_joined_with_single_spaces() {
        let mut session = SessionState::new();
        let mock = MockAdapter::new("alice", "hello world pw", vec![]);
        let mut adapter = SerializedAdapter::new(new_gate(), Box::new(mock));
        let registry = ExclusivityRegistry::new();
        let mut d = dispatcher(&mut session, &mut adapter, &registry);

        d.dispatch("USER", &["alice".to_string()]).await.unwrap();
        let resp = d
            .dispatch(
                "PASS",
                &["hello".to_string(), "world".to_string(), "pw".to_string()],
            )
            .await
            .unwrap();
        let text = String::from_utf8(resp.encode(&SessionState::new())).unwrap();
        assert_eq!(text, "+OK User successfully logged in\r\n");
    }

    #[tokio::test]
    async fn second_read_write_login_is_rejected_in_use() {
        let registry = ExclusivityRegistry::new();
        assert!(registry.try_insert(99, "bob", false));

        let mut session = SessionState::new();
        let mock = MockAdapter::new("bob", "pw", vec![]);
        let mut adapter = SerializedAdapter::new(new_gate(), Box::new(mock));
        let mut d = dispatcher(&mut session, &mut adapter, &registry);

        d.dispatch("USER", &["bob".to_string()]).await.unwrap();
        let resp = d.dispatch("PASS", &["pw".to_string()]).await.unwrap();
        let text = String::from_utf8(resp.encode(&SessionState::new())).unwrap();
        assert_eq!(text, "-ERR [IN-USE] This user is logged in in another session\r\n");
    }

    #[tokio::test]
    async fn retr_byte_stuffs_dot_lines() {
        let mut session = SessionState::new();
        let mock = MockAdapter::new("alice", "pw", vec![("id1", "From: a\r\n\r\n.hello\r\nworld")]);
        let mut adapter = SerializedAdapter::new(new_gate(), Box::new(mock));
        let registry = ExclusivityRegistry::new();
        let mut d = dispatcher(&mut session, &mut adapter, &registry);
        d.dispatch("USER", &["alice".to_string()]).await.unwrap();
        d.dispatch("PASS", &["pw".to_string()]).await.unwrap();

        let resp = d.dispatch("RETR", &["1".to_string()]).await.unwrap();
        let text = String::from_utf8(resp.encode(&SessionState::new())).unwrap();
        assert!(text.contains("..hello\r\n"));
        assert!(text.ends_with("\r\n.\r\n"));
    }

    #[tokio::test]
    async fn top_with_zero_lines_forces_crlf_terminator() {
        assert_eq!(top_content("From: a\r\nSubject: b\r\n\r\nbody line", 0), "From: a\r\nSubject: b\r\n");
        assert_eq!(top_content("From: a\r\n\r\nfirst\r\nsecond", 1), "From: a\r\n\r\nfirst");
    }

    #[tokio::test]
    async fn too_many_bad_passwords_closes_connection() {
        let mut session = SessionState::new();
        let mock = MockAdapter::new("alice", "hunter2", vec![]);
        let mut adapter = SerializedAdapter::new(new_gate(), Box::new(mock));
        let registry = ExclusivityRegistry::new();
        let mut d = dispatcher(&mut session, &mut adapter, &registry);
        d.dispatch("USER", &["alice".to_string()]).await.unwrap();

        for _ in 0..3 {
            let resp = d.dispatch("PASS", &["wrong".to_string()]).await.unwrap();
            assert!(!resp.closes_connection());
        }
        let resp = d.dispatch("PASS", &["wrong".to_string()]).await.unwrap();
        assert!(resp.closes_connection());
        let text = String::from_utf8(resp.encode(&SessionState::new())).unwrap();
        assert_eq!(text, "-ERR [AUTH] Too many incorrect passwords\r\n");
    }

    #[tokio::test]
    async fn dele_and_rset_are_refused_in_read_only_mode() {
        let mut session = SessionState::new();
        session.read_only = true;
        let mock = MockAdapter::new("alice", "pw", vec![("id1", "From: a\r\n\r\nhi")]);
        let mut adapter = SerializedAdapter::new(new_gate(), Box::new(mock));
        let registry = ExclusivityRegistry::new();
        let mut d = dispatcher(&mut session, &mut adapter, &registry);
        d.dispatch("USER", &["alice".to_string()]).await.unwrap();
        d.dispatch("PASS", &["pw".to_string()]).await.unwrap();

        let resp = d.dispatch("DELE", &["1".to_string()]).await.unwrap();
        let text = String::from_utf8(resp.encode(&SessionState::new())).unwrap();
        assert_eq!(text, "-ERR [X-POP3SF-READ-ONLY] The mailbox access mode is set to read-only\r\n");
    }

    #[tokio::test]
    async fn invalid_verb_outside_state_is_invalid_command() {
        let mut session = SessionState::new();
        let mock = MockAdapter::new("alice", "pw", vec![]);
        let mut adapter = SerializedAdapter::new(new_gate(), Box::new(mock));
        let registry = ExclusivityRegistry::new();
        let mut d = dispatcher(&mut session, &mut adapter, &registry);

        // STAT is only valid post-authentication.
        let resp = d.dispatch("STAT", &[]).await.unwrap();
        let text = String::from_utf8(resp.encode(&SessionState::new())).unwrap();
        assert_eq!(text, "-ERR Invalid command\r\n");
    }
}
