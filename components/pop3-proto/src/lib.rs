/// # Example POP3 session
///
/// S: <wait for connection on TCP port 110>
/// C: <open connection>
/// S:    +OK The POP3 server is ready
/// C:    USER mrose
/// S:    +OK Username accepted
/// C:    PASS verysecret
/// S:    +OK User successfully logged in
/// C:    STAT
/// S:    +OK 2 320
/// C:    LIST
/// S:    +OK Listing all messages' sizes
/// S:    1 120
/// S:    2 200
/// S:    .
/// C:    RETR 1
/// S:    +OK Sending the message's content
/// S:    <the POP3 server sends message 1>
/// S:    .
/// C:    DELE 1
/// S:    +OK The message was marked as deleted
/// C:    QUIT
/// S:    +OK Session is ending (an user was logged in)
/// C:  <close connection>
pub use framing::*;
pub use proto::*;

mod framing;
mod proto;
