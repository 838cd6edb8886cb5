use std::collections::HashMap;
use std::sync::Mutex;

/// One entry in the exclusivity registry: the connection holding it, and
/// whether it holds the mailbox read-only.
#[derive(Debug, Clone)]
struct Entry {
    connection_id: u64,
    read_only: bool,
}

/// Process-wide table preventing two mutating sessions for the same
/// user: one lock guarding a flat list of `(connection_id, username,
/// read_only)` tuples. An explicit, long-lived service owned by the
/// listener and shared with every worker, rather than a singleton (tests
/// can construct a fresh one).
///
/// Invariant on the set, for any username: either zero entries, or every
/// entry is read-only, or exactly one entry exists and it is read-write.
/// Read-only sessions coexist freely with each other; a read-write session
/// excludes every other session, read-only or not.
pub struct ExclusivityRegistry {
    entries: Mutex<HashMap<String, Vec<Entry>>>,
}

impl ExclusivityRegistry {
    pub fn new() -> Self {
        ExclusivityRegistry {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically checks and inserts. Returns `false` (and inserts
    /// nothing) if `username` already has a read-write entry, or if
    /// `username` has any entry at all and this insertion is not
    /// read-only.
    pub fn try_insert(&self, connection_id: u64, username: &str, read_only: bool) -> bool {
        let mut entries = self.entries.lock().expect("exclusivity registry lock poisoned");
        let existing = entries.entry(username.to_string()).or_default();

        // A read-write session excludes any other session for this user;
        // a read-only session only ever conflicts with a read-write one.
        let conflict = existing.iter().any(|e| !(read_only && e.read_only));
        if conflict {
            return false;
        }

        existing.push(Entry { connection_id, read_only });
        true
    }

    /// Always succeeds; idempotent. No-op if `connection_id` never held an
    /// entry (e.g. a session that closed before authenticating).
    pub fn remove(&self, connection_id: u64) {
        let mut entries = self.entries.lock().expect("exclusivity registry lock poisoned");
        entries.retain(|_, v| {
            v.retain(|e| e.connection_id != connection_id);
            !v.is_empty()
        });
    }
}

impl Default for ExclusivityRegistry {
    fn default() -> Self {
        ExclusivityRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_read_write_session_is_rejected() {
        let reg = ExclusivityRegistry::new();
        assert!(reg.try_insert(1, "bob", false));
        assert!(!reg.try_insert(2, "bob", false));
    }

    #[test]
    fn read_only_sessions_coexist() {
        let reg = ExclusivityRegistry::new();
        assert!(reg.try_insert(1, "bob", true));
        assert!(reg.try_insert(2, "bob", true));
        assert!(reg.try_insert(3, "bob", true));
    }

    #[test]
    fn read_write_excludes_existing_read_only() {
        let reg = ExclusivityRegistry::new();
        assert!(reg.try_insert(1, "bob", true));
        assert!(!reg.try_insert(2, "bob", false));
    }

    #[test]
    fn read_only_excludes_existing_read_write() {
        let reg = ExclusivityRegistry::new();
        assert!(reg.try_insert(1, "bob", false));
        assert!(!reg.try_insert(2, "bob", true));
    }

    #[test]
    fn different_usernames_never_conflict() {
        let reg = ExclusivityRegistry::new();
        assert!(reg.try_insert(1, "bob", false));
        assert!(reg.try_insert(2, "alice", false));
    }

    #[test]
    fn remove_is_idempotent_and_frees_the_slot() {
        let reg = ExclusivityRegistry::new();
        assert!(reg.try_insert(1, "bob", false));
        reg.remove(1);
        reg.remove(1);
        assert!(reg.try_insert(2, "bob", false));
    }
}
