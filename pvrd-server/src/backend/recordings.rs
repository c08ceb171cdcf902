//! Mapping between wire recording ids and backend recording paths.
//!
//! Clients address recordings by an 8-hex-digit textual id. The id is
//! a deterministic hash of the recording's backend path, so the same
//! recording always resolves to the same id within the process's
//! lifetime, and ids survive catalog re-enumeration.

use std::collections::HashMap;
use std::sync::Mutex;

/// Process-lifetime registry of wire id ↔ recording path.
pub struct RecordingIndex {
    by_uid: Mutex<HashMap<u32, String>>,
}

impl RecordingIndex {
    pub fn new() -> Self {
        Self {
            by_uid: Mutex::new(HashMap::new()),
        }
    }

    /// Register a recording path and return its wire id.
    pub fn register(&self, path: &str) -> u32 {
        let uid = hash_path(path);
        self.by_uid
            .lock()
            .expect("recording index poisoned")
            .entry(uid)
            .or_insert_with(|| path.to_string());
        uid
    }

    /// Resolve a wire id back to the recording path, if it was ever
    /// enumerated to a client.
    pub fn lookup(&self, uid: u32) -> Option<String> {
        self.by_uid
            .lock()
            .expect("recording index poisoned")
            .get(&uid)
            .cloned()
    }

    /// Format a wire id the way it travels in string fields.
    pub fn format(uid: u32) -> String {
        format!("{:08x}", uid)
    }

    /// Parse an 8-hex-digit textual id. An unparsable id is not a
    /// protocol error; callers report DataUnknown instead.
    pub fn parse(recid: &str) -> Option<u32> {
        u32::from_str_radix(recid.get(..8)?, 16).ok()
    }
}

impl Default for RecordingIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1a over the path bytes. Deterministic per path, which is all
/// the wire contract requires.
fn hash_path(path: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in path.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_resolves_to_same_id() {
        let index = RecordingIndex::new();
        let a = index.register("/video/News/2024-01-01.ts");
        let b = index.register("/video/News/2024-01-01.ts");
        assert_eq!(a, b);
        assert_eq!(
            index.lookup(a).as_deref(),
            Some("/video/News/2024-01-01.ts")
        );
    }

    #[test]
    fn wire_format_roundtrips() {
        let index = RecordingIndex::new();
        let uid = index.register("/video/Movie.ts");
        let recid = RecordingIndex::format(uid);
        assert_eq!(recid.len(), 8);
        assert_eq!(RecordingIndex::parse(&recid), Some(uid));
    }

    #[test]
    fn garbage_id_parses_to_none() {
        assert_eq!(RecordingIndex::parse("notahexid"), None);
        assert_eq!(RecordingIndex::parse("zz"), None);
    }
}
