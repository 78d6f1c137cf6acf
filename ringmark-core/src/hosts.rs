//! Rank-to-hostname lookup table.
//!
//! Populated once by the hostname-exchange probe via an all-gather and
//! read-only afterwards, which is what makes it safe to consult from the
//! watchdog's escape path while the main thread is blocked mid-collective.

use once_cell::sync::OnceCell;

/// Fixed width of one hostname record on the wire.
pub const HOST_RECORD_LEN: usize = 64;

/// Rendered for any rank whose hostname is not (yet) known.
pub const UNKNOWN_HOST: &str = "UNKNOWN";

#[derive(Debug, Default)]
pub struct HostTable {
    slots: OnceCell<Vec<String>>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the gathered table. The first population wins; repeat passes
    /// over the suite gather identical data and are ignored.
    pub fn populate(&self, hosts: Vec<String>) {
        let _ = self.slots.set(hosts);
    }

    pub fn is_populated(&self) -> bool {
        self.slots.get().is_some()
    }

    /// Hostname for `rank`, or [`UNKNOWN_HOST`] when the table has not been
    /// exchanged or the rank is out of range.
    pub fn get(&self, rank: usize) -> &str {
        self.slots
            .get()
            .and_then(|slots| slots.get(rank))
            .map(String::as_str)
            .unwrap_or(UNKNOWN_HOST)
    }
}

/// Hostname of the local node, re-read at call time so the crash and hang
/// paths do not depend on earlier process state.
pub fn local_hostname() -> String {
    let mut buf = [0u8; HOST_RECORD_LEN];
    // SAFETY: buf is a valid writable buffer of the given length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return UNKNOWN_HOST.to_string();
    }
    buf[buf.len() - 1] = 0;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Encode a hostname into one fixed-width, zero-padded wire record.
pub fn encode_record(name: &str) -> [u8; HOST_RECORD_LEN] {
    let mut record = [0u8; HOST_RECORD_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(HOST_RECORD_LEN - 1);
    record[..n].copy_from_slice(&bytes[..n]);
    record
}

/// Decode the fixed-width records of a gathered table.
pub fn decode_records(buf: &[u8]) -> Vec<String> {
    buf.chunks(HOST_RECORD_LEN)
        .map(|chunk| {
            let end = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
            String::from_utf8_lossy(&chunk[..end]).into_owned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpopulated_table_reports_unknown() {
        let table = HostTable::new();
        assert!(!table.is_populated());
        assert_eq!(table.get(0), UNKNOWN_HOST);
    }

    #[test]
    fn first_population_wins() {
        let table = HostTable::new();
        table.populate(vec!["a".into(), "b".into()]);
        table.populate(vec!["x".into(), "y".into()]);
        assert_eq!(table.get(0), "a");
        assert_eq!(table.get(1), "b");
        assert_eq!(table.get(2), UNKNOWN_HOST);
    }

    #[test]
    fn record_round_trip() {
        let record = encode_record("node042.cluster");
        let decoded = decode_records(&record);
        assert_eq!(decoded, vec!["node042.cluster".to_string()]);
    }

    #[test]
    fn overlong_names_truncate_without_panicking() {
        let long = "x".repeat(200);
        let record = encode_record(&long);
        let decoded = decode_records(&record);
        assert_eq!(decoded[0].len(), HOST_RECORD_LEN - 1);
    }

    #[test]
    fn local_hostname_is_nonempty() {
        assert!(!local_hostname().is_empty());
    }
}
