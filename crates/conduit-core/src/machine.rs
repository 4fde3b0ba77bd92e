//! Stable machine identity.
//!
//! The machine ID is never read from configuration; it is derived from the
//! host's systemd or DBus machine id file at startup.

use crate::error::{ConduitError, ConduitResult};
use std::path::Path;

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Return this host's stable machine identifier.
pub fn machine_id() -> ConduitResult<String> {
    for path in MACHINE_ID_PATHS {
        if let Some(id) = read_id(Path::new(path)) {
            return Ok(id);
        }
    }
    Err(ConduitError::MachineId(format!(
        "none of {} readable",
        MACHINE_ID_PATHS.join(", ")
    )))
}

fn read_id(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let id = raw.trim();
    if id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_file_is_skipped() {
        let dir = std::env::temp_dir().join("conduit-machine-id-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("machine-id");
        std::fs::write(&path, "\n").unwrap();
        assert!(read_id(&path).is_none());
        std::fs::write(&path, "2db2b3a5c8e14e9b8f10ddrow\n").unwrap();
        assert_eq!(read_id(&path).unwrap(), "2db2b3a5c8e14e9b8f10ddrow");
    }
}
