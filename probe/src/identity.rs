//! Persistent probe identity.
//!
//! A v4 UUID stored next to the probe; regenerated whenever the file is
//! missing or unreadable so a wiped container simply becomes a new probe.

use std::path::Path;

use uuid::Uuid;

pub fn load_or_create_uuid(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim();
            if let Ok(parsed) = Uuid::parse_str(trimmed) {
                return parsed.to_string();
            }
            tracing::warn!("Probe UUID file {:?} is corrupt, generating a new identity", path);
            create_uuid(path)
        }
        Err(_) => create_uuid(path),
    }
}

fn create_uuid(path: &Path) -> String {
    let id = Uuid::new_v4().to_string();
    if let Err(e) = std::fs::write(path, &id) {
        tracing::warn!("Could not persist probe UUID to {:?}: {}", path, e);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.uuid");
        let id = load_or_create_uuid(&path);
        assert!(Uuid::parse_str(&id).is_ok());
        let again = load_or_create_uuid(&path);
        assert_eq!(id, again);
    }

    #[test]
    fn corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.uuid");
        std::fs::write(&path, "not-a-uuid").unwrap();
        let id = load_or_create_uuid(&path);
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), id);
    }

    #[test]
    fn unwritable_path_still_yields_an_identity() {
        let id = load_or_create_uuid(Path::new("/nonexistent-dir-9f2e/probe.uuid"));
        assert!(Uuid::parse_str(&id).is_ok());
    }
}
