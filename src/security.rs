#![forbid(unsafe_code)]

//! Shared security helpers used by the cubecast server.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. Running as a regular
/// unprivileged user keeps local installs predictable and avoids accidental
/// writes into system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Media ids are interpolated into artifact filenames, so anything that
/// could escape the media root has to be rejected before a path is built.
/// The allowed shape covers every extractor id we produce, including the
/// `g<domain><id>` form for generic sources (dots appear in the domain).
pub fn is_safe_media_id(id: &str) -> bool {
    !id.is_empty()
        && !id.chars().all(|c| c == '.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn safe_ids_pass() {
        assert!(is_safe_media_id("dQw4w9WgXcQ"));
        assert!(is_safe_media_id("gexample.comclip-01"));
        assert!(is_safe_media_id("a_b-c.d"));
    }

    #[test]
    fn traversal_and_separator_ids_fail() {
        assert!(!is_safe_media_id(""));
        assert!(!is_safe_media_id(".."));
        assert!(!is_safe_media_id("../etc/passwd"));
        assert!(!is_safe_media_id("a/b"));
        assert!(!is_safe_media_id("a\\b"));
        assert!(!is_safe_media_id("id with spaces"));
        assert!(!is_safe_media_id("id\0"));
    }
}
