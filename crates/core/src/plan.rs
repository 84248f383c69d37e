//! Per-file reconciliation decision
//!
//! A pure function of three views of one filename: what the local index says
//! was last reconciled, what is on disk now, and what the server holds now.
//! Deletions are versioned tombstones (see [`FileMetadata::tombstone`]).

use crate::hash::ContentHash;
use crate::meta::FileMetadata;

/// What the engine should do with one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// Index, disk and server agree
    Nothing,
    /// Upload the on-disk content and propose it at `version`
    Upload { version: u64 },
    /// Propose a tombstone at `version`
    PublishDelete { version: u64 },
    /// Overwrite the local file with the server's content.
    ///
    /// `overrides_local` is set when a local change is discarded.
    Pull { overrides_local: bool },
    /// Delete the local file to match a server tombstone
    RemoveLocal { overrides_local: bool },
    /// Disk already matches the server: record the server entry in the index
    Adopt,
    /// Nothing exists anywhere any more: drop the index entry
    Forget,
}

/// Decide the action for one filename.
///
/// `disk` is the freshly computed hash list, `None` if the file does not
/// exist locally.
#[must_use]
pub fn plan(
    index: Option<&FileMetadata>,
    disk: Option<&[ContentHash]>,
    remote: Option<&FileMetadata>,
) -> FileAction {
    let index_live = index.filter(|m| !m.is_tombstone());
    let local_changed = match (disk, index_live) {
        (Some(disk), Some(index)) => disk != index.block_hash_list.as_slice(),
        (None, None) => false,
        // new, re-created or deleted
        _ => true,
    };

    if local_changed {
        plan_local_change(index.map_or(0, |m| m.version), disk, remote)
    } else {
        plan_unchanged(index, disk, remote)
    }
}

fn plan_local_change(
    index_version: u64,
    disk: Option<&[ContentHash]>,
    remote: Option<&FileMetadata>,
) -> FileAction {
    let remote_version = remote.map_or(0, |r| r.version);

    match (disk, remote) {
        (Some(disk), Some(r)) if !r.is_tombstone() && disk == r.block_hash_list.as_slice() => {
            FileAction::Adopt
        }
        (None, Some(r)) if r.is_tombstone() => FileAction::Adopt,
        (None, None) => FileAction::Forget,
        // The server moved past what we last saw; the proposal could only be
        // rejected, so the server's version wins right away.
        (_, Some(r)) if remote_version > index_version => take_remote(r, disk, true),
        (Some(_), _) => FileAction::Upload {
            version: remote_version + 1,
        },
        (None, _) => FileAction::PublishDelete {
            version: remote_version + 1,
        },
    }
}

fn plan_unchanged(
    index: Option<&FileMetadata>,
    disk: Option<&[ContentHash]>,
    remote: Option<&FileMetadata>,
) -> FileAction {
    let Some(remote) = remote else {
        // Server has no record of a file we reconciled: it lost its state.
        return match index {
            Some(index) if !index.is_tombstone() => FileAction::Upload { version: 1 },
            _ => FileAction::Nothing,
        };
    };

    match index {
        Some(index) if index == remote => FileAction::Nothing,
        Some(index) if remote.version < index.version && !index.is_tombstone() => {
            FileAction::Upload {
                version: remote.version + 1,
            }
        }
        _ => take_remote(remote, disk, false),
    }
}

fn take_remote(
    remote: &FileMetadata,
    disk: Option<&[ContentHash]>,
    overrides_local: bool,
) -> FileAction {
    match disk {
        Some(_) if remote.is_tombstone() => FileAction::RemoveLocal { overrides_local },
        None if remote.is_tombstone() => FileAction::Adopt,
        Some(disk) if disk == remote.block_hash_list.as_slice() => FileAction::Adopt,
        _ => FileAction::Pull { overrides_local },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(parts: &[&str]) -> Vec<ContentHash> {
        parts.iter().map(|p| ContentHash::from_bytes(p.as_bytes())).collect()
    }

    fn meta(version: u64, parts: &[&str]) -> FileMetadata {
        FileMetadata::new("f", version, h(parts))
    }

    fn tomb(version: u64) -> FileMetadata {
        FileMetadata::tombstone("f", version)
    }

    #[test]
    fn test_new_local_file() {
        let disk = h(&["a"]);
        assert_eq!(
            plan(None, Some(&disk), None),
            FileAction::Upload { version: 1 }
        );
    }

    #[test]
    fn test_local_modification() {
        let index = meta(2, &["old"]);
        let remote = meta(2, &["old"]);
        let disk = h(&["new"]);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&remote)),
            FileAction::Upload { version: 3 }
        );
    }

    #[test]
    fn test_remote_newer() {
        let index = meta(2, &["old"]);
        let remote = meta(3, &["remote"]);
        let disk = h(&["old"]);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&remote)),
            FileAction::Pull {
                overrides_local: false
            }
        );
    }

    #[test]
    fn test_new_remote_file() {
        let remote = meta(1, &["r"]);
        assert_eq!(
            plan(None, None, Some(&remote)),
            FileAction::Pull {
                overrides_local: false
            }
        );
    }

    #[test]
    fn test_in_sync() {
        let index = meta(4, &["x", "y"]);
        let disk = h(&["x", "y"]);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&index.clone())),
            FileAction::Nothing
        );
    }

    #[test]
    fn test_local_change_with_remote_ahead_pulls() {
        let index = meta(2, &["base"]);
        let remote = meta(3, &["theirs"]);
        let disk = h(&["mine"]);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&remote)),
            FileAction::Pull {
                overrides_local: true
            }
        );
    }

    #[test]
    fn test_new_local_file_colliding_with_remote() {
        let remote = meta(1, &["theirs"]);
        let disk = h(&["mine"]);
        assert_eq!(
            plan(None, Some(&disk), Some(&remote)),
            FileAction::Pull {
                overrides_local: true
            }
        );
    }

    #[test]
    fn test_adopt_identical_content() {
        let remote = meta(5, &["same"]);
        let disk = h(&["same"]);
        assert_eq!(plan(None, Some(&disk), Some(&remote)), FileAction::Adopt);

        // Index behind but disk already has the remote content
        let index = meta(4, &["older"]);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&remote)),
            FileAction::Adopt
        );
    }

    #[test]
    fn test_local_deletion() {
        let index = meta(2, &["x"]);
        let remote = meta(2, &["x"]);
        assert_eq!(
            plan(Some(&index), None, Some(&remote)),
            FileAction::PublishDelete { version: 3 }
        );
    }

    #[test]
    fn test_local_deletion_loses_to_newer_remote() {
        let index = meta(2, &["x"]);
        let remote = meta(3, &["y"]);
        assert_eq!(
            plan(Some(&index), None, Some(&remote)),
            FileAction::Pull {
                overrides_local: true
            }
        );
    }

    #[test]
    fn test_remote_deletion() {
        let index = meta(2, &["x"]);
        let disk = h(&["x"]);
        let remote = tomb(3);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&remote)),
            FileAction::RemoveLocal {
                overrides_local: false
            }
        );
    }

    #[test]
    fn test_remote_deletion_beats_local_edit() {
        let index = meta(2, &["x"]);
        let disk = h(&["edited"]);
        let remote = tomb(3);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&remote)),
            FileAction::RemoveLocal {
                overrides_local: true
            }
        );
    }

    #[test]
    fn test_deleted_on_both_sides() {
        let index = meta(2, &["x"]);
        let remote = tomb(3);
        assert_eq!(plan(Some(&index), None, Some(&remote)), FileAction::Adopt);
    }

    #[test]
    fn test_unseen_tombstone_is_recorded() {
        let remote = tomb(7);
        assert_eq!(plan(None, None, Some(&remote)), FileAction::Adopt);
    }

    #[test]
    fn test_recorded_tombstone_is_stable() {
        let index = tomb(7);
        assert_eq!(
            plan(Some(&index), None, Some(&index.clone())),
            FileAction::Nothing
        );
    }

    #[test]
    fn test_recreation_after_delete() {
        let index = tomb(3);
        let disk = h(&["back"]);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&index.clone())),
            FileAction::Upload { version: 4 }
        );
    }

    #[test]
    fn test_server_lost_state_republishes() {
        let index = meta(5, &["x"]);
        let disk = h(&["x"]);
        assert_eq!(
            plan(Some(&index), Some(&disk), None),
            FileAction::Upload { version: 1 }
        );

        let remote = meta(2, &["older"]);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&remote)),
            FileAction::Upload { version: 3 }
        );
    }

    #[test]
    fn test_tombstones_are_not_republished() {
        let index = tomb(5);
        assert_eq!(plan(Some(&index), None, None), FileAction::Nothing);

        let remote = meta(2, &["older"]);
        assert_eq!(
            plan(Some(&index), None, Some(&remote)),
            FileAction::Pull {
                overrides_local: false
            }
        );
    }

    #[test]
    fn test_local_delete_when_server_lost_file() {
        let index = meta(2, &["x"]);
        assert_eq!(plan(Some(&index), None, None), FileAction::Forget);
    }

    #[test]
    fn test_same_version_different_content_takes_remote() {
        let index = meta(3, &["a"]);
        let disk = h(&["a"]);
        let remote = meta(3, &["b"]);
        assert_eq!(
            plan(Some(&index), Some(&disk), Some(&remote)),
            FileAction::Pull {
                overrides_local: false
            }
        );
    }
}
