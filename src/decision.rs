//! The three-way reconciliation decision function: pure, synchronous, no I/O.
//!
//! Given what the local filesystem, the cloud, and the last-synced metadata
//! each say about a path, decide what action (if any) is owed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Nothing changed since the last successful sync.
    NoOp,
    /// Push the local copy to the cloud.
    Upload,
    /// Fetch the cloud copy to disk.
    Download,
    /// Both sides changed since the last sync; back up the local copy and download.
    Conflict,
}

/// Presence + mtime triple as seen from one side of the comparison. `None` means
/// absent on that side.
#[derive(Debug, Clone, Copy)]
pub struct SideState {
    pub exists: bool,
    pub mtime: i64,
}

impl SideState {
    pub fn absent() -> Self {
        Self { exists: false, mtime: 0 }
    }

    pub fn present(mtime: i64) -> Self {
        Self { exists: true, mtime }
    }
}

/// Decides the action for a single path given its local state, cloud state, and
/// the mtimes recorded the last time both sides were known to agree.
///
/// `known_local_mtime` / `known_cloud_mtime` are `None` when the path has never
/// been synced before (no metadata record exists).
pub fn decide(
    local: SideState,
    cloud: SideState,
    known_local_mtime: Option<i64>,
    known_cloud_mtime: Option<i64>,
) -> Decision {
    match (local.exists, cloud.exists) {
        (false, false) => Decision::NoOp,
        // Only one side has the file: push it to the other, even if a prior
        // record exists (a local delete with no cloud-side change resurrects
        // the file on the next pass; deletion propagation is out of scope).
        (true, false) => Decision::Upload,
        (false, true) => Decision::Download,
        (true, true) => {
            let local_changed = known_local_mtime.map(|k| local.mtime > k).unwrap_or(true);
            let cloud_changed = known_cloud_mtime.map(|k| cloud.mtime > k).unwrap_or(true);

            match (local_changed, cloud_changed) {
                (false, false) => Decision::NoOp,
                (true, false) => Decision::Upload,
                (false, true) => Decision::Download,
                (true, true) => {
                    if local.mtime > cloud.mtime {
                        Decision::Upload
                    } else if cloud.mtime > local.mtime {
                        Decision::Download
                    } else {
                        Decision::Conflict
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_absent_is_noop() {
        assert_eq!(
            decide(SideState::absent(), SideState::absent(), None, None),
            Decision::NoOp
        );
    }

    #[test]
    fn new_local_file_uploads() {
        assert_eq!(
            decide(SideState::present(100), SideState::absent(), None, None),
            Decision::Upload
        );
    }

    #[test]
    fn new_cloud_file_downloads() {
        assert_eq!(
            decide(SideState::absent(), SideState::present(100), None, None),
            Decision::Download
        );
    }

    #[test]
    fn cloud_removed_after_sync_reuploads_local() {
        assert_eq!(
            decide(SideState::present(100), SideState::absent(), Some(100), Some(100)),
            Decision::Upload
        );
    }

    #[test]
    fn local_removed_after_sync_redownloads_cloud() {
        assert_eq!(
            decide(SideState::absent(), SideState::present(100), Some(100), Some(100)),
            Decision::Download
        );
    }

    #[test]
    fn unchanged_both_sides_is_noop() {
        assert_eq!(
            decide(SideState::present(100), SideState::present(200), Some(100), Some(200)),
            Decision::NoOp
        );
    }

    #[test]
    fn local_only_modified_uploads() {
        assert_eq!(
            decide(SideState::present(150), SideState::present(200), Some(100), Some(200)),
            Decision::Upload
        );
    }

    #[test]
    fn cloud_only_modified_downloads() {
        assert_eq!(
            decide(SideState::present(100), SideState::present(250), Some(100), Some(200)),
            Decision::Download
        );
    }

    #[test]
    fn both_modified_cloud_newer_downloads() {
        assert_eq!(
            decide(SideState::present(150), SideState::present(250), Some(100), Some(200)),
            Decision::Download
        );
    }

    #[test]
    fn both_modified_local_newer_uploads() {
        assert_eq!(
            decide(SideState::present(250), SideState::present(150), Some(100), Some(200)),
            Decision::Upload
        );
    }

    #[test]
    fn both_modified_equal_mtimes_still_conflicts() {
        // equal resulting mtimes must never be treated as a silent match
        assert_eq!(
            decide(SideState::present(300), SideState::present(300), Some(100), Some(200)),
            Decision::Conflict
        );
    }

    #[test]
    fn never_seen_before_but_present_on_both_sides_and_cloud_newer_downloads() {
        assert_eq!(
            decide(SideState::present(100), SideState::present(200), None, None),
            Decision::Download
        );
    }

    #[test]
    fn never_seen_before_equal_mtimes_conflicts() {
        assert_eq!(
            decide(SideState::present(150), SideState::present(150), None, None),
            Decision::Conflict
        );
    }
}
