// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod inspect;
pub mod timeline;
pub mod verify;

use std::path::{Path, PathBuf};

/// The log file inside a data directory.
pub fn wal_path(dir: &Path) -> PathBuf {
    dir.join(hsvm_persistence::store::WAL_FILE)
}
