//! Segment file naming and directory bookkeeping.
//!
//! Segments live flat in the log directory as `segment__<id>`, where the id is a non-negative
//! integer assigned in creation order. No lockfile, no manifest; the file listing is the only
//! source of truth.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub(crate) const SEGMENT_PREFIX: &str = "segment__";

pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{id}"))
}

/// All segments in `dir`, ascending by id. Ordering by id matches chronological
/// creation order, independent of file mtimes. A file whose suffix does not
/// parse as an integer is skipped, not fatal.
pub(crate) fn list_segments(dir: &Path) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(suffix) = name.strip_prefix(SEGMENT_PREFIX) else {
            continue;
        };
        match suffix.parse::<u64>() {
            Ok(id) => segments.push((id, path)),
            Err(_) => log::warn!("skipping segment file with malformed id: {name}"),
        }
    }

    segments.sort_unstable_by_key(|&(id, _)| id);
    Ok(segments)
}

/// The id of the segment an opener should append to. A previous run may have
/// closed with the tail segment below the rotation threshold; it is reopened
/// and appending continues. A zero-byte segment counts as below threshold.
pub(crate) fn find_resume_target(dir: &Path, max_file_size: u64) -> io::Result<u64> {
    let segments = list_segments(dir)?;
    let Some((last_id, last_path)) = segments.last() else {
        return Ok(0);
    };

    let size = fs::metadata(last_path)?.len();
    if size < max_file_size { Ok(*last_id) } else { Ok(last_id + 1) }
}

/// Create-or-append, positioned at end of file.
pub(crate) fn open_for_append(path: &Path) -> io::Result<File> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.seek(SeekFrom::End(0))?;
    Ok(file)
}

pub(crate) fn open_for_read(path: &Path) -> io::Result<File> {
    File::open(path)
}

pub(crate) fn delete(path: &Path) -> io::Result<()> {
    fs::remove_file(path)
}

/// The segment with the lowest id, if any.
pub(crate) fn oldest(dir: &Path) -> io::Result<Option<(u64, PathBuf)>> {
    Ok(list_segments(dir)?.into_iter().next())
}
