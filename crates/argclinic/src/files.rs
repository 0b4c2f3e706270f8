//! File I/O helpers: read whole files, write atomically and only on change.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::errors::{ClinicError, ClinicResult};

pub fn read_file(path: &str) -> ClinicResult<String> {
    fs::read_to_string(path)
        .map_err(|e| ClinicError::new(format!("Can't open file {path:?}: {e}")))
}

/// Writes `contents` to `path` via a temporary file in the same directory,
/// atomically replacing the target. Unchanged files are left untouched.
pub fn write_file(path: &str, contents: &str) -> ClinicResult<()> {
    if let Ok(existing) = fs::read_to_string(path)
        && existing == contents
    {
        return Ok(());
    }

    let target = Path::new(path);
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent)
                .map_err(|e| ClinicError::new(format!("Can't create directory for {path:?}: {e}")))?;
            parent
        }
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| ClinicError::new(format!("Can't create temporary file near {path:?}: {e}")))?;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| ClinicError::new(format!("Can't write {path:?}: {e}")))?;
    tmp.persist(target)
        .map_err(|e| ClinicError::new(format!("Can't replace {path:?}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.c");
        let path = path.to_str().unwrap();
        write_file(path, "contents\n").unwrap();
        assert_eq!(read_file(path).unwrap(), "contents\n");
    }

    #[test]
    fn unchanged_files_keep_their_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.c");
        let path = path.to_str().unwrap();
        write_file(path, "same\n").unwrap();
        let before = std::fs::metadata(path).unwrap().modified().unwrap();
        write_file(path, "same\n").unwrap();
        let after = std::fs::metadata(path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clinic").join("out.c.h");
        let path = path.to_str().unwrap();
        write_file(path, "generated\n").unwrap();
        assert_eq!(read_file(path).unwrap(), "generated\n");
    }
}
