//! Local file helpers built on capability-scoped directories.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Splits `path` into its parent directory and file name.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidInput`] when the path has no file name.
pub fn split(path: &Utf8Path) -> io::Result<(&Utf8Path, &str)> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{path} does not name a file"),
        )
    })?;
    Ok((parent, name))
}

/// Opens the parent directory of `path`, creating it when missing.
///
/// # Errors
///
/// Propagates directory creation and open failures.
pub fn open_parent(path: &Utf8Path) -> io::Result<(Dir, String)> {
    let (parent, name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    Ok((dir, name.to_owned()))
}

/// Returns whether `path` exists.
///
/// # Errors
///
/// Propagates failures other than a missing parent directory.
pub fn exists(path: &Utf8Path) -> io::Result<bool> {
    let (parent, name) = split(path)?;
    match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir.try_exists(name),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Reads `path` to a string.
///
/// # Errors
///
/// Propagates open and read failures.
pub fn read_to_string(path: &Utf8Path) -> io::Result<String> {
    let (parent, name) = split(path)?;
    Dir::open_ambient_dir(parent, ambient_authority())?.read_to_string(name)
}

/// Replaces `path` with `contents` by writing a sibling temporary file and
/// renaming it over the target.
///
/// When `mode` is given the permissions are applied before the rename, so
/// the final name never exposes the content with looser permissions.
///
/// # Errors
///
/// Propagates directory, write and rename failures.
pub fn write_atomic(path: &Utf8Path, contents: &[u8], mode: Option<u32>) -> io::Result<()> {
    let (dir, name) = open_parent(path)?;
    let staging = format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple());
    dir.write(&staging, contents)?;
    if let Some(bits) = mode {
        restrict(&dir, &staging, bits)?;
    }
    if let Err(err) = dir.rename(&staging, &dir, &name) {
        dir.remove_file(&staging).ok();
        return Err(err);
    }
    Ok(())
}

#[cfg(unix)]
fn restrict(dir: &Dir, name: &str, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    dir.set_permissions(
        name,
        cap_std::fs::Permissions::from_std(std::fs::Permissions::from_mode(mode)),
    )
}

#[cfg(not(unix))]
const fn restrict(_dir: &Dir, _name: &str, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Removes the directory tree at `path`; a missing tree counts as removed.
///
/// # Errors
///
/// Propagates failures other than [`io::ErrorKind::NotFound`].
pub fn remove_tree(path: &Utf8Path) -> io::Result<()> {
    let (parent, name) = split(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    match dir.remove_dir_all(name) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Converts an OS path to UTF-8, reporting non-UTF-8 paths as invalid data.
///
/// # Errors
///
/// Returns [`io::ErrorKind::InvalidData`] for non-UTF-8 paths.
pub fn utf8(path: std::path::PathBuf) -> io::Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path).map_err(|original| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is not valid UTF-8", original.display()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_path(tmp: &TempDir, name: &str) -> Utf8PathBuf {
        utf8(tmp.path().join(name)).unwrap_or_else(|err| panic!("utf8 temp path: {err}"))
    }

    #[test]
    fn atomic_write_creates_parents_and_replaces_content() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_path(&tmp, "nested/dir/file.json");

        write_atomic(&path, b"first", None).unwrap_or_else(|err| panic!("write: {err}"));
        write_atomic(&path, b"second", None).unwrap_or_else(|err| panic!("rewrite: {err}"));

        let contents = read_to_string(&path).unwrap_or_else(|err| panic!("read: {err}"));
        assert_eq!(contents, "second");
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("nested/dir"))
            .unwrap_or_else(|err| panic!("read dir: {err}"))
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_path(&tmp, "key.pem");
        write_atomic(&path, b"secret", Some(0o600)).unwrap_or_else(|err| panic!("write: {err}"));

        let mode = std::fs::metadata(&path)
            .unwrap_or_else(|err| panic!("metadata: {err}"))
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_paths_do_not_exist_and_remove_cleanly() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = temp_path(&tmp, "absent/child");
        assert!(!exists(&path).unwrap_or_else(|err| panic!("exists: {err}")));
        remove_tree(&path).unwrap_or_else(|err| panic!("remove: {err}"));
    }
}
