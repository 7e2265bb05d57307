//! Volume free space

use std::io;
use std::path::Path;

/// Bytes available to unprivileged users on the volume holding `path`
pub fn free_disk_space(path: impl AsRef<Path>) -> io::Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path.as_ref()).map_err(io::Error::from)?;
    #[allow(clippy::unnecessary_cast)]
    let free = (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64);
    Ok(free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_free_disk_space() {
        let dir = tempdir().unwrap();
        assert!(free_disk_space(dir.path()).unwrap() > 0);
        assert!(free_disk_space(dir.path().join("missing")).is_err());
    }
}
