use anyhow::{anyhow, Context, Result};
use mnt::{MountEntry, MountIter};
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ## Filesystem Relative PathBuf ####################################################################################

// File-system relative path. PathBufs are considered root relative.
#[derive(Serialize, Deserialize, Clone, Debug, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct FsPathBuf(PathBuf);

impl FsPathBuf {
    pub fn as_pathbuf(&self, mount_path: &Path) -> PathBuf {
        mount_path.join(&self.0)
    }

    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }

    pub fn join<P: AsRef<Path>>(&self, path: P) -> Self {
        Self(self.0.join(path))
    }

    pub fn starts_with<P: AsRef<Path>>(&self, base: P) -> bool {
        self.0.starts_with(base)
    }

    pub fn strip_prefix<P: AsRef<Path>>(&self, base: P) -> Result<Self> {
        self.0
            .strip_prefix(base.as_ref())
            .map(|p| Self(p.to_owned()))
            .map_err(|_| anyhow!("path {:?} is not below {:?}", self.0, base.as_ref()))
    }

    pub fn to_string_lossy(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }
}

impl<T: ?Sized + AsRef<OsStr>> From<&T> for FsPathBuf {
    fn from(s: &T) -> Self {
        Self(PathBuf::from(s))
    }
}

impl FromStr for FsPathBuf {
    type Err = <PathBuf as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(FsPathBuf::from(s))
    }
}

// ## Filesystem Mounting ############################################################################################

pub use double::*;
const MOUNT_EXPECTATION: &str = "All entries in mount list must be parsable.";

#[cfg_attr(test, mockall::automock)]
pub mod double {
    use super::*;

    /// Find the mount entry at target or the mount that contains target.
    pub fn find_mountentry(target: &Path) -> Option<MountEntry> {
        mnt::get_mount(target).expect(MOUNT_EXPECTATION)
    }

    /// Lookup an exact mount entry at target.
    pub fn lookup_mountentry(target: &Path) -> Option<MountEntry> {
        let mut iter = MountIter::new_from_proc().expect(MOUNT_EXPECTATION);
        iter.find_map(|m| match m.expect(MOUNT_EXPECTATION) {
            m if m.file == target => Some(m),
            _ => None,
        })
    }
}

#[derive(Debug)]
pub struct BtrfsMountEntry(MountEntry);

impl BtrfsMountEntry {
    pub fn mount_entry(&self) -> &MountEntry {
        &self.0
    }

    pub fn subvolume_id(&self) -> Option<u32> {
        self.keyed_option("subvolid")
    }

    pub fn subvolume_path(&self) -> Option<String> {
        self.keyed_option("subvol")
    }

    pub fn is_toplevel_subvolume(&self) -> bool {
        let subvol_id = self.subvolume_id();
        let subvol_path = self.subvolume_path();

        (subvol_id.is_none() && subvol_path.is_none())
            || subvol_id.unwrap_or_default() == 5
            || subvol_path.unwrap_or_default() == "/"
    }

    /// Path of the mounted subvolume within the filesystem tree, without the
    /// leading slash btrfs prints in mount options.
    pub fn fstree_path(&self) -> PathBuf {
        self.subvolume_path()
            .map(|p| PathBuf::from(p.trim_start_matches('/')))
            .unwrap_or_default()
    }

    pub fn keyed_option<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Debug,
    {
        let prefix = format!("{}=", key);
        self.0.mntops.iter().find_map(|x| match x {
            mnt::MntOps::Extra(extra) if extra.starts_with(prefix.as_str()) => {
                extra.splitn(2, '=').nth(1).and_then(|s| s.parse::<T>().ok())
            }
            _ => None,
        })
    }
}

impl TryFrom<MountEntry> for BtrfsMountEntry {
    type Error = anyhow::Error;

    fn try_from(other: MountEntry) -> Result<Self, Self::Error> {
        match other.vfstype.as_str() {
            "btrfs" => Ok(BtrfsMountEntry(other)),
            x => Err(anyhow!(
                "{} is not a btrfs mount (it's {}).",
                other.file.to_string_lossy(),
                x
            )),
        }
    }
}

// ## Advisory Locking ###############################################################################################

/// Process-wide advisory lock on a store root. The lock is released when the
/// returned handle drops.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl StoreLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .context(format!("failed to create lock file at {:?}", path))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|_| anyhow!("another sync holds the lock at {:?}", path))?;
        Ok(Self {
            _file: file,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_if_not_btrfs() {
        let non_btrfs_mount: MountEntry = "/dev/vda / ext4 rw 0 0".parse().unwrap();
        assert!(BtrfsMountEntry::try_from(non_btrfs_mount)
            .unwrap_err()
            .to_string()
            .contains("not a btrfs mount"))
    }

    #[test]
    fn no_subvol_options_is_toplevel() {
        assert!(btrfs_without_subvol_opts().is_toplevel_subvolume())
    }

    #[test]
    fn child_subvol_options_is_not_toplevel() {
        assert!(!btrfs_with_child_subvol_opts().is_toplevel_subvolume())
    }

    #[test]
    fn subvol_options_parsed() {
        let mount = btrfs_with_child_subvol_opts();
        assert_eq!(mount.subvolume_id().unwrap(), 257);
        assert_eq!(mount.subvolume_path().unwrap(), "/testsub");
        assert_eq!(mount.fstree_path(), PathBuf::from("testsub"));
    }

    #[test]
    fn fstree_path_of_toplevel_is_empty() {
        assert_eq!(btrfs_without_subvol_opts().fstree_path(), PathBuf::new());
    }

    fn btrfs_with_child_subvol_opts() -> BtrfsMountEntry {
        let mount: MountEntry = "/dev/vda /mnt btrfs rw,noatime,subvolid=257,subvol=/testsub 0 0"
            .parse()
            .unwrap();
        BtrfsMountEntry::try_from(mount).unwrap()
    }

    fn btrfs_without_subvol_opts() -> BtrfsMountEntry {
        let mount: MountEntry = "/dev/vda /mnt btrfs rw,noatime 0 0".parse().unwrap();
        BtrfsMountEntry::try_from(mount).unwrap()
    }

    #[test]
    fn store_lock_excludes_second_holder() {
        let dir = std::env::temp_dir().join("btrsink-lock-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lock");
        let held = StoreLock::acquire(&path).unwrap();
        assert!(StoreLock::acquire(&path).is_err());
        drop(held);
        assert!(StoreLock::acquire(&path).is_ok());
    }
}
