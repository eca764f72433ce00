//! Thin safe wrappers over the system calls the engine needs and std does
//! not expose on raw descriptors: `openat`, `fstat`, directory reading via
//! `fdopendir`, and socket send-queue queries.

use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use libc::c_int;

use crate::dep_list::{DirEntry, FileKind};

/// The subset of `struct stat` the engine and the polling backend look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub kind: FileKind,
    pub nlink: u64,
    pub size: i64,
    pub mtime: (i64, i64),
    pub ctime: (i64, i64),
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    fn from_raw(st: &libc::stat) -> Self {
        let fmt = st.st_mode & libc::S_IFMT;
        let kind = if fmt == libc::S_IFDIR {
            FileKind::Directory
        } else if fmt == libc::S_IFREG {
            FileKind::Regular
        } else {
            FileKind::Other
        };
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            kind,
            nlink: st.st_nlink as u64,
            size: st.st_size as i64,
            mtime: (st.st_mtime as i64, st.st_mtime_nsec as i64),
            ctime: (st.st_ctime as i64, st.st_ctime_nsec as i64),
            mode: st.st_mode as u32,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
        }
    }
}

// Linux has no vnode notes; an O_PATH handle is enough to fstat and never
// blocks on FIFOs or devices.
#[cfg(any(target_os = "linux", target_os = "android"))]
const WATCH_OPEN_FLAGS: c_int = libc::O_PATH;
#[cfg(any(target_os = "macos", target_os = "ios"))]
const WATCH_OPEN_FLAGS: c_int = libc::O_EVTONLY;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
const WATCH_OPEN_FLAGS: c_int = libc::O_RDONLY | libc::O_NONBLOCK;

fn to_cstring(path: &OsStr) -> io::Result<CString> {
    CString::new(path.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Open `path` (relative to `dir`, or to the cwd) for watching.
pub fn open_watch(dir: Option<BorrowedFd<'_>>, path: &OsStr, follow: bool) -> io::Result<OwnedFd> {
    let c_path = to_cstring(path)?;
    let mut flags = WATCH_OPEN_FLAGS | libc::O_CLOEXEC;
    if !follow {
        flags |= libc::O_NOFOLLOW;
    }
    let dirfd = dir.map_or(libc::AT_FDCWD, |d| d.as_raw_fd());

    loop {
        // SAFETY: c_path is NUL-terminated and outlives the call.
        match cvt(unsafe { libc::openat(dirfd, c_path.as_ptr(), flags) }) {
            // SAFETY: openat returned a fresh descriptor we now own.
            Ok(fd) => return Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

pub fn fstat(fd: BorrowedFd<'_>) -> io::Result<FileStat> {
    fstat_raw(fd.as_raw_fd())
}

/// `fstat` on a descriptor owned elsewhere; used by the polling backend,
/// which only sees descriptors between `register` and `deregister`.
pub(crate) fn fstat_raw(fd: RawFd) -> io::Result<FileStat> {
    // SAFETY: stat is plain old data, fstat fills it.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    cvt(unsafe { libc::fstat(fd, &mut st) })?;
    Ok(FileStat::from_raw(&st))
}

struct DirStream(*mut libc::DIR);

impl Drop for DirStream {
    fn drop(&mut self) {
        // SAFETY: the stream came from fdopendir and is closed once.
        unsafe { libc::closedir(self.0) };
    }
}

#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn dirent_ino(ent: &libc::dirent) -> u64 {
    ent.d_fileno as u64
}

#[cfg(not(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn dirent_ino(ent: &libc::dirent) -> u64 {
    ent.d_ino as u64
}

fn dirent_kind(d_type: u8) -> FileKind {
    match d_type {
        libc::DT_DIR => FileKind::Directory,
        libc::DT_REG => FileKind::Regular,
        libc::DT_UNKNOWN => FileKind::Unknown,
        _ => FileKind::Other,
    }
}

/// Read the entries of the directory open on `dir`, skipping `.` and `..`.
///
/// A directory unlinked under us reads as empty.
pub fn read_dir(dir: BorrowedFd<'_>) -> io::Result<Vec<DirEntry>> {
    let dot = b".\0";
    // A fresh descriptor gives the stream its own offset.
    let fd = match cvt(unsafe {
        libc::openat(
            dir.as_raw_fd(),
            dot.as_ptr().cast(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    }) {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    // SAFETY: fd is valid; on success the stream owns it.
    let stream = unsafe { libc::fdopendir(fd) };
    if stream.is_null() {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    let stream = DirStream(stream);

    let mut entries = Vec::new();
    loop {
        // SAFETY: the stream is open; the returned entry stays valid until
        // the next readdir call, and we copy out of it before that.
        let ent = unsafe { libc::readdir(stream.0) };
        if ent.is_null() {
            break;
        }
        let ent = unsafe { &*ent };
        let name = unsafe { CStr::from_ptr(ent.d_name.as_ptr()) }.to_bytes();
        if name == b"." || name == b".." {
            continue;
        }
        entries.push(DirEntry::new(
            OsStr::from_bytes(name),
            dirent_ino(ent),
            dirent_kind(ent.d_type),
        ));
    }
    Ok(entries)
}

/// Set or clear `FD_CLOEXEC`.
pub fn set_cloexec(fd: BorrowedFd<'_>, on: bool) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = cvt(unsafe { libc::fcntl(raw, libc::F_GETFD) })?;
    let next = if on {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if next != flags {
        cvt(unsafe { libc::fcntl(raw, libc::F_SETFD, next) })?;
    }
    Ok(())
}

fn getsockopt_int(sock: RawFd, level: c_int, name: c_int) -> io::Result<c_int> {
    let mut value: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as libc::socklen_t;
    cvt(unsafe { libc::getsockopt(sock, level, name, (&mut value as *mut c_int).cast(), &mut len) })?;
    Ok(value)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn queued_bytes(sock: RawFd) -> io::Result<usize> {
    let mut queued: c_int = 0;
    cvt(unsafe { libc::ioctl(sock, libc::TIOCOUTQ, &mut queued) })?;
    Ok(queued.max(0) as usize)
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn queued_bytes(sock: RawFd) -> io::Result<usize> {
    Ok(getsockopt_int(sock, libc::SOL_SOCKET, libc::SO_NWRITE)?.max(0) as usize)
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
fn queued_bytes(_sock: RawFd) -> io::Result<usize> {
    Ok(0)
}

/// Bytes that can be written to `sock` right now without blocking.
pub fn send_space(sock: BorrowedFd<'_>) -> io::Result<usize> {
    let fd = sock.as_raw_fd();
    let sndbuf = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF)?.max(0) as usize;
    Ok(sndbuf.saturating_sub(queued_bytes(fd)?))
}
