//! The FUSE adapter: translates kernel upcalls one-to-one into storage
//! operations.
//!
//! The engine addresses everything by absolute path, while FUSE speaks
//! inode numbers, so the adapter keeps an ino→path table fed by
//! `lookup` and kept current across `rename` and `unlink`. FUSE
//! reserves ino 0 and roots the tree at 1; the engine roots at 0, so
//! adapter ino = engine inum + 1 throughout.

use std::{
    collections::HashMap,
    ffi::OsStr,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use log::{debug, warn};
use pagefs_storage::{Metadata, Storage};
use pagefs_types::{MODE_DIR, MODE_SYMLINK, MODE_TYPE_MASK, PAGE_SIZE};

const TTL: Duration = Duration::from_secs(1);

pub struct PageFs {
    store: Storage,
    paths: HashMap<u64, String>,
}

fn timestamp(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

fn kind_of(mode: u32) -> FileType {
    match mode & MODE_TYPE_MASK {
        MODE_DIR => FileType::Directory,
        MODE_SYMLINK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn time_or_now(t: TimeOrNow) -> i64 {
    let at = match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    };
    at.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64)
}

impl PageFs {
    pub fn new(store: Storage) -> Self {
        let mut paths = HashMap::new();
        paths.insert(1, "/".to_owned());
        Self { store, paths }
    }

    fn attr(&self, req: &Request<'_>, meta: &Metadata) -> FileAttr {
        FileAttr {
            ino: meta.ino + 1,
            size: meta.size,
            blocks: meta.size.div_ceil(512),
            atime: timestamp(meta.atime),
            mtime: timestamp(meta.mtime),
            ctime: timestamp(meta.mtime),
            crtime: UNIX_EPOCH,
            kind: kind_of(meta.mode),
            perm: (meta.mode & 0o7777) as u16,
            nlink: meta.nlink,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: PAGE_SIZE as u32,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let dir = self.paths.get(&parent)?;
        let name = name.to_str()?;
        Some(if dir == "/" {
            format!("/{name}")
        } else {
            format!("{dir}/{name}")
        })
    }

    /// Stats `path` and answers the entry reply, recording the ino→path
    /// mapping on the way out.
    fn reply_entry(&mut self, req: &Request<'_>, path: &str, reply: ReplyEntry) {
        match self.store.stat(path) {
            Ok(meta) => {
                let attr = self.attr(req, &meta);
                self.paths.insert(attr.ino, path.to_owned());
                reply.entry(&TTL, &attr, 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }
}

impl Filesystem for PageFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("lookup({path:?})");
        self.reply_entry(req, &path, reply);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.store.stat(&path) {
            Ok(meta) => {
                debug!("getattr({path:?}) -> mode {:o}, size {}", meta.mode, meta.size);
                reply.attr(&TTL, &self.attr(req, &meta));
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("setattr({path:?}, mode {mode:?}, size {size:?})");

        if let Some(mode) = mode {
            if let Err(err) = self.store.chmod(&path, mode) {
                reply.error(err.errno());
                return;
            }
        }
        if let Some(size) = size {
            if let Err(err) = self.store.truncate(&path, size) {
                reply.error(err.errno());
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let old = match self.store.stat(&path) {
                Ok(meta) => meta,
                Err(err) => {
                    reply.error(err.errno());
                    return;
                }
            };
            let ts = [
                atime.map_or(old.atime, time_or_now),
                mtime.map_or(old.mtime, time_or_now),
            ];
            if let Err(err) = self.store.set_times(&path, ts) {
                reply.error(err.errno());
                return;
            }
        }

        match self.store.stat(&path) {
            Ok(meta) => reply.attr(&TTL, &self.attr(req, &meta)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("mknod({path:?}, {mode:o})");
        match self.store.mknod(&path, mode) {
            Ok(()) => self.reply_entry(req, &path, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("mkdir({path:?}, {mode:o})");
        match self.store.mknod(&path, mode | MODE_DIR) {
            Ok(()) => self.reply_entry(req, &path, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("unlink({path:?})");
        let ino = self.store.stat(&path).map(|meta| meta.ino + 1);
        match self.store.unlink(&path) {
            Ok(()) => {
                if let Ok(ino) = ino {
                    self.paths.remove(&ino);
                }
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.unlink(req, parent, name, reply);
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let (Some(path), Some(target)) = (self.child_path(parent, name), link.to_str()) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("symlink({target:?}, {path:?})");
        match self.store.symlink(target, &path) {
            Ok(()) => self.reply_entry(req, &path, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let size = match self.store.stat(&path) {
            Ok(meta) => meta.size as usize,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        let mut buf = vec![0u8; size];
        match self.store.read(&path, &mut buf, 0) {
            Ok(n) => {
                // The stored target carries its NUL terminator.
                let target = buf[..n].strip_suffix(&[0]).unwrap_or(&buf[..n]);
                debug!("readlink({path:?}) -> {target:?}");
                reply.data(target);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(from), Some(to)) = (self.path_of(ino), self.child_path(newparent, newname))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("link({from:?} => {to:?})");
        match self.store.link(&from, &to) {
            Ok(()) => self.reply_entry(req, &to, reply),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("rename({from:?} => {to:?})");
        match self.store.rename(&from, &to) {
            Ok(()) => {
                // Keep the ino table pointing at the moved subtree.
                let prefix = format!("{from}/");
                for path in self.paths.values_mut() {
                    if *path == from {
                        path.clone_from(&to);
                    } else if let Some(moved) =
                        path.strip_prefix(&prefix).map(|rest| format!("{to}/{rest}"))
                    {
                        *path = moved;
                    }
                }
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // The engine keeps no per-open state.
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let mut buf = vec![0u8; size as usize];
        match self.store.read(&path, &mut buf, offset as u64) {
            Ok(n) => {
                debug!("read({path:?}, {size} bytes @+{offset}) -> {n}");
                reply.data(&buf[..n]);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.store.write(&path, data, offset as u64) {
            Ok(n) => {
                debug!("write({path:?}, {} bytes @+{offset}) -> {n}", data.len());
                reply.written(n as u32);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!("readdir({path:?}, @+{offset})");

        // `.` and `..` are not stored; the adapter synthesizes them.
        let parent_ino = match self.store.stat(parent_of(&path)) {
            Ok(meta) => meta.ino + 1,
            Err(_) => ino,
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_owned()),
            (parent_ino, FileType::Directory, "..".to_owned()),
        ];
        let names = match self.store.list(&path) {
            Ok(names) => names,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        for name in names {
            match self.store.stat(&join(&path, &name)) {
                Ok(meta) => entries.push((meta.ino + 1, kind_of(meta.mode), name)),
                Err(err) => warn!("readdir({path:?}): skipping {name:?}: {err}"),
            }
        }

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.store.stat(&path) {
            // Everyone is the owner: check the owner permission bits.
            Ok(meta) if mask == libc::F_OK || ((meta.mode >> 6) as i32 & mask) == mask => {
                reply.ok();
            }
            Ok(_) => reply.error(libc::EACCES),
            Err(err) => reply.error(err.errno()),
        }
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}
