//! XFS backend for [`FsOps`], driving the kernel through ioctls on a mounted filesystem.
//!
//! Structures mirror the kernel UAPI layouts (`linux/fsmap.h`, `linux/fs.h`,
//! `xfs_fs.h`). Variable-length ioctl arguments are built in 8-byte aligned word
//! buffers: a fixed header followed by `count` records.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::ptr;

use tracing::{debug, info, trace};

use crate::error::errno;
use crate::fsops::FsOps;
use crate::geometry::Geometry;
use crate::records::{
    BmapFork, BmapRecord, BmapRequest, BmapState, DedupeOutcome, FileStat, Freshness,
    FsmapRecord, RefcountRecord, ScrubKind, ScrubOutcome,
};

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u8, nr: u8, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | ((ty as u64) << 8) | nr as u64
}

const fn iow<T>(ty: u8, nr: u8) -> u64 {
    ioc(IOC_WRITE, ty, nr, size_of::<T>())
}

const fn ior<T>(ty: u8, nr: u8) -> u64 {
    ioc(IOC_READ, ty, nr, size_of::<T>())
}

const fn iowr<T>(ty: u8, nr: u8) -> u64 {
    ioc(IOC_READ | IOC_WRITE, ty, nr, size_of::<T>())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawFsmap {
    device: u32,
    flags: u32,
    physical: u64,
    owner: u64,
    offset: u64,
    length: u64,
    reserved: [u64; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawFsmapHead {
    iflags: u32,
    oflags: u32,
    count: u32,
    entries: u32,
    reserved: [u64; 6],
    keys: [RawFsmap; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawFsrefs {
    device: u32,
    flags: u32,
    physical: u64,
    owners: u64,
    length: u64,
    reserved: [u64; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawFsrefsHead {
    iflags: u32,
    oflags: u32,
    count: u32,
    entries: u32,
    reserved: [u64; 6],
    keys: [RawFsrefs; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawGetbmap {
    offset: i64,
    block: i64,
    length: i64,
    count: i32,
    entries: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawGetbmapx {
    offset: i64,
    block: i64,
    length: i64,
    count: i32,
    entries: i32,
    iflags: i32,
    oflags: i32,
    unused: [i32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawCloneRange {
    src_fd: i64,
    src_offset: u64,
    src_length: u64,
    dest_offset: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawDedupeHead {
    src_offset: u64,
    src_length: u64,
    dest_count: u16,
    reserved1: u16,
    reserved2: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawDedupeInfo {
    dest_fd: i64,
    dest_offset: u64,
    bytes_deduped: u64,
    status: i32,
    reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawExchangeRange {
    file1_fd: i32,
    pad: u32,
    file1_offset: u64,
    file2_offset: u64,
    length: u64,
    flags: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawCommitRange {
    file1_fd: i32,
    pad: u32,
    file1_offset: u64,
    file2_offset: u64,
    length: u64,
    flags: u64,
    file2_freshness: [u64; 6],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawMapFreesp {
    offset: i64,
    len: i64,
    pad: [i64; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawScrubMetadata {
    kind: u32,
    flags: u32,
    ino: u64,
    gen: u32,
    agno: u32,
    reserved: [u64; 5],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawFsopGeom {
    blocksize: u32,
    rtextsize: u32,
    agblocks: u32,
    agcount: u32,
    logblocks: u32,
    sectsize: u32,
    inodesize: u32,
    imaxpct: u32,
    datablocks: u64,
    rtblocks: u64,
    rtextents: u64,
    logstart: u64,
    uuid: [u8; 16],
    sunit: u32,
    swidth: u32,
    version: i32,
    flags: u32,
    logsectsize: u32,
    rtsectsize: u32,
    dirblocksize: u32,
    logsunit: u32,
    sick: u32,
    checked: u32,
    reserved: [u64; 17],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawEofblocks {
    version: u32,
    flags: u32,
    uid: u32,
    gid: u32,
    prid: u32,
    pad32: u32,
    min_file_size: u64,
    pad64: [u64; 12],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawBulkIreq {
    ino: u64,
    flags: u32,
    icount: u32,
    ocount: u32,
    agno: u32,
    reserved: [u64; 5],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawBulkstat {
    ino: u64,
    size: u64,
    blocks: u64,
    xflags: u64,
    atime: i64,
    mtime: i64,
    ctime: i64,
    btime: i64,
    gen: u32,
    rest: [u32; 31],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawFsxattr {
    xflags: u32,
    extsize: u32,
    nextents: u32,
    projid: u32,
    cowextsize: u32,
    pad: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawXfsHandle {
    handle_bytes: u32,
    handle_type: i32,
    ino: [u32; 2],
    gen: u32,
}

const FS_IOC_GETFSMAP: u64 = iowr::<RawFsmapHead>(b'X', 59);
const XFS_IOC_GETFSREFCOUNTS: u64 = iowr::<RawFsrefsHead>(b'X', 66);
const XFS_IOC_GETBMAPX: u64 = iowr::<RawGetbmap>(b'X', 56);
const FICLONERANGE: u64 = iow::<RawCloneRange>(0x94, 13);
const FIDEDUPERANGE: u64 = iowr::<RawDedupeHead>(0x94, 54);
const XFS_IOC_EXCHANGE_RANGE: u64 = iow::<RawExchangeRange>(b'X', 129);
const XFS_IOC_START_COMMIT: u64 = ior::<RawCommitRange>(b'X', 130);
const XFS_IOC_COMMIT_RANGE: u64 = iow::<RawCommitRange>(b'X', 131);
const XFS_IOC_MAP_FREESP: u64 = iow::<RawMapFreesp>(b'X', 64);
const XFS_IOC_SCRUB_METADATA: u64 = iowr::<RawScrubMetadata>(b'X', 60);
const XFS_IOC_FSGEOMETRY: u64 = ior::<RawFsopGeom>(b'X', 126);
const XFS_IOC_FREE_EOFBLOCKS: u64 = ior::<RawEofblocks>(b'X', 58);
const XFS_IOC_BULKSTAT: u64 = ior::<RawBulkIreq>(b'X', 127);
const FS_IOC_FSGETXATTR: u64 = ior::<RawFsxattr>(b'X', 31);
const FS_IOC_FSSETXATTR: u64 = iow::<RawFsxattr>(b'X', 32);

const BBSHIFT: u32 = 9;

const BMV_IF_ATTRFORK: i32 = 0x1;
const BMV_IF_PREALLOC: i32 = 0x4;
const BMV_IF_DELALLOC: i32 = 0x8;
const BMV_IF_COWFORK: i32 = 0x20;
const BMV_OF_PREALLOC: i32 = 0x1;
const BMV_OF_LAST: i32 = 0x4;
const BMV_OF_SHARED: i32 = 0x8;

const FILE_DEDUPE_RANGE_SAME: i32 = 0;
const FILE_DEDUPE_RANGE_DIFFERS: i32 = 1;

const XFS_SCRUB_IFLAG_REPAIR: u32 = 1 << 0;
const XFS_SCRUB_OFLAG_CORRUPT: u32 = 1 << 1;
const XFS_SCRUB_OFLAG_XCORRUPT: u32 = 1 << 4;
const XFS_SCRUB_OFLAG_INCOMPLETE: u32 = 1 << 5;
const XFS_SCRUB_IFLAG_FORCE_REBUILD: u32 = 1 << 8;

const XFS_FSOP_GEOM_FLAGS_RMAPBT: u32 = 1 << 19;
const XFS_FSOP_GEOM_FLAGS_REFLINK: u32 = 1 << 20;

const XFS_EOFBLOCKS_VERSION: u32 = 1;
const XFS_EOF_FLAGS_SYNC: u32 = 1 << 0;

const FS_XFLAG_REALTIME: u32 = 0x1;

/// `FILEID_INO32_GEN` with the XFS 64-bit inode flag.
const XFS_FILEID_INO64_GEN: i32 = 0x81;

fn ioctl<T>(fd: RawFd, request: u64, arg: *mut T) -> io::Result<()> {
    // SAFETY: every caller passes a pointer to a live, correctly sized argument for
    // `request`, and the kernel does not retain it past the call.
    let ret = unsafe { libc::ioctl(fd, request as _, arg) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Header followed by `cap` records in one 8-byte aligned allocation.
struct IoctlBuf<H, R> {
    words: Vec<u64>,
    cap: usize,
    _layout: PhantomData<(H, R)>,
}

impl<H: Copy, R: Copy> IoctlBuf<H, R> {
    fn new(head: H, cap: usize) -> Self {
        let bytes = size_of::<H>() + cap * size_of::<R>();
        let mut buf = Self {
            words: vec![0u64; bytes.div_ceil(8)],
            cap,
            _layout: PhantomData,
        };
        // SAFETY: the buffer is at least size_of::<H>() bytes and 8-byte aligned, which
        // satisfies the alignment of every header type used here.
        unsafe { ptr::write(buf.words.as_mut_ptr() as *mut H, head) };
        buf
    }

    fn head(&self) -> H {
        // SAFETY: written in `new`, possibly updated by the kernel in place.
        unsafe { ptr::read(self.words.as_ptr() as *const H) }
    }

    fn rec(&self, idx: usize) -> Option<R> {
        if idx >= self.cap {
            return None;
        }
        // SAFETY: idx < cap keeps the read inside the allocation; headers are a multiple
        // of 8 bytes so records stay aligned.
        unsafe {
            let base = (self.words.as_ptr() as *const u8).add(size_of::<H>()) as *const R;
            Some(ptr::read(base.add(idx)))
        }
    }

    fn set_rec(&mut self, idx: usize, rec: R) {
        if idx < self.cap {
            // SAFETY: as in `rec`.
            unsafe {
                let base = (self.words.as_mut_ptr() as *mut u8).add(size_of::<H>()) as *mut R;
                ptr::write(base.add(idx), rec);
            }
        }
    }

    fn as_mut_ptr(&mut self) -> *mut H {
        self.words.as_mut_ptr() as *mut H
    }
}

fn new_encode_dev(dev: u64) -> u32 {
    let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0xfff);
    let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0xff);
    ((minor & 0xff) | (major << 8) | ((minor & !0xff) << 12)) as u32
}

fn raw_fsmap(rec: &FsmapRecord) -> RawFsmap {
    RawFsmap {
        device: rec.device,
        flags: rec.flags,
        physical: rec.physical,
        owner: rec.owner,
        offset: rec.offset,
        length: rec.length,
        reserved: [0; 3],
    }
}

fn raw_fsrefs(rec: &RefcountRecord) -> RawFsrefs {
    RawFsrefs {
        device: rec.device,
        flags: rec.flags,
        physical: rec.physical,
        owners: rec.owners,
        length: rec.length,
        reserved: [0; 4],
    }
}

/// Open file on an XFS mount.
#[derive(Debug)]
pub struct XfsFile {
    file: File,
}

impl XfsFile {
    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// A mounted XFS filesystem.
#[derive(Debug)]
pub struct XfsFs {
    mount: File,
    path: PathBuf,
    geom: Geometry,
}

impl XfsFs {
    /// Opens the filesystem mounted at `path` and reads its geometry.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mount = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(path)?;
        let fd = mount.as_raw_fd();

        // SAFETY: all-zero is a valid bit pattern for this plain-integer struct.
        let mut raw: RawFsopGeom = unsafe { std::mem::zeroed() };
        ioctl(fd, XFS_IOC_FSGEOMETRY, &mut raw)?;

        let data_dev = new_encode_dev(mount.metadata()?.dev());
        let rt_dev = if raw.rtblocks > 0 {
            rt_device(path)?
        } else {
            None
        };
        let geom = Geometry {
            block_size: raw.blocksize as u64,
            ag_blocks: raw.agblocks as u64,
            ag_count: raw.agcount,
            data_blocks: raw.datablocks,
            rt_blocks: raw.rtblocks,
            rt_extent_blocks: (raw.rtextsize as u64 / raw.blocksize.max(1) as u64).max(1),
            data_dev,
            rt_dev,
            reflink: raw.flags & XFS_FSOP_GEOM_FLAGS_REFLINK != 0,
            rmapbt: raw.flags & XFS_FSOP_GEOM_FLAGS_RMAPBT != 0,
        };
        info!(
            "opened {}: bs={} agcount={} reflink={} rmapbt={}",
            path.display(),
            geom.block_size,
            geom.ag_count,
            geom.reflink,
            geom.rmapbt
        );
        Ok(Self {
            mount,
            path: path.to_path_buf(),
            geom,
        })
    }

    /// Mount point this filesystem was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn inode_gen(&self, ino: u64) -> io::Result<u32> {
        let mut buf: IoctlBuf<RawBulkIreq, RawBulkstat> = IoctlBuf::new(
            RawBulkIreq {
                ino,
                icount: 1,
                ..Default::default()
            },
            1,
        );
        ioctl(self.mount.as_raw_fd(), XFS_IOC_BULKSTAT, buf.as_mut_ptr())?;
        match buf.rec(0) {
            Some(bs) if buf.head().ocount == 1 && bs.ino == ino => Ok(bs.gen),
            _ => Err(errno(libc::ENOENT)),
        }
    }
}

/// Finds the realtime device named by the `rtdev=` mount option of `path`.
fn rt_device(path: &Path) -> io::Result<Option<u32>> {
    let canon = path.canonicalize()?;
    let mounts = std::fs::read_to_string("/proc/self/mounts")?;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(dir), Some(_ty), Some(opts)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if Path::new(dir) != canon {
            continue;
        }
        if let Some(rtdev) = opts.split(',').find_map(|o| o.strip_prefix("rtdev=")) {
            let rdev = std::fs::metadata(rtdev)?.rdev();
            debug!("realtime device {} ({:#x})", rtdev, rdev);
            return Ok(Some(new_encode_dev(rdev)));
        }
    }
    Ok(None)
}

impl FsOps for XfsFs {
    type File = XfsFile;

    fn geometry(&self) -> io::Result<Geometry> {
        Ok(self.geom.clone())
    }

    fn create_temp_file(&self, realtime: bool) -> io::Result<XfsFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .mode(0o600)
            .custom_flags(libc::O_TMPFILE | libc::O_EXCL)
            .open(&self.path)?;
        let fd = file.as_raw_fd();
        let mut attr = RawFsxattr::default();
        ioctl(fd, FS_IOC_FSGETXATTR, &mut attr)?;
        if realtime {
            attr.xflags |= FS_XFLAG_REALTIME;
        } else {
            attr.xflags &= !FS_XFLAG_REALTIME;
        }
        ioctl(fd, FS_IOC_FSSETXATTR, &mut attr)?;
        trace!("created scratch file fd={} realtime={}", fd, realtime);
        Ok(XfsFile { file })
    }

    fn open_owner(&self, ino: u64) -> io::Result<XfsFile> {
        let gen = self.inode_gen(ino)?;
        let mut handle = RawXfsHandle {
            handle_bytes: 12,
            handle_type: XFS_FILEID_INO64_GEN,
            ino: [ino as u32, (ino >> 32) as u32],
            gen,
        };
        // SAFETY: `handle` is a valid struct file_handle with a 12-byte payload.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_open_by_handle_at,
                self.mount.as_raw_fd(),
                &mut handle as *mut RawXfsHandle,
                libc::O_RDWR | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the syscall returned a fresh descriptor we now own.
        let file = unsafe { File::from_raw_fd(fd as RawFd) };
        Ok(XfsFile { file })
    }

    fn stat(&self, file: &XfsFile) -> io::Result<FileStat> {
        let meta = file.file.metadata()?;
        Ok(FileStat {
            ino: meta.ino(),
            size: meta.size(),
            allocated: meta.blocks() << BBSHIFT,
        })
    }

    fn getfsmap(&self, keys: &[FsmapRecord; 2], max: usize) -> io::Result<Vec<FsmapRecord>> {
        let head = RawFsmapHead {
            count: max as u32,
            keys: [raw_fsmap(&keys[0]), raw_fsmap(&keys[1])],
            ..Default::default()
        };
        let mut buf: IoctlBuf<RawFsmapHead, RawFsmap> = IoctlBuf::new(head, max);
        ioctl(self.mount.as_raw_fd(), FS_IOC_GETFSMAP, buf.as_mut_ptr())?;
        let entries = buf.head().entries as usize;
        Ok((0..entries)
            .filter_map(|i| buf.rec(i))
            .map(|r| FsmapRecord {
                device: r.device,
                flags: r.flags,
                physical: r.physical,
                owner: r.owner,
                offset: r.offset,
                length: r.length,
            })
            .collect())
    }

    fn getfsrefs(
        &self,
        keys: &[RefcountRecord; 2],
        max: usize,
    ) -> io::Result<Vec<RefcountRecord>> {
        let head = RawFsrefsHead {
            count: max as u32,
            keys: [raw_fsrefs(&keys[0]), raw_fsrefs(&keys[1])],
            ..Default::default()
        };
        let mut buf: IoctlBuf<RawFsrefsHead, RawFsrefs> = IoctlBuf::new(head, max);
        ioctl(self.mount.as_raw_fd(), XFS_IOC_GETFSREFCOUNTS, buf.as_mut_ptr())?;
        let entries = buf.head().entries as usize;
        Ok((0..entries)
            .filter_map(|i| buf.rec(i))
            .map(|r| RefcountRecord {
                device: r.device,
                flags: r.flags,
                physical: r.physical,
                owners: r.owners,
                length: r.length,
            })
            .collect())
    }

    fn getbmapx(
        &self,
        file: &XfsFile,
        req: &BmapRequest,
        max: usize,
    ) -> io::Result<Vec<BmapRecord>> {
        let fork = match req.fork {
            BmapFork::Data => 0,
            BmapFork::Attr => BMV_IF_ATTRFORK,
            BmapFork::Cow => BMV_IF_COWFORK,
        };
        let head = RawGetbmapx {
            offset: (req.offset >> BBSHIFT) as i64,
            length: (req.length.div_ceil(1 << BBSHIFT)) as i64,
            count: (max + 1) as i32,
            iflags: fork | BMV_IF_PREALLOC | BMV_IF_DELALLOC,
            ..Default::default()
        };
        let mut buf: IoctlBuf<RawGetbmapx, RawGetbmapx> = IoctlBuf::new(head, max);
        ioctl(file.fd(), XFS_IOC_GETBMAPX, buf.as_mut_ptr())?;
        let entries = buf.head().entries.max(0) as usize;
        Ok((0..entries)
            .filter_map(|i| buf.rec(i))
            .map(|r| BmapRecord {
                offset: (r.offset as u64) << BBSHIFT,
                length: (r.length as u64) << BBSHIFT,
                state: match r.block {
                    -1 => BmapState::Hole,
                    -2 => BmapState::Delalloc,
                    b => BmapState::Mapped((b as u64) << BBSHIFT),
                },
                unwritten: r.oflags & BMV_OF_PREALLOC != 0,
                shared: r.oflags & BMV_OF_SHARED != 0,
                last: r.oflags & BMV_OF_LAST != 0,
            })
            .collect())
    }

    fn clone_range(
        &self,
        src: &XfsFile,
        src_off: u64,
        len: u64,
        dst: &XfsFile,
        dst_off: u64,
    ) -> io::Result<()> {
        let mut arg = RawCloneRange {
            src_fd: src.fd() as i64,
            src_offset: src_off,
            src_length: len,
            dest_offset: dst_off,
        };
        ioctl(dst.fd(), FICLONERANGE, &mut arg)
    }

    fn dedupe_range(
        &self,
        src: &XfsFile,
        src_off: u64,
        len: u64,
        dst: &XfsFile,
        dst_off: u64,
    ) -> io::Result<DedupeOutcome> {
        let head = RawDedupeHead {
            src_offset: src_off,
            src_length: len,
            dest_count: 1,
            ..Default::default()
        };
        let mut buf: IoctlBuf<RawDedupeHead, RawDedupeInfo> = IoctlBuf::new(head, 1);
        buf.set_rec(
            0,
            RawDedupeInfo {
                dest_fd: dst.fd() as i64,
                dest_offset: dst_off,
                ..Default::default()
            },
        );
        ioctl(src.fd(), FIDEDUPERANGE, buf.as_mut_ptr())?;
        let info = buf.rec(0).ok_or_else(|| errno(libc::EIO))?;
        match info.status {
            FILE_DEDUPE_RANGE_SAME => Ok(DedupeOutcome::Same(info.bytes_deduped)),
            FILE_DEDUPE_RANGE_DIFFERS => Ok(DedupeOutcome::Differs),
            code if code < 0 => Err(errno(-code)),
            _ => Err(errno(libc::EIO)),
        }
    }

    fn start_exchange(&self, file2: &XfsFile) -> io::Result<Freshness> {
        let mut arg = RawCommitRange::default();
        ioctl(file2.fd(), XFS_IOC_START_COMMIT, &mut arg)?;
        Ok(Freshness {
            raw: arg.file2_freshness,
        })
    }

    fn exchange_range(
        &self,
        file1: &XfsFile,
        off1: u64,
        file2: &XfsFile,
        off2: u64,
        len: u64,
        guard: Option<&Freshness>,
    ) -> io::Result<()> {
        match guard {
            Some(fresh) => {
                let mut arg = RawCommitRange {
                    file1_fd: file1.fd(),
                    file1_offset: off1,
                    file2_offset: off2,
                    length: len,
                    file2_freshness: fresh.raw,
                    ..Default::default()
                };
                ioctl(file2.fd(), XFS_IOC_COMMIT_RANGE, &mut arg)
            }
            None => {
                let mut arg = RawExchangeRange {
                    file1_fd: file1.fd(),
                    file1_offset: off1,
                    file2_offset: off2,
                    length: len,
                    ..Default::default()
                };
                ioctl(file2.fd(), XFS_IOC_EXCHANGE_RANGE, &mut arg)
            }
        }
    }

    fn map_free_space(&self, file: &XfsFile, physical: u64, len: u64) -> io::Result<()> {
        let mut arg = RawMapFreesp {
            offset: physical as i64,
            len: len as i64,
            pad: [0; 2],
        };
        ioctl(file.fd(), XFS_IOC_MAP_FREESP, &mut arg)
    }

    fn scrub_metadata(&self, agno: u32, kind: ScrubKind) -> io::Result<ScrubOutcome> {
        let mut arg = RawScrubMetadata {
            kind: kind.code(),
            flags: XFS_SCRUB_IFLAG_REPAIR | XFS_SCRUB_IFLAG_FORCE_REBUILD,
            agno,
            ..Default::default()
        };
        ioctl(self.mount.as_raw_fd(), XFS_IOC_SCRUB_METADATA, &mut arg)?;
        let bad = XFS_SCRUB_OFLAG_CORRUPT | XFS_SCRUB_OFLAG_XCORRUPT | XFS_SCRUB_OFLAG_INCOMPLETE;
        if arg.flags & bad != 0 {
            Ok(ScrubOutcome::NeedsRepair)
        } else {
            Ok(ScrubOutcome::Rebuilt)
        }
    }

    fn sync_fs(&self) -> io::Result<()> {
        // SAFETY: syncfs only reads the descriptor.
        if unsafe { libc::syncfs(self.mount.as_raw_fd()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn free_eofblocks(&self) -> io::Result<()> {
        let mut arg = RawEofblocks {
            version: XFS_EOFBLOCKS_VERSION,
            flags: XFS_EOF_FLAGS_SYNC,
            ..Default::default()
        };
        ioctl(self.mount.as_raw_fd(), XFS_IOC_FREE_EOFBLOCKS, &mut arg)
    }

    fn set_len(&self, file: &XfsFile, size: u64) -> io::Result<()> {
        file.file.set_len(size)
    }

    fn unshare_range(&self, file: &XfsFile, offset: u64, len: u64) -> io::Result<()> {
        fallocate(
            file,
            libc::FALLOC_FL_UNSHARE_RANGE | libc::FALLOC_FL_KEEP_SIZE,
            offset,
            len,
        )
    }

    fn preallocate(&self, file: &XfsFile, offset: u64, len: u64) -> io::Result<()> {
        fallocate(file, libc::FALLOC_FL_KEEP_SIZE, offset, len)
    }

    fn read_at(&self, file: &XfsFile, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        file.file.read_at(buf, offset)
    }

    fn write_at(&self, file: &XfsFile, buf: &[u8], offset: u64) -> io::Result<()> {
        file.file.write_all_at(buf, offset)
    }

    fn fsync(&self, file: &XfsFile) -> io::Result<()> {
        file.file.sync_all()
    }
}

fn fallocate(file: &XfsFile, mode: i32, offset: u64, len: u64) -> io::Result<()> {
    // SAFETY: fallocate only reads its integer arguments.
    let ret = unsafe {
        libc::fallocate(file.fd(), mode, offset as libc::off_t, len as libc::off_t)
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Returns whether `path` names a directory on an XFS mount.
pub fn is_xfs(path: &Path) -> bool {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: statfs writes into the zeroed struct we pass and reads the C string.
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statfs(cpath.as_ptr(), &mut st) };
    ret == 0 && st.f_type as u64 == 0x5846_5342
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layouts() {
        assert_eq!(size_of::<RawFsmap>(), 64);
        assert_eq!(size_of::<RawFsmapHead>(), 192);
        assert_eq!(size_of::<RawFsrefs>(), 64);
        assert_eq!(size_of::<RawFsrefsHead>(), 192);
        assert_eq!(size_of::<RawGetbmap>(), 32);
        assert_eq!(size_of::<RawGetbmapx>(), 48);
        assert_eq!(size_of::<RawCloneRange>(), 32);
        assert_eq!(size_of::<RawDedupeHead>(), 24);
        assert_eq!(size_of::<RawDedupeInfo>(), 32);
        assert_eq!(size_of::<RawExchangeRange>(), 40);
        assert_eq!(size_of::<RawCommitRange>(), 88);
        assert_eq!(size_of::<RawScrubMetadata>(), 64);
        assert_eq!(size_of::<RawFsopGeom>(), 256);
        assert_eq!(size_of::<RawEofblocks>(), 128);
        assert_eq!(size_of::<RawBulkIreq>(), 64);
        assert_eq!(size_of::<RawBulkstat>(), 192);
        assert_eq!(size_of::<RawFsxattr>(), 28);
    }

    #[test]
    fn test_ioctl_numbers() {
        assert_eq!(FICLONERANGE, 0x4020_940d);
        assert_eq!(FIDEDUPERANGE, 0xc018_9436);
        assert_eq!(FS_IOC_GETFSMAP, 0xc0c0_583b);
        assert_eq!(FS_IOC_FSGETXATTR, 0x801c_581f);
    }

    #[test]
    fn test_encode_dev() {
        // makedev(8, 3)
        assert_eq!(new_encode_dev((8 << 8) | 3), 0x803);
        // makedev(259, 1)
        assert_eq!(new_encode_dev((259 << 8) | 1), (259 << 8) | 1);
    }

    #[test]
    fn test_ioctl_buf_records() {
        let mut buf: IoctlBuf<RawDedupeHead, RawDedupeInfo> = IoctlBuf::new(
            RawDedupeHead {
                src_length: 4096,
                dest_count: 1,
                ..Default::default()
            },
            1,
        );
        buf.set_rec(
            0,
            RawDedupeInfo {
                dest_offset: 8192,
                ..Default::default()
            },
        );
        assert_eq!(buf.head().src_length, 4096);
        assert_eq!(buf.rec(0).map(|r| r.dest_offset), Some(8192));
        assert!(buf.rec(1).is_none());
    }
}
