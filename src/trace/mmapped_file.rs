use crate::{
    remote_ptr::{RemotePtr, Void},
    trace::{
        codec::{invalid_data, Decoder, Encoder},
        substream_writer::nix_to_io,
        trace_frame::FrameTime,
    },
};
use libc::pid_t;
use nix::sys::stat::stat;
use std::{
    ffi::{OsStr, OsString},
    fmt::{self, Display, Formatter},
    io,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::Path,
};

/// Longest file name a mapping record can carry.
pub const PATH_MAX: usize = libc::PATH_MAX as usize;

/// A file name of at most `PATH_MAX` bytes.
#[derive(Clone, Default, Eq, PartialEq, Hash, Debug)]
pub struct BoundedPath(OsString);

impl BoundedPath {
    pub fn new<S: AsRef<OsStr>>(name: S) -> io::Result<BoundedPath> {
        let name = name.as_ref();
        if name.len() > PATH_MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file name of {} bytes exceeds PATH_MAX", name.len()),
            ));
        }
        Ok(BoundedPath(name.to_os_string()))
    }

    pub fn as_os_str(&self) -> &OsStr {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The parts of `struct stat` replay needs to check that a backing file is
/// still the one that was mapped.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub mtime: i64,
}

impl FileStat {
    pub fn from_path(path: &Path) -> io::Result<FileStat> {
        let st = stat(path).map_err(nix_to_io)?;
        Ok(FileStat::from(&st))
    }
}

impl From<&libc::stat> for FileStat {
    fn from(st: &libc::stat) -> Self {
        FileStat {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            size: st.st_size as i64,
            mtime: st.st_mtime as i64,
        }
    }
}

/// One memory mapping made by the traced process.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct MmappedFile {
    /// Global time of the mapping. Stamped by the TraceWriter.
    pub time: FrameTime,
    pub tid: pid_t,
    /// Whether the contents of `[start, end)` were saved as a raw data
    /// record at the same global time.
    pub copied: bool,
    /// May be a synthetic name like `[heap]` for anonymous mappings.
    pub filename: BoundedPath,
    pub stat: FileStat,
    pub start: RemotePtr<Void>,
    pub end: RemotePtr<Void>,
}

impl MmappedFile {
    pub fn size(&self) -> usize {
        self.end.as_usize().saturating_sub(self.start.as_usize())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::with_capacity(64 + self.filename.len());
        e.put_u64(self.time)
            .put_i32(self.tid)
            .put_u8(self.copied as u8)
            .put_bytes(self.filename.as_bytes())
            .put_u64(self.stat.dev)
            .put_u64(self.stat.ino)
            .put_u32(self.stat.mode)
            .put_u32(self.stat.uid)
            .put_u32(self.stat.gid)
            .put_i64(self.stat.size)
            .put_i64(self.stat.mtime)
            .put_u64(self.start.as_usize() as u64)
            .put_u64(self.end.as_usize() as u64);
        e.into_inner()
    }

    pub fn decode(data: &[u8]) -> io::Result<MmappedFile> {
        let mut d = Decoder::new(data);
        let time = d.get_u64()?;
        let tid = d.get_i32()?;
        let copied = match d.get_u8()? {
            0 => false,
            1 => true,
            v => return Err(invalid_data(format!("bad copied flag {} in mapping record", v))),
        };
        let filename = BoundedPath::new(OsString::from_vec(d.get_bytes()?.to_vec()))
            .map_err(|e| invalid_data(e.to_string()))?;
        let stat = FileStat {
            dev: d.get_u64()?,
            ino: d.get_u64()?,
            mode: d.get_u32()?,
            uid: d.get_u32()?,
            gid: d.get_u32()?,
            size: d.get_i64()?,
            mtime: d.get_i64()?,
        };
        let start = RemotePtr::from(d.get_u64()?);
        let end = RemotePtr::from(d.get_u64()?);
        d.finish()?;
        if start >= end {
            return Err(invalid_data(format!(
                "mapping record at time {} has start {} >= end {}",
                time, start, end
            )));
        }
        Ok(MmappedFile {
            time,
            tid,
            copied,
            filename,
            stat,
            start,
            end,
        })
    }
}

impl Display for MmappedFile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ global_time:{}, tid:{}, start:{}, end:{}, filename:`{}', copied:{} }}",
            self.time,
            self.tid,
            self.start,
            self.end,
            self.filename.as_os_str().to_string_lossy(),
            self.copied
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_max_is_enforced() {
        assert!(BoundedPath::new("x".repeat(PATH_MAX)).is_ok());
        assert!(BoundedPath::new("x".repeat(PATH_MAX + 1)).is_err());
    }

    #[test]
    fn stat_of_real_file() {
        let st = FileStat::from_path(Path::new("/")).unwrap();
        assert_eq!(libc::S_IFDIR, st.mode & libc::S_IFMT);
        assert!(FileStat::from_path(Path::new("/does/not/exist")).is_err());
    }

    #[test]
    fn record_keeps_every_field() {
        let m = MmappedFile {
            time: 12,
            tid: 100,
            copied: true,
            filename: BoundedPath::new("/lib/x86_64-linux-gnu/libc.so.6").unwrap(),
            stat: FileStat {
                dev: 2049,
                ino: 393_220,
                mode: 0o100_644,
                uid: 0,
                gid: 0,
                size: 2_029_592,
                mtime: 1_600_000_000,
            },
            start: RemotePtr::from(0x7f00_0000_0000u64),
            end: RemotePtr::from(0x7f00_0000_2000u64),
        };
        assert_eq!(0x2000, m.size());
        assert_eq!(m, MmappedFile::decode(&m.encode()).unwrap());
        assert!(m.to_string().contains("filename:`/lib/x86_64-linux-gnu/libc.so.6'"));
    }

    #[test]
    fn empty_region_is_rejected() {
        let m = MmappedFile {
            start: RemotePtr::from(0x1000u64),
            end: RemotePtr::from(0x1000u64),
            ..Default::default()
        };
        assert!(MmappedFile::decode(&m.encode()).is_err());
    }
}
