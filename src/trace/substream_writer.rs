use crate::{log::LogLevel::LogError, trace::codec::invalid_data};
use nix::unistd::fsync;
use std::{
    convert::TryFrom,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Sync {
    DontSync,
    Sync,
}

/// Size of the length prefix and the checksum trailer around every record.
pub const RECORD_OVERHEAD: usize = 8;

/// SubstreamWriter creates an output file and appends framed records to it.
///
/// Each record is written as its payload length (u32 LE), the payload, and the
/// CRC-32 of the payload (u32 LE). Writes are buffered; nothing is durable
/// until `flush(Sync::Sync)` or `close(Sync::Sync)`.
pub struct SubstreamWriter {
    path: PathBuf,
    /// `None` once closed.
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
    records_written: u64,
    error: bool,
}

impl Drop for SubstreamWriter {
    fn drop(&mut self) {
        if self.close(Sync::DontSync).is_err() {
            log!(LogError, "Error closing {:?}", self.path);
        }
    }
}

impl SubstreamWriter {
    /// Fails if `path` already exists: trace files are never reused.
    pub fn new(path: &Path) -> io::Result<SubstreamWriter> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o400)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;
        Ok(SubstreamWriter {
            path: path.to_owned(),
            writer: Some(BufWriter::new(file)),
            bytes_written: 0,
            records_written: 0,
            error: false,
        })
    }

    pub fn good(&self) -> bool {
        !self.error
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn write_record(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| invalid_data(format!("record of {} bytes is too large", payload.len())))?;
        let res = self.write_framed(len, payload);
        if res.is_err() {
            self.error = true;
        }
        res
    }

    fn write_framed(&mut self, len: u32, payload: &[u8]) -> io::Result<()> {
        let w = match self.writer.as_mut() {
            Some(w) => w,
            None => return Err(closed_error(&self.path)),
        };
        w.write_all(&len.to_le_bytes())?;
        w.write_all(payload)?;
        w.write_all(&crc32fast::hash(payload).to_le_bytes())?;
        self.bytes_written += (payload.len() + RECORD_OVERHEAD) as u64;
        self.records_written += 1;
        Ok(())
    }

    pub fn flush(&mut self, sync: Sync) -> io::Result<()> {
        let w = match self.writer.as_mut() {
            Some(w) => w,
            None => return Ok(()),
        };
        w.flush()?;
        if sync == Sync::Sync {
            fsync(w.get_ref().as_raw_fd()).map_err(nix_to_io)?;
        }
        Ok(())
    }

    /// Idempotent.
    pub fn close(&mut self, sync: Sync) -> io::Result<()> {
        let res = self.flush(sync);
        if res.is_err() {
            self.error = true;
        }
        self.writer = None;
        res
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

/// A single framed record as a byte vector, for files that hold one record
/// after some other content.
pub fn encode_framed(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + RECORD_OVERHEAD);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    out
}

fn closed_error(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("write to closed trace file {:?}", path),
    )
}

pub fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}
