use crate::trace::{
    codec::invalid_data,
    substream_writer::RECORD_OVERHEAD,
};
use std::{
    convert::TryInto,
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

/// Position in a substream. Obtained from `get_state()` and handed back to
/// `restore_state()` to undo reads, e.g. when peeking.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SubstreamReaderState {
    offset: u64,
}

/// SubstreamReader opens a file written by SubstreamWriter and reads the
/// framed records back in order, verifying each record's checksum.
pub struct SubstreamReader {
    path: PathBuf,
    reader: BufReader<File>,
    /// Offset of the next unread record.
    offset: u64,
    /// Trace files are immutable once we open them so this is fixed.
    file_size: u64,
}

impl SubstreamReader {
    pub fn open(path: &Path) -> io::Result<SubstreamReader> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(SubstreamReader {
            path: path.to_owned(),
            reader: BufReader::new(file),
            offset: 0,
            file_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn at_end(&self) -> bool {
        self.offset >= self.file_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Returns `None` at a clean end of file. A record cut short is an
    /// `UnexpectedEof` error and a checksum mismatch is `InvalidData`.
    pub fn read_record(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.at_end() {
            return Ok(None);
        }
        let len = self.read_len()?;
        self.check_in_bounds(len)?;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        self.check_crc(&payload)?;
        self.offset += (len + RECORD_OVERHEAD) as u64;
        Ok(Some(payload))
    }

    /// Like `read_record()` but the payload goes into `buf`, which must be
    /// exactly the length of the record. On a length mismatch nothing is
    /// consumed.
    pub fn read_record_into(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.at_end() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("no more records in {:?}", self.path),
            ));
        }
        let state = self.get_state();
        let len = self.read_len()?;
        if len != buf.len() {
            self.restore_state(state)?;
            return Err(invalid_data(format!(
                "record in {:?} is {} bytes, expected {}",
                self.path,
                len,
                buf.len()
            )));
        }
        self.reader.read_exact(buf)?;
        self.check_crc(buf)?;
        self.offset += (len + RECORD_OVERHEAD) as u64;
        Ok(())
    }

    /// Move past the next record without reading or verifying its payload.
    /// Returns the payload length.
    pub fn skip_record(&mut self) -> io::Result<usize> {
        let len = self.read_len()?;
        let end = self.check_in_bounds(len)?;
        self.reader.seek(SeekFrom::Start(end))?;
        self.offset = end;
        Ok(len)
    }

    pub fn get_state(&self) -> SubstreamReaderState {
        SubstreamReaderState {
            offset: self.offset,
        }
    }

    pub fn restore_state(&mut self, state: SubstreamReaderState) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(state.offset))?;
        self.offset = state.offset;
        Ok(())
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.restore_state(SubstreamReaderState { offset: 0 })
    }

    fn read_len(&mut self) -> io::Result<usize> {
        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes)?;
        Ok(u32::from_le_bytes(len_bytes) as usize)
    }

    /// The end offset of a record of `len` payload bytes starting at the
    /// current offset, or `UnexpectedEof` if the file is too short for it.
    fn check_in_bounds(&self, len: usize) -> io::Result<u64> {
        let end = self.offset + (len + RECORD_OVERHEAD) as u64;
        if end > self.file_size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("record at offset {} in {:?} is truncated", self.offset, self.path),
            ));
        }
        Ok(end)
    }

    fn check_crc(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut crc_bytes = [0u8; 4];
        self.reader.read_exact(&mut crc_bytes)?;
        if u32::from_le_bytes(crc_bytes) != crc32fast::hash(payload) {
            return Err(invalid_data(format!(
                "checksum mismatch in record at offset {} of {:?}",
                self.offset, self.path
            )));
        }
        Ok(())
    }
}

/// Unwrap a buffer that holds exactly one framed record.
pub fn decode_framed(data: &[u8]) -> io::Result<&[u8]> {
    if data.len() < RECORD_OVERHEAD {
        return Err(invalid_data("framed record too short"));
    }
    let len = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
    if data.len() != len + RECORD_OVERHEAD {
        return Err(invalid_data(format!(
            "framed record claims {} bytes but {} are present",
            len,
            data.len() - RECORD_OVERHEAD
        )));
    }
    let payload = &data[4..4 + len];
    let crc = u32::from_le_bytes(data[4 + len..].try_into().unwrap());
    if crc != crc32fast::hash(payload) {
        return Err(invalid_data("checksum mismatch in framed record"));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::substream_writer::{encode_framed, SubstreamWriter, Sync};
    use std::fs;
    use tempfile::TempDir;

    fn write_records(path: &Path, records: &[&[u8]]) {
        let mut w = SubstreamWriter::new(path).unwrap();
        for r in records {
            w.write_record(r).unwrap();
        }
        w.close(Sync::DontSync).unwrap();
    }

    #[test]
    fn records_come_back_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mmaps");
        write_records(&path, &[b"one", b"", b"three"]);

        let mut r = SubstreamReader::open(&path).unwrap();
        assert_eq!(Some(b"one".to_vec()), r.read_record().unwrap());
        assert_eq!(Some(Vec::new()), r.read_record().unwrap());
        assert_eq!(Some(b"three".to_vec()), r.read_record().unwrap());
        assert!(r.at_end());
        assert_eq!(None, r.read_record().unwrap());
    }

    #[test]
    fn restore_state_undoes_reads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        write_records(&path, &[b"abc", b"defg"]);

        let mut r = SubstreamReader::open(&path).unwrap();
        let state = r.get_state();
        assert_eq!(3, r.skip_record().unwrap());
        assert_eq!(Some(b"defg".to_vec()), r.read_record().unwrap());
        r.restore_state(state).unwrap();
        assert_eq!(Some(b"abc".to_vec()), r.read_record().unwrap());
        r.rewind().unwrap();
        let mut buf = [0u8; 3];
        r.read_record_into(&mut buf).unwrap();
        assert_eq!(b"abc", &buf);
    }

    #[test]
    fn read_into_wrong_size_consumes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        write_records(&path, &[b"abcdef"]);

        let mut r = SubstreamReader::open(&path).unwrap();
        let mut small = [0u8; 2];
        assert!(r.read_record_into(&mut small).is_err());
        assert_eq!(Some(b"abcdef".to_vec()), r.read_record().unwrap());
    }

    #[test]
    fn corrupted_payload_is_invalid_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace_0");
        let mut bytes = encode_framed(b"frame");
        bytes[5] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let mut r = SubstreamReader::open(&path).unwrap();
        let err = r.read_record().unwrap_err();
        assert_eq!(io::ErrorKind::InvalidData, err.kind());
    }

    #[test]
    fn torn_length_prefix_is_unexpected_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace_0");
        let mut bytes = encode_framed(b"frame");
        bytes.extend_from_slice(&[1, 0]);
        fs::write(&path, &bytes).unwrap();

        let mut r = SubstreamReader::open(&path).unwrap();
        r.read_record().unwrap();
        let err = r.read_record().unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
    }

    #[test]
    fn oversized_length_prefix_is_unexpected_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let mut bytes = 0xffff_fff0u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"short");
        fs::write(&path, &bytes).unwrap();

        let mut r = SubstreamReader::open(&path).unwrap();
        let err = r.read_record().unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
        r.rewind().unwrap();
        assert_eq!(io::ErrorKind::UnexpectedEof, r.skip_record().unwrap_err().kind());
    }

    #[test]
    fn decode_framed_checks_length_and_crc() {
        let bytes = encode_framed(b"header");
        assert_eq!(b"header", decode_framed(&bytes).unwrap());
        assert!(decode_framed(&bytes[..bytes.len() - 1]).is_err());
        let mut bad = bytes.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        assert!(decode_framed(&bad).is_err());
    }
}
