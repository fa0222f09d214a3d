use crate::trace::codec::{invalid_data, Decoder, Encoder};
use memchr::{memchr, memchr_iter};
use std::{
    ffi::{OsStr, OsString},
    io,
    os::unix::ffi::{OsStrExt, OsStringExt},
};

/// The program that was recorded and how it was started. Written once per
/// trace, before the first frame.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct RecordedEnv {
    pub exe_image: OsString,
    /// Working directory of the recorder when the trace was started.
    pub cwd: OsString,
    pub argv: Vec<OsString>,
    pub envp: Vec<OsString>,
}

impl RecordedEnv {
    /// Fails if any argument or environment string has an interior NUL, since
    /// such strings could never have reached `execve()`.
    pub fn new<S: AsRef<OsStr>>(
        exe_image: &OsStr,
        cwd: &OsStr,
        argv: &[S],
        envp: &[S],
    ) -> io::Result<RecordedEnv> {
        let argv = to_c_strings(argv)?;
        let envp = to_c_strings(envp)?;
        Ok(RecordedEnv {
            exe_image: exe_image.to_owned(),
            cwd: cwd.to_owned(),
            argv,
            envp,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_bytes(self.exe_image.as_bytes())
            .put_bytes(self.cwd.as_bytes());
        put_string_block(&mut e, &self.argv);
        put_string_block(&mut e, &self.envp);
        e.into_inner()
    }

    pub fn decode(data: &[u8]) -> io::Result<RecordedEnv> {
        let mut d = Decoder::new(data);
        let exe_image = OsString::from_vec(d.get_bytes()?.to_vec());
        let cwd = OsString::from_vec(d.get_bytes()?.to_vec());
        let argv = get_string_block(&mut d)?;
        let envp = get_string_block(&mut d)?;
        d.finish()?;
        Ok(RecordedEnv {
            exe_image,
            cwd,
            argv,
            envp,
        })
    }

    /// Value of `name` in the recorded environment, if set.
    pub fn getenv(&self, name: &str) -> Option<&OsStr> {
        let name = name.as_bytes();
        self.envp.iter().find_map(|entry| {
            let entry = entry.as_bytes();
            match memchr(b'=', entry) {
                Some(eq) if &entry[..eq] == name => Some(OsStr::from_bytes(&entry[eq + 1..])),
                _ => None,
            }
        })
    }
}

fn to_c_strings<S: AsRef<OsStr>>(strings: &[S]) -> io::Result<Vec<OsString>> {
    strings
        .iter()
        .map(|s| {
            let s = s.as_ref();
            if memchr(0, s.as_bytes()).is_some() {
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{:?} contains a NUL byte", s),
                ))
            } else {
                Ok(s.to_owned())
            }
        })
        .collect()
}

/// Count, then every string NUL terminated.
fn put_string_block(e: &mut Encoder, strings: &[OsString]) {
    let mut block = Vec::new();
    for s in strings {
        block.extend_from_slice(s.as_bytes());
        block.push(0);
    }
    e.put_u32(strings.len() as u32).put_bytes(&block);
}

fn get_string_block(d: &mut Decoder) -> io::Result<Vec<OsString>> {
    let count = d.get_u32()? as usize;
    let block = d.get_bytes()?;
    let mut strings = Vec::with_capacity(count);
    let mut start = 0;
    for nul in memchr_iter(0, block) {
        strings.push(OsString::from_vec(block[start..nul].to_vec()));
        start = nul + 1;
    }
    if start != block.len() || strings.len() != count {
        return Err(invalid_data(format!(
            "string block should hold {} NUL terminated strings, found {}",
            count,
            strings.len()
        )));
    }
    Ok(strings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_round_trips_exactly() {
        let env = RecordedEnv::new(
            OsStr::new("/bin/ls"),
            OsStr::new("/home/user"),
            &["ls", "-l", ""],
            &["HOME=/home/user", "PATH=/usr/bin:/bin", "EMPTY="],
        )
        .unwrap();
        let decoded = RecordedEnv::decode(&env.encode()).unwrap();
        assert_eq!(env, decoded);
        assert_eq!(3, decoded.argv.len());
        assert_eq!(Some(OsStr::new("/usr/bin:/bin")), decoded.getenv("PATH"));
        assert_eq!(Some(OsStr::new("")), decoded.getenv("EMPTY"));
        assert_eq!(None, decoded.getenv("PAT"));
    }

    #[test]
    fn interior_nul_is_refused() {
        let argv = [OsString::from_vec(b"a\0b".to_vec())];
        assert!(RecordedEnv::new(OsStr::new("/bin/true"), OsStr::new("/"), &argv, &[]).is_err());
    }

    #[test]
    fn count_mismatch_is_invalid_data() {
        let mut e = Encoder::new();
        e.put_bytes(b"/bin/true").put_bytes(b"/");
        e.put_u32(2).put_bytes(b"only-one\0");
        e.put_u32(0).put_bytes(b"");
        let err = RecordedEnv::decode(&e.into_inner()).unwrap_err();
        assert_eq!(io::ErrorKind::InvalidData, err.kind());
    }
}
