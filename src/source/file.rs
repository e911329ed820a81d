use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::ByteRangeSource;

/// A local file. Reads are positional and done on the blocking pool, so they run in parallel.
pub struct FileSource {
    path: PathBuf,
    origin: String,
    fd: Arc<File>,
    len: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileSource> {
        let path = path.as_ref().to_path_buf();
        let fd = File::open(&path)?;
        let len = fd.metadata()?.len();
        let origin = std::fs::canonicalize(&path)
            .unwrap_or_else(|_| path.clone())
            .to_string_lossy()
            .into_owned();

        Ok(FileSource {
            path,
            origin,
            fd: Arc::new(fd),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn pread(fd: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    fd.read_at(buf, offset)
}

#[cfg(windows)]
fn pread(fd: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    fd.seek_read(buf, offset)
}

fn read_at(fd: &File, offset: u64, length: u64) -> io::Result<Bytes> {
    // The file may have grown since it was opened.
    let available = fd.metadata()?.len().saturating_sub(offset);
    let want = usize::try_from(length.min(available))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut buf = vec![0u8; want];
    let mut n = 0;

    while n < want {
        match pread(fd, &mut buf[n..], offset + n as u64) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }

    buf.truncate(n);
    Ok(Bytes::from(buf))
}

impl ByteRangeSource for FileSource {
    fn read(&self, offset: u64, length: u64) -> BoxFuture<'_, io::Result<Bytes>> {
        let fd = Arc::clone(&self.fd);

        async move {
            tokio::task::spawn_blocking(move || read_at(&fd, offset, length))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        }
        .boxed()
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn len(&self) -> Option<u64> {
        Some(self.len)
    }
}
