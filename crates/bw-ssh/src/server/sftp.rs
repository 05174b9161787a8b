//! The `sftp` subsystem, rooted at the session user's home directory

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::oneshot;

use super::output::SessionOutput;
use crate::error::SshError;

/// Largest chunk answered per read request
const MAX_READ_LEN: u32 = 256 * 1024;

/// Serve SFTP on `stream` and report the exit status when it ends.
///
/// A clean end-of-stream exits 0; any transport error exits 1.
pub(crate) async fn serve<S>(stream: S, root: PathBuf, output: SessionOutput)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tracing::debug!("Starting sftp server in {}", root.display());
    let (outcome_tx, outcome_rx) = oneshot::channel();
    russh_sftp::server::run(TrackedStream::new(stream, outcome_tx), SftpHandler::new(root)).await;

    tokio::spawn(async move {
        let clean = outcome_rx.await.unwrap_or(false);
        let result = if clean {
            Ok(())
        } else {
            tracing::debug!("sftp server completed with error");
            Err(SshError::ExitCode(1))
        };
        output.finish(result).await;
    });
}

/// Stream wrapper reporting whether it ended in a clean EOF
struct TrackedStream<S> {
    inner: S,
    outcome: Option<oneshot::Sender<bool>>,
}

impl<S> TrackedStream<S> {
    fn new(inner: S, outcome: oneshot::Sender<bool>) -> Self {
        Self {
            inner,
            outcome: Some(outcome),
        }
    }

    fn report(&mut self, clean: bool) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(clean);
        }
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.report(false);
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match ready!(Pin::new(&mut this.inner).poll_read(cx, buf)) {
            Ok(()) => {
                if buf.filled().len() == before && buf.remaining() > 0 {
                    this.report(true);
                }
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                this.report(false);
                Poll::Ready(Err(e))
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_write(cx, buf));
        if result.is_err() {
            this.report(false);
        }
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

enum OpenHandle {
    File(tokio::fs::File),
    Dir(Option<Vec<File>>),
}

/// Filesystem-backed SFTP request handler
pub(crate) struct SftpHandler {
    root: PathBuf,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
}

impl SftpHandler {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            root,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Absolute, lexically normalized path for a client-supplied one
    fn resolve(&self, path: &str) -> PathBuf {
        let joined = if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        };

        let mut normalized = PathBuf::from("/");
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::Normal(part) => normalized.push(part),
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        normalized
    }

    fn insert(&mut self, handle: OpenHandle) -> String {
        let id = format!("h{}", self.next_handle);
        self.next_handle += 1;
        self.handles.insert(id.clone(), handle);
        id
    }

    fn file(&mut self, handle: &str) -> Result<&mut tokio::fs::File, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(OpenHandle::File(file)) => Ok(file),
            _ => Err(StatusCode::BadMessage),
        }
    }

    fn ok(id: u32) -> Status {
        Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        }
    }
}

fn status_for(err: io::Error) -> StatusCode {
    tracing::debug!("sftp: {}", err);
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

async fn attrs_of(path: &Path, follow: bool) -> Result<FileAttributes, StatusCode> {
    let metadata = if follow {
        tokio::fs::metadata(path).await
    } else {
        tokio::fs::symlink_metadata(path).await
    };
    metadata
        .map(|m| FileAttributes::from(&m))
        .map_err(status_for)
}

#[cfg(unix)]
async fn apply_permissions(path: &Path, attrs: &FileAttributes) -> Result<(), StatusCode> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = attrs.permissions {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(status_for)?;
    }
    Ok(())
}

#[cfg(not(unix))]
async fn apply_permissions(_path: &Path, _attrs: &FileAttributes) -> Result<(), StatusCode> {
    Ok(())
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        tracing::debug!("sftp client version {}", version);
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let path = self.resolve(&filename);
        let file = tokio::fs::OpenOptions::new()
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE) || pflags.contains(OpenFlags::APPEND))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .create_new(pflags.contains(OpenFlags::CREATE) && pflags.contains(OpenFlags::EXCLUDE))
            .open(&path)
            .await
            .map_err(status_for)?;

        let handle = self.insert(OpenHandle::File(file));
        Ok(Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(OpenHandle::File(mut file)) => {
                file.flush().await.map_err(status_for)?;
                Ok(Self::ok(id))
            }
            Some(OpenHandle::Dir(_)) => Ok(Self::ok(id)),
            None => Err(StatusCode::BadMessage),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(status_for)?;

        let len = len.min(MAX_READ_LEN);
        let mut data = Vec::with_capacity(len as usize);
        (&mut *file)
            .take(u64::from(len))
            .read_to_end(&mut data)
            .await
            .map_err(status_for)?;

        if data.is_empty() && len > 0 {
            return Err(StatusCode::Eof);
        }
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.file(&handle)?;
        file.seek(SeekFrom::Start(offset)).await.map_err(status_for)?;
        file.write_all(&data).await.map_err(status_for)?;
        Ok(Self::ok(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = attrs_of(&self.resolve(&path), false).await?;
        Ok(Attrs { id, attrs })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.file(&handle)?;
        let metadata = file.metadata().await.map_err(status_for)?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        apply_permissions(&self.resolve(&path), &attrs).await?;
        Ok(Self::ok(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let dir = self.resolve(&path);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(status_for)?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(status_for)? {
            let attrs = match entry.metadata().await {
                Ok(metadata) => FileAttributes::from(&metadata),
                Err(_) => FileAttributes::default(),
            };
            files.push(File::new(entry.file_name().to_string_lossy(), attrs));
        }

        let handle = self.insert(OpenHandle::Dir(Some(files)));
        Ok(Handle { id, handle })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        match self.handles.get_mut(&handle) {
            Some(OpenHandle::Dir(entries)) => match entries.take() {
                Some(files) if !files.is_empty() => Ok(Name { id, files }),
                _ => Err(StatusCode::Eof),
            },
            _ => Err(StatusCode::BadMessage),
        }
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_file(self.resolve(&filename))
            .await
            .map_err(status_for)?;
        Ok(Self::ok(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let dir = self.resolve(&path);
        tokio::fs::create_dir(&dir).await.map_err(status_for)?;
        apply_permissions(&dir, &attrs).await?;
        Ok(Self::ok(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        tokio::fs::remove_dir(self.resolve(&path))
            .await
            .map_err(status_for)?;
        Ok(Self::ok(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = self.resolve(&path);
        Ok(Name {
            id,
            files: vec![File::dummy(resolved.to_string_lossy())],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let attrs = attrs_of(&self.resolve(&path), true).await?;
        Ok(Attrs { id, attrs })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::rename(self.resolve(&oldpath), self.resolve(&newpath))
            .await
            .map_err(status_for)?;
        Ok(Self::ok(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = tokio::fs::read_link(self.resolve(&path))
            .await
            .map_err(status_for)?;
        Ok(Name {
            id,
            files: vec![File::dummy(target.to_string_lossy())],
        })
    }

    #[cfg(unix)]
    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        tokio::fs::symlink(&targetpath, self.resolve(&linkpath))
            .await
            .map_err(status_for)?;
        Ok(Self::ok(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_sftp::server::Handler as _;

    #[test]
    fn test_paths_resolve_against_root() {
        let handler = SftpHandler::new(PathBuf::from("/home/dev"));
        assert_eq!(handler.resolve(""), PathBuf::from("/home/dev"));
        assert_eq!(handler.resolve("."), PathBuf::from("/home/dev"));
        assert_eq!(handler.resolve("src/main.rs"), PathBuf::from("/home/dev/src/main.rs"));
        assert_eq!(handler.resolve("../other"), PathBuf::from("/home/other"));
        assert_eq!(handler.resolve("/etc/hosts"), PathBuf::from("/etc/hosts"));
    }

    #[tokio::test]
    async fn test_write_then_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = SftpHandler::new(dir.path().to_path_buf());

        let handle = handler
            .open(
                1,
                "notes.txt".to_string(),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                FileAttributes::default(),
            )
            .await
            .unwrap();
        handler
            .write(2, handle.handle.clone(), 0, b"hello sftp".to_vec())
            .await
            .unwrap();
        handler.close(3, handle.handle).await.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("notes.txt")).unwrap(),
            b"hello sftp"
        );

        let handle = handler
            .open(4, "notes.txt".to_string(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap();
        let data = handler.read(5, handle.handle.clone(), 6, 100).await.unwrap();
        assert_eq!(data.data, b"sftp");
        let eof = handler.read(6, handle.handle.clone(), 10, 100).await;
        assert!(matches!(eof, Err(StatusCode::Eof)));
    }

    #[tokio::test]
    async fn test_oversized_read_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![7u8; MAX_READ_LEN as usize + 1000];
        std::fs::write(dir.path().join("big.bin"), &content).unwrap();
        let mut handler = SftpHandler::new(dir.path().to_path_buf());

        let handle = handler
            .open(1, "big.bin".to_string(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap();
        let data = handler.read(2, handle.handle.clone(), 0, u32::MAX).await.unwrap();
        assert_eq!(data.data.len(), MAX_READ_LEN as usize);

        let rest = handler
            .read(3, handle.handle, u64::from(MAX_READ_LEN), u32::MAX)
            .await
            .unwrap();
        assert_eq!(rest.data.len(), 1000);
    }

    #[tokio::test]
    async fn test_readdir_lists_once_then_eof() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"1").unwrap();
        std::fs::write(dir.path().join("b"), b"2").unwrap();
        let mut handler = SftpHandler::new(dir.path().to_path_buf());

        let handle = handler.opendir(1, ".".to_string()).await.unwrap();
        let listing = handler.readdir(2, handle.handle.clone()).await.unwrap();
        let mut names: Vec<_> = listing.files.iter().map(|f| f.filename.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);

        let again = handler.readdir(3, handle.handle).await;
        assert!(matches!(again, Err(StatusCode::Eof)));
    }

    #[tokio::test]
    async fn test_missing_file_maps_to_no_such_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = SftpHandler::new(dir.path().to_path_buf());
        let result = handler.stat(1, "absent".to_string()).await;
        assert!(matches!(result, Err(StatusCode::NoSuchFile)));
    }

    #[tokio::test]
    async fn test_clean_eof_is_reported() {
        let (client, server) = tokio::io::duplex(64);
        let (tx, rx) = oneshot::channel();
        let mut tracked = TrackedStream::new(server, tx);
        drop(client);

        let mut buf = Vec::new();
        tracked.read_to_end(&mut buf).await.unwrap();
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_without_eof_is_unclean() {
        let (_client, server) = tokio::io::duplex(64);
        let (tx, rx) = oneshot::channel();
        drop(TrackedStream::new(server, tx));
        assert!(!rx.await.unwrap());
    }
}
