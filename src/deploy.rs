use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
};

use axum::body::Bytes;
use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::{domain::Deployment, id::new_deployment_id, store::BoxFuture};

/// A validated archive extracted from an upload request.
#[derive(Debug, Clone)]
pub struct UploadedArchive {
    pub app_name: String,
    pub filename: String,
    pub content_type: String,
    pub entries: usize,
    pub bytes: Bytes,
}

/// An archive written next to the live one but not yet visible under it.
#[derive(Debug, Clone)]
pub struct StagedArchive {
    pub deployment: Deployment,
    pub staged_path: PathBuf,
}

/// Receives archives for deployment tooling.
///
/// Uploads go through two phases: `stage` writes the bytes somewhere private
/// to this upload, then exactly one of `publish` or `abort` settles it. Until
/// `publish` succeeds the previously published archive is untouched.
pub trait DeploySink: Send + Sync + 'static {
    fn stage(&self, archive: UploadedArchive) -> BoxFuture<'_, io::Result<StagedArchive>>;

    /// Makes a staged archive the live one for its app. The staged file is
    /// removed when this fails.
    fn publish(&self, staged: StagedArchive) -> BoxFuture<'_, io::Result<()>>;

    fn abort(&self, staged: StagedArchive) -> BoxFuture<'_, io::Result<()>>;

    /// Drops whatever is held for `app_name`. Returns whether anything was removed.
    fn discard(&self, app_name: String) -> BoxFuture<'_, io::Result<bool>>;
}

/// Keeps the latest archive of each app as `<dir>/<name>.zip`.
#[derive(Debug, Clone)]
pub struct ArchiveDir {
    dir: PathBuf,
}

impl ArchiveDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_path(&self, app_name: &str) -> PathBuf {
        self.dir.join(format!("{app_name}.zip"))
    }

    fn staging_path(&self, app_name: &str, deployment_id: &str) -> PathBuf {
        self.dir.join(format!(".{app_name}.{deployment_id}.zip.tmp"))
    }
}

/// Runs filesystem work off the async workers; archives can be large.
async fn blocking<T, F>(f: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create_new(path)?;
    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    if written.is_err() {
        let _ = fs::remove_file(path);
    }
    written
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl DeploySink for ArchiveDir {
    fn stage(&self, archive: UploadedArchive) -> BoxFuture<'_, io::Result<StagedArchive>> {
        Box::pin(async move {
            let deployment_id = new_deployment_id();
            let staged_path = self.staging_path(&archive.app_name, &deployment_id);

            let dir = self.dir.clone();
            let path = staged_path.clone();
            let bytes = archive.bytes.clone();
            let sha256 = blocking(move || {
                fs::create_dir_all(&dir)?;
                write_new(&path, &bytes)?;
                Ok(hex::encode(Sha256::digest(&bytes)))
            })
            .await?;

            Ok(StagedArchive {
                deployment: Deployment {
                    deployment_id,
                    sha256,
                    size_bytes: archive.bytes.len() as u64,
                    entries: archive.entries,
                    received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                    app_name: archive.app_name,
                    filename: archive.filename,
                    content_type: archive.content_type,
                },
                staged_path,
            })
        })
    }

    fn publish(&self, staged: StagedArchive) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            let live = self.archive_path(&staged.deployment.app_name);
            blocking(move || {
                fs::rename(&staged.staged_path, live).inspect_err(|_| {
                    let _ = fs::remove_file(&staged.staged_path);
                })
            })
            .await
        })
    }

    fn abort(&self, staged: StagedArchive) -> BoxFuture<'_, io::Result<()>> {
        Box::pin(async move {
            blocking(move || remove_if_present(&staged.staged_path).map(|_| ())).await
        })
    }

    fn discard(&self, app_name: String) -> BoxFuture<'_, io::Result<bool>> {
        let live = self.archive_path(&app_name);
        Box::pin(async move { blocking(move || remove_if_present(&live)).await })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::id::is_deployment_id;

    fn archive(app_name: &str, bytes: &'static [u8]) -> UploadedArchive {
        UploadedArchive {
            app_name: app_name.to_string(),
            filename: "application.zip".to_string(),
            content_type: "application/zip".to_string(),
            entries: 1,
            bytes: Bytes::from_static(bytes),
        }
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    async fn deploy(sink: &ArchiveDir, archive: UploadedArchive) -> Deployment {
        let staged = sink.stage(archive).await.unwrap();
        let deployment = staged.deployment.clone();
        sink.publish(staged).await.unwrap();
        deployment
    }

    #[tokio::test]
    async fn stage_describes_archive_without_publishing_it() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = ArchiveDir::new(tmp.path().join("archives"));

        let staged = sink.stage(archive("myApp", b"abc")).await.unwrap();
        let deployment = &staged.deployment;

        assert!(!sink.archive_path("myApp").exists());
        assert_eq!(fs::read(&staged.staged_path).unwrap(), b"abc");
        assert!(is_deployment_id(&deployment.deployment_id));
        assert_eq!(deployment.app_name, "myApp");
        assert_eq!(deployment.filename, "application.zip");
        assert_eq!(deployment.size_bytes, 3);
        assert_eq!(deployment.entries, 1);
        assert_eq!(
            deployment.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(chrono::DateTime::parse_from_rfc3339(&deployment.received_at).is_ok());
    }

    #[tokio::test]
    async fn concurrent_stages_use_distinct_files() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = ArchiveDir::new(tmp.path());

        let (a, b) = tokio::join!(
            sink.stage(archive("myApp", b"first")),
            sink.stage(archive("myApp", b"second"))
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.staged_path, b.staged_path);
        assert_eq!(fs::read(&a.staged_path).unwrap(), b"first");
        assert_eq!(fs::read(&b.staged_path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn publish_replaces_previous_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = ArchiveDir::new(tmp.path());

        deploy(&sink, archive("myApp", b"first")).await;
        deploy(&sink, archive("myApp", b"second")).await;

        assert_eq!(fs::read(sink.archive_path("myApp")).unwrap(), b"second");
        assert_eq!(file_names(sink.dir()), vec!["myApp.zip".to_string()]);
    }

    #[tokio::test]
    async fn abort_keeps_the_published_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = ArchiveDir::new(tmp.path());
        deploy(&sink, archive("myApp", b"first")).await;

        let staged = sink.stage(archive("myApp", b"second")).await.unwrap();
        sink.abort(staged).await.unwrap();

        assert_eq!(fs::read(sink.archive_path("myApp")).unwrap(), b"first");
        assert_eq!(file_names(sink.dir()), vec!["myApp.zip".to_string()]);
    }

    #[tokio::test]
    async fn failed_publish_removes_the_staged_file() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = ArchiveDir::new(tmp.path());
        let staged = sink.stage(archive("myApp", b"abc")).await.unwrap();
        let staged_path = staged.staged_path.clone();
        fs::create_dir(sink.archive_path("myApp")).unwrap();
        fs::write(sink.archive_path("myApp").join("occupied"), b"x").unwrap();

        assert!(sink.publish(staged).await.is_err());
        assert!(!staged_path.exists());
    }

    #[tokio::test]
    async fn discard_reports_whether_an_archive_existed() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = ArchiveDir::new(tmp.path());

        assert!(!sink.discard("myApp".to_string()).await.unwrap());
        deploy(&sink, archive("myApp", b"abc")).await;
        assert!(sink.discard("myApp".to_string()).await.unwrap());
        assert!(!sink.archive_path("myApp").exists());
    }
}
