use std::{collections::HashMap, io, sync::Arc};

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Request, multipart::MultipartError},
    http::StatusCode,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::{
    deploy::{DeploySink, UploadedArchive},
    domain::Deployment,
    state::StoreError,
    store::AppStore,
};

pub const APPLICATION_FIELD: &str = "application";
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

#[derive(Debug)]
pub enum IngestError {
    AppNotFound { name: String },
    MalformedUpload(String),
    PayloadTooLarge,
    Store(StoreError),
    Sink(io::Error),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AppNotFound { name } => write!(f, "app not found: {name}"),
            Self::MalformedUpload(reason) => write!(f, "malformed upload: {reason}"),
            Self::PayloadTooLarge => write!(f, "upload exceeds the configured size limit"),
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Sink(e) => write!(f, "deploy sink error: {e}"),
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Sink(e) => Some(e),
            Self::AppNotFound { .. } | Self::MalformedUpload(_) | Self::PayloadTooLarge => None,
        }
    }
}

fn malformed(reason: impl Into<String>) -> IngestError {
    IngestError::MalformedUpload(reason.into())
}

fn store_error(name: &str, err: StoreError) -> IngestError {
    if err.is_not_found() {
        IngestError::AppNotFound {
            name: name.to_string(),
        }
    } else {
        IngestError::Store(err)
    }
}

fn multipart_error(err: MultipartError) -> IngestError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return IngestError::PayloadTooLarge;
    }
    malformed(err.body_text())
}

/// One lock per app name. Whoever holds it may change that app's archive
/// and deployment record together.
#[derive(Debug, Default)]
pub struct AppLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, app_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(app_name.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Accepts a deployment archive for `app_name` from a multipart request.
///
/// The app must exist before the body is looked at, so a request for an
/// unknown app is answered with `AppNotFound` whatever its body holds.
///
/// Staging, recording and publishing run under the app's lock. On any
/// failure the previously published archive and its record are left as
/// they were.
pub async fn ingest_upload(
    store: &dyn AppStore,
    sink: &dyn DeploySink,
    locks: &AppLocks,
    app_name: String,
    req: Request,
) -> Result<Deployment, IngestError> {
    let app = store
        .find_by_name(app_name.clone())
        .await
        .map_err(|e| store_error(&app_name, e))?;

    let multipart = Multipart::from_request(req, &()).await.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            IngestError::PayloadTooLarge
        } else {
            malformed(rejection.body_text())
        }
    })?;
    let part = read_application_part(multipart).await?;
    let entries = count_zip_entries(&part.bytes)?;

    let archive = UploadedArchive {
        app_name: app.name.clone(),
        filename: part.filename,
        content_type: part.content_type,
        entries,
        bytes: part.bytes,
    };

    let _guard = locks.lock(&app.name).await;
    let previous = match store.find_deployment(app.name.clone()).await {
        Ok(deployment) => Some(deployment),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(IngestError::Store(e)),
    };

    let staged = sink.stage(archive).await.map_err(IngestError::Sink)?;
    let deployment = staged.deployment.clone();

    if let Err(e) = store.record_deployment(deployment.clone()).await {
        // The app may have been deleted while the body was being read.
        if let Err(abort_err) = sink.abort(staged).await {
            warn!(app = %app.name, error = %abort_err, "failed to remove staged archive");
        }
        return Err(store_error(&app.name, e));
    }

    if let Err(e) = sink.publish(staged).await {
        let restored = match previous {
            Some(previous) => store.record_deployment(previous).await,
            None => store.clear_deployment(app.name.clone()).await,
        };
        if let Err(restore_err) = restored {
            warn!(
                app = %app.name,
                deployment_id = %deployment.deployment_id,
                error = %restore_err,
                "failed to restore deployment record after publish failure"
            );
        }
        return Err(IngestError::Sink(e));
    }
    Ok(deployment)
}

#[derive(Debug)]
struct ApplicationPart {
    filename: String,
    content_type: String,
    bytes: Bytes,
}

async fn read_application_part(mut multipart: Multipart) -> Result<ApplicationPart, IngestError> {
    let mut found: Option<ApplicationPart> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name != APPLICATION_FIELD {
            return Err(malformed(format!("unexpected part: {name:?}")));
        }
        if found.is_some() {
            return Err(malformed("more than one application part"));
        }

        let filename = field
            .file_name()
            .map(base_file_name)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| malformed("application part has no filename"))?;
        if !filename.to_ascii_lowercase().ends_with(".zip") {
            return Err(malformed(format!("not a .zip filename: {filename:?}")));
        }

        let content_type = field.content_type().unwrap_or_default().to_string();
        if !is_zip_content_type(&content_type) {
            return Err(malformed(format!(
                "expected content type {ZIP_CONTENT_TYPE}, got {content_type:?}"
            )));
        }

        let bytes = field.bytes().await.map_err(multipart_error)?;
        found = Some(ApplicationPart {
            filename,
            content_type: ZIP_CONTENT_TYPE.to_string(),
            bytes,
        });
    }

    found.ok_or_else(|| malformed("missing application part"))
}

/// Keeps only the last path component of a client supplied filename.
fn base_file_name(raw: &str) -> String {
    raw.rsplit(['/', '\\']).next().unwrap_or_default().trim().to_string()
}

fn is_zip_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(ZIP_CONTENT_TYPE))
}

fn count_zip_entries(bytes: &[u8]) -> Result<usize, IngestError> {
    let archive = zip::ZipArchive::new(io::Cursor::new(bytes))
        .map_err(|e| malformed(format!("not a zip archive: {e}")))?;
    if archive.is_empty() {
        return Err(malformed("zip archive has no entries"));
    }
    Ok(archive.len())
}

#[cfg(test)]
pub(crate) fn zip_with(files: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write as _;

    let mut writer = zip::ZipWriter::new(io::Cursor::new(Vec::new()));
    for (name, contents) in files {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
