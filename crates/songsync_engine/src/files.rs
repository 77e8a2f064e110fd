//! Blob side-channel.
//!
//! Song images and similar attachments are exchanged by file name next to
//! the patch chain. A download publishes one request per missing name and
//! completes once every name has been answered; an upload publishes the
//! blob contents and completes once every name has a response.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::property::{codecs, ListenerId, SyncedProperty};
use crate::transport::{PubSubTransport, Publisher};
use parking_lot::Mutex;
use songsync_protocol::{FileRequest, FileSetResponse, PatchId};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a download or upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTransfer {
    /// Names transferred successfully.
    pub completed: Vec<String>,
    /// Names that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl FileTransfer {
    /// Returns true if nothing failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

type DoneFn = Box<dyn FnOnce(FileTransfer) + Send>;

struct Transfer {
    outstanding: BTreeSet<String>,
    report: FileTransfer,
    on_done: Option<DoneFn>,
    listener: Option<ListenerId>,
}

impl Transfer {
    fn new(on_done: DoneFn) -> Self {
        Self {
            outstanding: BTreeSet::new(),
            report: FileTransfer::default(),
            on_done: Some(on_done),
            listener: None,
        }
    }

    /// Takes the completion callback once nothing is outstanding.
    fn finish(&mut self) -> Option<(DoneFn, FileTransfer, Option<ListenerId>)> {
        if !self.outstanding.is_empty() {
            return None;
        }
        let on_done = self.on_done.take()?;
        Some((on_done, std::mem::take(&mut self.report), self.listener.take()))
    }
}

/// Returns an error unless `name` is a plain file name.
fn check_name(name: &str) -> SyncResult<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '+', '#']);
    if plain {
        Ok(())
    } else {
        Err(SyncError::InvalidBlobName(name.to_string()))
    }
}

/// Downloads and uploads blobs for one client.
pub struct FileExchange {
    blob_dir: PathBuf,
    request_get: SyncedProperty<FileRequest>,
    request_file: SyncedProperty<Vec<u8>>,
    request_set: SyncedProperty<Vec<u8>>,
    set_response: SyncedProperty<FileSetResponse>,
}

impl FileExchange {
    /// Builds and connects the file channels. Blobs live in `blob_dir`.
    pub fn connect(
        config: &SyncConfig,
        transport: Arc<dyn PubSubTransport>,
        publisher: Arc<Publisher>,
        blob_dir: impl Into<PathBuf>,
    ) -> SyncResult<Self> {
        let topics = config.topics();
        let t = || Arc::clone(&transport);
        let p = || Arc::clone(&publisher);
        let exchange = Self {
            blob_dir: blob_dir.into(),
            request_get: SyncedProperty::builder("files_request_get", codecs::file_request())
                .publish_to(topics.files_request_get())
                .never_equal()
                .build(t(), p()),
            request_file: SyncedProperty::builder("files_request_file", codecs::bytes())
                .subscribe_to(topics.files_request_file())
                .never_equal()
                .build(t(), p()),
            request_set: SyncedProperty::builder("files_request_set", codecs::bytes())
                .publish_to(topics.files_request_set())
                .never_equal()
                .build(t(), p()),
            set_response: SyncedProperty::builder("files_request_set_response", codecs::file_set_response())
                .subscribe_to(topics.files_request_set_response())
                .never_equal()
                .build(t(), p()),
        };
        exchange.request_file.connect()?;
        exchange.set_response.connect()?;
        Ok(exchange)
    }

    /// Blob directory.
    pub fn blob_dir(&self) -> &Path {
        &self.blob_dir
    }

    /// Path of a blob.
    pub fn blob_path(&self, name: &str) -> SyncResult<PathBuf> {
        check_name(name)?;
        Ok(self.blob_dir.join(name))
    }

    /// Names that are not present in the blob directory.
    pub fn missing<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        names
            .into_iter()
            .filter(|name| !self.blob_dir.join(name).is_file())
            .map(str::to_string)
            .collect()
    }

    /// Copies a local file into the blob directory under a fresh name that
    /// keeps the extension. Returns the new name.
    pub fn import(&self, source: &Path) -> SyncResult<String> {
        let stem = PatchId::generate().to_string();
        let name = match source.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{stem}.{ext}"),
            None => stem,
        };
        fs::create_dir_all(&self.blob_dir)?;
        fs::copy(source, self.blob_dir.join(&name))?;
        debug!(source = %source.display(), %name, "imported blob");
        Ok(name)
    }

    /// Requests `names` and writes every answer into the blob directory.
    /// `on_done` runs once all names are answered; an empty answer counts
    /// as a failure.
    pub fn download<I, F>(&self, names: I, on_done: F)
    where
        I: IntoIterator<Item = String>,
        F: FnOnce(FileTransfer) + Send + 'static,
    {
        let transfer = Arc::new(Mutex::new(Transfer::new(Box::new(on_done))));
        {
            let mut t = transfer.lock();
            for name in names {
                match check_name(&name) {
                    Ok(()) => {
                        t.outstanding.insert(name);
                    }
                    Err(e) => t.report.failed.push((name, e.to_string())),
                }
            }
        }

        let requested: Vec<String> = transfer.lock().outstanding.iter().cloned().collect();
        if !requested.is_empty() {
            let state = Arc::clone(&transfer);
            let blob_dir = self.blob_dir.clone();
            let property = self.request_file.clone();
            let id = self.request_file.on_remote_change(move |content, args| {
                let Some(name) = args.first() else {
                    return;
                };
                let finished = {
                    let mut t = state.lock();
                    if !t.outstanding.remove(name) {
                        return;
                    }
                    match store_blob(&blob_dir, name, content) {
                        Ok(()) => t.report.completed.push(name.clone()),
                        Err(e) => {
                            warn!(%name, error = %e, "blob download failed");
                            t.report.failed.push((name.clone(), e.to_string()));
                        }
                    }
                    t.finish()
                };
                if let Some((on_done, report, listener)) = finished {
                    if let Some(listener) = listener {
                        property.remove_listener(listener);
                    }
                    on_done(report);
                }
            });
            transfer.lock().listener = Some(id);

            for name in requested {
                debug!(%name, "requesting blob");
                self.request_get.publish(&FileRequest { name }, &[]);
            }
        }

        complete_if_idle(&transfer, &self.request_file);
    }

    /// Publishes the named blobs from the blob directory. `on_done` runs
    /// once every name has a response; unreadable blobs fail immediately.
    pub fn upload<I, F>(&self, names: I, on_done: F)
    where
        I: IntoIterator<Item = String>,
        F: FnOnce(FileTransfer) + Send + 'static,
    {
        let transfer = Arc::new(Mutex::new(Transfer::new(Box::new(on_done))));
        let mut blobs = Vec::new();
        {
            let mut t = transfer.lock();
            for name in names {
                let content = self.blob_path(&name).and_then(|path| Ok(fs::read(path)?));
                match content {
                    Ok(content) => {
                        t.outstanding.insert(name.clone());
                        blobs.push((name, content));
                    }
                    Err(e) => t.report.failed.push((name, e.to_string())),
                }
            }
        }

        if !blobs.is_empty() {
            let state = Arc::clone(&transfer);
            let property = self.set_response.clone();
            let id = self.set_response.on_remote_change(move |response, _| {
                let Some(response) = response else {
                    return;
                };
                let finished = {
                    let mut t = state.lock();
                    if !t.outstanding.remove(&response.name) {
                        return;
                    }
                    if response.ok {
                        t.report.completed.push(response.name.clone());
                    } else {
                        let reason = response.reason.clone().unwrap_or_else(|| "rejected".into());
                        warn!(name = %response.name, %reason, "blob upload failed");
                        t.report.failed.push((response.name.clone(), reason));
                    }
                    t.finish()
                };
                if let Some((on_done, report, listener)) = finished {
                    if let Some(listener) = listener {
                        property.remove_listener(listener);
                    }
                    on_done(report);
                }
            });
            transfer.lock().listener = Some(id);

            for (name, content) in blobs {
                debug!(%name, bytes = content.len(), "uploading blob");
                self.request_set.publish(&content, &[name.as_str()]);
            }
        }

        complete_if_idle(&transfer, &self.set_response);
    }

    /// Unsubscribes the file channels.
    pub fn close(&self) -> SyncResult<()> {
        self.request_file.clear_listeners();
        self.request_file.disconnect()?;
        self.set_response.clear_listeners();
        self.set_response.disconnect()
    }
}

fn complete_if_idle<T>(transfer: &Arc<Mutex<Transfer>>, property: &SyncedProperty<T>)
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    let finished = transfer.lock().finish();
    if let Some((on_done, report, listener)) = finished {
        if let Some(listener) = listener {
            property.remove_listener(listener);
        }
        on_done(report);
    }
}

fn store_blob(dir: &Path, name: &str, content: Option<&Vec<u8>>) -> SyncResult<()> {
    let content = match content {
        Some(content) if !content.is_empty() => content,
        _ => return Err(SyncError::BlobUnavailable(name.to_string())),
    };
    fs::create_dir_all(dir)?;
    fs::write(dir.join(name), content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::ChainArbiter;
    use crate::config::PublishMode;
    use crate::transport::MemoryBroker;
    use tempfile::tempdir;

    fn exchange(broker: &MemoryBroker, dir: &Path) -> FileExchange {
        let config = SyncConfig::new("local", "t/", "alice").with_client_id("c1");
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("c1"));
        let publisher = Arc::new(Publisher::new(Arc::clone(&transport), PublishMode::Inline));
        FileExchange::connect(&config, transport, publisher, dir).unwrap()
    }

    fn collect() -> (Arc<Mutex<Option<FileTransfer>>>, impl FnOnce(FileTransfer) + Send + 'static) {
        let slot = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&slot);
        (slot, move |report| *sink.lock() = Some(report))
    }

    #[test]
    fn download_writes_blobs() {
        let dir = tempdir().unwrap();
        let broker = MemoryBroker::new();
        let arbiter = ChainArbiter::start(Arc::new(broker.client("arbiter")), "t/").unwrap();
        arbiter.put_file("a.png", b"aaa".to_vec());
        let files = exchange(&broker, dir.path());

        let (report, on_done) = collect();
        files.download(vec!["a.png".to_string(), "gone.png".to_string()], on_done);
        assert!(report.lock().is_none());
        broker.pump();

        let report = report.lock().clone().unwrap();
        assert_eq!(report.completed, vec!["a.png".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "gone.png");
        assert_eq!(fs::read(dir.path().join("a.png")).unwrap(), b"aaa");
        assert_eq!(files.missing(["a.png", "gone.png"]), vec!["gone.png".to_string()]);
    }

    #[test]
    fn nothing_to_download_completes_at_once() {
        let dir = tempdir().unwrap();
        let broker = MemoryBroker::new();
        let files = exchange(&broker, dir.path());
        let (report, on_done) = collect();
        files.download(Vec::new(), on_done);
        assert_eq!(report.lock().clone(), Some(FileTransfer::default()));
    }

    #[test]
    fn invalid_names_fail_without_request() {
        let dir = tempdir().unwrap();
        let broker = MemoryBroker::new();
        let files = exchange(&broker, dir.path());
        let (report, on_done) = collect();
        files.download(vec!["../etc".to_string()], on_done);
        assert_eq!(broker.pending(), 0);
        assert!(!report.lock().clone().unwrap().is_success());
    }

    #[test]
    fn upload_completes_on_response() {
        let dir = tempdir().unwrap();
        let broker = MemoryBroker::new();
        let arbiter = ChainArbiter::start(Arc::new(broker.client("arbiter")), "t/").unwrap();
        let files = exchange(&broker, dir.path());

        let source = dir.path().join("photo.jpg");
        fs::write(&source, b"jpeg").unwrap();
        let name = files.import(&source).unwrap();
        assert!(name.ends_with(".jpg"));

        let (report, on_done) = collect();
        files.upload(vec![name.clone(), "missing.png".to_string()], on_done);
        broker.pump();

        let report = report.lock().clone().unwrap();
        assert_eq!(report.completed, vec![name.clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(arbiter.file(&name), Some(b"jpeg".to_vec()));
    }
}
