//! Hot-reloading holder of the current TLS keypair.

use crate::error::{CredentialsError, Result};
use crate::filewatcher::{FileEvent, FileWatcher, NotifyFileWatcher, PathWatch};
use crate::loader::{load_keypair, load_trust_pool, Keypair, TrustPool};
use crate::paths::CredentialPaths;
use arc_swap::ArcSwap;
use log::{debug, error, info};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Handle for receiving keypair rotation notifications from a [`CertificateWatcher`].
///
/// Each successful reload bumps a generation number, starting from `0` for the
/// keypair loaded at startup. A slow receiver may skip intermediate generations.
#[derive(Clone, Debug)]
pub struct KeypairUpdates {
    rx: watch::Receiver<u64>,
}

impl KeypairUpdates {
    /// Waits for the next rotation and returns its generation.
    ///
    /// ## Errors
    ///
    /// Returns [`CredentialsError::Closed`] once the watcher and its watch loop are gone.
    pub async fn changed(&mut self) -> Result<u64> {
        self.rx
            .changed()
            .await
            .map_err(|_| CredentialsError::Closed)?;
        Ok(*self.rx.borrow_and_update())
    }

    /// Returns the last observed generation without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Waits until the generation satisfies `f`, returning immediately if it
    /// already does.
    ///
    /// ## Errors
    ///
    /// Returns [`CredentialsError::Closed`] once the watcher and its watch loop are gone.
    pub async fn wait_for<F>(&mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(&u64) -> bool,
    {
        let current = self.last();
        if f(&current) {
            return Ok(current);
        }
        loop {
            let generation = self.changed().await?;
            if f(&generation) {
                return Ok(generation);
            }
        }
    }
}

/// Watches a certificate/key file pair and serves the most recent valid keypair.
///
/// The CA bundle is loaded once at startup and is not watched. After startup,
/// [`CertificateWatcher::get`] always returns a complete keypair: rewrites that
/// fail to load are logged and the previous keypair stays in effect.
///
/// Cloning is cheap; clones share the same snapshot and watch loop. The loop runs
/// until the stop token passed at construction is cancelled.
#[derive(Clone)]
pub struct CertificateWatcher {
    inner: Arc<Inner>,
}

struct Inner {
    paths: CredentialPaths,

    // Copy-on-write, last-known-good keypair.
    keypair: ArcSwap<Keypair>,

    trust_pool: TrustPool,

    generation: AtomicU64,
    update_tx: watch::Sender<u64>,
}

impl fmt::Debug for CertificateWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateWatcher")
            .field("paths", &self.inner.paths)
            .field("keypair", &"<ArcSwap<Keypair>>")
            .field("trust_pool_len", &self.inner.trust_pool.len())
            .field("generation", &self.inner.generation.load(Ordering::Relaxed))
            .finish()
    }
}

impl CertificateWatcher {
    /// Loads and watches `cert-chain.pem`, `key.pem` and `root-cert.pem` inside
    /// `folder`.
    ///
    /// ## Errors
    ///
    /// See [`CertificateWatcher::watch_files`].
    pub fn watch_folder(stop: CancellationToken, folder: impl AsRef<Path>) -> Result<Self> {
        Self::watch_files(stop, CredentialPaths::from_dir(folder))
    }

    /// Loads the credentials named by `paths` and watches the certificate and key
    /// files with a [`NotifyFileWatcher`].
    ///
    /// Must be called from within a Tokio runtime; the watch loop runs as a task
    /// on it until `stop` is cancelled.
    ///
    /// ## Errors
    ///
    /// Returns an error, without starting the watch loop, if:
    /// - the CA bundle is missing, unparsable, or yields no trust anchor,
    /// - the certificate or key file is missing, unparsable, or they do not match,
    /// - the files cannot be watched,
    /// - or no Tokio runtime is available.
    pub fn watch_files(stop: CancellationToken, paths: CredentialPaths) -> Result<Self> {
        Self::watch_files_with(stop, paths, NotifyFileWatcher::new()?)
    }

    /// Like [`CertificateWatcher::watch_files`], with a caller-supplied [`FileWatcher`].
    ///
    /// ## Errors
    ///
    /// See [`CertificateWatcher::watch_files`].
    pub fn watch_files_with<W: FileWatcher>(
        stop: CancellationToken,
        paths: CredentialPaths,
        mut file_watcher: W,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CredentialsError::Runtime(e.to_string()))?;

        let trust_pool = load_trust_pool(paths.ca_certificate_file())?;
        let keypair = load_keypair(paths.certificate_file(), paths.key_file())?;

        let cert_watch = file_watcher.add(paths.certificate_file())?;
        let key_watch = file_watcher.add(paths.key_file())?;

        debug!(
            "Begin watching certificate files: {}, {}",
            paths.certificate_file().display(),
            paths.key_file().display()
        );

        let (update_tx, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            paths,
            keypair: ArcSwap::from_pointee(keypair),
            trust_pool,
            generation: AtomicU64::new(0),
            update_tx,
        });

        let task_inner = Arc::clone(&inner);
        runtime.spawn(async move {
            task_inner
                .watch(file_watcher, cert_watch, key_watch, stop)
                .await;
        });

        Ok(Self { inner })
    }

    /// Returns the current keypair.
    ///
    /// Never blocks on the watch loop and never observes a half-replaced keypair.
    pub fn get(&self) -> Arc<Keypair> {
        self.inner.keypair.load_full()
    }

    /// Returns the CA trust pool loaded at startup.
    pub fn trust_pool(&self) -> &TrustPool {
        &self.inner.trust_pool
    }

    /// Returns the watched credential paths.
    pub fn paths(&self) -> &CredentialPaths {
        &self.inner.paths
    }

    /// Returns a handle that resolves on every successful keypair rotation.
    pub fn updated(&self) -> KeypairUpdates {
        KeypairUpdates {
            rx: self.inner.update_tx.subscribe(),
        }
    }
}

impl Inner {
    async fn watch<W: FileWatcher>(
        &self,
        mut file_watcher: W,
        mut cert: PathWatch,
        mut key: PathWatch,
        stop: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = stop.cancelled() => {
                    file_watcher.close();
                    debug!("stopping watch of certificate file changes");
                    return;
                }

                event = cert.events.recv() => {
                    let Some(event) = event else { return };
                    self.handle_event(&event);
                }

                event = key.events.recv() => {
                    let Some(event) = event else { return };
                    self.handle_event(&event);
                }

                Some(e) = cert.errors.recv() => {
                    error!("error event while watching cert file: {e}");
                }

                Some(e) = key.errors.recv() => {
                    error!("error event while watching key file: {e}");
                }
            }
        }
    }

    fn handle_event(&self, event: &FileEvent) {
        if !event.kind.is_create_or_write() {
            return;
        }

        // A rotation is only meaningful as a matched pair, so both files are reloaded.
        match load_keypair(self.paths.certificate_file(), self.paths.key_file()) {
            Ok(keypair) => {
                self.set(keypair);
                info!(
                    "reloaded keypair after {:?} on {}",
                    event.kind,
                    event.path.display()
                );
            }
            Err(e) => {
                error!("error loading certificates after watch event; keeping previous: {e}");
            }
        }
    }

    fn set(&self, keypair: Keypair) {
        self.keypair.store(Arc::new(keypair));
        let next = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.update_tx.send_replace(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filewatcher::FileEventKind;
    use crate::testing::TestPki;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Senders = (
        mpsc::UnboundedSender<FileEvent>,
        mpsc::UnboundedSender<CredentialsError>,
    );

    /// Hands out channels per path so tests can inject events directly.
    #[derive(Clone, Default)]
    struct FakeFileWatcher {
        senders: Arc<Mutex<Vec<(PathBuf, Senders)>>>,
        closed: Arc<AtomicBool>,
    }

    impl FakeFileWatcher {
        fn send(&self, path: &Path, kind: FileEventKind) {
            for (p, (events, _)) in self.senders.lock().unwrap().iter() {
                if p == path {
                    events
                        .send(FileEvent {
                            path: p.clone(),
                            kind,
                        })
                        .unwrap();
                }
            }
        }

        fn send_error(&self, path: &Path) {
            for (p, (_, errors)) in self.senders.lock().unwrap().iter() {
                if p == path {
                    errors
                        .send(CredentialsError::Watch("injected".into()))
                        .unwrap();
                }
            }
        }

        fn drop_channels(&self) {
            self.senders.lock().unwrap().clear();
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl FileWatcher for FakeFileWatcher {
        fn add(&mut self, path: &Path) -> Result<PathWatch> {
            let (events_tx, events) = mpsc::unbounded_channel();
            let (errors_tx, errors) = mpsc::unbounded_channel();
            self.senders
                .lock()
                .unwrap()
                .push((path.to_path_buf(), (events_tx, errors_tx)));
            Ok(PathWatch { events, errors })
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
            self.senders.lock().unwrap().clear();
        }
    }

    struct Fixture {
        pki: TestPki,
        dir: tempfile::TempDir,
        paths: CredentialPaths,
        fw: FakeFileWatcher,
        stop: CancellationToken,
        watcher: CertificateWatcher,
    }

    fn start() -> (Fixture, Vec<u8>) {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let issued = pki.issue("localhost");
        let paths = pki.write(dir.path(), &issued);
        let fw = FakeFileWatcher::default();
        let stop = CancellationToken::new();

        let watcher =
            CertificateWatcher::watch_files_with(stop.clone(), paths.clone(), fw.clone()).unwrap();

        (
            Fixture {
                pki,
                dir,
                paths,
                fw,
                stop,
                watcher,
            },
            issued.cert_der,
        )
    }

    fn leaf(watcher: &CertificateWatcher) -> Vec<u8> {
        watcher.get().leaf().unwrap().as_ref().to_vec()
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn get_returns_keypair_on_disk_at_start() {
        let (fx, initial) = start();
        assert_eq!(leaf(&fx.watcher), initial);
        assert_eq!(fx.watcher.updated().last(), 0);
        assert_eq!(fx.watcher.trust_pool().len(), 1);
    }

    #[tokio::test]
    async fn rewrite_with_valid_pair_is_picked_up() {
        let (fx, _) = start();
        let mut updates = fx.watcher.updated();

        let rotated = fx.pki.issue("localhost");
        fx.pki.write(fx.dir.path(), &rotated);
        fx.fw.send(fx.paths.key_file(), FileEventKind::Write);

        let generation = tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(generation, 1);
        assert_eq!(leaf(&fx.watcher), rotated.cert_der);
    }

    #[tokio::test]
    async fn invalid_rewrite_keeps_previous_keypair() {
        let (fx, initial) = start();
        let mut updates = fx.watcher.updated();

        // Certificate rotated but the key not yet: a mismatched pair.
        let rotated = fx.pki.issue("localhost");
        std::fs::write(fx.paths.certificate_file(), &rotated.cert_pem).unwrap();
        fx.fw.send(fx.paths.certificate_file(), FileEventKind::Write);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(leaf(&fx.watcher), initial);
        assert_eq!(updates.last(), 0);

        // Completing the pair makes it loadable.
        std::fs::write(fx.paths.key_file(), &rotated.key_pem).unwrap();
        fx.fw.send(fx.paths.key_file(), FileEventKind::Write);

        updates.wait_for(|g| *g >= 1).await.unwrap();
        assert_eq!(leaf(&fx.watcher), rotated.cert_der);
    }

    #[tokio::test]
    async fn remove_events_do_not_reload() {
        let (fx, initial) = start();

        let rotated = fx.pki.issue("localhost");
        fx.pki.write(fx.dir.path(), &rotated);
        fx.fw.send(fx.paths.certificate_file(), FileEventKind::Remove);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(leaf(&fx.watcher), initial);
    }

    #[tokio::test]
    async fn error_events_are_not_fatal() {
        let (fx, _) = start();
        let mut updates = fx.watcher.updated();

        fx.fw.send_error(fx.paths.certificate_file());
        fx.fw.send_error(fx.paths.key_file());

        let rotated = fx.pki.issue("localhost");
        fx.pki.write(fx.dir.path(), &rotated);
        fx.fw.send(fx.paths.certificate_file(), FileEventKind::Create);

        updates.wait_for(|g| *g >= 1).await.unwrap();
        assert_eq!(leaf(&fx.watcher), rotated.cert_der);
    }

    #[tokio::test]
    async fn stop_closes_file_watcher() {
        let (fx, _) = start();
        fx.stop.cancel();

        let fw = fx.fw.clone();
        wait_until(move || fw.is_closed()).await;
    }

    #[tokio::test]
    async fn closed_event_channel_ends_loop() {
        let (fx, _) = start();
        let mut updates = fx.watcher.updated();

        fx.fw.drop_channels();
        drop(fx.watcher);

        // With the loop gone and the last handle dropped, the update channel closes.
        let res = tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .unwrap();
        assert!(matches!(res, Err(CredentialsError::Closed)));
        assert!(!fx.fw.is_closed());
    }

    #[tokio::test]
    async fn concurrent_readers_always_see_complete_keypairs() {
        let (fx, _) = start();
        let mut readers = Vec::new();
        for _ in 0..8 {
            let watcher = fx.watcher.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let kp = watcher.get();
                    assert_eq!(kp.cert_chain().len(), 1);
                    tokio::task::yield_now().await;
                }
            }));
        }

        for _ in 0..5 {
            let rotated = fx.pki.issue("localhost");
            fx.pki.write(fx.dir.path(), &rotated);
            fx.fw.send(fx.paths.certificate_file(), FileEventKind::Write);
        }

        for r in readers {
            r.await.unwrap();
        }
    }

    #[test]
    fn start_without_runtime_fails() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let paths = pki.write(dir.path(), &pki.issue("localhost"));

        let err = CertificateWatcher::watch_files_with(
            CancellationToken::new(),
            paths,
            FakeFileWatcher::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CredentialsError::Runtime(_)));
    }

    #[tokio::test]
    async fn start_fails_on_ca_without_certificates() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let paths = pki.write(dir.path(), &pki.issue("localhost"));
        std::fs::write(paths.ca_certificate_file(), "").unwrap();

        let fw = FakeFileWatcher::default();
        let err = CertificateWatcher::watch_files_with(CancellationToken::new(), paths, fw.clone())
            .unwrap_err();
        assert!(matches!(err, CredentialsError::NoTrustAnchors { .. }));
        // Nothing was watched.
        assert!(fw.senders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_fails_on_missing_key() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let paths = pki.write(dir.path(), &pki.issue("localhost"));
        std::fs::remove_file(paths.key_file()).unwrap();

        let err = CertificateWatcher::watch_files_with(
            CancellationToken::new(),
            paths,
            FakeFileWatcher::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CredentialsError::ReadFile { .. }));
    }

    #[tokio::test]
    async fn combined_certificate_and_key_file_is_reloaded() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        pki.write(dir.path(), &pki.issue("localhost"));

        let combined = dir.path().join("combined.pem");
        let write_combined = |issued: &crate::testing::Issued| {
            let pem = format!("{}{}", issued.cert_pem, issued.key_pem);
            std::fs::write(&combined, pem).unwrap();
        };
        let first = pki.issue("localhost");
        write_combined(&first);

        let paths = CredentialPaths::from_dir(dir.path())
            .with_certificate_file(&combined)
            .with_key_file(&combined);
        let stop = CancellationToken::new();
        let watcher = CertificateWatcher::watch_files(stop.clone(), paths).unwrap();
        assert_eq!(leaf(&watcher), first.cert_der);

        let rotated = pki.issue("localhost");
        write_combined(&rotated);

        wait_until(|| leaf(&watcher) == rotated.cert_der).await;

        stop.cancel();
    }

    #[tokio::test]
    async fn watch_folder_picks_up_real_file_changes() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        pki.write(dir.path(), &pki.issue("localhost"));
        let stop = CancellationToken::new();

        let watcher = CertificateWatcher::watch_folder(stop.clone(), dir.path()).unwrap();
        let mut updates = watcher.updated();

        let rotated = pki.issue("localhost");
        pki.write(dir.path(), &rotated);

        // Intermediate half-written states may fail to load; the final pair must win.
        wait_until(|| leaf(&watcher) == rotated.cert_der).await;
        assert!(updates.changed().await.unwrap() >= 1);

        stop.cancel();
    }
}
