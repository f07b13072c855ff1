use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use pomodoro_lib::engine::{
    config::UpdaterConfig,
    platform::OsIdentifier,
    updater::{
        ApplyOutcome, ArchiveFormat, FailureKind, PackageInstaller, RetrievedArtifact, RunOutcome,
        UpdateError, UpdateOrchestrator, UpdateState, VersionId, VersionStore,
    },
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

#[derive(Clone, Copy)]
enum Framing {
    Urls,
    Inline,
}

#[derive(Clone)]
struct Release {
    version: String,
    package: Vec<u8>,
    checksum: String,
    framing: Framing,
}

#[derive(Default)]
struct ServiceState {
    release: Mutex<Option<Release>>,
    unavailable: AtomicBool,
    manifest_requests: AtomicUsize,
    package_fetches: AtomicUsize,
    delay_ms: AtomicUsize,
}

/// Release-lookup service stand-in serving one release on an ephemeral port
struct FakeService {
    url: String,
    state: Arc<ServiceState>,
}

impl FakeService {
    fn start(release: Option<Release>) -> Self {
        let state = Arc::new(ServiceState::default());
        *state.release.lock().unwrap() = release;

        let app = Router::new()
            .route("/check-version", get(check_version))
            .route("/get-update", get(get_update))
            .route("/files/package.zip", get(package))
            .route("/files/package.zip.sha256", get(checksum))
            .with_state(state.clone());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                axum::serve(listener, app).await.unwrap();
            });
        });

        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    fn package_fetches(&self) -> usize {
        self.state.package_fetches.load(Ordering::SeqCst)
    }
}

async fn check_version(State(state): State<Arc<ServiceState>>) -> Response {
    match state.release.lock().unwrap().clone() {
        Some(release) => Json(serde_json::json!({ "version": release.version })).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_update(
    State(state): State<Arc<ServiceState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.manifest_requests.fetch_add(1, Ordering::SeqCst);

    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
    }
    if state.unavailable.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let current_os = OsIdentifier::current().unwrap();
    if params.get("os_version").map(String::as_str) != Some(current_os.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(release) = state.release.lock().unwrap().clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let body = match release.framing {
        Framing::Urls => serde_json::json!({
            "version": release.version,
            "download_url": "/files/package.zip",
            "checksum_url": "/files/package.zip.sha256",
        }),
        Framing::Inline => serde_json::json!({
            "version": release.version,
            "download_zip": STANDARD.encode(&release.package),
            "checksum_zip": STANDARD.encode(release.checksum.as_bytes()),
        }),
    };
    Json(body).into_response()
}

async fn package(State(state): State<Arc<ServiceState>>) -> Response {
    state.package_fetches.fetch_add(1, Ordering::SeqCst);
    match state.release.lock().unwrap().clone() {
        Some(release) => release.package.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn checksum(State(state): State<Arc<ServiceState>>) -> Response {
    match state.release.lock().unwrap().clone() {
        Some(release) => release.checksum.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn release(version: &str, framing: Framing) -> Release {
    let package = build_zip(&[
        ("pomodoro", b"timer v2 binary"),
        ("assets/backdrop.png", b"backdrop"),
        ("assets/ArialRoundedMTBold.ttf", b"font"),
    ]);
    let checksum = format!("{}  update-linux.zip\n", sha256_hex(&package));
    Release {
        version: version.to_string(),
        package,
        checksum,
        framing,
    }
}

/// Temp base dir with `dist/` holding a v1.0 install
fn installed_base(version: Option<&str>) -> (tempfile::TempDir, UpdaterConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = UpdaterConfig::for_base_dir(dir.path());

    fs::create_dir_all(config.install_dir.join("assets")).unwrap();
    fs::write(config.install_dir.join("pomodoro"), "timer v1 binary").unwrap();
    fs::write(config.install_dir.join("assets/old-button.png"), "button").unwrap();
    if let Some(v) = version {
        fs::write(&config.version_file, v).unwrap();
    }
    (dir, config)
}

fn orchestrator(config: &UpdaterConfig, service: &FakeService) -> UpdateOrchestrator {
    let mut config = config.clone();
    config.service_url = service.url.clone();
    config.request_timeout_secs = 10;
    UpdateOrchestrator::new(config).unwrap()
}

/// Relative path -> contents for every file under `dir`
fn tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeMap<String, Vec<u8>>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
                out.insert(rel, fs::read(&path).unwrap());
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, dir, &mut out);
    out
}

/// Relative path -> modification time for everything under `dir`
fn mtimes(dir: &Path) -> BTreeMap<PathBuf, SystemTime> {
    fn walk(dir: &Path, out: &mut BTreeMap<PathBuf, SystemTime>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let meta = fs::metadata(&path).unwrap();
            out.insert(path.clone(), meta.modified().unwrap());
            if meta.is_dir() {
                walk(&path, out);
            }
        }
    }
    let mut out = BTreeMap::new();
    walk(dir, &mut out);
    out
}

fn read_version(config: &UpdaterConfig) -> Option<VersionId> {
    VersionStore::new(config.version_file.clone()).read()
}

#[test]
fn test_install_round_trip_with_urls() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    let (_dir, mut config) = installed_base(Some("v1.0"));
    config.launch_executable = Some(PathBuf::from("pomodoro"));
    let orch = orchestrator(&config, &service);

    let restart = match orch.check_and_apply() {
        ApplyOutcome::Updated { restart } => restart,
        other => panic!("unexpected outcome: {:?}", other),
    };
    assert_eq!(restart.version, VersionId::new("v2.0"));
    assert_eq!(restart.install_dir, config.install_dir);
    assert!(restart.executable.as_ref().unwrap().exists());

    assert_eq!(read_version(&config), Some(VersionId::new("v2.0")));
    assert_eq!(orch.state(), UpdateState::Complete);

    let installed = tree(&config.install_dir);
    let names: Vec<&str> = installed.keys().map(String::as_str).collect();
    assert_eq!(
        names,
        vec!["assets/ArialRoundedMTBold.ttf", "assets/backdrop.png", "pomodoro"]
    );
    assert_eq!(installed["pomodoro"], b"timer v2 binary");

    // Previous installation kept in the backup slot
    let snapshot = tree(&config.backup_dir().join("snapshot"));
    assert_eq!(snapshot["pomodoro"], b"timer v1 binary");
    assert_eq!(
        orch.backup_record().unwrap().version,
        Some(VersionId::new("v1.0"))
    );

    // Scratch payloads and staging area are gone
    assert!(!config.staging_dir().exists());
    let scratch_left = fs::read_dir(config.scratch_dir())
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(scratch_left, 0);
}

#[cfg(unix)]
#[test]
fn test_installed_files_are_executable() {
    use std::os::unix::fs::PermissionsExt;

    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    let (_dir, config) = installed_base(Some("v1.0"));
    let orch = orchestrator(&config, &service);

    assert!(matches!(orch.run(), Ok(RunOutcome::Installed(_))));
    let mode = fs::metadata(config.install_dir.join("pomodoro"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o744);
}

#[test]
fn test_install_with_inline_base64_framing() {
    let service = FakeService::start(Some(release("v2.0", Framing::Inline)));
    let (_dir, config) = installed_base(Some("v1.0"));
    let orch = orchestrator(&config, &service);

    assert!(matches!(orch.run(), Ok(RunOutcome::Installed(_))));
    assert_eq!(read_version(&config), Some(VersionId::new("v2.0")));
    assert_eq!(tree(&config.install_dir)["pomodoro"], b"timer v2 binary");
    assert_eq!(service.package_fetches(), 0);
}

#[test]
fn test_first_install_without_version_file() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    let dir = tempfile::tempdir().unwrap();
    let config = UpdaterConfig::for_base_dir(dir.path());
    let orch = orchestrator(&config, &service);

    assert!(matches!(orch.run(), Ok(RunOutcome::Installed(_))));
    assert_eq!(read_version(&config), Some(VersionId::new("v2.0")));
    assert!(!orch.backup_record().unwrap().had_installation);
}

#[test]
fn test_up_to_date_skips_package_fetch() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    let (_dir, config) = installed_base(Some("v2.0"));
    let orch = orchestrator(&config, &service);

    assert!(matches!(orch.check(), Ok(None)));
    assert_eq!(orch.check_and_apply(), ApplyOutcome::UpToDate);
    assert_eq!(service.package_fetches(), 0);
    assert_eq!(orch.state(), UpdateState::Complete);
}

#[test]
fn test_repeated_apply_when_current_writes_nothing() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    let (dir, config) = installed_base(Some("v2.0"));
    let orch = orchestrator(&config, &service);

    assert_eq!(orch.check_and_apply(), ApplyOutcome::UpToDate);
    let before = mtimes(dir.path());
    let contents_before = tree(dir.path());

    assert_eq!(orch.check_and_apply(), ApplyOutcome::UpToDate);
    assert_eq!(mtimes(dir.path()), before);
    assert_eq!(tree(dir.path()), contents_before);
    assert_eq!(service.state.manifest_requests.load(Ordering::SeqCst), 2);
}

#[test]
fn test_checksum_mismatch_never_installs() {
    let mut bad = release("v2.0", Framing::Urls);
    bad.checksum = "abc123...  update-linux.zip".to_string();
    let service = FakeService::start(Some(bad));
    let (_dir, config) = installed_base(Some("v1.0"));
    let before = tree(&config.install_dir);
    let orch = orchestrator(&config, &service);

    match orch.check_and_apply() {
        ApplyOutcome::Failed { reason } => {
            assert_eq!(reason.kind, FailureKind::ChecksumMismatch);
            assert!(!reason.retryable);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert_eq!(orch.state(), UpdateState::Failed);
    assert_eq!(fs::read_to_string(&config.version_file).unwrap(), "v1.0");
    assert_eq!(tree(&config.install_dir), before);
    // Commit never ran, so no backup was taken
    assert!(orch.backup_record().is_none());
    assert!(!config.staging_dir().exists());
    // Downloaded artifact was discarded
    assert!(!config.scratch_dir().join("package.zip").exists());
}

#[test]
fn test_empty_package_is_corrupt_download() {
    let mut empty = release("v2.0", Framing::Urls);
    empty.package = Vec::new();
    let service = FakeService::start(Some(empty));
    let (_dir, config) = installed_base(Some("v1.0"));
    let orch = orchestrator(&config, &service);

    match orch.run() {
        Err(UpdateError::CorruptDownload(_)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(read_version(&config), Some(VersionId::new("v1.0")));
    assert_eq!(service.package_fetches(), 1);
}

#[test]
fn test_missing_release_is_up_to_date() {
    let service = FakeService::start(None);
    let (_dir, config) = installed_base(Some("v1.0"));
    let orch = orchestrator(&config, &service);

    assert_eq!(orch.check_and_apply(), ApplyOutcome::UpToDate);
    assert_eq!(read_version(&config), Some(VersionId::new("v1.0")));
}

#[test]
fn test_service_outage_is_retryable() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    service.state.unavailable.store(true, Ordering::SeqCst);
    let (_dir, config) = installed_base(Some("v1.0"));
    let orch = orchestrator(&config, &service);

    match orch.check_and_apply() {
        ApplyOutcome::Failed { reason } => {
            assert_eq!(reason.kind, FailureKind::TransientFetch);
            assert!(reason.retryable);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    // Host retries once the service is back
    service.state.unavailable.store(false, Ordering::SeqCst);
    assert!(matches!(orch.check_and_apply(), ApplyOutcome::Updated { .. }));
}

#[test]
fn test_interrupted_after_staging_leaves_install_untouched() {
    let rel = release("v2.0", Framing::Urls);
    let (_dir, config) = installed_base(Some("v1.0"));
    let before = tree(&config.install_dir);

    // Stage a package, then stop before commit as if the process had been killed
    {
        let installer = PackageInstaller::from_config(&config);
        let artifact =
            RetrievedArtifact::from_bytes(&config.scratch_dir(), "package.zip", &rel.package)
                .unwrap();
        let staging = installer.extract(&artifact, ArchiveFormat::Zip).unwrap();
        assert!(staging.path().join("pomodoro").exists());
    }

    assert_eq!(tree(&config.install_dir), before);
    assert_eq!(fs::read_to_string(&config.version_file).unwrap(), "v1.0");
    assert!(config.staging_dir().exists());

    // The next cycle discards the stale staging area and installs normally
    let service = FakeService::start(Some(rel));
    let orch = orchestrator(&config, &service);
    assert!(matches!(orch.run(), Ok(RunOutcome::Installed(_))));
    assert_eq!(read_version(&config), Some(VersionId::new("v2.0")));
    assert!(!config.staging_dir().exists());
}

#[test]
fn test_second_run_rejected_while_first_in_flight() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    service.state.delay_ms.store(500, Ordering::SeqCst);
    let (_dir, config) = installed_base(Some("v2.0"));
    let orch = Arc::new(orchestrator(&config, &service));

    let first = {
        let orch = orch.clone();
        std::thread::spawn(move || orch.run())
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while orch.state() != UpdateState::Checking {
        assert!(Instant::now() < deadline, "first run never started checking");
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(matches!(orch.run(), Err(UpdateError::AlreadyRunning)));
    assert!(matches!(first.join().unwrap(), Ok(RunOutcome::UpToDate)));

    // Free again once the first run finished
    assert!(matches!(orch.run(), Ok(RunOutcome::UpToDate)));
}

#[test]
fn test_status_events_follow_state_machine() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    let (_dir, config) = installed_base(Some("v1.0"));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let orch = orchestrator(&config, &service).with_observer(move |event| {
        assert!(!event.message.is_empty());
        sink.lock().unwrap().push(event.state);
    });

    assert!(matches!(orch.run(), Ok(RunOutcome::Installed(_))));
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            UpdateState::Idle,
            UpdateState::Checking,
            UpdateState::Fetching,
            UpdateState::Verifying,
            UpdateState::Installing,
            UpdateState::Complete,
        ]
    );
}

#[test]
fn test_older_release_ignored_without_downgrade() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    let (_dir, mut config) = installed_base(Some("v3.0"));
    config.allow_downgrade = false;
    let orch = orchestrator(&config, &service);

    assert_eq!(orch.check_and_apply(), ApplyOutcome::UpToDate);
    assert_eq!(service.package_fetches(), 0);
    assert_eq!(read_version(&config), Some(VersionId::new("v3.0")));
}

#[test]
fn test_latest_version_probe() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    let (_dir, config) = installed_base(Some("v1.0"));
    let orch = orchestrator(&config, &service);

    assert_eq!(orch.client().latest_version().unwrap(), VersionId::new("v2.0"));
}

#[test]
fn test_version_write_failure_restores_previous_install() {
    let service = FakeService::start(Some(release("v2.0", Framing::Urls)));
    let (_dir, config) = installed_base(None);
    // A directory where the version file belongs makes the post-swap write fail
    fs::create_dir_all(&config.version_file).unwrap();
    let before = tree(&config.install_dir);
    let orch = orchestrator(&config, &service);

    match orch.check_and_apply() {
        ApplyOutcome::Failed { reason } => {
            assert_eq!(reason.kind, FailureKind::InstallFailure);
            assert!(!reason.retryable);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert_eq!(orch.state(), UpdateState::Failed);
    assert_eq!(tree(&config.install_dir), before);
    assert!(config.version_file.is_dir());
    assert!(read_version(&config).is_none());

    let installer = PackageInstaller::from_config(&config);
    assert!(installer.is_consistent(&config.install_dir));
    assert!(orch.backup_record().unwrap().had_installation);
}

#[test]
fn test_unreadable_package_leaves_install_untouched() {
    let package = b"definitely not a zip archive".to_vec();
    let checksum = format!("{}  update-linux.zip", sha256_hex(&package));
    let service = FakeService::start(Some(Release {
        version: "v2.0".to_string(),
        package,
        checksum,
        framing: Framing::Urls,
    }));
    let (_dir, config) = installed_base(Some("v1.0"));
    let before = tree(&config.install_dir);
    let orch = orchestrator(&config, &service);

    match orch.run() {
        Err(UpdateError::InstallFailure(msg)) => assert!(msg.contains("zip"), "{}", msg),
        other => panic!("unexpected result: {:?}", other),
    }

    assert_eq!(tree(&config.install_dir), before);
    assert_eq!(read_version(&config), Some(VersionId::new("v1.0")));
    // Extraction failed before commit, so nothing was backed up or restored
    assert!(orch.backup_record().is_none());
    assert!(PackageInstaller::from_config(&config).is_consistent(&config.install_dir));
}
