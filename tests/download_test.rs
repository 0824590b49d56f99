// tests/download_test.rs

//! Download pipeline driven through a manual transport

mod common;

use common::{
    Fixture, SHA256_HELLO, fixture_configured, fixture_with, install_op, installed, repo_url,
    repository,
};
use pkgqueue::catalog::{Catalog, Repository};
use pkgqueue::download::{DownloadOverrideProvider, OverrideDecision, TransferEvent};
use pkgqueue::packages::{Origin, Package};
use pkgqueue::solver::{LOCAL_ARCHIVE_HOST, SolverOperation};
use pkgqueue::{AddOutcome, Queue};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const HOST: &str = "repo.example.com";

fn fixture(max_parallel: usize) -> Fixture {
    fixture_with(max_parallel, |dir, catalog| {
        let hashed = format!("SHA256: {}\nSize: 5", SHA256_HELLO);
        let bad_hash = format!("SHA256: {}", "0".repeat(64));
        let bad_size = format!("SHA256: {}\nSize: 6", SHA256_HELLO);
        catalog.add_repository(repository(
            &dir.join("sources"),
            HOST,
            &[
                ("A", "1.0", hashed.as_str()),
                ("B", "1.0", hashed.as_str()),
                ("C", "1.0", hashed.as_str()),
                ("D", "1.0", hashed.as_str()),
                ("bad", "1.0", bad_hash.as_str()),
                ("big", "1.0", bad_size.as_str()),
            ],
        ));
    })
}

/// Queue `ids` for installation and recheck with a plan installing exactly them
fn plan(f: &Fixture, ids: &[&str]) {
    for id in ids {
        assert_eq!(
            f.manager.add(f.package(id), Queue::Installations, false),
            AddOutcome::Added
        );
    }
    f.solver.script(
        ids.iter().map(|id| install_op(id, "1.0", HOST)).collect(),
        Vec::new(),
    );
    f.manager.reload_data_and_wait(true).unwrap();
}

fn start(f: &Fixture) {
    f.manager.start_more_downloads();
    f.manager.barrier();
}

fn pool_file(id: &str) -> String {
    format!("pool/{}_1.0_all.deb", id)
}

#[test]
fn test_recheck_starts_downloads() {
    let f = fixture(2);
    f.manager.add(f.package("A"), Queue::Installations, false);
    f.solver.script(vec![install_op("A", "1.0", HOST)], Vec::new());

    f.manager.reload_data_and_wait(true).unwrap();
    f.manager.barrier();

    assert_eq!(f.transport.started(), 1);
    assert_eq!(f.manager.in_flight(), 1);
    assert!(f.manager.queued_download("A").unwrap().started);
}

#[test]
fn test_reload_without_auto_start_waits_for_caller() {
    let f = fixture_configured(
        2,
        |dir, catalog| {
            catalog.add_repository(repository(&dir.join("sources"), HOST, &[("A", "1.0", "")]));
        },
        |_| {},
        |builder| builder.start_downloads_on_reload(false),
    );
    f.manager.add(f.package("A"), Queue::Installations, false);
    f.solver.script(vec![install_op("A", "1.0", HOST)], Vec::new());

    f.manager.reload_data_and_wait(true).unwrap();
    f.manager.barrier();
    assert_eq!(f.transport.started(), 0);

    start(&f);
    assert_eq!(f.transport.started(), 1);
}

#[test]
fn test_failed_recheck_starts_nothing() {
    let f = fixture(2);
    f.manager.add(f.package("A"), Queue::Installations, false);
    f.solver.fail();

    assert!(f.manager.reload_data_and_wait(true).is_err());
    f.manager.barrier();

    assert_eq!(f.transport.started(), 0);
}

#[test]
fn test_parallel_downloads_respect_the_cap() {
    let f = fixture(2);
    plan(&f, &["A", "B", "C", "D"]);
    let scratch = f.scratch();

    assert_eq!(f.transport.started(), 2);
    assert_eq!(f.manager.in_flight(), 2);

    for id in ["A", "B", "C", "D"] {
        let index = f.transport.index_of(&pool_file(id));
        f.transport.succeed(index, &scratch, b"hello");
        f.manager.barrier();
        assert!(f.manager.in_flight() <= 2);
    }

    assert!(f.manager.wait_until_settled(Duration::from_secs(5)));
    assert_eq!(f.transport.started(), 4);
    assert_eq!(f.manager.in_flight(), 0);
    assert_eq!(f.manager.ready_packages(), 4);
    assert_eq!(f.manager.downloading_packages(), 0);
    assert!(f.manager.verify_complete());
    assert!(f.observer.ready_count() >= 1);
    assert_eq!(f.manager.cached_download_files().len(), 4);
    assert!(f.archive_dir().join("A_1.0_all.deb").exists());
    assert_eq!(
        f.package("A").local_archive(),
        Some(f.archive_dir().join("A_1.0_all.deb"))
    );
}

#[test]
fn test_download_urls_and_headers() {
    let f = fixture(2);
    plan(&f, &["A"]);


    assert_eq!(
        f.transport.urls(),
        vec![format!("https://{}/{}", HOST, pool_file("A"))]
    );
    assert!(
        f.transport
            .headers(0)
            .contains(&("User-Agent".to_string(), "pkgqueue-tests".to_string()))
    );
    assert!(f.manager.queued_download("A").unwrap().started);
}

#[test]
fn test_progress_and_waiting_messages() {
    let f = fixture(2);
    plan(&f, &["A"]);

    f.transport
        .emit(0, TransferEvent::Waiting(format!("Connecting to {}", HOST)));
    f.manager.barrier();
    let waiting = f.manager.queued_download("A").unwrap();
    assert_eq!(waiting.message.as_deref(), Some("Connecting to repo.example.com"));

    f.transport.emit(
        0,
        TransferEvent::Progress {
            bytes_delta: 5,
            total_written: 5,
            total_expected: Some(10),
        },
    );
    f.manager.barrier();
    let progress = f.manager.queued_download("A").unwrap();
    assert_eq!(progress.message, None);
    assert_eq!(progress.total_bytes_written, 5);
    assert_eq!(progress.total_bytes_expected, Some(10));
    assert!((progress.progress - 0.5).abs() < f64::EPSILON);
    assert_eq!(f.manager.downloading_packages(), 1);
}

#[test]
fn test_hash_mismatch_fails_the_package() {
    let f = fixture(2);
    plan(&f, &["bad"]);

    let downloaded = f.transport.succeed(0, &f.scratch(), b"hello");
    f.manager.barrier();

    let download = f.manager.queued_download("bad").unwrap();
    assert!(!download.success);
    assert!(download.completed);
    assert_eq!(download.progress, 0.0);
    assert!(download.failure_reason.unwrap().contains("Hash mismatch"));
    assert!(!downloaded.exists());
    assert_eq!(f.manager.find("bad"), Some(Queue::Installations));
    assert!(!f.manager.verify_complete());
    assert_eq!(f.observer.ready_count(), 0);
    assert!(f.manager.cached_download_files().is_empty());
}

#[test]
fn test_size_mismatch_fails_the_package() {
    let f = fixture(2);
    plan(&f, &["big"]);

    f.transport.succeed(0, &f.scratch(), b"hello");
    f.manager.barrier();

    let download = f.manager.queued_download("big").unwrap();
    assert!(!download.success);
    assert!(download.failure_reason.unwrap().contains("Size mismatch"));
}

#[test]
fn test_http_failure_and_retry() {
    let f = fixture(2);
    plan(&f, &["A"]);

    f.transport.fail(0, 404);
    f.manager.barrier();

    let failed = f.manager.queued_download("A").unwrap();
    assert_eq!(
        failed.failure_reason.as_deref(),
        Some("Download failed with status code 404")
    );
    assert_eq!(f.manager.in_flight(), 0);
    assert!(f.manager.wait_until_settled(Duration::from_secs(5)));

    assert!(f.manager.retry_download("A"));
    f.manager.barrier();
    assert_eq!(f.transport.started(), 2);

    f.transport.succeed(1, &f.scratch(), b"hello");
    f.manager.barrier();
    assert!(f.manager.queued_download("A").unwrap().success);
    assert!(!f.manager.retry_download("A"));
}

#[test]
fn test_first_terminal_event_wins() {
    let f = fixture(2);
    plan(&f, &["A"]);

    f.transport.succeed(0, &f.scratch(), b"hello");
    f.transport.fail(0, 500);
    f.manager.barrier();

    let download = f.manager.queued_download("A").unwrap();
    assert!(download.success);
    assert_eq!(download.failure_reason, None);
    assert_eq!(f.manager.in_flight(), 0);
}

#[test]
fn test_cancel_drops_stale_events() {
    let f = fixture(2);
    plan(&f, &["A"]);
    let session = f.manager.session();

    f.manager.cancel_downloads();

    assert_eq!(f.manager.session(), session + 1);
    assert!(f.transport.is_cancelled(0));
    assert!(f.manager.queued_download("A").is_none());
    assert_eq!(f.manager.in_flight(), 0);

    let late = f.transport.succeed(0, &f.scratch(), b"hello");
    f.manager.barrier();

    assert!(f.manager.queued_download("A").is_none());
    assert!(!f.observer.saw_success("A"));
    assert!(!late.exists());
    assert_eq!(f.manager.find("A"), Some(Queue::Installations));

    start(&f);
    assert_eq!(f.transport.started(), 2);
    assert!(f.manager.queued_download("A").unwrap().started);
}

#[test]
fn test_locked_queue_starts_nothing() {
    let f = fixture(2);
    f.manager.add(f.package("A"), Queue::Installations, false);
    f.manager.set_locked_for_installation(true);
    f.solver.script(vec![install_op("A", "1.0", HOST)], Vec::new());

    f.manager.reload_data_and_wait(true).unwrap();
    start(&f);
    assert_eq!(f.transport.started(), 0);
    assert_eq!(f.manager.find("A"), Some(Queue::Installations));
    assert!(f.manager.wait_until_settled(Duration::from_millis(200)));

    f.manager.set_locked_for_installation(false);
    f.manager.barrier();
    assert_eq!(f.transport.started(), 1);
}

struct PaidRepository;

impl DownloadOverrideProvider for PaidRepository {
    fn download_url(&self, package: &Package, _repo: &Repository) -> OverrideDecision {
        match package.id.as_str() {
            "A" => OverrideDecision::Url(
                Url::parse("https://cdn.example.com/signed/A.deb?token=1").unwrap(),
            ),
            "B" => OverrideDecision::Fail("not purchased".to_string()),
            _ => OverrideDecision::Decline,
        }
    }
}

#[test]
fn test_override_provider_decides_url() {
    let f = fixture(3);
    let token = f
        .manager
        .register_override_provider(Arc::new(PaidRepository), &repo_url(HOST));
    plan(&f, &["A", "B", "C"]);


    let urls = f.transport.urls();
    assert_eq!(urls.len(), 2);
    assert!(urls.contains(&"https://cdn.example.com/signed/A.deb?token=1".to_string()));
    assert!(urls.contains(&format!("https://{}/{}", HOST, pool_file("C"))));
    let refused = f.manager.queued_download("B").unwrap();
    assert_eq!(refused.failure_reason.as_deref(), Some("not purchased"));
    assert!(refused.completed);

    f.manager.deregister_override_provider(token);
    assert!(f.manager.retry_download("B"));
    f.manager.barrier();
    f.transport.index_of(&pool_file("B"));
}

#[test]
fn test_local_archive_skips_transport() {
    let f = fixture_with(2, |dir, catalog| {
        let deb = dir.join("local.deb");
        fs::write(&deb, b"hello").unwrap();
        catalog.add_local(
            Package::from_control(
                "Package: L\nVersion: 1.0\nArchitecture: all\n",
                Origin::Local { path: deb },
            )
            .unwrap(),
        );
    });
    let local = f.catalog.local_package("L").unwrap();
    f.manager.add(local.clone(), Queue::Installations, false);
    f.solver.script(
        vec![SolverOperation::install("L", "1.0", Some(LOCAL_ARCHIVE_HOST))],
        Vec::new(),
    );
    f.manager.reload_data_and_wait(true).unwrap();


    let cached = f.archive_dir().join("L_1.0_all.deb");
    assert_eq!(f.transport.started(), 0);
    assert!(f.manager.queued_download("L").unwrap().success);
    assert!(cached.exists());
    assert!(!f.dir.path().join("local.deb").exists());
    assert_eq!(local.local_archive(), Some(cached.clone()));
    assert_eq!(f.manager.cached_download_files(), vec![cached]);
    assert_eq!(f.observer.ready_count(), 1);
}

#[test]
fn test_unplaceable_local_archive_ignores_stale_cache_file() {
    let f = fixture_with(2, |dir, catalog| {
        catalog.add_local(
            Package::from_control(
                "Package: L\nVersion: 1.0\nArchitecture: all\n",
                Origin::Local {
                    path: dir.join("missing.deb"),
                },
            )
            .unwrap(),
        );
    });
    let stale = f.archive_dir().join("L_1.0_all.deb");
    fs::create_dir_all(f.archive_dir()).unwrap();
    fs::write(&stale, b"left over").unwrap();

    let local = f.catalog.local_package("L").unwrap();
    f.manager.add(local, Queue::Installations, false);
    f.solver.script(
        vec![SolverOperation::install("L", "1.0", Some(LOCAL_ARCHIVE_HOST))],
        Vec::new(),
    );
    f.manager.reload_data_and_wait(true).unwrap();
    f.manager.barrier();

    let download = f.manager.queued_download("L").unwrap();
    assert!(!download.success);
    assert!(download.completed);
    assert_eq!(
        download.failure_reason.as_deref(),
        Some("Package L is untrusted")
    );
    assert_eq!(f.transport.started(), 0);
    assert!(f.manager.cached_download_files().is_empty());
    assert_eq!(f.observer.ready_count(), 0);
}

#[test]
fn test_verified_cache_hit_skips_transport() {
    let f = fixture(2);
    fs::create_dir_all(f.archive_dir()).unwrap();
    fs::write(f.archive_dir().join("A_1.0_all.deb"), b"hello").unwrap();
    plan(&f, &["A"]);


    assert_eq!(f.transport.started(), 0);
    assert!(f.manager.queued_download("A").unwrap().success);
    assert!(f.manager.verify_complete());
}

#[test]
fn test_install_and_download_scenario() {
    let f = fixture_with(2, |dir, catalog| {
        let hashed = format!("SHA256: {}", SHA256_HELLO);
        catalog.add_repository(repository(
            &dir.join("sources"),
            HOST,
            &[
                ("app", "2.0", format!("Depends: libfoo\n{}", hashed).as_str()),
                ("libfoo", "1.1", hashed.as_str()),
            ],
        ));
        catalog.set_installed(vec![installed("legacy", "0.5", "Conflicts: libfoo")]);
    });

    f.manager.add(f.package("app"), Queue::Installations, false);
    f.solver.script(
        vec![
            SolverOperation::install("app", "2.0", Some("repo.example.com [all]")),
            SolverOperation::install("libfoo", "1.1", Some("repo.example.com [all]")),
            SolverOperation::remove("legacy", "0.5"),
        ],
        Vec::new(),
    );
    f.manager.reload_data_and_wait(true).unwrap();

    assert_eq!(f.manager.find("app"), Some(Queue::Installations));
    assert_eq!(f.manager.find("libfoo"), Some(Queue::InstallDeps));
    assert_eq!(f.manager.find("legacy"), Some(Queue::UninstallDeps));
    assert_eq!(f.manager.operation_count(), 3);

    assert_eq!(f.transport.started(), 2);
    let scratch = f.scratch();
    f.transport.succeed(0, &scratch, b"hello");
    f.transport.succeed(1, &scratch, b"hello");

    assert!(f.manager.wait_until_settled(Duration::from_secs(5)));
    assert!(f.manager.verify_complete());
    assert_eq!(f.manager.ready_packages(), 2);
    assert!(f.observer.ready_count() >= 1);

    f.manager.set_locked_for_installation(true);
    assert_eq!(
        f.manager.add(f.package("libfoo"), Queue::Upgrades, false),
        AddOutcome::Locked
    );
}
