// tests/mirror.rs

//! End-to-end mirroring runs against synthetic repositories

mod common;

use common::{DATE_1, DATE_2, FakePackage, MemoryTransport, RepoBuilder};
use debmirror::hash::hash_bytes;
use debmirror::mirror::RepoSnapshot;
use debmirror::{CheckMode, DistOutcome, HashAlgorithm, Mirror, MirrorConfig, RunSummary};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn packages() -> Vec<FakePackage> {
    vec![
        FakePackage::new("hello", b"hello package payload"),
        FakePackage::new("tzdata", b"tzdata package payload, a bit longer"),
    ]
}

fn config(upstream: &Path, cache: &Path, mode: CheckMode, dists: &[&str]) -> MirrorConfig {
    let mut config = MirrorConfig::new(upstream.to_str().unwrap(), cache);
    config.check_mode = mode;
    config.distributions = dists.iter().map(|d| d.to_string()).collect();
    config.concurrency = Some(4);
    config
}

async fn run(upstream: &Path, cache: &Path, mode: CheckMode, dists: &[&str]) -> RunSummary {
    Mirror::new(config(upstream, cache, mode, dists))
        .unwrap()
        .run()
        .await
        .unwrap()
}

fn upstream(repo: &RepoBuilder) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    repo.write_to(dir.path());
    dir
}

fn read_state(cache: &Path) -> RepoSnapshot {
    let text = std::fs::read_to_string(cache.join("repo.json")).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_first_run_mirrors_everything() {
    let mut repo = RepoBuilder::new();
    repo.dist("stable", DATE_1, &packages(), false);
    let upstream = upstream(&repo);
    let cache = tempfile::tempdir().unwrap();

    let summary = run(upstream.path(), cache.path(), CheckMode::Size, &["stable"]).await;

    assert_eq!(summary.outcome("stable"), Some(&DistOutcome::Mirrored));
    // Contents, i18n Index, Translation-en, Translation-de, Packages.gz, two debs
    assert_eq!(summary.transfers.fetched, 7);
    assert_eq!(summary.transfers.corrupt, 0);
    assert_eq!(summary.transfers.failed, 0);

    for package in packages() {
        let local = cache.path().join(package.pool_path());
        assert_eq!(std::fs::read(local).unwrap(), package.data);
    }
    for path in [
        "dists/stable/Release",
        "dists/stable/Contents-amd64.gz",
        "dists/stable/main/binary-amd64/Packages.gz",
        "dists/stable/main/i18n/Index",
        "dists/stable/main/i18n/Translation-en",
        "dists/stable/main/i18n/Translation-de",
    ] {
        assert!(cache.path().join(path).is_file(), "{path} missing");
    }
    assert_eq!(
        std::fs::read(cache.path().join("dists/stable/Release")).unwrap(),
        repo.files()["dists/stable/Release"]
    );

    let state = read_state(cache.path());
    assert!(!state.running);
    let main = &state.dists["stable"].components["main"];
    assert_eq!(main.packages, 2);
    let total: usize = packages().iter().map(|p| p.data.len()).sum();
    assert_eq!(main.size, total as u64);
    assert_eq!(main.human_size, format!("{total}.00 B"));
}

#[tokio::test]
async fn test_second_run_fetches_nothing() {
    let mut repo = RepoBuilder::new();
    repo.dist("stable", DATE_1, &packages(), false);
    let upstream = upstream(&repo);
    let cache = tempfile::tempdir().unwrap();

    for mode in [CheckMode::Size, CheckMode::Sha256, CheckMode::Md5] {
        run(upstream.path(), cache.path(), mode, &["stable"]).await;
        let again = run(upstream.path(), cache.path(), mode, &["stable"]).await;

        assert_eq!(again.outcome("stable"), Some(&DistOutcome::Mirrored));
        assert_eq!(again.transfers.fetched, 0, "{mode} re-fetched files");
        assert_eq!(again.transfers.up_to_date, 7);
        // Counters restart each run and still count every package
        assert_eq!(read_state(cache.path()).dists["stable"].components["main"].packages, 2);
    }
}

#[tokio::test]
async fn test_release_date_mode_skips_unchanged_dist() {
    let mut repo = RepoBuilder::new();
    repo.dist("stable", DATE_1, &packages(), false);
    let upstream_dir = upstream(&repo);
    let cache = tempfile::tempdir().unwrap();

    let first = run(upstream_dir.path(), cache.path(), CheckMode::ReleaseDate, &["stable"]).await;
    assert_eq!(first.outcome("stable"), Some(&DistOutcome::Mirrored));

    let second = run(upstream_dir.path(), cache.path(), CheckMode::ReleaseDate, &["stable"]).await;
    assert_eq!(second.outcome("stable"), Some(&DistOutcome::UpToDate));
    assert_eq!(second.transfers.fetched, 0);
    assert_eq!(second.transfers.up_to_date, 0);

    // Counters of the skipped distribution carry over
    let state = read_state(cache.path());
    assert_eq!(state.dists["stable"].components["main"].packages, 2);

    // A new publication date triggers a full pass
    let mut newer = RepoBuilder::new();
    newer.dist("stable", DATE_2, &packages(), false);
    newer.write_to(upstream_dir.path());
    let third = run(upstream_dir.path(), cache.path(), CheckMode::ReleaseDate, &["stable"]).await;
    assert_eq!(third.outcome("stable"), Some(&DistOutcome::Mirrored));
    assert_eq!(third.transfers.up_to_date, 7);
}

#[tokio::test]
async fn test_size_mismatch_is_corrupt_and_kept() {
    let mut repo = RepoBuilder::new();
    let bad = FakePackage::new("broken", b"twelve bytes").declared_size(10);
    repo.dist("stable", DATE_1, &[bad.clone(), packages()[0].clone()], false);
    let upstream = upstream(&repo);
    let cache = tempfile::tempdir().unwrap();

    let summary = run(upstream.path(), cache.path(), CheckMode::Size, &["stable"]).await;

    assert_eq!(summary.transfers.corrupt, 1);
    assert_eq!(
        std::fs::read(cache.path().join(bad.pool_path())).unwrap(),
        b"twelve bytes"
    );
    // Counted regardless of outcome, with the declared size
    let main = &read_state(cache.path()).dists["stable"].components["main"];
    assert_eq!(main.packages, 2);
    assert_eq!(main.size, 10 + packages()[0].data.len() as u64);

    // Still mismatching on the next run: fetched again, corrupt again
    let again = run(upstream.path(), cache.path(), CheckMode::Size, &["stable"]).await;
    assert_eq!(again.transfers.corrupt, 1);
}

#[tokio::test]
async fn test_missing_dist_does_not_stop_others() {
    let mut repo = RepoBuilder::new();
    repo.dist("stable", DATE_1, &packages(), false);
    let upstream = upstream(&repo);
    let cache = tempfile::tempdir().unwrap();

    let summary = run(
        upstream.path(),
        cache.path(),
        CheckMode::Size,
        &["nope", "stable"],
    )
    .await;

    assert_eq!(summary.outcome("nope"), Some(&DistOutcome::NotFound));
    assert_eq!(summary.outcome("stable"), Some(&DistOutcome::Mirrored));
    assert!(!summary.has_aborted());
    assert!(!cache.path().join("dists/nope").exists());
}

#[tokio::test]
async fn test_missing_package_fails_but_is_counted() {
    let mut repo = RepoBuilder::new();
    let gone = FakePackage::new("gone", b"never published").missing();
    repo.dist("stable", DATE_1, &[gone.clone(), packages()[0].clone()], false);
    let upstream = upstream(&repo);
    let cache = tempfile::tempdir().unwrap();

    let summary = run(upstream.path(), cache.path(), CheckMode::Size, &["stable"]).await;

    assert_eq!(summary.outcome("stable"), Some(&DistOutcome::Mirrored));
    assert_eq!(summary.transfers.failed, 1);
    assert!(!cache.path().join(gone.pool_path()).exists());
    assert_eq!(read_state(cache.path()).dists["stable"].components["main"].packages, 2);
}

#[tokio::test]
async fn test_traversing_filename_is_skipped() {
    let mut repo = RepoBuilder::new();
    let evil = FakePackage::new("evil", b"payload")
        .filename("../../outside.deb")
        .missing();
    repo.dist("stable", DATE_1, &[evil, packages()[0].clone()], false);
    let upstream = upstream(&repo);
    let cache = tempfile::tempdir().unwrap();

    let summary = run(upstream.path(), cache.path(), CheckMode::Size, &["stable"]).await;

    assert_eq!(summary.outcome("stable"), Some(&DistOutcome::Mirrored));
    assert!(cache.path().join(packages()[0].pool_path()).exists());
    assert_eq!(read_state(cache.path()).dists["stable"].components["main"].packages, 1);
}

#[tokio::test]
async fn test_cancelled_run_leaves_release_uncommitted() {
    let mut repo = RepoBuilder::new();
    repo.dist("stable", DATE_1, &packages(), false);
    let upstream = upstream(&repo);
    let cache = tempfile::tempdir().unwrap();

    let mirror = Mirror::new(config(upstream.path(), cache.path(), CheckMode::Size, &["stable"]))
        .unwrap();
    mirror.cancellation_token().cancel();
    let summary = mirror.run().await.unwrap();

    assert_eq!(summary.outcome("stable"), Some(&DistOutcome::Cancelled));
    assert!(!cache.path().join("dists/stable/Release").exists());
    // The final state snapshot is still written
    assert!(!read_state(cache.path()).running);
}

#[tokio::test]
async fn test_architecture_filter_skips_unlisted() {
    let mut repo = RepoBuilder::new();
    repo.dist("stable", DATE_1, &packages(), false);
    let upstream = upstream(&repo);
    let cache = tempfile::tempdir().unwrap();

    let mut config = config(upstream.path(), cache.path(), CheckMode::Size, &["stable"]);
    config.architectures = Some(vec!["arm64".to_string()]);
    let summary = Mirror::new(config).unwrap().run().await.unwrap();

    assert_eq!(summary.outcome("stable"), Some(&DistOutcome::Mirrored));
    assert!(!cache.path().join(packages()[0].pool_path()).exists());
    assert!(!cache.path().join("dists/stable/Contents-amd64.gz").exists());
}

#[tokio::test]
async fn test_by_hash_remote_source() {
    let mut repo = RepoBuilder::new();
    repo.dist("stable", DATE_1, &packages(), true);
    let packages_gz = repo.files()["dists/stable/main/binary-amd64/Packages.gz"].clone();
    let digest = hash_bytes(HashAlgorithm::Sha256, &packages_gz);
    let transport = Arc::new(MemoryTransport::new(&repo));
    let cache = tempfile::tempdir().unwrap();

    let config = config(Path::new("unused"), cache.path(), CheckMode::Sha256, &["stable"]);
    let mirror = Mirror::with_transport(config, transport.clone()).unwrap();
    let summary = mirror.run().await.unwrap();

    assert_eq!(summary.outcome("stable"), Some(&DistOutcome::Mirrored));
    assert_eq!(summary.transfers.corrupt, 0);

    let by_hash_locator = format!("dists/stable/main/binary-amd64/by-hash/SHA256/{digest}");
    let fetched = transport.fetched();
    assert!(fetched.contains(&by_hash_locator), "fetched: {fetched:?}");
    assert!(!fetched.contains(&"dists/stable/main/binary-amd64/Packages.gz".to_string()));

    // Stored under the canonical name and published under by-hash
    assert_eq!(
        std::fs::read(cache.path().join("dists/stable/main/binary-amd64/Packages.gz")).unwrap(),
        packages_gz
    );
    assert_eq!(
        std::fs::read(cache.path().join(&by_hash_locator)).unwrap(),
        packages_gz
    );
    for package in packages() {
        assert!(cache.path().join(package.pool_path()).exists());
    }
}

#[tokio::test]
async fn test_by_hash_falls_back_to_canonical() {
    let mut repo = RepoBuilder::new();
    repo.dist("stable", DATE_1, &packages(), true);
    let packages_gz = repo.files()["dists/stable/main/binary-amd64/Packages.gz"].clone();
    let digest = hash_bytes(HashAlgorithm::Sha256, &packages_gz);
    repo.remove(&format!("dists/stable/main/binary-amd64/by-hash/SHA256/{digest}"));
    let transport = Arc::new(MemoryTransport::new(&repo));
    let cache = tempfile::tempdir().unwrap();

    let config = config(Path::new("unused"), cache.path(), CheckMode::Size, &["stable"]);
    let summary = Mirror::with_transport(config, transport.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.outcome("stable"), Some(&DistOutcome::Mirrored));
    assert!(transport
        .fetched()
        .contains(&"dists/stable/main/binary-amd64/Packages.gz".to_string()));
    assert!(cache.path().join(packages()[0].pool_path()).exists());
}

#[tokio::test]
async fn test_shared_pool_file_fetched_once() {
    let tzdata = FakePackage::new("tzdata", &vec![7u8; 64 * 1024]).architecture("all");
    let hello = FakePackage::new("hello", b"hello package payload");
    let mut repo = RepoBuilder::new();
    repo.dist_for_architectures(
        "stable",
        DATE_1,
        &["amd64", "arm64"],
        &[hello.clone(), tzdata.clone()],
        false,
    );
    let transport = Arc::new(MemoryTransport::new(&repo));
    let cache = tempfile::tempdir().unwrap();

    let config = config(Path::new("unused"), cache.path(), CheckMode::Sha256, &["stable"]);
    let summary = Mirror::with_transport(config, transport.clone())
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.outcome("stable"), Some(&DistOutcome::Mirrored));
    assert_eq!(summary.transfers.failed, 0);
    assert_eq!(summary.transfers.corrupt, 0);

    let fetched = transport.fetched();
    let count = |locator: &str| fetched.iter().filter(|f| *f == locator).count();
    assert_eq!(count(&tzdata.pool_path()), 1, "fetched: {fetched:?}");
    assert_eq!(count("dists/stable/main/i18n/Index"), 1, "fetched: {fetched:?}");

    assert_eq!(
        std::fs::read(cache.path().join(tzdata.pool_path())).unwrap(),
        tzdata.data
    );
    assert!(cache.path().join("dists/stable/main/i18n/Translation-de").exists());
    assert!(!cache
        .path()
        .join(format!("{}.partial", tzdata.pool_path()))
        .exists());

    // Every index entry is counted, the shared file once per architecture
    let main = &read_state(cache.path()).dists["stable"].components["main"];
    assert_eq!(main.packages, 3);
    assert_eq!(main.size, (hello.data.len() + 2 * tzdata.data.len()) as u64);
}
