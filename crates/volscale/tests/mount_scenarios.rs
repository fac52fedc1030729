//! Integration tests for mount orchestration against the in-memory cluster.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use volscale::driver::Fault;
use async_trait::async_trait;
use volscale::model::{
    AttachOptions, DriverType, UnmountOptions, VolumeFilter, VolumeLocator, VolumeSpec,
};
use volscale::{
    Connector, DriverError, DriverHandle, MemoryCluster, RequestContext, VolumeDriver,
    VolumeService,
};
use volscale_common::{VolscaleConfig, VolscaleError};

fn service_on(cluster: &MemoryCluster, node: &str, base: &Path) -> VolumeService {
    service_with(cluster.driver(node), base)
}

fn service_with(driver: volscale::MemoryDriver, base: &Path) -> VolumeService {
    let config = VolscaleConfig::default()
        .with_node(driver.node())
        .with_mount_base(base.join(driver.node()));
    VolumeService::new(DriverHandle::ready(Arc::new(driver)), config)
}

#[test_log::test(tokio::test)]
async fn test_unscaled_block_volume_mounts_in_place() {
    let temp = tempdir().unwrap();
    let cluster = MemoryCluster::new(DriverType::Block);
    let svc = service_on(&cluster, "n1", temp.path());
    let ctx = svc.context();
    svc.create(&ctx, "db1", VolumeSpec::default(), None)
        .await
        .unwrap();

    let path = svc
        .mount(&ctx, "db1", &AttachOptions::default())
        .await
        .unwrap();
    assert_eq!(path, temp.path().join("n1").join("db1"));
    assert!(path.is_dir());

    let snapshot = cluster.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].attached_on.as_deref(), Some("n1"));
    assert_eq!(snapshot[0].attach_path, vec![path.clone()]);
    assert_eq!(svc.resolve_mountpoint(&ctx, "db1").await.unwrap(), path);
}

#[test_log::test(tokio::test)]
async fn test_scaled_volume_gets_one_replica_per_node() {
    let temp = tempdir().unwrap();
    let cluster = MemoryCluster::new(DriverType::Block);
    let n = service_on(&cluster, "n", temp.path());
    let m = service_on(&cluster, "m", temp.path());
    n.create(&n.context(), "cache", VolumeSpec::scaled(3), None)
        .await
        .unwrap();

    let (ctx_n, ctx_m) = (n.context(), m.context());
    let (opts_n, opts_m) = (AttachOptions::default(), AttachOptions::default());
    let (on_n, on_m) = tokio::join!(
        n.mount(&ctx_n, "cache", &opts_n),
        m.mount(&ctx_m, "cache", &opts_m)
    );
    let on_n = on_n.unwrap();
    let on_m = on_m.unwrap();
    assert_ne!(on_n, on_m);

    let mut names = cluster.created_names();
    names.sort();
    assert_eq!(names, vec!["cache", "cache_000", "cache_001"]);

    let attached: HashSet<_> = cluster
        .snapshot()
        .into_iter()
        .filter_map(|v| v.attached_on)
        .collect();
    assert_eq!(attached, HashSet::from(["n".to_string(), "m".to_string()]));
}

#[test_log::test(tokio::test)]
async fn test_replica_attached_here_is_reused() {
    let temp = tempdir().unwrap();
    let cluster = MemoryCluster::new(DriverType::Block);
    let driver = cluster.driver("n");
    driver
        .create(&VolumeLocator::named("cache"), None, &VolumeSpec::scaled(2))
        .await
        .unwrap();
    let replica = driver
        .create(&VolumeLocator::named("cache_000"), None, &VolumeSpec::default())
        .await
        .unwrap();
    driver
        .attach(&replica, &AttachOptions::default())
        .await
        .unwrap();

    let svc = service_on(&cluster, "n", temp.path());
    svc
        .mount(&svc.context(), "cache", &AttachOptions::default())
        .await
        .unwrap();

    assert_eq!(cluster.created_names(), vec!["cache", "cache_000"]);
    let mounted = driver
        .mounted_at(&temp.path().join("n").join("cache"))
        .await;
    assert_eq!(mounted, Some(replica));
}

#[test_log::test(tokio::test)]
async fn test_unmount_twice_is_not_found() {
    let temp = tempdir().unwrap();
    let cluster = MemoryCluster::new(DriverType::Block);
    let svc = service_on(&cluster, "n", temp.path());
    let ctx = svc.context();
    svc.create(&ctx, "db1", VolumeSpec::default(), None)
        .await
        .unwrap();
    svc.create(&ctx, "cache", VolumeSpec::scaled(2), None)
        .await
        .unwrap();

    for name in ["db1", "cache"] {
        let path = svc
            .mount(&ctx, name, &AttachOptions::default())
            .await
            .unwrap();
        svc
            .unmount(&ctx, name, &UnmountOptions::default())
            .await
            .unwrap();
        assert!(!path.exists());

        let err = svc
            .unmount(&ctx, name, &UnmountOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{name}: {err}");
    }

    // Nothing left attached or mounted.
    for volume in cluster.snapshot() {
        assert!(volume.attached_on.is_none(), "{}", volume.name());
        assert!(volume.attach_path.is_empty(), "{}", volume.name());
    }
}

#[test_log::test(tokio::test)]
async fn test_remount_with_stuck_occupant_leaves_state_unchanged() {
    let temp = tempdir().unwrap();
    let cluster = MemoryCluster::new(DriverType::Block);
    let svc = service_on(&cluster, "n", temp.path());
    let ctx = svc.context();
    svc.create(&ctx, "cache", VolumeSpec::scaled(2), None)
        .await
        .unwrap();
    let path = svc
        .mount(&ctx, "cache", &AttachOptions::default())
        .await
        .unwrap();
    let before = cluster.snapshot();

    cluster.fail_next(Fault::Detach);
    let err = svc
        .mount(&ctx, "cache", &AttachOptions::default())
        .await
        .unwrap_err();
    match err {
        VolscaleError::InconsistentState {
            name,
            replica,
            path: at,
        } => {
            assert_eq!(name, "cache");
            assert_eq!(replica, before[1].id.to_string());
            assert_eq!(at, path);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(cluster.snapshot(), before);
    assert_eq!(cluster.created_names(), vec!["cache", "cache_000"]);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_mounts_bind_distinct_replicas() {
    for nodes in 2..=6_u32 {
        let temp = tempdir().unwrap();
        let cluster = MemoryCluster::new(DriverType::Block);
        let setup = service_on(&cluster, "setup", temp.path());
        setup
            .create(&setup.context(), "cache", VolumeSpec::scaled(nodes), None)
            .await
            .unwrap();

        let tasks: Vec<_> = (0..nodes)
            .map(|i| {
                let driver = cluster
                    .driver(format!("node-{i}"))
                    .with_latency(Duration::from_millis(2));
                let svc = service_with(driver, temp.path());
                tokio::spawn(async move {
                    svc.mount(&svc.context(), "cache", &AttachOptions::default())
                        .await
                })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }

        let created = cluster.created_names();
        let unique: HashSet<_> = created.iter().collect();
        assert_eq!(unique.len(), created.len(), "duplicate create: {created:?}");

        let replicas: Vec<_> = cluster
            .snapshot()
            .into_iter()
            .filter(|v| v.name() != "cache")
            .collect();
        assert_eq!(replicas.len(), nodes as usize);
        let holders: HashSet<_> = replicas
            .iter()
            .map(|v| v.attached_on.clone().unwrap())
            .collect();
        assert_eq!(holders.len(), nodes as usize);
    }
}

#[test_log::test(tokio::test)]
async fn test_cancelled_request_stops_before_backend() {
    let temp = tempdir().unwrap();
    let cluster = MemoryCluster::new(DriverType::Block);
    let svc = service_on(&cluster, "n", temp.path());
    svc.create(&svc.context(), "cache", VolumeSpec::scaled(3), None)
        .await
        .unwrap();

    let ctx = RequestContext::new();
    ctx.cancel();
    let err = svc
        .mount(&ctx, "cache", &AttachOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VolscaleError::Cancelled));
    assert_eq!(cluster.created_names(), vec!["cache"]);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_slow_backend() {
    let temp = tempdir().unwrap();
    let cluster = MemoryCluster::new(DriverType::Block);
    cluster
        .driver("n")
        .create(&VolumeLocator::named("cache"), None, &VolumeSpec::scaled(3))
        .await
        .unwrap();

    let slow = cluster.driver("n").with_latency(Duration::from_millis(200));
    let config = VolscaleConfig::default()
        .with_node("n")
        .with_mount_base(temp.path())
        .with_request_timeout(Duration::from_millis(50));
    let svc = VolumeService::new(DriverHandle::ready(Arc::new(slow)), config);

    let err = svc
        .mount(&svc.context(), "cache", &AttachOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VolscaleError::DeadlineExceeded));
    assert!(err.is_cancellation());
}

#[test_log::test(tokio::test)]
async fn test_file_volumes_are_never_attached() {
    let temp = tempdir().unwrap();
    let cluster = MemoryCluster::new(DriverType::File);
    let svc = service_on(&cluster, "n", temp.path());
    let ctx = svc.context();
    svc.create(&ctx, "shared", VolumeSpec::default(), None)
        .await
        .unwrap();

    let path = svc
        .mount(&ctx, "shared", &AttachOptions::default())
        .await
        .unwrap();
    let listed = svc.list(&ctx).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].mountpoint.as_ref(), Some(&path));
    assert!(cluster.snapshot()[0].attached_on.is_none());

    let replicas = cluster
        .driver("n")
        .enumerate(&VolumeFilter::name_matching("^shared_"))
        .await
        .unwrap();
    assert!(replicas.is_empty());
}

/// Backend whose connection attempt never completes.
struct Unreachable;

#[async_trait]
impl Connector for Unreachable {
    async fn connect(&self) -> Result<Arc<dyn VolumeDriver>, DriverError> {
        std::future::pending::<Result<Arc<dyn VolumeDriver>, DriverError>>().await
    }
}

fn unreachable_service(base: &Path) -> VolumeService {
    let config = VolscaleConfig::default().with_node("n").with_mount_base(base);
    VolumeService::new(DriverHandle::lazy(Unreachable), config)
}

#[test_log::test(tokio::test)]
async fn test_cancelled_request_abandons_hung_connect() {
    let temp = tempdir().unwrap();
    let svc = unreachable_service(temp.path());

    let ctx = RequestContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });
    let err = svc
        .mount(&ctx, "cache", &AttachOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VolscaleError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_hung_connect() {
    let temp = tempdir().unwrap();
    let svc = unreachable_service(temp.path());

    let ctx = RequestContext::with_timeout(Duration::from_millis(50));
    let err = svc
        .unmount(&ctx, "cache", &UnmountOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VolscaleError::DeadlineExceeded));

    let ctx = RequestContext::with_timeout(Duration::from_millis(50));
    assert!(matches!(
        svc.list(&ctx).await,
        Err(VolscaleError::DeadlineExceeded)
    ));
}
