use std::{io::Write, sync::Arc};

use anyhow::Result;
use blob_backend::{
    BeginOptions,
    BlobBackendConfig,
    Capabilities,
    MemoryBackend,
    MultiRangeExecutor,
    MultipartCoordinator,
    PlanOptions,
    Range,
    ReadConfig,
    StorageBackend,
    UploadConfig,
    connect,
    plan,
};
use bytes::Bytes;
use futures::stream;
use tokio_util::sync::CancellationToken;
use tracing::subscriber;
use tracing_subscriber::{Layer, layer::SubscriberExt};

const CONTENT: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
    );
}

fn ranges(pairs: &[(u64, u64)]) -> Vec<Range> {
    pairs
        .iter()
        .map(|&(start, count)| Range { start, count })
        .collect()
}

async fn read_ranges(
    executor: &MultiRangeExecutor,
    key: &str,
    requested: &[Range],
) -> Result<Vec<Bytes>> {
    let parts = executor
        .read(key, requested, &CancellationToken::new())
        .await?;
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        out.push(part.body.collect().await?);
    }
    Ok(out)
}

#[tokio::test]
async fn test_same_bytes_across_provider_presets() -> Result<()> {
    init_tracing();
    let requested = ranges(&[(20, 5), (0, 5), (10, 5)]);
    let expected = vec![
        Bytes::from("klmno"),
        Bytes::from("01234"),
        Bytes::from("abcde"),
    ];

    for caps in [
        Capabilities::s3(),
        Capabilities::gcs(),
        Capabilities::azure_blob(),
        Capabilities::memory(false),
    ] {
        let native = caps.supports_multi_range;
        let backend = Arc::new(MemoryBackend::with_blob("bucket", caps, "blob", CONTENT));
        let executor = MultiRangeExecutor::new(backend.clone(), ReadConfig::default());

        assert_eq!(read_ranges(&executor, "blob", &requested).await?, expected);
        let stats = backend.stats();
        if native {
            assert_eq!((stats.multi_range_calls, stats.get_calls), (1, 0));
        } else {
            assert_eq!((stats.multi_range_calls, stats.get_calls), (0, 3));
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_plan_reconstructs_request() -> Result<()> {
    let requested = ranges(&[
        (100, 10),
        (0, 4),
        (50, 25),
        (2, 8),
        (0, 4),
        (300, 1),
        (111, 9),
    ]);
    for threshold in [0.0, 0.25, 0.5, 1.0] {
        let plan = plan(&requested, &Capabilities::s3(), &PlanOptions::new(threshold))?;
        assert_eq!(plan.logical_ranges(), requested);
        for group in plan.groups() {
            for member in group.members() {
                assert!(group.range().contains(&member.range));
            }
        }
    }

    let merged_all = plan(&requested, &Capabilities::s3(), &PlanOptions::new(1.0))?;
    assert_eq!(merged_all.len(), 1);
    let no_gaps = plan(&requested, &Capabilities::s3(), &PlanOptions::new(0.0))?;
    assert_eq!(no_gaps.len(), 5);
    Ok(())
}

#[tokio::test]
async fn test_stream_upload_then_range_read() -> Result<()> {
    init_tracing();
    let backend: Arc<dyn StorageBackend> =
        Arc::new(MemoryBackend::new("bucket", Capabilities::gcs()));
    let coordinator = MultipartCoordinator::new(backend.clone(), UploadConfig::default());

    let chunks = stream::iter(
        CONTENT
            .as_bytes()
            .chunks(10)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect::<Vec<_>>(),
    );
    let descriptor = coordinator
        .upload_stream(
            "uploaded",
            chunks,
            BeginOptions {
                content_type: Some("text/plain".to_string()),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await?;
    assert_eq!(descriptor.size_bytes, Some(CONTENT.len() as u64));
    assert!(descriptor.sha256_hash.is_some());

    let executor = MultiRangeExecutor::new(backend.clone(), ReadConfig::default());
    let parts = executor
        .read("uploaded", &ranges(&[(35, 1), (9, 2)]), &CancellationToken::new())
        .await?;
    assert_eq!(parts[0].content_type, "text/plain");
    let mut bodies = Vec::new();
    for part in parts {
        bodies.push(part.body.collect().await?);
    }
    assert_eq!(bodies, vec![Bytes::from("z"), Bytes::from("9a")]);
    Ok(())
}

#[tokio::test]
async fn test_configured_local_file_backend() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    writeln!(
        file,
        "path: file://{}\nread:\n  gap_threshold: 0.5\n  concurrency: 2\n",
        dir.path().join("blobs").to_str().unwrap()
    )?;

    let config = BlobBackendConfig::from_path(file.path().to_str().unwrap())?;
    assert_eq!(config.read.gap_threshold, 0.5);
    let backend = connect(&config)?;
    assert_eq!(backend.capabilities().name, "file");
    backend
        .put_blob("data/blob", Bytes::from(CONTENT), None)
        .await?;

    let executor = MultiRangeExecutor::new(backend, config.read.clone());
    let bodies = read_ranges(&executor, "data/blob", &ranges(&[(10, 5), (0, 5), (20, 5)])).await?;
    assert_eq!(
        bodies,
        vec![
            Bytes::from("abcde"),
            Bytes::from("01234"),
            Bytes::from("klmno"),
        ]
    );
    Ok(())
}
