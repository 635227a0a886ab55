use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use unikv::EmbeddedConfig;
use unikv::EmbeddedDriver;
use unikv::ErrorKind;
use unikv::KvDriver;
use unikv::PutOptions;
use unikv::WatchConfig;

async fn embedded(dir: &tempfile::TempDir) -> Arc<dyn KvDriver> {
    let config = EmbeddedConfig {
        db_path: dir.path().join("kv.db").to_string_lossy().to_string(),
        ..Default::default()
    };
    Arc::new(EmbeddedDriver::open(&config, &WatchConfig::default()).await.unwrap())
}

#[tokio::test]
async fn embedded_txn_applies_all_ops() {
    let dir = tempfile::tempdir().unwrap();
    let driver = embedded(&dir).await;
    driver.put("z", b"0", PutOptions::default()).await.unwrap();

    let mut txn = unikv::DriverExt::new_txn(&driver);
    txn.put("x", "1").unwrap().put("y", "2").unwrap().delete("z").unwrap();
    txn.commit().await.unwrap();

    assert_eq!(driver.get("x").await.unwrap().unwrap().value, b"1");
    assert_eq!(driver.get("y").await.unwrap().unwrap().value, b"2");
    assert!(driver.get("z").await.unwrap().is_none());
    driver.close().await.unwrap();
}

#[tokio::test]
async fn cancelled_commit_leaves_prior_state() {
    let dir = tempfile::tempdir().unwrap();
    let driver = embedded(&dir).await;
    driver.put("z", b"0", PutOptions::default()).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut txn = unikv::DriverExt::new_txn(&driver);
    txn.put("x", "1").unwrap().put("y", "2").unwrap().delete("z").unwrap();
    let err = txn.commit_with_cancel(&cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    assert!(driver.get("x").await.unwrap().is_none());
    assert!(driver.get("y").await.unwrap().is_none());
    assert_eq!(driver.get("z").await.unwrap().unwrap().value, b"0");
    assert_eq!(txn.put("x", "1").unwrap_err().kind(), ErrorKind::Closed);
    driver.close().await.unwrap();
}
