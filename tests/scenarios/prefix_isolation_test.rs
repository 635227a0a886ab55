use unikv::DriverExt;
use unikv::KeyValBroker;
use unikv::KvDriver;
use unikv::PutOptions;

use crate::commons::mem_driver;

#[tokio::test]
async fn brokers_on_sibling_prefixes_do_not_see_each_other() {
    let driver = mem_driver(false);
    let a = driver.new_broker("/a/");
    let b = driver.new_broker("/b/");

    a.put("k", b"1", PutOptions::default()).await.unwrap();
    b.put("k", b"2", PutOptions::default()).await.unwrap();

    assert_eq!(a.get("k").await.unwrap().unwrap().value, b"1");
    assert_eq!(b.get("k").await.unwrap().unwrap().value, b"2");

    let mut keys: Vec<String> = driver
        .list_keys("/")
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap()
        .into_iter()
        .map(|kv| kv.key)
        .collect();
    keys.sort();
    assert_eq!(keys, ["/a/k", "/b/k"]);

    let only_a = a.list_keys("").await.unwrap().try_collect().await.unwrap();
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].key, "k");
}
