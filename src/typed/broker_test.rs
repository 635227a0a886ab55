use std::sync::Arc;

use rsa::RsaPublicKey;

use super::*;
use crate::test_utils::endpoint;
use crate::test_utils::Endpoint;
use crate::test_utils::Service;
use crate::test_utils::TEST_KEYS;
use crate::CryptoPolicy;
use crate::DriverExt;
use crate::ErrorKind;
use crate::FieldCrypto;
use crate::JsonCodec;
use crate::KvDriver;
use crate::MemDriver;
use crate::MemoryConfig;
use crate::MessageCrypto;
use crate::ProtoCodec;
use crate::PutOptions;
use crate::Serializer;
use crate::WatchConfig;

fn mem_driver() -> Arc<dyn KvDriver> {
    Arc::new(MemDriver::new(&MemoryConfig::default(), &WatchConfig::default()))
}

fn typed(
    driver: &Arc<dyn KvDriver>,
    prefix: &str,
    codec: Serializer,
) -> TypedBroker {
    TypedBroker::new(Arc::new(driver.new_broker(prefix)), MessageDecoder::new(codec, None))
}

#[tokio::test]
async fn put_get_round_trip_with_both_codecs() {
    let driver = mem_driver();
    for codec in [Serializer::Proto(ProtoCodec), Serializer::Json(JsonCodec::default())] {
        let broker = typed(&driver, "/svc/", codec);
        broker.put("a", &endpoint("h", 80), PutOptions::default()).await.unwrap();

        let mut out = Endpoint::default();
        let revision = broker.get_into("a", &mut out).await.unwrap();
        assert!(revision.is_some());
        assert_eq!(out, endpoint("h", 80));
        assert_eq!(broker.get::<Endpoint>("a").await.unwrap(), Some(endpoint("h", 80)));
    }
}

#[tokio::test]
async fn missing_key_leaves_buffer_untouched() {
    let broker = typed(&mem_driver(), "", Serializer::default());
    let mut out = endpoint("keep", 1);
    assert_eq!(broker.get_into("/nope", &mut out).await.unwrap(), None);
    assert_eq!(out, endpoint("keep", 1));
    assert_eq!(broker.get::<Endpoint>("/nope").await.unwrap(), None);
}

#[tokio::test]
async fn undecodable_value_is_a_codec_error() {
    let driver = mem_driver();
    driver.put("/svc/bad", b"{not json", PutOptions::default()).await.unwrap();
    let broker = typed(&driver, "/svc/", Serializer::Json(JsonCodec::default()));
    let err = broker.get::<Endpoint>("bad").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Codec);
}

#[tokio::test]
async fn list_reuses_caller_buffer() {
    let driver = mem_driver();
    let broker = typed(&driver, "/svc/", Serializer::default());
    for (key, port) in [("a", 1), ("b", 2), ("c", 3)] {
        broker.put(key, &endpoint(key, port), PutOptions::default()).await.unwrap();
    }

    let mut iter = broker.list_values("").await.unwrap();
    let mut buffer = Endpoint::default();
    let mut seen = Vec::new();
    while let Some(kv) = iter.next_into(&mut buffer).await.unwrap() {
        seen.push((kv.key, buffer.port));
    }
    assert_eq!(seen, vec![("a".to_string(), 1), ("b".to_string(), 2), ("c".to_string(), 3)]);
    assert!(iter.next_into(&mut buffer).await.unwrap().is_none());

    let all = broker.list_values("b").await.unwrap().try_collect::<Endpoint>().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].value, endpoint("b", 2));
}

#[tokio::test]
async fn typed_txn_commits_messages() {
    let driver = mem_driver();
    let broker = typed(&driver, "/svc/", Serializer::default());
    broker.put("old", &endpoint("o", 1), PutOptions::default()).await.unwrap();

    let mut txn = broker.new_txn().unwrap();
    txn.put("x", &endpoint("x", 1)).unwrap().delete("old").unwrap();
    assert_eq!(txn.len(), 2);
    txn.commit().await.unwrap();

    assert_eq!(broker.get::<Endpoint>("x").await.unwrap(), Some(endpoint("x", 1)));
    assert_eq!(broker.get::<Endpoint>("old").await.unwrap(), None);
    assert_eq!(txn.commit().await.unwrap_err().kind(), ErrorKind::Closed);
}

#[tokio::test]
async fn nested_typed_broker_composes_prefixes() {
    let driver = mem_driver();
    let broker = typed(&driver, "/a/", Serializer::default()).new_broker("b/").unwrap();
    broker.put("k", &endpoint("h", 1), PutOptions::default()).await.unwrap();
    assert!(driver.get("/a/b/k").await.unwrap().is_some());
}

#[tokio::test]
async fn policy_fields_are_decrypted_on_read() {
    let crypto = Arc::new(FieldCrypto::new(
        vec![TEST_KEYS[0].clone()],
        Some(RsaPublicKey::from(&TEST_KEYS[0])),
    ));
    let policy = Arc::new(CryptoPolicy::new().with::<Service>(&["endpoint.password"]));
    let message_crypto = MessageCrypto::new(crypto, policy);

    let driver = mem_driver();
    let mut stored = Service {
        name: "db".into(),
        endpoint: Some(Endpoint {
            password: "pw".into(),
            ..endpoint("h", 5432)
        }),
        tags: vec![],
    };
    message_crypto.encrypt(&mut stored).unwrap();
    let plain_broker = typed(&driver, "/svc/", Serializer::default());
    plain_broker.put("db", &stored, PutOptions::default()).await.unwrap();

    let secure = TypedBroker::new(
        Arc::new(driver.new_broker("/svc/")),
        MessageDecoder::new(Serializer::default(), Some(message_crypto)),
    );
    let read = secure.get::<Service>("db").await.unwrap().unwrap();
    assert_eq!(read.endpoint.unwrap().password, "pw");

    let listed = secure.list_values("").await.unwrap().try_collect::<Service>().await.unwrap();
    assert_eq!(listed[0].value.endpoint.as_ref().unwrap().password, "pw");

    let raw = plain_broker.get::<Service>("db").await.unwrap().unwrap();
    assert_ne!(raw.endpoint.unwrap().password, "pw");
}
