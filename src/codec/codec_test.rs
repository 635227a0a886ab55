use super::*;
use crate::test_utils::endpoint;
use crate::test_utils::Endpoint;
use crate::test_utils::Service;
use crate::ErrorKind;

fn service() -> Service {
    Service {
        name: "billing".into(),
        endpoint: Some(endpoint("10.0.0.7", 8443)),
        tags: vec!["blue".into(), "canary".into()],
    }
}

#[test]
fn test_proto_unmarshal_replaces_previous_content() {
    let codec = ProtoCodec;
    let data = codec.marshal(&endpoint("a", 1)).unwrap();

    let mut target = Endpoint {
        host: "stale".into(),
        port: 9,
        password: "secret".into(),
    };
    codec.unmarshal(&data, &mut target).unwrap();
    assert_eq!(target, endpoint("a", 1));
    assert!(target.password.is_empty());
}

#[test]
fn test_proto_rejects_garbage() {
    let mut target = Endpoint::default();
    let err = ProtoCodec.unmarshal(&[0xff, 0xff, 0xff], &mut target).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Codec);
}

#[test]
fn test_json_accepts_partial_documents() {
    let mut target = service();
    JsonCodec::default()
        .unmarshal(br#"{"name":"search"}"#, &mut target)
        .unwrap();
    assert_eq!(target.name, "search");
    assert!(target.endpoint.is_none());
    assert!(target.tags.is_empty());
}

#[test]
fn test_json_marshal_is_readable() {
    let data = JsonCodec::default().marshal(&endpoint("h", 80)).unwrap();
    let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
    assert_eq!(value["host"], "h");
    assert_eq!(value["port"], 80);
}

#[test]
fn test_serializer_follows_config() {
    let mut config = crate::KvConfig::default();
    assert_eq!(Serializer::from_config(&config).name(), "proto");

    config.codec = crate::CodecKind::Json;
    config.expand_env_vars = true;
    match Serializer::from_config(&config) {
        Serializer::Json(codec) => assert!(codec.expands_env()),
        other => panic!("expected json codec, got {other:?}"),
    }
}

#[test]
fn test_serializer_dispatch_round_trips_nested_message() {
    for serializer in [Serializer::Proto(ProtoCodec), Serializer::Json(JsonCodec::default())] {
        let data = serializer.marshal(&service()).unwrap();
        let mut decoded = Service::default();
        serializer.unmarshal(&data, &mut decoded).unwrap();
        assert_eq!(decoded, service(), "{}", serializer.name());
    }
}
