use std::sync::Arc;

use unikv::BackendKind;
use unikv::Deps;
use unikv::FieldCrypto;
use unikv::KeyValBroker;
use unikv::KvConfig;
use unikv::KvDriver;
use unikv::KvPlugin;
use unikv::PutOptions;

#[tokio::test]
async fn externally_encrypted_json_is_decrypted_on_read() {
    let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let public = rsa::RsaPublicKey::from(&private);
    let dir = tempfile::tempdir().unwrap();
    let key_file = dir.path().join("private.pem");
    std::fs::write(
        &key_file,
        rsa::pkcs1::EncodeRsaPrivateKey::to_pkcs1_pem(&private, rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .as_bytes(),
    )
    .unwrap();

    // external writer
    let writer = FieldCrypto::new(vec![], Some(public));
    let raw = format!(r#"{{"encrypted":"true","payload":"{}"}}"#, writer.encrypt_value("plain").unwrap());

    let mut config = KvConfig {
        backend: BackendKind::Memory,
        ..Default::default()
    };
    config.crypto.private_key_files = vec![key_file.to_string_lossy().to_string()];
    let plugin = KvPlugin::new(Deps::new("kv", Arc::new(config)));
    plugin.init().await.unwrap();

    let driver = plugin.driver().unwrap();
    driver.put("/cfg/K", raw.as_bytes(), PutOptions::default()).await.unwrap();

    let bytes = driver.get("/cfg/K").await.unwrap().unwrap();
    assert_eq!(bytes.value, raw.as_bytes());

    let decrypted = plugin.new_broker_bytes("/cfg/").unwrap().get("K").await.unwrap().unwrap();
    assert_eq!(decrypted.value, br#"{"encrypted":"true","payload":"plain"}"#);
    plugin.close().await.unwrap();
}
