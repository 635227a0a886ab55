use lazy_static::lazy_static;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::LineEnding;
use rsa::RsaPrivateKey;
use rsa::RsaPublicKey;

lazy_static! {
    /// Two small keys; generating them is the slow part of the crypto tests
    pub static ref TEST_KEYS: Vec<RsaPrivateKey> = {
        let mut rng = rand::thread_rng();
        (0..2)
            .map(|_| RsaPrivateKey::new(&mut rng, 1024).expect("generate test key"))
            .collect()
    };
}

pub fn private_key_pem(index: usize) -> String {
    TEST_KEYS[index]
        .to_pkcs1_pem(LineEnding::LF)
        .expect("encode private key")
        .to_string()
}

pub fn public_key_pem(index: usize) -> String {
    RsaPublicKey::from(&TEST_KEYS[index])
        .to_pkcs1_pem(LineEnding::LF)
        .expect("encode public key")
}

/// Writes both keys of `index` as PEM files under `dir`.
pub fn write_key_files(
    dir: &std::path::Path,
    index: usize,
) -> (String, String) {
    let private = dir.join(format!("key{index}.pem"));
    let public = dir.join(format!("key{index}.pub.pem"));
    std::fs::write(&private, private_key_pem(index)).expect("write private key");
    std::fs::write(&public, public_key_pem(index)).expect("write public key");
    (
        private.to_string_lossy().to_string(),
        public.to_string_lossy().to_string(),
    )
}
