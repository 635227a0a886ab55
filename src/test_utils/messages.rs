use serde::Deserialize;
use serde::Serialize;

/// Flat message used by codec and typed broker tests
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct Endpoint {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub host: String,
    #[prost(uint32, tag = "2")]
    #[serde(default)]
    pub port: u32,
    #[prost(string, tag = "3")]
    #[serde(default)]
    pub password: String,
}

/// Nested message for dotted-path field encryption
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct Service {
    #[prost(string, tag = "1")]
    #[serde(default)]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[prost(string, repeated, tag = "3")]
    #[serde(default)]
    pub tags: Vec<String>,
}

pub fn endpoint(
    host: &str,
    port: u32,
) -> Endpoint {
    Endpoint {
        host: host.to_string(),
        port,
        password: String::new(),
    }
}
