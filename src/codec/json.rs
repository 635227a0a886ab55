use std::borrow::Cow;

use super::Codec;
use super::KvMessage;
use crate::Error;
use crate::Result;
use crate::CRYPTO_MARKER;

/// JSON via serde, optionally expanding environment references first
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    expand_env: bool,
}

impl JsonCodec {
    pub fn new(expand_env: bool) -> Self {
        Self { expand_env }
    }

    pub fn expands_env(&self) -> bool {
        self.expand_env
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn marshal<M: KvMessage>(
        &self,
        msg: &M,
    ) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(msg)?)
    }

    fn unmarshal<M: KvMessage>(
        &self,
        data: &[u8],
        msg: &mut M,
    ) -> Result<()> {
        let data: Cow<'_, [u8]> = if self.expand_env {
            let text = std::str::from_utf8(data)
                .map_err(|e| Error::invalid(format!("JSON value is not utf-8: {e}")))?;
            Cow::Owned(expand_env(text, |name| std::env::var(name).ok()).into_bytes())
        } else {
            Cow::Borrowed(data)
        };
        *msg = serde_json::from_slice(&data)?;
        Ok(())
    }
}

/// Replaces `${NAME}` and `$NAME` with `lookup(NAME)`, unknown names with
/// nothing. The crypto marker and a `$` not followed by a name stay as is.
pub fn expand_env(
    input: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        if rest.starts_with(CRYPTO_MARKER) {
            out.push_str(CRYPTO_MARKER);
            rest = &rest[CRYPTO_MARKER.len()..];
            continue;
        }
        if let Some(braced) = rest.strip_prefix("${") {
            if let Some(end) = braced.find('}') {
                out.push_str(&lookup(&braced[..end]).unwrap_or_default());
                rest = &braced[end + 1..];
                continue;
            }
        }
        let name_len = env_name_len(&rest[1..]);
        if name_len == 0 {
            out.push('$');
            rest = &rest[1..];
            continue;
        }
        out.push_str(&lookup(&rest[1..1 + name_len]).unwrap_or_default());
        rest = &rest[1 + name_len..];
    }
    out.push_str(rest);
    out
}

/// Length of the variable name at the start of `s`: a letter or `_`
/// followed by letters, digits and `_`.
fn env_name_len(s: &str) -> usize {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return 0,
    }
    chars
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}
