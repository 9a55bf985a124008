// Outbound payloads handed to the session by the driver

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::config::{ClientConfig, PayloadEncoding};

/// Encode file contents the way they go over the air.
pub fn encode_file_contents(contents: &[u8], encoding: PayloadEncoding) -> Vec<u8> {
    match encoding {
        PayloadEncoding::Base64 => STANDARD.encode(contents).into_bytes(),
        PayloadEncoding::Raw => contents.to_vec(),
    }
}

pub async fn read_file_payload(path: &Path, encoding: PayloadEncoding) -> std::io::Result<Vec<u8>> {
    let contents = tokio::fs::read(path).await?;
    Ok(encode_file_contents(&contents, encoding))
}

/// The payload configured for this run. A file takes precedence over the
/// inline text.
pub async fn configured_payload(client: &ClientConfig) -> std::io::Result<Option<Vec<u8>>> {
    if let Some(path) = &client.payload_file {
        return read_file_payload(path, client.payload_encoding).await.map(Some);
    }
    Ok(client.payload.as_ref().map(|text| text.as_bytes().to_vec()))
}
