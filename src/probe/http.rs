//! HTTP probe implementation.

use super::{ProbeError, ProbeTarget};

/// Characters of body kept as a preview.
pub const PREVIEW_CHARS: usize = 50;

/// Status line plus the start of the body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub preview: String,
}

/// Send one request to the target.
///
/// Only the first body chunk is read; the rest of the body is abandoned so a
/// slow or endless stream cannot hold the probe open.
pub async fn run_http_probe(
    client: &reqwest::Client,
    target: &ProbeTarget,
) -> Result<HttpResponse, ProbeError> {
    let map_err = |e: reqwest::Error| {
        if e.is_timeout() {
            ProbeError::Timeout(target.timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    };

    let mut response = client
        .request(target.method.clone(), target.url.clone())
        .headers(target.headers.clone())
        .timeout(target.timeout)
        .send()
        .await
        .map_err(map_err)?;

    let status_code = response.status().as_u16();

    // The status is already known; a broken body only costs the preview.
    let preview = match response.chunk().await {
        Ok(Some(chunk)) => truncate_preview(&chunk),
        Ok(None) => String::new(),
        Err(e) => {
            tracing::debug!("Could not read body preview for {}: {}", target.name, e);
            String::new()
        }
    };

    Ok(HttpResponse {
        status_code,
        preview,
    })
}

fn truncate_preview(bytes: &[u8]) -> String {
    String::from_utf8_lossy(trim_partial_char(bytes))
        .chars()
        .take(PREVIEW_CHARS)
        .collect()
}

/// Drop a multi-byte character cut off by the end of the chunk.
fn trim_partial_char(bytes: &[u8]) -> &[u8] {
    let tail = bytes.len().saturating_sub(3);
    let Some(start) = (tail..bytes.len()).rev().find(|&i| (bytes[i] & 0xC0) != 0x80) else {
        return bytes;
    };
    match std::str::from_utf8(&bytes[start..]) {
        Err(e) if e.error_len().is_none() => &bytes[..start],
        _ => bytes,
    }
}
