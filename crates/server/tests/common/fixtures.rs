//! Test payloads and request builders.

/// Multipart boundary used by the chunk request builder.
pub const BOUNDARY: &str = "gantry-test-boundary";

/// A chunk payload beginning with the JPEG signature, padded with `fill`.
#[allow(dead_code)]
pub fn jpeg_bytes(len: usize, fill: u8) -> Vec<u8> {
    let mut data = vec![fill; len];
    data[..3].copy_from_slice(&[0xFF, 0xD8, 0xFF]);
    data
}

/// A plain payload with a uniform fill byte.
#[allow(dead_code)]
pub fn filled_bytes(len: usize, fill: u8) -> Vec<u8> {
    vec![fill; len]
}

/// Build a multipart body carrying one chunk with its echoed fields.
#[allow(dead_code)]
pub fn chunk_body(chunk: &[u8], index: u32, total: u32, file_type: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(chunk.len() + 512);
    for (name, value) in [
        ("chunkIndex", index.to_string()),
        ("totalChunks", total.to_string()),
        ("fileType", file_type.to_string()),
    ] {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(chunk);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Content-Type header value matching [`chunk_body`].
#[allow(dead_code)]
pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}
