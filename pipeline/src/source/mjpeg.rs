use bytes::{Bytes, BytesMut};
use tracing::trace;

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse state for a `multipart/x-mixed-replace; boundary=frame` byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Looking for `--frame\r\n`.
    SeekingBoundary,
    /// Past the boundary, looking for the blank line ending the part headers.
    SeekingHeaderEnd,
    /// Inside a JPEG body, looking for the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for the multipart JPEG stream ffmpeg writes with
/// `-f mpjpeg -boundary_tag frame`.
///
/// Bytes are pushed in arbitrary chunks; complete JPEG bodies are pulled out
/// one at a time.
#[derive(Debug)]
pub struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    /// Offset into `buffer` already scanned for a boundary in `CollectingJpeg`.
    scanned: usize,
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MjpegParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scanned: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete JPEG body, if the buffer holds one.
    pub fn next_jpeg(&mut self) -> Option<Bytes> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) else {
                        // Keep a tail in case the boundary straddles chunks.
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        return None;
                    };
                    let _ = self.buffer.split_to(pos + BOUNDARY.len());
                    self.state = ParseState::SeekingHeaderEnd;
                }
                ParseState::SeekingHeaderEnd => {
                    let pos = find_subsequence(&self.buffer, HEADER_END)?;
                    let _ = self.buffer.split_to(pos + HEADER_END.len());
                    self.scanned = 0;
                    self.state = ParseState::CollectingJpeg;
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scanned..], BOUNDARY)
                    else {
                        self.scanned = self.buffer.len().saturating_sub(BOUNDARY.len());
                        return None;
                    };
                    let boundary_at = self.scanned + pos;
                    let body = self.buffer.split_to(boundary_at);
                    let _ = self.buffer.split_to(BOUNDARY.len());
                    self.state = ParseState::SeekingHeaderEnd;
                    self.scanned = 0;

                    let body = trim_crlf(body.freeze());
                    if body.is_empty() {
                        continue;
                    }
                    trace!(bytes = body.len(), "multipart part complete");
                    return Some(body);
                }
            }
        }
    }

    /// Flush at end of input. The last part has no closing boundary, so
    /// whatever body is buffered is returned if it looks like a whole JPEG.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.state != ParseState::CollectingJpeg {
            self.buffer.clear();
            return None;
        }
        let body = trim_crlf(self.buffer.split().freeze());
        self.state = ParseState::SeekingBoundary;
        self.scanned = 0;
        (body.len() >= 4 && body.starts_with(&[0xFF, 0xD8]) && body.ends_with(&[0xFF, 0xD9]))
            .then_some(body)
    }
}

fn trim_crlf(body: Bytes) -> Bytes {
    if body.ends_with(b"\r\n") {
        body.slice(..body.len() - 2)
    } else {
        body
    }
}

/// Find the position of `needle` in `haystack`.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(body: &[u8]) -> Vec<u8> {
        let mut out = b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ".to_vec();
        out.extend_from_slice(body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    const A: &[u8] = &[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
    const B: &[u8] = &[0xFF, 0xD8, 9, 9, 0xFF, 0xD9];

    #[test]
    fn splits_parts_and_flushes_last() {
        let mut stream = part(A);
        stream.extend(part(B));

        let mut parser = MjpegParser::new();
        parser.push(&stream);
        assert_eq!(parser.next_jpeg().as_deref(), Some(A));
        assert_eq!(parser.next_jpeg(), None);
        assert_eq!(parser.finish().as_deref(), Some(B));
    }

    #[test]
    fn handles_byte_at_a_time_delivery() {
        let mut stream = part(A);
        stream.extend(part(B));
        stream.extend(part(A));

        let mut parser = MjpegParser::new();
        let mut out = Vec::new();
        for byte in &stream {
            parser.push(std::slice::from_ref(byte));
            while let Some(jpeg) = parser.next_jpeg() {
                out.push(jpeg);
            }
        }
        out.extend(parser.finish());
        assert_eq!(out, vec![Bytes::from_static(A), Bytes::from_static(B), Bytes::from_static(A)]);
    }

    #[test]
    fn skips_leading_garbage() {
        let mut stream = b"noise before the first part".to_vec();
        stream.extend(part(A));
        stream.extend(part(B));
        let mut parser = MjpegParser::new();
        parser.push(&stream);
        assert_eq!(parser.next_jpeg().as_deref(), Some(A));
    }

    #[test]
    fn truncated_tail_is_discarded() {
        let mut stream = part(A);
        stream.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\x01");
        let mut parser = MjpegParser::new();
        parser.push(&stream);
        assert_eq!(parser.next_jpeg().as_deref(), Some(A));
        assert_eq!(parser.finish(), None);
    }
}
