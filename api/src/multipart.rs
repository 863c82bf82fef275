//! `multipart/x-mixed-replace` framing for the live MJPEG feed.

use std::convert::Infallible;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use roadwatch_common::frame::EncodedFrame;
use roadwatch_pipeline::engine::StreamEngine;
use tracing::error;

pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// One self-contained body part: boundary, headers, JPEG bytes, CRLF.
pub fn frame_part(frame: &EncodedFrame) -> Bytes {
    let head = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut buf = BytesMut::with_capacity(head.len() + frame.len() + 2);
    buf.put_slice(head.as_bytes());
    buf.put_slice(&frame.bytes);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Drive `engine` on the blocking pool, one frame per poll, and emit each
/// frame as a body part. Dropping the stream drops the engine, which closes
/// its source.
pub fn frame_stream(engine: StreamEngine) -> impl Stream<Item = Result<Bytes, Infallible>> {
    stream::unfold(Some(engine), |slot| async move {
        let mut engine = slot?;
        let pulled = tokio::task::spawn_blocking(move || {
            let next = engine.next();
            (engine, next)
        })
        .await;
        match pulled {
            Ok((engine, Some(frame))) => Some((Ok(frame_part(&frame)), Some(engine))),
            Ok((_, None)) => None,
            Err(e) => {
                error!(error = %e, "stream worker panicked");
                None
            }
        }
    })
}
