//! Reassembly of a drawing sent as two independently chunked streams.
//!
//! The text stream carries a zlib-compressed JSON [`SendEnvelope`], the
//! image stream carries raw image bytes. Either stream may finish first; the
//! message only materializes once both have been marked complete, and the
//! per-connection state is cleared at that moment, whether decoding succeeds
//! or not.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use sketchmate_shared::protocol::SendEnvelope;
use sketchmate_shared::FrameType;

use crate::error::ServerError;
use crate::session::ConnectionId;

/// A fully reassembled send, ready for the inbox pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledSend {
    pub envelope: SendEnvelope,
    pub image: Vec<u8>,
}

/// Both buffers of a transfer whose barrier fired, not yet decoded.
#[derive(Debug)]
pub struct RawTransfer {
    text: Vec<u8>,
    image: Vec<u8>,
}

impl RawTransfer {
    /// Decompress and decode the text stream and attach the image.
    /// `limit` bounds the decompressed size.
    pub fn assemble(self, limit: usize) -> Result<AssembledSend, ServerError> {
        let mut decompressed = Vec::new();
        ZlibDecoder::new(self.text.as_slice())
            .take(limit as u64 + 1)
            .read_to_end(&mut decompressed)
            .map_err(|e| ServerError::TransferDecode(format!("decompression failed: {e}")))?;
        if decompressed.len() > limit {
            return Err(ServerError::TransferTooLarge { limit });
        }

        let envelope: SendEnvelope = serde_json::from_slice(&decompressed)
            .map_err(|e| ServerError::TransferDecode(format!("invalid envelope: {e}")))?;

        Ok(AssembledSend {
            envelope,
            image: self.image,
        })
    }
}

/// Accumulator for one connection.
#[derive(Debug, Default)]
pub struct PendingTransfer {
    text: Vec<u8>,
    image: Vec<u8>,
    text_complete: bool,
    image_complete: bool,
}

impl PendingTransfer {
    pub fn append_text_chunk(&mut self, chunk: &[u8], limit: usize) -> Result<(), ServerError> {
        if self.text_complete {
            return Err(ServerError::BadRequest(
                "text stream already complete".to_string(),
            ));
        }
        append_bounded(&mut self.text, chunk, limit)
    }

    pub fn append_image_chunk(&mut self, chunk: &[u8], limit: usize) -> Result<(), ServerError> {
        if self.image_complete {
            return Err(ServerError::BadRequest(
                "image stream already complete".to_string(),
            ));
        }
        append_bounded(&mut self.image, chunk, limit)
    }

    pub fn mark_text_complete(&mut self) -> Option<RawTransfer> {
        self.text_complete = true;
        self.try_complete()
    }

    pub fn mark_image_complete(&mut self) -> Option<RawTransfer> {
        self.image_complete = true;
        self.try_complete()
    }

    pub fn is_idle(&self) -> bool {
        self.text.is_empty() && self.image.is_empty() && !self.text_complete && !self.image_complete
    }

    fn try_complete(&mut self) -> Option<RawTransfer> {
        if !(self.text_complete && self.image_complete) {
            return None;
        }
        let done = std::mem::take(self);
        Some(RawTransfer {
            text: done.text,
            image: done.image,
        })
    }
}

fn append_bounded(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> Result<(), ServerError> {
    if buf.len() + chunk.len() > limit {
        return Err(ServerError::TransferTooLarge { limit });
    }
    buf.extend_from_slice(chunk);
    Ok(())
}

/// Pending transfers of all connections, keyed by connection.
///
/// Events of one connection are fed in receipt order by its reader loop; the
/// table lock only guards the map itself.
#[derive(Clone)]
pub struct TransferTable {
    pending: Arc<Mutex<HashMap<ConnectionId, PendingTransfer>>>,
    limit: usize,
}

impl TransferTable {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            limit,
        }
    }

    /// Append a chunk. Any error discards the connection's partial state.
    pub async fn append(
        &self,
        conn: ConnectionId,
        stream: FrameType,
        chunk: &[u8],
    ) -> Result<(), ServerError> {
        let mut pending = self.pending.lock().await;
        let transfer = pending.entry(conn).or_default();

        let result = match stream {
            FrameType::TextChunk => transfer.append_text_chunk(chunk, self.limit),
            FrameType::ImageChunk => transfer.append_image_chunk(chunk, self.limit),
        };

        if let Err(e) = &result {
            warn!(connection = %conn, error = %e, "Discarding pending transfer");
            pending.remove(&conn);
        }
        result
    }

    /// Mark one stream complete. Returns the assembled message once both
    /// streams are complete; decoding errors are reported after the state has
    /// already been cleared.
    pub async fn complete(
        &self,
        conn: ConnectionId,
        stream: FrameType,
    ) -> Result<Option<AssembledSend>, ServerError> {
        let raw = {
            let mut pending = self.pending.lock().await;
            let transfer = pending.entry(conn).or_default();
            let raw = match stream {
                FrameType::TextChunk => transfer.mark_text_complete(),
                FrameType::ImageChunk => transfer.mark_image_complete(),
            };
            if raw.is_some() {
                pending.remove(&conn);
            }
            raw
        };

        match raw {
            Some(raw) => {
                debug!(connection = %conn, "Transfer barrier reached");
                raw.assemble(self.limit).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Drop a connection's partial state. Returns true if anything was pending.
    pub async fn discard(&self, conn: ConnectionId) -> bool {
        let removed = self.pending.lock().await.remove(&conn);
        match removed {
            Some(transfer) if !transfer.is_idle() => {
                debug!(connection = %conn, "Discarded partial transfer");
                true
            }
            _ => false,
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionHandle;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use sketchmate_shared::UserId;
    use std::io::Write;

    fn envelope() -> SendEnvelope {
        SendEnvelope {
            sender: UserId::from("alice"),
            name: "Alice".into(),
            followers: vec![UserId::from("bob")],
            drawing: r#"{"strokes":[[0,0],[10,10]]}"#.into(),
            aspect_ratio: 1.5,
        }
    }

    fn zlib(data: &[u8], level: Compression) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), level);
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn compressed(envelope: &SendEnvelope) -> Vec<u8> {
        let json = serde_json::to_vec(envelope).unwrap();
        zlib(&json, Compression::default())
    }

    fn conn() -> ConnectionId {
        ConnectionHandle::channel().0.id()
    }

    #[tokio::test]
    async fn barrier_waits_for_both_streams() {
        let table = TransferTable::new(1024 * 1024);
        let c = conn();
        let text = compressed(&envelope());
        let (first, rest) = text.split_at(text.len() / 2);

        table.append(c, FrameType::TextChunk, first).await.unwrap();
        table.append(c, FrameType::TextChunk, rest).await.unwrap();
        assert!(table.complete(c, FrameType::TextChunk).await.unwrap().is_none());
        table.append(c, FrameType::ImageChunk, b"\x89PN").await.unwrap();
        table.append(c, FrameType::ImageChunk, b"G-data").await.unwrap();
        assert_eq!(table.in_flight().await, 1);

        let sent = table
            .complete(c, FrameType::ImageChunk)
            .await
            .unwrap()
            .expect("barrier fires on second end marker");
        assert_eq!(sent.envelope, envelope());
        assert_eq!(sent.image, b"\x89PNG-data");
        assert_eq!(table.in_flight().await, 0);
    }

    #[tokio::test]
    async fn decodes_standard_zlib_stream() {
        let table = TransferTable::new(1024 * 1024);
        let c = conn();
        let text = compressed(&envelope());
        // RFC 1950 header: deflate, 32K window.
        assert_eq!(text[0], 0x78);

        for chunk in text.chunks(7) {
            table.append(c, FrameType::TextChunk, chunk).await.unwrap();
        }
        table.append(c, FrameType::ImageChunk, b"img").await.unwrap();
        table.complete(c, FrameType::TextChunk).await.unwrap();
        let sent = table.complete(c, FrameType::ImageChunk).await.unwrap().unwrap();
        assert_eq!(sent.envelope, envelope());
    }

    #[tokio::test]
    async fn image_may_finish_first() {
        let table = TransferTable::new(1024 * 1024);
        let c = conn();

        table.append(c, FrameType::ImageChunk, b"img").await.unwrap();
        assert!(table.complete(c, FrameType::ImageChunk).await.unwrap().is_none());
        table
            .append(c, FrameType::TextChunk, &compressed(&envelope()))
            .await
            .unwrap();
        let sent = table.complete(c, FrameType::TextChunk).await.unwrap();
        assert_eq!(sent.unwrap().image, b"img");
    }

    #[tokio::test]
    async fn cycles_do_not_bleed() {
        let table = TransferTable::new(1024 * 1024);
        let c = conn();
        for image in [b"first".as_slice(), b"second".as_slice()] {
            table
                .append(c, FrameType::TextChunk, &compressed(&envelope()))
                .await
                .unwrap();
            table.append(c, FrameType::ImageChunk, image).await.unwrap();
            table.complete(c, FrameType::TextChunk).await.unwrap();
            let sent = table.complete(c, FrameType::ImageChunk).await.unwrap().unwrap();
            assert_eq!(sent.image, image);
        }
    }

    #[tokio::test]
    async fn malformed_text_clears_state() {
        let table = TransferTable::new(1024 * 1024);
        let c = conn();

        table.append(c, FrameType::TextChunk, b"not zlib").await.unwrap();
        table.append(c, FrameType::ImageChunk, b"img").await.unwrap();
        table.complete(c, FrameType::TextChunk).await.unwrap();
        let err = table.complete(c, FrameType::ImageChunk).await.unwrap_err();
        assert!(matches!(err, ServerError::TransferDecode(_)));
        assert_eq!(table.in_flight().await, 0);

        // A retry starts clean.
        table
            .append(c, FrameType::TextChunk, &compressed(&envelope()))
            .await
            .unwrap();
        table.append(c, FrameType::ImageChunk, b"retry").await.unwrap();
        table.complete(c, FrameType::ImageChunk).await.unwrap();
        let sent = table.complete(c, FrameType::TextChunk).await.unwrap().unwrap();
        assert_eq!(sent.image, b"retry");
    }

    #[tokio::test]
    async fn valid_compression_invalid_json() {
        let table = TransferTable::new(1024 * 1024);
        let c = conn();
        let junk = zlib(b"{\"sender\":", Compression::default());
        table.append(c, FrameType::TextChunk, &junk).await.unwrap();
        table.complete(c, FrameType::ImageChunk).await.unwrap();
        let err = table.complete(c, FrameType::TextChunk).await.unwrap_err();
        assert!(matches!(err, ServerError::TransferDecode(_)));
    }

    #[tokio::test]
    async fn oversized_stream_is_rejected() {
        let table = TransferTable::new(8);
        let c = conn();
        table.append(c, FrameType::ImageChunk, b"12345").await.unwrap();
        let err = table
            .append(c, FrameType::ImageChunk, b"6789")
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::TransferTooLarge { limit: 8 }));
        assert_eq!(table.in_flight().await, 0);
    }

    #[tokio::test]
    async fn decompression_is_bounded() {
        let table = TransferTable::new(64);
        let c = conn();
        let bomb = zlib(&[b'a'; 4096], Compression::best());
        assert!(bomb.len() <= 64);
        table.append(c, FrameType::TextChunk, &bomb).await.unwrap();
        table.complete(c, FrameType::ImageChunk).await.unwrap();
        let err = table.complete(c, FrameType::TextChunk).await.unwrap_err();
        assert!(matches!(err, ServerError::TransferTooLarge { .. }));
    }

    #[tokio::test]
    async fn chunk_after_end_marker_is_rejected() {
        let table = TransferTable::new(1024);
        let c = conn();
        table.append(c, FrameType::TextChunk, b"abc").await.unwrap();
        table.complete(c, FrameType::TextChunk).await.unwrap();
        assert!(table.append(c, FrameType::TextChunk, b"def").await.is_err());
        assert_eq!(table.in_flight().await, 0);
    }

    #[tokio::test]
    async fn disconnect_discards_partial_state() {
        let table = TransferTable::new(1024);
        let c = conn();
        table.append(c, FrameType::TextChunk, b"partial").await.unwrap();
        assert!(table.discard(c).await);
        assert!(!table.discard(c).await);
        assert_eq!(table.in_flight().await, 0);
    }
}
