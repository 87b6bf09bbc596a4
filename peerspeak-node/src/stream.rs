//! Framed reads and queued writes over a TCP stream.

use std::io;

use peerspeak_core::wire;
use peerspeak_core::{Channel, MessageHeader, MessageKind, PeerId, WireError, HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Read one header, then exactly `payload_length` bytes.
/// Returns the header and the whole frame as it appeared on the wire.
/// End of stream between frames is `UnexpectedEof` without a payload (see [`is_eof`]);
/// inside a frame it carries a "truncated frame" message.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> io::Result<(MessageHeader, Vec<u8>)> {
    let mut head = [0u8; HEADER_LEN];
    let n = reader.read(&mut head).await?;
    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    reader
        .read_exact(&mut head[n..])
        .await
        .map_err(truncated)?;
    let header = wire::decode_header(&head);
    let mut frame = vec![0u8; HEADER_LEN + header.payload_length as usize];
    frame[..HEADER_LEN].copy_from_slice(&head);
    reader
        .read_exact(&mut frame[HEADER_LEN..])
        .await
        .map_err(truncated)?;
    Ok((header, frame))
}

fn truncated(e: io::Error) -> io::Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a frame")
    } else {
        e
    }
}

/// Clean end-of-stream on a frame boundary, as opposed to a transport fault or a truncated frame.
pub fn is_eof(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::UnexpectedEof && e.get_ref().is_none()
}

/// Write side of a link: frames go into a queue drained by a writer task, so callers never wait.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    channel: Channel,
}

impl Outbox {
    /// Spawn the writer task for `writer`. It exits when every `Outbox` clone is gone
    /// or on the first write error, which is logged and not retried.
    pub fn spawn<W>(writer: W, channel: Channel, label: String) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_loop(writer, rx, label));
        (Self { tx, channel }, task)
    }

    /// Validate, frame and queue a message.
    pub fn write(
        &self,
        kind: MessageKind,
        sequence: u16,
        sender_id: PeerId,
        payload: &[u8],
    ) -> Result<(), WireError> {
        let frame = wire::encode_for(self.channel, kind, sequence, sender_id, payload)?;
        self.send_raw(frame);
        Ok(())
    }

    /// Queue an already encoded frame unchanged.
    pub fn send_raw(&self, frame: Vec<u8>) {
        if self.tx.send(frame).is_err() {
            log::debug!("{} write queue closed, frame dropped", self.channel);
        }
    }

    /// True once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    label: String,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            log::warn!("write error on {}: {}", label, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_frame_consumes_exact_payload() {
        let a = wire::encode(MessageKind::Chat, 1, PeerId(3), b"abc").unwrap();
        let b = wire::encode(MessageKind::Add, 2, PeerId(3), &9u64.to_be_bytes()).unwrap();
        let mut bytes = a.clone();
        bytes.extend_from_slice(&b);
        let mut reader = bytes.as_slice();
        let (h1, f1) = read_frame(&mut reader).await.unwrap();
        assert_eq!(h1.payload_length, 3);
        assert_eq!(f1, a);
        let (h2, f2) = read_frame(&mut reader).await.unwrap();
        assert_eq!(h2.kind, MessageKind::Add);
        assert_eq!(f2, b);
        let end = read_frame(&mut reader).await.unwrap_err();
        assert!(is_eof(&end));
    }

    #[tokio::test]
    async fn truncated_frame_is_not_a_clean_end() {
        let frame = wire::encode(MessageKind::Chat, 1, PeerId(3), b"abcdef").unwrap();

        let mut half_header = &frame[..5];
        let e = read_frame(&mut half_header).await.unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);
        assert!(!is_eof(&e));

        let mut half_payload = &frame[..HEADER_LEN + 2];
        let e = read_frame(&mut half_payload).await.unwrap_err();
        assert!(!is_eof(&e));
    }

    #[tokio::test]
    async fn outbox_rejects_before_writing() {
        let (client, mut server) = tokio::io::duplex(256);
        let (outbox, task) = Outbox::spawn(client, Channel::Discovery, "test".into());
        assert!(matches!(
            outbox.write(MessageKind::Chat, 0, PeerId(1), b"hi"),
            Err(WireError::NotAllowed { .. })
        ));
        assert!(outbox.write(MessageKind::Open, 0, PeerId(1), &[0; 4]).is_err());
        outbox
            .write(MessageKind::Accept, 0, PeerId(1), &[1])
            .unwrap();
        drop(outbox);
        task.await.unwrap();
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        // Only the ACCEPT frame reached the stream.
        assert_eq!(got.len(), HEADER_LEN + 1);
        assert_eq!(got[10], MessageKind::Accept.code());
    }
}
