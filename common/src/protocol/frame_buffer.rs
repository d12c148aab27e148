//! 受信バイトの蓄積とフレーム切り出し
//!
//! ソケットからの部分的な読み込みを `BytesMut` に溜め、ヘッダとペイロードが
//! 揃った時点でフレームを切り出します。ヘッダは先読みで検証し、ペイロード
//! 全体が届くまで入力を消費しません。

use bytes::{Bytes, BytesMut};

use super::header::{try_decode_header, Header, HEADER_SIZE};
use crate::error::{Error, Result};

/// 既定の最大ペイロードサイズ（64MB）
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// 受信した 1 フレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// ヘッダ
    pub header: Header,
    /// ペイロード（圧縮されたまま）
    pub payload: Bytes,
}

/// 受信フレームバッファ
pub struct FrameBuffer {
    buffer: BytesMut,
    max_packet_size: usize,
}

impl FrameBuffer {
    /// 既定の設定で作成
    pub fn new() -> Self {
        Self::with_max_packet_size(DEFAULT_MAX_PACKET_SIZE)
    }

    /// 最大ペイロードサイズを指定して作成
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_packet_size,
        }
    }

    /// 受信データを追加する（フレームは取り出さない）
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// 受信データを追加し、完成したフレームをすべて取り出す
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// フレームを 1 つ取り出す（データ不足なら `None`）
    pub fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        let header = match try_decode_header(&self.buffer)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if header.payload_len as usize > self.max_packet_size {
            return Err(Error::FrameProtocol(format!(
                "ペイロードサイズ {} が上限 {} を超えています",
                header.payload_len, self.max_packet_size
            )));
        }

        if self.buffer.len() < header.frame_len() {
            // 大きなペイロードは一度に確保しておく
            self.buffer.reserve(header.frame_len() - self.buffer.len());
            return Ok(None);
        }

        let _ = self.buffer.split_to(HEADER_SIZE);
        let payload = self.buffer.split_to(header.payload_len as usize).freeze();
        Ok(Some(Frame { header, payload }))
    }

    /// バッファ済みのバイト数
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// バッファが空かどうか
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// バッファを破棄
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::encode_header;

    fn frame_bytes(payload: &[u8], index: u8) -> Vec<u8> {
        let mut out = encode_header(payload.len() as u32, 0, index).to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_single_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&frame_bytes(b"hello", 0)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_byte_by_byte() {
        let data = frame_bytes(b"fragmented payload", 2);
        let mut buffer = FrameBuffer::new();
        let mut frames = Vec::new();
        for byte in &data {
            frames.extend(buffer.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header.chunk_index, 2);
        assert_eq!(&frames[0].payload[..], b"fragmented payload");
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut data = frame_bytes(b"one", 1);
        data.extend(frame_bytes(b"", 0));
        data.extend(frame_bytes(b"three", 0));
        data.extend(&frame_bytes(b"partial", 0)[..5]);

        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&data).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[1].payload.is_empty());
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_oversized_payload() {
        let mut buffer = FrameBuffer::with_max_packet_size(16);
        let header = encode_header(17, 0, 0);
        assert!(matches!(buffer.push(&header), Err(Error::FrameProtocol(_))));
    }

    #[test]
    fn test_header_not_consumed_until_payload_complete() {
        let data = frame_bytes(b"abcdef", 0);
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&data[..HEADER_SIZE + 2]).unwrap().is_empty());
        assert_eq!(buffer.len(), HEADER_SIZE + 2);
        let frames = buffer.push(&data[HEADER_SIZE + 2..]).unwrap();
        assert_eq!(&frames[0].payload[..], b"abcdef");
    }
}
