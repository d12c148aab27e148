//! ワイヤフレームヘッダ
//!
//! すべてのフレームは 8 バイトのヘッダで始まります:
//!
//! | オフセット | サイズ | 内容 |
//! |---|---|---|
//! | 0 | 1 | マジックバイト `'P'` |
//! | 1 | 1 | プロトコルフラグ（このバージョンでは常に 0） |
//! | 2 | 1 | 圧縮レベル / 圧縮器識別子（0 = 無圧縮） |
//! | 3 | 1 | チャンク番号（0 = 構造化メッセージ、1 以上 = ブロブ） |
//! | 4-7 | 4 | ペイロード長（ビッグエンディアン） |

use bytes::{Buf, BufMut};

use crate::compression::CompressionAlgorithm;
use crate::error::{Error, Result};

/// マジックバイト
pub const MAGIC: u8 = b'P';
/// ヘッダサイズ
pub const HEADER_SIZE: usize = 8;
/// 最大チャンク番号
pub const MAX_CHUNK_INDEX: u8 = u8::MAX;

/// デコード済みのフレームヘッダ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// プロトコルフラグ
    pub flags: u8,
    /// 圧縮レベルバイト
    pub compression_level: u8,
    /// チャンク番号
    pub chunk_index: u8,
    /// ペイロード長
    pub payload_len: u32,
}

impl Header {
    /// 新しいヘッダを作成
    pub fn new(payload_len: u32, compression_level: u8, chunk_index: u8) -> Self {
        Self {
            flags: 0,
            compression_level,
            chunk_index,
            payload_len,
        }
    }

    /// ヘッダとペイロードを合わせたフレーム全体の長さ
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }

    /// 構造化メッセージを運ぶチャンクかどうか
    pub fn is_message(&self) -> bool {
        self.chunk_index == 0
    }

    /// 圧縮方式
    pub fn compression(&self) -> Result<CompressionAlgorithm> {
        CompressionAlgorithm::from_level_byte(self.compression_level)
    }
}

/// ヘッダをエンコード
pub fn encode_header(payload_len: u32, compression_level: u8, chunk_index: u8) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    let mut buf = &mut out[..];
    buf.put_u8(MAGIC);
    buf.put_u8(0);
    buf.put_u8(compression_level);
    buf.put_u8(chunk_index);
    buf.put_u32(payload_len);
    out
}

/// バッファ先頭のヘッダを読み取る（入力は消費しない）
///
/// 8 バイトに満たない場合は `Ok(None)` を返します。マジックバイト、
/// フラグ、圧縮識別子のいずれかが不正なら `FrameProtocol` エラーです。
pub fn try_decode_header(buffer: &[u8]) -> Result<Option<Header>> {
    if buffer.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut buf = &buffer[..HEADER_SIZE];
    let magic = buf.get_u8();
    if magic != MAGIC {
        return Err(Error::FrameProtocol(format!(
            "不正なマジックバイトです: {:#04x}",
            magic
        )));
    }
    let flags = buf.get_u8();
    if flags != 0 {
        return Err(Error::FrameProtocol(format!(
            "未対応のプロトコルフラグです: {:#04x}",
            flags
        )));
    }
    let compression_level = buf.get_u8();
    CompressionAlgorithm::from_level_byte(compression_level)?;
    let chunk_index = buf.get_u8();
    let payload_len = buf.get_u32();

    Ok(Some(Header {
        flags,
        compression_level,
        chunk_index,
        payload_len,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let header = encode_header(0x0102_0304, 0x11, 3);
        assert_eq!(header, [b'P', 0, 0x11, 3, 1, 2, 3, 4]);
    }

    #[test]
    fn test_short_buffer() {
        let header = encode_header(10, 0, 0);
        for len in 0..HEADER_SIZE {
            assert_eq!(try_decode_header(&header[..len]).unwrap(), None);
        }
    }

    #[test]
    fn test_peek_ignores_trailing_bytes() {
        let mut frame = encode_header(3, 0, 0).to_vec();
        frame.extend_from_slice(b"abc");
        let header = try_decode_header(&frame).unwrap().unwrap();
        assert_eq!(header.frame_len(), frame.len());
        assert!(header.is_message());
    }

    #[test]
    fn test_bad_magic() {
        let mut header = encode_header(0, 0, 0);
        header[0] = b'X';
        assert!(matches!(try_decode_header(&header), Err(Error::FrameProtocol(_))));
    }

    #[test]
    fn test_nonzero_flags() {
        let mut header = encode_header(0, 0, 0);
        header[1] = 0x10;
        assert!(matches!(try_decode_header(&header), Err(Error::FrameProtocol(_))));
    }

    #[test]
    fn test_unknown_compressor() {
        let header = encode_header(0, 0x40, 0);
        assert!(matches!(try_decode_header(&header), Err(Error::FrameProtocol(_))));
    }

    fn known_level() -> impl Strategy<Value = u8> {
        prop_oneof![Just(0u8), 1u8..=9, (0u8..=9).prop_map(|l| 0x10 | l)]
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(len in any::<u32>(), level in known_level(), index in any::<u8>()) {
            let bytes = encode_header(len, level, index);
            let header = try_decode_header(&bytes).unwrap().unwrap();
            prop_assert_eq!(header, Header::new(len, level, index));
        }
    }
}
