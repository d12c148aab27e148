//! 圧縮アルゴリズム
//!
//! ワイヤフレーム単位で適用する圧縮器のレジストリです。
//! フレームヘッダの圧縮レベルバイトが、どの圧縮器が使われたかを示します:
//!
//! | ビット | 意味 |
//! |---|---|
//! | `0x0F` | 圧縮率のヒント（レベル） |
//! | `0x10` | LZ4 |
//! | `0x20`, `0x40`, `0x80` | 未定義（受信時はプロトコルエラー） |
//!
//! レベルバイトが 0 なら無圧縮、フラグなしで非 0 なら zlib です。

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, warn};

use crate::error::{Error, Result};

/// zlib フラグ（レベルのみ）
pub const ZLIB_FLAG: u8 = 0x00;
/// LZ4 フラグ
pub const LZ4_FLAG: u8 = 0x10;
/// 認識しないフラグビット
const UNKNOWN_FLAGS: u8 = 0xE0;
/// レベルを表すビット
const LEVEL_MASK: u8 = 0x0F;

/// 解凍後サイズの絶対上限
pub const MAX_SIZE: usize = 256 * 1024 * 1024;

/// 圧縮方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// 無圧縮
    None,
    /// Zlib
    Zlib,
    /// LZ4
    LZ4,
}

impl CompressionAlgorithm {
    /// 文字列から圧縮アルゴリズムを解析
    pub fn from_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "lz4" => Some(CompressionAlgorithm::LZ4),
            _ => None,
        }
    }

    /// 圧縮アルゴリズムを文字列に変換
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::LZ4 => "lz4",
        }
    }

    /// 圧縮レベルと組み合わせてヘッダのレベルバイトを作る
    pub fn level_byte(&self, level: u8) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            // zlib のレベル 0 は「無圧縮」と区別できないため 1 以上にする
            CompressionAlgorithm::Zlib => ZLIB_FLAG | level.clamp(1, 9),
            CompressionAlgorithm::LZ4 => LZ4_FLAG | (level & LEVEL_MASK),
        }
    }

    /// ヘッダのレベルバイトから圧縮方式を判定
    pub fn from_level_byte(level_byte: u8) -> Result<Self> {
        if level_byte == 0 {
            return Ok(CompressionAlgorithm::None);
        }
        if level_byte & UNKNOWN_FLAGS != 0 {
            return Err(Error::FrameProtocol(format!(
                "未知の圧縮識別子です: {:#04x}",
                level_byte
            )));
        }
        if level_byte & LZ4_FLAG != 0 {
            Ok(CompressionAlgorithm::LZ4)
        } else {
            Ok(CompressionAlgorithm::Zlib)
        }
    }
}

/// 圧縮されたペイロード
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    /// ヘッダに書き込むレベルバイト
    pub level_byte: u8,
    /// 圧縮済みデータ
    pub data: Vec<u8>,
}

/// データを圧縮
///
/// 戻り値のレベルバイトをそのままフレームヘッダに書き込みます。
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm, level: u8) -> Result<Compressed> {
    if data.len() > MAX_SIZE {
        return Err(Error::InvalidParameter(format!(
            "圧縮前のデータが大きすぎます: {}MB（上限 {}MB）",
            data.len() / 1024 / 1024,
            MAX_SIZE / 1024 / 1024
        )));
    }
    let level_byte = algorithm.level_byte(level);
    let data = match algorithm {
        CompressionAlgorithm::None => data.to_vec(),

        CompressionAlgorithm::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(u32::from(level.clamp(1, 9))));
            encoder.write_all(data)?;
            encoder.finish()?
        }

        CompressionAlgorithm::LZ4 => {
            let mode = if level >= 7 {
                lz4::block::CompressionMode::HIGHCOMPRESSION(i32::from(level))
            } else if level <= 3 {
                lz4::block::CompressionMode::FAST(8 - i32::from(level) * 2)
            } else {
                lz4::block::CompressionMode::DEFAULT
            };
            // 先頭 4 バイト（リトルエンディアン）に解凍後サイズを付加
            lz4::block::compress(data, Some(mode), true)
                .map_err(|e| Error::CodecFailure(format!("LZ4 圧縮エラー: {}", e)))?
        }
    };
    Ok(Compressed { level_byte, data })
}

/// データを解凍
///
/// `max_size` を超える解凍後サイズは、確保の前に拒否します。
pub fn decompress(data: &[u8], level_byte: u8, max_size: usize) -> Result<Vec<u8>> {
    let max_size = max_size.min(MAX_SIZE);
    match CompressionAlgorithm::from_level_byte(level_byte)? {
        CompressionAlgorithm::None => Ok(data.to_vec()),

        CompressionAlgorithm::Zlib => {
            let mut decoder = ZlibDecoder::new(data).take(max_size as u64 + 1);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| Error::Decode(format!("zlib 解凍エラー: {}", e)))?;
            if decompressed.len() > max_size {
                return Err(Error::FrameProtocol(format!(
                    "解凍後のサイズが上限 {} バイトを超えています",
                    max_size
                )));
            }
            Ok(decompressed)
        }

        CompressionAlgorithm::LZ4 => {
            if data.len() < 4 {
                return Err(Error::Decode("LZ4 データにサイズヘッダがありません".to_string()));
            }
            let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if size > max_size {
                return Err(Error::FrameProtocol(format!(
                    "LZ4 の解凍後サイズ {} が上限 {} を超えています",
                    size, max_size
                )));
            }
            lz4::block::decompress(data, None)
                .map_err(|e| Error::Decode(format!("LZ4 解凍エラー: {}", e)))
        }
    }
}

/// 利用可能な圧縮アルゴリズムを取得（性能順）
pub fn available_algorithms() -> Vec<CompressionAlgorithm> {
    vec![CompressionAlgorithm::LZ4, CompressionAlgorithm::Zlib]
}

/// ローカルの優先順位とピアの対応リストから圧縮器を選択
///
/// 共通の圧縮器がなければ無圧縮になります。
pub fn negotiate_compressor(preferred: &[CompressionAlgorithm], remote: &[String]) -> CompressionAlgorithm {
    let remote: Vec<CompressionAlgorithm> = remote
        .iter()
        .filter_map(|name| CompressionAlgorithm::from_name(name))
        .collect();
    for algorithm in preferred {
        if *algorithm != CompressionAlgorithm::None && remote.contains(algorithm) {
            debug!(target: "compression", "圧縮器をネゴシエート: {}", algorithm.as_str());
            return *algorithm;
        }
    }
    warn!(target: "compression", "ピアと共通の圧縮器がありません。無圧縮で送信します");
    CompressionAlgorithm::None
}
