//! エンコーダとデコーダのライフサイクル
//!
//! どちらも `Uninitialized → Ready → Closed` の状態を持ちます。
//! `init_context` で Ready になり、Ready の間は 1 フレームずつ処理し、
//! `clean` で Closed になります（冪等）。1 フレームの失敗
//! （`CodecFailure`）ではインスタンスは Ready のまま残ります。

use std::collections::BTreeMap;
use std::fmt;

use super::image::ImageWrapper;
use super::pixel_format::PixelFormat;
use super::registry::{CodecFactory, CodecSpec};
use crate::compression::{self, CompressionAlgorithm};
use crate::error::{Error, Result};
use crate::protocol::Value;

/// 描画パケットに載せるコーデックオプション
pub type CodecOptions = BTreeMap<String, Value>;

/// コーデックの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Uninitialized,
    Ready,
    Closed,
}

impl fmt::Display for CodecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CodecState::Uninitialized => "uninitialized",
            CodecState::Ready => "ready",
            CodecState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// エンコードオプション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderOptions {
    /// 品質目標（0-100）
    pub quality: u8,
    /// 速度目標（0-100）
    pub speed: u8,
    /// コーデック内部のスレッド数
    pub threads: usize,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            quality: 80,
            speed: 50,
            threads: 1,
        }
    }
}

/// エンコード結果
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub encoding: &'static str,
    pub data: Vec<u8>,
    /// 元データの行バイト数（デコーダが参照する）
    pub rowstride: usize,
    pub options: CodecOptions,
}

/// エンコーダ
pub trait Encoder: Send {
    fn name(&self) -> &'static str;

    fn encoding(&self) -> &'static str;

    fn state(&self) -> CodecState;

    /// コンテキストを確保して Ready にする
    fn init_context(
        &mut self,
        width: u32,
        height: u32,
        src_format: PixelFormat,
        options: &EncoderOptions,
    ) -> Result<()>;

    /// 1 フレームを圧縮
    fn compress_image(&mut self, image: &ImageWrapper, options: &EncoderOptions) -> Result<EncodedImage>;

    /// コンテキストを解放して Closed にする（冪等）
    fn clean(&mut self);
}

/// デコーダ
pub trait Decoder: Send {
    fn name(&self) -> &'static str;

    fn encoding(&self) -> &'static str;

    fn state(&self) -> CodecState;

    /// コンテキストを確保して Ready にする
    ///
    /// `dst_format` は出力する画素フォーマットの希望です。
    fn init_context(&mut self, width: u32, height: u32, dst_format: PixelFormat) -> Result<()>;

    /// 1 フレームを展開
    fn decompress_image(&mut self, data: &[u8], options: &CodecOptions) -> Result<ImageWrapper>;

    /// コンテキストを解放して Closed にする（冪等）
    fn clean(&mut self);
}

/// 状態遷移と初期化時の寸法を管理する
#[derive(Debug, Clone)]
pub struct Lifecycle {
    codec: &'static str,
    state: CodecState,
    width: u32,
    height: u32,
    format: Option<PixelFormat>,
}

impl Lifecycle {
    pub fn new(codec: &'static str) -> Self {
        Self {
            codec,
            state: CodecState::Uninitialized,
            width: 0,
            height: 0,
            format: None,
        }
    }

    /// Uninitialized → Ready
    pub fn init(&mut self, width: u32, height: u32, format: PixelFormat) -> Result<()> {
        if self.state != CodecState::Uninitialized {
            return Err(Error::InvalidState(format!(
                "{} は {} 状態のため初期化できません",
                self.codec, self.state
            )));
        }
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter(format!(
                "{}: 画像サイズが不正です: {}x{}",
                self.codec, width, height
            )));
        }
        self.width = width;
        self.height = height;
        self.format = Some(format);
        self.state = CodecState::Ready;
        Ok(())
    }

    pub fn ensure_ready(&self) -> Result<()> {
        match self.state {
            CodecState::Ready => Ok(()),
            state => Err(Error::InvalidState(format!("{} は {} 状態です", self.codec, state))),
        }
    }

    /// 画像が初期化時の寸法と一致するか確認
    pub fn check_image(&self, image: &ImageWrapper) -> Result<()> {
        self.ensure_ready()?;
        if image.width() != self.width || image.height() != self.height {
            return Err(Error::InvalidParameter(format!(
                "{} は {}x{} で初期化されていますが {}x{} が渡されました",
                self.codec,
                self.width,
                self.height,
                image.width(),
                image.height()
            )));
        }
        Ok(())
    }

    /// Closed に遷移。すでに Closed なら `false`
    pub fn close(&mut self) -> bool {
        if self.state == CodecState::Closed {
            return false;
        }
        self.state = CodecState::Closed;
        true
    }

    pub fn state(&self) -> CodecState {
        self.state
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> Option<PixelFormat> {
        self.format
    }
}

/// 仕様からエンコーダを作成して初期化
pub fn new_encoder(
    spec: &CodecSpec,
    width: u32,
    height: u32,
    src_format: PixelFormat,
    options: &EncoderOptions,
) -> Result<Box<dyn Encoder>> {
    let factory = match spec.factory {
        CodecFactory::Encoder(factory) => factory,
        _ => {
            return Err(Error::InvalidParameter(format!(
                "{} はエンコーダではありません",
                spec.name
            )))
        }
    };
    spec.check_size(width, height)?;
    if spec.input_format != Some(src_format) {
        return Err(Error::UnsupportedFormat(format!(
            "{} は {} を入力にできません",
            spec.name, src_format
        )));
    }
    let mut encoder = factory();
    encoder.init_context(width, height, src_format, options)?;
    Ok(encoder)
}

/// 仕様からデコーダを作成して初期化
pub fn new_decoder(spec: &CodecSpec, width: u32, height: u32, dst_format: PixelFormat) -> Result<Box<dyn Decoder>> {
    let factory = match spec.factory {
        CodecFactory::Decoder(factory) => factory,
        _ => {
            return Err(Error::InvalidParameter(format!(
                "{} はデコーダではありません",
                spec.name
            )))
        }
    };
    spec.check_size(width, height)?;
    let mut decoder = factory();
    decoder.init_context(width, height, dst_format)?;
    Ok(decoder)
}

/// 画素データを圧縮し、使った圧縮器をオプションに記録
///
/// 速度目標が 50 以上なら lz4、それ未満なら zlib を使い、圧縮しても
/// 小さくならなければ無圧縮のまま返します。
pub fn pack_payload(raw: Vec<u8>, options: &EncoderOptions, client_options: &mut CodecOptions) -> Result<Vec<u8>> {
    let (algorithm, level) = if options.speed >= 50 {
        (CompressionAlgorithm::LZ4, 1)
    } else {
        (CompressionAlgorithm::Zlib, (1 + (100 - options.speed.min(100)) / 12).min(9))
    };
    let compressed = compression::compress(&raw, algorithm, level)?;
    if compressed.data.len() >= raw.len() {
        return Ok(raw);
    }
    client_options.insert(algorithm.as_str().to_string(), Value::from(u64::from(level)));
    Ok(compressed.data)
}

/// `pack_payload` の逆。展開後の長さが `expected_len` でなければ `CodecFailure`
pub fn unpack_payload(data: &[u8], options: &CodecOptions, expected_len: usize) -> Result<Vec<u8>> {
    let mut raw = None;
    for algorithm in [CompressionAlgorithm::LZ4, CompressionAlgorithm::Zlib] {
        if let Some(level) = options.get(algorithm.as_str()).and_then(Value::as_u64) {
            let level_byte = algorithm.level_byte(level.min(15) as u8);
            let decompressed = compression::decompress(data, level_byte, expected_len)
                .map_err(|e| Error::CodecFailure(format!("画素データを展開できません: {}", e)))?;
            raw = Some(decompressed);
            break;
        }
    }
    let raw = raw.unwrap_or_else(|| data.to_vec());
    if raw.len() != expected_len {
        return Err(Error::CodecFailure(format!(
            "画素データは {} バイトですが {} バイト必要です",
            raw.len(),
            expected_len
        )));
    }
    Ok(raw)
}

/// オプションから文字列を取得
pub fn option_str<'a>(options: &'a CodecOptions, key: &str) -> Option<&'a str> {
    options.get(key).and_then(Value::as_str)
}

/// オプションから真偽値を取得（整数の 0/1 も受け付ける）
pub fn option_bool(options: &CodecOptions, key: &str) -> Option<bool> {
    options.get(key).and_then(Value::as_bool)
}
