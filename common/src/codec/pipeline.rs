//! 領域ごとのエンコード・デコードパイプライン
//!
//! サーバー側の `RegionEncoder` は、キャプチャした画面領域を必要なら
//! 色空間変換してからエンコードし、`draw` パケットにします。
//! クライアント側の `RegionDecoder` はその逆を行い、提示用の
//! フォーマットに変換した画像を返します。
//!
//! どちらも (フォーマット, 幅, 高さ) が変わらない間は変換器とコーデックを
//! 使い回し、変わったときは古いインスタンスを閉じてから作り直します。
//! インスタンスは 1 つのワーカーだけが所有するため、パイプラインごと
//! ワーカーに渡して使います。

use std::sync::Arc;

use log::{debug, trace, warn};

use super::csc::{ColorspaceConverter, CscOptions, CscParams};
use super::image::ImageWrapper;
use super::pixel_format::PixelFormat;
use super::registry::{new_converter, CodecRegistry, CodecSpec, PipelineKey, PipelineOption, ScoreTarget};
use super::video::{new_decoder, new_encoder, CodecOptions, Decoder, EncodedImage, Encoder, EncoderOptions};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::protocol::{Message, PacketType, Value};

/// `draw` パケット
///
/// `["draw", wid, x, y, w, h, encoding, data, sequence, rowstride, options]`
#[derive(Debug, Clone, PartialEq)]
pub struct DrawPacket {
    pub wid: u64,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub encoding: String,
    pub data: Vec<u8>,
    pub sequence: u64,
    pub rowstride: usize,
    pub options: CodecOptions,
}

impl DrawPacket {
    /// エンコード結果から作成
    pub fn new(wid: u64, x: u32, y: u32, width: u32, height: u32, sequence: u64, encoded: EncodedImage) -> Self {
        Self {
            wid,
            x,
            y,
            width,
            height,
            encoding: encoded.encoding.to_string(),
            data: encoded.data,
            sequence,
            rowstride: encoded.rowstride,
            options: encoded.options,
        }
    }

    pub fn to_message(self) -> Message {
        PacketType::Draw
            .message()
            .with(self.wid)
            .with(self.x)
            .with(self.y)
            .with(self.width)
            .with(self.height)
            .with(self.encoding)
            .with(self.data)
            .with(self.sequence)
            .with(self.rowstride)
            .with(self.options)
    }

    pub fn from_message(message: Message) -> Result<Self> {
        let narrow = |index: usize| -> Result<u32> {
            let v = message.uint_arg(index)?;
            u32::try_from(v).map_err(|_| Error::Decode(format!("draw: 位置 {} の値 {} は範囲外です", index, v)))
        };
        let wid = message.uint_arg(1)?;
        let (x, y, width, height) = (narrow(2)?, narrow(3)?, narrow(4)?, narrow(5)?);
        let encoding = message.str_arg(6)?.to_string();
        message.bytes_arg(7)?;
        let sequence = message.uint_arg(8)?;
        let rowstride = usize::try_from(message.uint_arg(9)?)
            .map_err(|_| Error::Decode("draw: rowstride が範囲外です".to_string()))?;
        let options = message.map_arg(10)?.clone();

        let data = match message.into_items().swap_remove(7) {
            Value::Bytes(data) => data,
            other => return Err(Error::Decode(format!("draw: data が {} です", other.kind()))),
        };
        Ok(Self {
            wid,
            x,
            y,
            width,
            height,
            encoding,
            data,
            sequence,
            rowstride,
            options,
        })
    }
}

/// `damage-sequence` パケット（描画の確認応答）
///
/// `["damage-sequence", sequence, wid, w, h, decode_time_us, message]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamageAck {
    pub sequence: u64,
    pub wid: u64,
    pub width: u32,
    pub height: u32,
    pub decode_time_us: u64,
    /// 成功時は空、失敗時はエラーの説明
    pub message: String,
}

impl DamageAck {
    pub fn to_message(&self) -> Message {
        PacketType::DamageSequence
            .message()
            .with(self.sequence)
            .with(self.wid)
            .with(self.width)
            .with(self.height)
            .with(self.decode_time_us)
            .with(self.message.as_str())
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        let narrow = |index: usize| -> Result<u32> {
            let v = message.uint_arg(index)?;
            u32::try_from(v)
                .map_err(|_| Error::Decode(format!("damage-sequence: 位置 {} の値 {} は範囲外です", index, v)))
        };
        Ok(Self {
            sequence: message.uint_arg(1)?,
            wid: message.uint_arg(2)?,
            width: narrow(3)?,
            height: narrow(4)?,
            decode_time_us: message.uint_arg(5)?,
            message: message.str_arg(6)?.to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.message.is_empty()
    }
}

struct ActiveEncode {
    key: PipelineKey,
    src_format: PixelFormat,
    csc: Option<Box<dyn ColorspaceConverter>>,
    encoder: Box<dyn Encoder>,
}

impl ActiveEncode {
    fn close(&mut self) {
        if let Some(csc) = self.csc.as_mut() {
            csc.clean();
        }
        self.encoder.clean();
    }
}

/// サーバー側の領域エンコーダ
pub struct RegionEncoder {
    registry: Arc<CodecRegistry>,
    encoding: String,
    target: ScoreTarget,
    config: PipelineConfig,
    full_range: bool,
    active: Option<ActiveEncode>,
}

impl RegionEncoder {
    pub fn new(registry: Arc<CodecRegistry>, encoding: &str, config: &PipelineConfig) -> Self {
        Self {
            registry,
            encoding: encoding.to_string(),
            target: ScoreTarget::from(config),
            config: config.clone(),
            full_range: true,
            active: None,
        }
    }

    /// YUV に変換するときのレンジ
    pub fn with_full_range(mut self, full_range: bool) -> Self {
        self.full_range = full_range;
        self
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// エンコーディングを切り替える（変わる場合は現在のパイプラインを閉じる）
    pub fn set_encoding(&mut self, encoding: &str) {
        if self.encoding != encoding {
            self.close();
            self.encoding = encoding.to_string();
        }
    }

    /// 使用中のパイプライン
    pub fn current(&self) -> Option<&PipelineKey> {
        self.active.as_ref().map(|active| &active.key)
    }

    /// 画像をエンコード
    ///
    /// 画像はこの呼び出しが所有し、終了時に解放します。
    pub fn encode(&mut self, mut image: ImageWrapper) -> Result<EncodedImage> {
        let (format, width, height) = (image.pixel_format(), image.width(), image.height());
        let reusable = self.active.as_ref().map_or(false, |active| {
            active.src_format == format && active.key.width == width && active.key.height == height
        });
        if !reusable {
            self.rebuild(format, width, height)?;
        }
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| Error::InvalidState("パイプラインがありません".to_string()))?;

        let options = EncoderOptions {
            quality: self.target.quality,
            speed: self.target.speed,
            threads: self.config.codec_thread_count(active.encoder.name(), 1),
        };
        let mut encoded = match active.csc.as_mut() {
            Some(csc) => {
                let mut converted = csc.convert_image(&image)?;
                image.free();
                let result = active.encoder.compress_image(&converted, &options);
                converted.free();
                result?
            }
            None => {
                let result = active.encoder.compress_image(&image, &options);
                image.free();
                result?
            }
        };
        encoded
            .options
            .insert("quality".to_string(), Value::from(u64::from(options.quality)));
        encoded
            .options
            .insert("speed".to_string(), Value::from(u64::from(options.speed)));
        Ok(encoded)
    }

    fn rebuild(&mut self, format: PixelFormat, width: u32, height: u32) -> Result<()> {
        let previous = self.active.as_ref().map(|active| active.key.clone());
        self.close();

        let registry = Arc::clone(&self.registry);
        let candidates = registry.rank_pipelines(format, &self.encoding, width, height, &self.target, previous.as_ref());
        if candidates.is_empty() {
            return Err(Error::UnsupportedFormat(format!(
                "{} を {}x{} の {} でエンコードする方法がありません",
                format, width, height, self.encoding
            )));
        }
        let mut last_error = None;
        for candidate in &candidates {
            match self.build(candidate, format, width, height) {
                Ok(active) => {
                    debug!(
                        target: "codec",
                        "パイプライン: {} {}x{} -> {:?} -> {} ({}) score={}",
                        format,
                        width,
                        height,
                        active.key.csc,
                        active.key.encoder,
                        active.key.csc_format,
                        candidate.score
                    );
                    self.active = Some(active);
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        target: "codec",
                        "{:?} -> {} を構築できません: {}",
                        candidate.csc.map(|spec| spec.name),
                        candidate.encoder.name,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::UnsupportedFormat(self.encoding.clone())))
    }

    fn build(&self, candidate: &PipelineOption<'_>, format: PixelFormat, width: u32, height: u32) -> Result<ActiveEncode> {
        let mut csc = match candidate.csc {
            Some(spec) => {
                let params = CscParams::same_size(width, height, format, candidate.csc_format).with_options(CscOptions {
                    full_range: self.full_range,
                });
                Some(new_converter(spec, params)?)
            }
            None => None,
        };
        let options = EncoderOptions {
            quality: self.target.quality,
            speed: self.target.speed,
            threads: self.config.codec_thread_count(candidate.encoder.name, 1),
        };
        let encoder = match new_encoder(candidate.encoder, width, height, candidate.csc_format, &options) {
            Ok(encoder) => encoder,
            Err(e) => {
                if let Some(csc) = csc.as_mut() {
                    csc.clean();
                }
                return Err(e);
            }
        };
        Ok(ActiveEncode {
            key: candidate.key(width, height),
            src_format: format,
            csc,
            encoder,
        })
    }

    /// 変換器とエンコーダを閉じる（冪等）
    pub fn close(&mut self) {
        if let Some(mut active) = self.active.take() {
            trace!(target: "codec", "パイプラインを閉じます: {}", active.key.encoder);
            active.close();
        }
    }
}

impl Drop for RegionEncoder {
    fn drop(&mut self) {
        self.close();
    }
}

struct ActiveDecode {
    width: u32,
    height: u32,
    decoder: Box<dyn Decoder>,
}

/// クライアント側の領域デコーダ
///
/// デコーダはエンコーディングごとに 1 つ、変換器は 1 つだけ保持します。
pub struct RegionDecoder {
    registry: Arc<CodecRegistry>,
    target_format: PixelFormat,
    target: ScoreTarget,
    decoders: Vec<(String, ActiveDecode)>,
    csc: Option<Box<dyn ColorspaceConverter>>,
}

impl RegionDecoder {
    /// `target_format` は提示側が受け取る画素フォーマット
    pub fn new(registry: Arc<CodecRegistry>, target_format: PixelFormat, config: &PipelineConfig) -> Self {
        Self {
            registry,
            target_format,
            target: ScoreTarget::from(config),
            decoders: Vec::new(),
            csc: None,
        }
    }

    pub fn target_format(&self) -> PixelFormat {
        self.target_format
    }

    /// `draw` パケットを提示用の画像にする
    ///
    /// 返す画像の位置は領域の座標です。1 フレームの失敗
    /// （`CodecFailure`）ではデコーダは閉じません。
    pub fn decode(&mut self, draw: &DrawPacket) -> Result<ImageWrapper> {
        let decoder = self.decoder_for(&draw.encoding, draw.width, draw.height)?;
        let mut decoded = decoder.decompress_image(&draw.data, &draw.options)?;
        decoded.set_position(draw.x, draw.y);
        if decoded.pixel_format() == self.target_format {
            return Ok(decoded);
        }

        let csc = self.converter_for(&decoded)?;
        let result = csc.convert_image(&decoded);
        decoded.free();
        let mut converted = result?;
        converted.set_position(draw.x, draw.y);
        Ok(converted)
    }

    fn decoder_for(&mut self, encoding: &str, width: u32, height: u32) -> Result<&mut Box<dyn Decoder>> {
        let position = self.decoders.iter().position(|(name, _)| name == encoding);
        if let Some(index) = position {
            let (_, active) = &mut self.decoders[index];
            if active.width != width || active.height != height {
                active.decoder.clean();
                self.decoders.swap_remove(index);
            }
        }
        let index = match self.decoders.iter().position(|(name, _)| name == encoding) {
            Some(index) => index,
            None => {
                let decoder = self.create_decoder(encoding, width, height)?;
                self.decoders.push((
                    encoding.to_string(),
                    ActiveDecode {
                        width,
                        height,
                        decoder,
                    },
                ));
                self.decoders.len() - 1
            }
        };
        Ok(&mut self.decoders[index].1.decoder)
    }

    fn create_decoder(&self, encoding: &str, width: u32, height: u32) -> Result<Box<dyn Decoder>> {
        let specs = self.registry.decoder_specs(encoding);
        if specs.is_empty() {
            return Err(Error::UnsupportedFormat(format!("'{}' のデコーダがありません", encoding)));
        }
        let mut last_error = None;
        for spec in specs {
            let format = preferred_output(spec, self.target_format);
            match new_decoder(spec, width, height, format) {
                Ok(decoder) => {
                    debug!(target: "codec", "デコーダ: {} {}x{} -> {}", spec.name, width, height, format);
                    return Ok(decoder);
                }
                Err(e) => {
                    debug!(target: "codec", "{} を構築できません: {}", spec.name, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::UnsupportedFormat(encoding.to_string())))
    }

    fn converter_for(&mut self, image: &ImageWrapper) -> Result<&mut Box<dyn ColorspaceConverter>> {
        let (format, width, height) = (image.pixel_format(), image.width(), image.height());
        let reusable = self.csc.as_ref().map_or(false, |csc| {
            let p = csc.params();
            p.src_format == format && p.src_width == width && p.src_height == height
        });
        if !reusable {
            let current = self.csc.as_ref().map(|csc| csc.name());
            if let Some(mut old) = self.csc.take() {
                old.clean();
            }
            let ranked = self
                .registry
                .rank_csc(format, self.target_format, width, height, &self.target, current);
            let params = CscParams::same_size(width, height, format, self.target_format);
            let mut created = None;
            for (score, spec) in ranked {
                match new_converter(spec, params) {
                    Ok(csc) => {
                        debug!(target: "csc", "変換器: {} {} -> {} score={}", spec.name, format, self.target_format, score);
                        created = Some(csc);
                        break;
                    }
                    Err(e) => debug!(target: "csc", "{} を構築できません: {}", spec.name, e),
                }
            }
            let csc = created.ok_or_else(|| {
                Error::UnsupportedFormat(format!("{} -> {} の変換器がありません", format, self.target_format))
            })?;
            self.csc = Some(csc);
        }
        self.csc
            .as_mut()
            .ok_or_else(|| Error::InvalidState("変換器がありません".to_string()))
    }

    /// すべてのデコーダと変換器を閉じる（冪等）
    pub fn close(&mut self) {
        for (encoding, mut active) in self.decoders.drain(..) {
            trace!(target: "codec", "{} のデコーダを閉じます", encoding);
            active.decoder.clean();
        }
        if let Some(mut csc) = self.csc.take() {
            csc.clean();
        }
    }
}

impl Drop for RegionDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

/// デコーダに要求する出力フォーマット
fn preferred_output(spec: &CodecSpec, target: PixelFormat) -> PixelFormat {
    if spec.output_formats.contains(&target) {
        target
    } else {
        match spec.output_formats.first() {
            Some(format) => *format,
            None => {
                warn!(target: "codec", "{} は出力フォーマットを宣言していません", spec.name);
                target
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::csc::software;

    fn registry() -> Arc<CodecRegistry> {
        Arc::new(CodecRegistry::with_defaults(&PipelineConfig::default()).unwrap())
    }

    fn gradient(width: u32, height: u32) -> ImageWrapper {
        let stride = width as usize * 4;
        let mut pixels = vec![0u8; stride * height as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let i = y * stride + x * 4;
                pixels[i..i + 4].copy_from_slice(&[(x * 4) as u8, (y * 4) as u8, 128, 0]);
            }
        }
        ImageWrapper::from_packed(0, 0, width, height, PixelFormat::BGRX, pixels, stride).unwrap()
    }

    #[test]
    fn test_rgb_region_roundtrip() {
        let registry = registry();
        let config = PipelineConfig::default();
        let mut encoder = RegionEncoder::new(Arc::clone(&registry), "rgb", &config);
        let source = gradient(24, 16);
        let expected = source.try_clone().unwrap();
        let encoded = encoder.encode(source).unwrap();
        let draw = DrawPacket::new(1, 10, 20, 24, 16, 7, encoded);

        let mut decoder = RegionDecoder::new(registry, PixelFormat::BGRX, &config);
        let image = decoder.decode(&draw).unwrap();
        assert_eq!((image.x(), image.y()), (10, 20));
        assert_eq!(image.pixel_format(), PixelFormat::BGRX);
        for (x, y) in [(0, 0), (23, 15), (7, 9)] {
            assert_eq!(image.rgb_at(x, y).unwrap(), expected.rgb_at(x, y).unwrap());
        }
    }

    #[test]
    fn test_planar_region_within_bound() {
        let registry = registry();
        let config = PipelineConfig {
            quality: 100,
            ..PipelineConfig::default()
        };
        let mut encoder = RegionEncoder::new(Arc::clone(&registry), "planar", &config);
        let source = gradient(32, 32);
        let expected = source.try_clone().unwrap();
        let encoded = encoder.encode(source).unwrap();
        assert!(encoded.options.contains_key("csc"));
        assert!(encoder.current().is_some());
        let draw = DrawPacket::new(1, 0, 0, 32, 32, 1, encoded);

        let mut decoder = RegionDecoder::new(registry, PixelFormat::BGRX, &config);
        let image = decoder.decode(&draw).unwrap();
        for y in 0..32 {
            for x in 0..32 {
                let a = image.rgb_at(x, y).unwrap();
                let b = expected.rgb_at(x, y).unwrap();
                for c in 0..3 {
                    assert!((a[c] as i32 - b[c] as i32).abs() <= 2, "({}, {})", x, y);
                }
            }
        }
    }

    #[test]
    fn test_pipeline_reused_until_size_changes() {
        let registry = registry();
        let mut config = PipelineConfig::default();
        config.forced_csc = Some(software::NAME.to_string());
        let mut encoder = RegionEncoder::new(registry, "planar", &config);
        encoder.encode(gradient(16, 16)).unwrap();
        let first = encoder.current().cloned().unwrap();
        encoder.encode(gradient(16, 16)).unwrap();
        assert_eq!(encoder.current(), Some(&first));
        encoder.encode(gradient(8, 16)).unwrap();
        assert_eq!(encoder.current().map(|key| key.width), Some(8));
        encoder.close();
        assert!(encoder.current().is_none());
    }

    #[test]
    fn test_unknown_encoding() {
        let mut encoder = RegionEncoder::new(registry(), "h264", &PipelineConfig::default());
        assert!(matches!(encoder.encode(gradient(4, 4)), Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn test_corrupt_draw_keeps_decoder() {
        let registry = registry();
        let config = PipelineConfig::default();
        let mut encoder = RegionEncoder::new(Arc::clone(&registry), "rgb", &config);
        let good = DrawPacket::new(1, 0, 0, 8, 8, 1, encoder.encode(gradient(8, 8)).unwrap());
        let mut bad = good.clone();
        bad.data.truncate(3);

        let mut decoder = RegionDecoder::new(registry, PixelFormat::BGRX, &config);
        assert!(matches!(decoder.decode(&bad), Err(Error::CodecFailure(_))));
        assert!(decoder.decode(&good).is_ok());
    }

    #[test]
    fn test_draw_packet_message() {
        let mut options = CodecOptions::new();
        options.insert("csc".into(), Value::from("YUV420P"));
        let draw = DrawPacket {
            wid: 3,
            x: 1,
            y: 2,
            width: 10,
            height: 20,
            encoding: "planar".into(),
            data: vec![9; 40],
            sequence: 99,
            rowstride: 10,
            options,
        };
        let message = draw.clone().to_message();
        assert_eq!(message.packet_type(), "draw");
        assert_eq!(message.len(), 11);
        assert_eq!(DrawPacket::from_message(message).unwrap(), draw);
        assert!(DrawPacket::from_message(Message::new("draw").with(1u64)).is_err());
    }

    #[test]
    fn test_damage_ack_message() {
        let ack = DamageAck {
            sequence: 5,
            wid: 1,
            width: 64,
            height: 48,
            decode_time_us: 1200,
            message: String::new(),
        };
        let parsed = DamageAck::from_message(&ack.to_message()).unwrap();
        assert_eq!(parsed, ack);
        assert!(parsed.is_success());
    }

    #[test]
    fn test_damage_ack_out_of_range_size() {
        let message = PacketType::DamageSequence
            .message()
            .with(5u64)
            .with(1u64)
            .with(1u64 << 33)
            .with(48u64)
            .with(0u64)
            .with("");
        assert!(matches!(DamageAck::from_message(&message), Err(Error::Decode(_))));
    }
}
