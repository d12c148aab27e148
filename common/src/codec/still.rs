//! 静止画エンコーディング（`png`, `jpeg`）
//!
//! `image` クレートで圧縮・展開します。`image-codecs` 機能が有効な
//! ビルドでのみ登録されます。

use ::image::codecs::jpeg::JpegEncoder;
use ::image::codecs::png::PngEncoder;
use ::image::{ColorType, ImageEncoder, ImageFormat};
use log::trace;

use super::image::ImageWrapper;
use super::pixel_format::PixelFormat;
use super::registry::CodecSpec;
use super::video::{CodecOptions, CodecState, Decoder, EncodedImage, Encoder, EncoderOptions, Lifecycle};
use crate::error::{Error, Result};
use crate::protocol::Value;

/// 静止画の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillKind {
    Png,
    Jpeg,
}

impl StillKind {
    pub fn encoding(&self) -> &'static str {
        match self {
            StillKind::Png => "png",
            StillKind::Jpeg => "jpeg",
        }
    }

    fn encoder_name(&self) -> &'static str {
        match self {
            StillKind::Png => "enc_png",
            StillKind::Jpeg => "enc_jpeg",
        }
    }

    fn decoder_name(&self) -> &'static str {
        match self {
            StillKind::Png => "dec_png",
            StillKind::Jpeg => "dec_jpeg",
        }
    }

    /// 扱える画素フォーマット（JPEG はアルファを持てない）
    fn formats(&self) -> &'static [PixelFormat] {
        match self {
            StillKind::Png => &[PixelFormat::RGB, PixelFormat::RGBA],
            StillKind::Jpeg => &[PixelFormat::RGB],
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            StillKind::Png => ImageFormat::Png,
            StillKind::Jpeg => ImageFormat::Jpeg,
        }
    }
}

/// 登録する仕様
pub fn specs() -> Vec<CodecSpec> {
    let mut specs = Vec::new();
    for &format in StillKind::Png.formats() {
        specs.push(CodecSpec::encoder("enc_png", "png", format, create_png_encoder).with_speed(20));
    }
    specs.push(
        CodecSpec::encoder("enc_jpeg", "jpeg", PixelFormat::RGB, create_jpeg_encoder)
            .with_quality(70)
            .with_speed(60),
    );
    specs.push(CodecSpec::decoder(
        "dec_png",
        "png",
        StillKind::Png.formats().to_vec(),
        create_png_decoder,
    ));
    specs.push(CodecSpec::decoder(
        "dec_jpeg",
        "jpeg",
        StillKind::Jpeg.formats().to_vec(),
        create_jpeg_decoder,
    ));
    specs
}

pub fn create_png_encoder() -> Box<dyn Encoder> {
    Box::new(StillEncoder::new(StillKind::Png))
}

pub fn create_jpeg_encoder() -> Box<dyn Encoder> {
    Box::new(StillEncoder::new(StillKind::Jpeg))
}

pub fn create_png_decoder() -> Box<dyn Decoder> {
    Box::new(StillDecoder::new(StillKind::Png))
}

pub fn create_jpeg_decoder() -> Box<dyn Decoder> {
    Box::new(StillDecoder::new(StillKind::Jpeg))
}

fn check_format(kind: StillKind, format: PixelFormat) -> Result<()> {
    if kind.formats().contains(&format) {
        Ok(())
    } else {
        Err(Error::UnsupportedFormat(format!("{} は {} を扱えません", kind.encoding(), format)))
    }
}

/// 静止画エンコーダ
pub struct StillEncoder {
    kind: StillKind,
    lifecycle: Lifecycle,
}

impl StillEncoder {
    pub fn new(kind: StillKind) -> Self {
        Self {
            kind,
            lifecycle: Lifecycle::new(kind.encoder_name()),
        }
    }
}

impl Encoder for StillEncoder {
    fn name(&self) -> &'static str {
        self.kind.encoder_name()
    }

    fn encoding(&self) -> &'static str {
        self.kind.encoding()
    }

    fn state(&self) -> CodecState {
        self.lifecycle.state()
    }

    fn init_context(&mut self, width: u32, height: u32, src_format: PixelFormat, _options: &EncoderOptions) -> Result<()> {
        check_format(self.kind, src_format)?;
        self.lifecycle.init(width, height, src_format)
    }

    fn compress_image(&mut self, image: &ImageWrapper, options: &EncoderOptions) -> Result<EncodedImage> {
        self.lifecycle.check_image(image)?;
        let format = image.pixel_format();
        check_format(self.kind, format)?;
        let color = if format == PixelFormat::RGBA {
            ColorType::Rgba8
        } else {
            ColorType::Rgb8
        };

        let mut raw = Vec::new();
        image.append_plane_rows(0, &mut raw)?;
        let (width, height) = (image.width(), image.height());
        let mut data = Vec::new();
        let mut client_options = CodecOptions::new();
        let result = match self.kind {
            StillKind::Png => PngEncoder::new(&mut data).write_image(&raw, width, height, color),
            StillKind::Jpeg => {
                let quality = options.quality.clamp(1, 100);
                client_options.insert("quality".to_string(), Value::from(u64::from(quality)));
                JpegEncoder::new_with_quality(&mut data, quality).write_image(&raw, width, height, color)
            }
        };
        result.map_err(|e| Error::CodecFailure(format!("{} エンコードエラー: {}", self.kind.encoding(), e)))?;
        trace!(
            target: "codec",
            "{}: {}x{} -> {} バイト",
            self.kind.encoder_name(),
            width,
            height,
            data.len()
        );
        Ok(EncodedImage {
            encoding: self.kind.encoding(),
            data,
            rowstride: format.min_stride(0, width),
            options: client_options,
        })
    }

    fn clean(&mut self) {
        self.lifecycle.close();
    }
}

impl Drop for StillEncoder {
    fn drop(&mut self) {
        self.clean();
    }
}

/// 静止画デコーダ
pub struct StillDecoder {
    kind: StillKind,
    lifecycle: Lifecycle,
}

impl StillDecoder {
    pub fn new(kind: StillKind) -> Self {
        Self {
            kind,
            lifecycle: Lifecycle::new(kind.decoder_name()),
        }
    }
}

impl Decoder for StillDecoder {
    fn name(&self) -> &'static str {
        self.kind.decoder_name()
    }

    fn encoding(&self) -> &'static str {
        self.kind.encoding()
    }

    fn state(&self) -> CodecState {
        self.lifecycle.state()
    }

    fn init_context(&mut self, width: u32, height: u32, dst_format: PixelFormat) -> Result<()> {
        check_format(self.kind, dst_format)?;
        self.lifecycle.init(width, height, dst_format)
    }

    fn decompress_image(&mut self, data: &[u8], _options: &CodecOptions) -> Result<ImageWrapper> {
        self.lifecycle.ensure_ready()?;
        let decoded = ::image::load_from_memory_with_format(data, self.kind.image_format())
            .map_err(|e| Error::CodecFailure(format!("{} デコードエラー: {}", self.kind.encoding(), e)))?;
        let (width, height) = (self.lifecycle.width(), self.lifecycle.height());
        if decoded.width() != width || decoded.height() != height {
            return Err(Error::CodecFailure(format!(
                "{}: {}x{} を期待しましたが {}x{} でした",
                self.kind.encoding(),
                width,
                height,
                decoded.width(),
                decoded.height()
            )));
        }
        let format = self.lifecycle.format().unwrap_or(PixelFormat::RGB);
        let pixels = if format == PixelFormat::RGBA {
            decoded.to_rgba8().into_raw()
        } else {
            decoded.to_rgb8().into_raw()
        };
        ImageWrapper::from_packed(0, 0, width, height, format, pixels, format.min_stride(0, width))
    }

    fn clean(&mut self) {
        self.lifecycle.close();
    }
}

impl Drop for StillDecoder {
    fn drop(&mut self) {
        self.clean();
    }
}
