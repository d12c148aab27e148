//! `planar` エンコーディング
//!
//! YUV または GBR のプレーンを可逆のまま送ります。各プレーンの行を
//! パディングなしで連結し、全体をまとめて圧縮します。プレーンの形式と
//! レンジはオプション（`csc`, `full_range`）でデコーダに伝えます。

use log::trace;

use super::image::ImageWrapper;
use super::pixel_format::PixelFormat;
use super::registry::CodecSpec;
use super::video::{
    option_bool, option_str, pack_payload, unpack_payload, CodecOptions, CodecState, Decoder, EncodedImage,
    Encoder, EncoderOptions, Lifecycle,
};
use crate::error::{Error, Result};
use crate::protocol::Value;

/// エンコーディング名
pub const ENCODING: &str = "planar";

/// エンコーダの実装名
pub const ENCODER_NAME: &str = "enc_planar";

/// デコーダの実装名
pub const DECODER_NAME: &str = "dec_planar";

/// 登録する仕様
pub fn specs() -> Vec<CodecSpec> {
    let mut specs: Vec<CodecSpec> = PixelFormat::PLANAR
        .iter()
        .map(|&format| {
            CodecSpec::encoder(ENCODER_NAME, ENCODING, format, create_encoder)
                .with_speed(80)
                .with_setup_cost(10)
        })
        .collect();
    specs.push(CodecSpec::decoder(
        DECODER_NAME,
        ENCODING,
        PixelFormat::PLANAR.to_vec(),
        create_decoder,
    ));
    specs
}

pub fn create_encoder() -> Box<dyn Encoder> {
    Box::new(PlanarEncoder::new())
}

pub fn create_decoder() -> Box<dyn Decoder> {
    Box::new(PlanarDecoder::new())
}

fn require_planar(format: PixelFormat) -> Result<()> {
    if format.is_planar() {
        Ok(())
    } else {
        Err(Error::UnsupportedFormat(format!("{} はプレーナ形式ではありません", format)))
    }
}

/// 全プレーンを詰めたときのバイト数
fn packed_len(format: PixelFormat, width: u32, height: u32) -> usize {
    (0..format.plane_count())
        .map(|plane| {
            let (_, rows) = format.plane_dimensions(plane, width, height);
            format.min_stride(plane, width) * rows as usize
        })
        .sum()
}

/// `planar` エンコーダ
pub struct PlanarEncoder {
    lifecycle: Lifecycle,
}

impl PlanarEncoder {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(ENCODER_NAME),
        }
    }
}

impl Default for PlanarEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for PlanarEncoder {
    fn name(&self) -> &'static str {
        ENCODER_NAME
    }

    fn encoding(&self) -> &'static str {
        ENCODING
    }

    fn state(&self) -> CodecState {
        self.lifecycle.state()
    }

    fn init_context(&mut self, width: u32, height: u32, src_format: PixelFormat, _options: &EncoderOptions) -> Result<()> {
        require_planar(src_format)?;
        self.lifecycle.init(width, height, src_format)
    }

    fn compress_image(&mut self, image: &ImageWrapper, options: &EncoderOptions) -> Result<EncodedImage> {
        self.lifecycle.check_image(image)?;
        let format = image.pixel_format();
        if Some(format) != self.lifecycle.format() {
            return Err(Error::InvalidParameter(format!(
                "{} は {:?} で初期化されていますが {} が渡されました",
                ENCODER_NAME,
                self.lifecycle.format(),
                format
            )));
        }

        let mut raw = Vec::new();
        for plane in 0..format.plane_count() {
            image.append_plane_rows(plane, &mut raw)?;
        }
        let mut client_options = CodecOptions::new();
        client_options.insert("csc".to_string(), Value::from(format.as_str()));
        client_options.insert("full_range".to_string(), Value::from(image.full_range()));
        let raw_len = raw.len();
        let data = pack_payload(raw, options, &mut client_options)?;
        trace!(target: "codec", "{}: {} {} -> {} バイト", ENCODER_NAME, format, raw_len, data.len());
        Ok(EncodedImage {
            encoding: ENCODING,
            data,
            rowstride: format.min_stride(0, image.width()),
            options: client_options,
        })
    }

    fn clean(&mut self) {
        self.lifecycle.close();
    }
}

impl Drop for PlanarEncoder {
    fn drop(&mut self) {
        self.clean();
    }
}

/// `planar` デコーダ
pub struct PlanarDecoder {
    lifecycle: Lifecycle,
}

impl PlanarDecoder {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(DECODER_NAME),
        }
    }
}

impl Default for PlanarDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PlanarDecoder {
    fn name(&self) -> &'static str {
        DECODER_NAME
    }

    fn encoding(&self) -> &'static str {
        ENCODING
    }

    fn state(&self) -> CodecState {
        self.lifecycle.state()
    }

    fn init_context(&mut self, width: u32, height: u32, dst_format: PixelFormat) -> Result<()> {
        require_planar(dst_format)?;
        self.lifecycle.init(width, height, dst_format)
    }

    fn decompress_image(&mut self, data: &[u8], options: &CodecOptions) -> Result<ImageWrapper> {
        self.lifecycle.ensure_ready()?;
        let format = match option_str(options, "csc") {
            Some(name) => name.parse::<PixelFormat>()?,
            None => self.lifecycle.format().unwrap_or(PixelFormat::YUV420P),
        };
        require_planar(format)?;
        let (width, height) = (self.lifecycle.width(), self.lifecycle.height());
        let raw = unpack_payload(data, options, packed_len(format, width, height))?;

        let mut image = ImageWrapper::allocate(0, 0, width, height, format)?
            .with_full_range(option_bool(options, "full_range").unwrap_or(true));
        let strides = image.rowstrides().to_vec();
        let planes = image.planes_mut()?;
        let mut offset = 0;
        for (plane, buf) in planes.iter_mut().enumerate() {
            let row_bytes = format.min_stride(plane, width);
            let (_, rows) = format.plane_dimensions(plane, width, height);
            for row in 0..rows as usize {
                let d = row * strides[plane];
                buf[d..d + row_bytes].copy_from_slice(&raw[offset..offset + row_bytes]);
                offset += row_bytes;
            }
        }
        Ok(image)
    }

    fn clean(&mut self) {
        self.lifecycle.close();
    }
}

impl Drop for PlanarDecoder {
    fn drop(&mut self) {
        self.clean();
    }
}
