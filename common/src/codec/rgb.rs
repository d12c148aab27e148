//! `rgb` エンコーディング
//!
//! パック形式の画素をそのまま送ります。行はパディングなしに詰め、
//! lz4 または zlib で圧縮します。

use log::trace;

use super::image::ImageWrapper;
use super::pixel_format::PixelFormat;
use super::registry::CodecSpec;
use super::video::{
    option_str, pack_payload, unpack_payload, CodecOptions, CodecState, Decoder, EncodedImage, Encoder,
    EncoderOptions, Lifecycle,
};
use crate::error::{Error, Result};
use crate::protocol::Value;

/// エンコーディング名
pub const ENCODING: &str = "rgb";

/// エンコーダの実装名
pub const ENCODER_NAME: &str = "enc_rgb";

/// デコーダの実装名
pub const DECODER_NAME: &str = "dec_rgb";

/// 登録する仕様
pub fn specs() -> Vec<CodecSpec> {
    let mut specs: Vec<CodecSpec> = PixelFormat::PACKED
        .iter()
        .map(|&format| CodecSpec::encoder(ENCODER_NAME, ENCODING, format, create_encoder).with_speed(70))
        .collect();
    specs.push(CodecSpec::decoder(
        DECODER_NAME,
        ENCODING,
        PixelFormat::PACKED.to_vec(),
        create_decoder,
    ));
    specs
}

pub fn create_encoder() -> Box<dyn Encoder> {
    Box::new(RgbEncoder::new())
}

pub fn create_decoder() -> Box<dyn Decoder> {
    Box::new(RgbDecoder::new())
}

fn require_packed(format: PixelFormat) -> Result<()> {
    if format.is_packed() {
        Ok(())
    } else {
        Err(Error::UnsupportedFormat(format!(
            "{} はパック形式ではありません",
            format
        )))
    }
}

/// `rgb` エンコーダ
pub struct RgbEncoder {
    lifecycle: Lifecycle,
}

impl RgbEncoder {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(ENCODER_NAME),
        }
    }
}

impl Default for RgbEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for RgbEncoder {
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
        require_packed(src_format)?;
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

        let rowstride = format.min_stride(0, image.width());
        let len = rowstride * image.height() as usize;
        let raw = if image.rowstride(0)? == rowstride {
            image.get_plane_bytes(0)?[..len].to_vec()
        } else {
            let mut tight = image.try_clone()?;
            tight.restride(rowstride)?;
            tight.get_plane_bytes(0)?[..len].to_vec()
        };

        let mut client_options = CodecOptions::new();
        client_options.insert("rgb_format".to_string(), Value::from(format.as_str()));
        let data = pack_payload(raw, options, &mut client_options)?;
        trace!(
            target: "codec",
            "{}: {}x{} {} -> {} バイト",
            ENCODER_NAME,
            image.width(),
            image.height(),
            format,
            data.len()
        );
        Ok(EncodedImage {
            encoding: ENCODING,
            data,
            rowstride,
            options: client_options,
        })
    }

    fn clean(&mut self) {
        self.lifecycle.close();
    }
}

impl Drop for RgbEncoder {
    fn drop(&mut self) {
        self.clean();
    }
}

/// `rgb` デコーダ
pub struct RgbDecoder {
    lifecycle: Lifecycle,
}

impl RgbDecoder {
    pub fn new() -> Self {
        Self {
            lifecycle: Lifecycle::new(DECODER_NAME),
        }
    }
}

impl Default for RgbDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RgbDecoder {
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
        require_packed(dst_format)?;
        self.lifecycle.init(width, height, dst_format)
    }

    fn decompress_image(&mut self, data: &[u8], options: &CodecOptions) -> Result<ImageWrapper> {
        self.lifecycle.ensure_ready()?;
        let format = match option_str(options, "rgb_format") {
            Some(name) => name.parse::<PixelFormat>()?,
            None => self.lifecycle.format().unwrap_or(PixelFormat::BGRX),
        };
        require_packed(format)?;
        let (width, height) = (self.lifecycle.width(), self.lifecycle.height());
        let rowstride = format.min_stride(0, width);
        let raw = unpack_payload(data, options, rowstride * height as usize)?;
        ImageWrapper::from_packed(0, 0, width, height, format, raw, rowstride)
    }

    fn clean(&mut self) {
        self.lifecycle.close();
    }
}

impl Drop for RgbDecoder {
    fn drop(&mut self) {
        self.clean();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded_bgrx(width: u32, height: u32) -> ImageWrapper {
        let stride = width as usize * 4 + 12;
        let mut pixels = vec![0u8; stride * height as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let i = y * stride + x * 4;
                pixels[i..i + 4].copy_from_slice(&[x as u8, y as u8, 0x40, 0]);
            }
        }
        ImageWrapper::from_packed(0, 0, width, height, PixelFormat::BGRX, pixels, stride).unwrap()
    }

    #[test]
    fn test_roundtrip_with_padded_stride() {
        let image = padded_bgrx(16, 8);
        let mut encoder = RgbEncoder::new();
        encoder
            .init_context(16, 8, PixelFormat::BGRX, &EncoderOptions::default())
            .unwrap();
        let encoded = encoder.compress_image(&image, &EncoderOptions::default()).unwrap();
        assert_eq!(encoded.rowstride, 64);

        let mut decoder = RgbDecoder::new();
        decoder.init_context(16, 8, PixelFormat::BGRX).unwrap();
        let decoded = decoder.decompress_image(&encoded.data, &encoded.options).unwrap();
        for (x, y) in [(0, 0), (15, 7), (3, 5)] {
            assert_eq!(decoded.rgb_at(x, y).unwrap(), image.rgb_at(x, y).unwrap());
        }
    }

    #[test]
    fn test_lifecycle_errors() {
        let mut encoder = RgbEncoder::new();
        let image = padded_bgrx(4, 4);
        assert!(matches!(
            encoder.compress_image(&image, &EncoderOptions::default()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            encoder.init_context(4, 4, PixelFormat::YUV420P, &EncoderOptions::default()),
            Err(Error::UnsupportedFormat(_))
        ));
        encoder
            .init_context(4, 4, PixelFormat::BGRX, &EncoderOptions::default())
            .unwrap();
        encoder.clean();
        encoder.clean();
        assert_eq!(encoder.state(), CodecState::Closed);
        assert!(encoder.compress_image(&image, &EncoderOptions::default()).is_err());
    }

    #[test]
    fn test_corrupt_frame_leaves_decoder_ready() {
        let mut decoder = RgbDecoder::new();
        decoder.init_context(4, 4, PixelFormat::BGRX).unwrap();
        let mut options = CodecOptions::new();
        options.insert("rgb_format".into(), Value::from("BGRX"));
        assert!(matches!(
            decoder.decompress_image(&[1, 2, 3], &options),
            Err(Error::CodecFailure(_))
        ));
        assert_eq!(decoder.state(), CodecState::Ready);
        assert!(decoder.decompress_image(&[0u8; 64], &options).is_ok());
    }
}
