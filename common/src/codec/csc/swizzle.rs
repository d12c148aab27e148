//! パック RGB 系のバイト並べ替え
//!
//! 出力 1 画素の各バイトが入力のどのバイトから来るかを構築時に表にして
//! おき、変換はその表を引くだけです。スケーリングはしません。

use log::debug;

use super::{check_source, ColorspaceConverter, CscParams};
use crate::codec::image::ImageWrapper;
use crate::codec::pixel_format::PixelFormat;
use crate::codec::registry::CodecSpec;
use crate::error::{Error, Result};

/// 実装名
pub const NAME: &str = "csc_swizzle";

/// 変換できる出力フォーマット（パック形式どうしのみ）
pub fn supported_outputs(src: PixelFormat) -> Vec<PixelFormat> {
    if src.is_packed() {
        PixelFormat::PACKED.to_vec()
    } else {
        Vec::new()
    }
}

/// 登録する仕様
pub fn specs() -> Vec<CodecSpec> {
    PixelFormat::PACKED
        .iter()
        .map(|&src| CodecSpec::csc(NAME, src, supported_outputs(src), create).with_speed(100))
        .collect()
}

/// ファクトリ
pub fn create(params: CscParams) -> Result<Box<dyn ColorspaceConverter>> {
    Ok(Box::new(SwizzleConverter::new(params)?))
}

/// バイト並べ替え変換器
pub struct SwizzleConverter {
    params: CscParams,
    /// 出力バイト位置ごとの入力バイト位置（`None` は 0xFF で埋める）
    table: Vec<Option<usize>>,
    src_bpp: usize,
    closed: bool,
}

impl SwizzleConverter {
    pub fn new(params: CscParams) -> Result<Self> {
        params.validate_dimensions()?;
        let (src, dst) = match (params.src_format.packed_layout(), params.dst_format.packed_layout()) {
            (Some(src), Some(dst)) => (src, dst),
            _ => {
                return Err(Error::UnsupportedFormat(format!(
                    "{} は {} -> {} を扱えません",
                    NAME, params.src_format, params.dst_format
                )))
            }
        };
        if params.is_scaling() {
            return Err(Error::UnsupportedFormat(format!(
                "{} はスケーリングできません（{}x{} -> {}x{}）",
                NAME, params.src_width, params.src_height, params.dst_width, params.dst_height
            )));
        }

        let mut table = vec![None; dst.bpp];
        table[dst.r] = Some(src.r);
        table[dst.g] = Some(src.g);
        table[dst.b] = Some(src.b);
        if let Some(x) = dst.x {
            table[x] = if params.src_format.has_alpha() && params.dst_format.has_alpha() {
                src.x
            } else {
                None
            };
        }
        debug!(target: "csc", "{}: {} -> {} {:?}", NAME, params.src_format, params.dst_format, table);
        Ok(Self {
            params,
            table,
            src_bpp: src.bpp,
            closed: false,
        })
    }
}

impl ColorspaceConverter for SwizzleConverter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn params(&self) -> &CscParams {
        &self.params
    }

    fn convert_image(&mut self, image: &ImageWrapper) -> Result<ImageWrapper> {
        check_source(NAME, &self.params, self.closed, image)?;
        let (width, height) = (image.width(), image.height());
        let mut out = ImageWrapper::allocate(image.x(), image.y(), width, height, self.params.dst_format)?;
        let src = image.get_plane_bytes(0)?;
        let src_stride = image.rowstride(0)?;
        let dst_stride = out.rowstride(0)?;
        let dst_bpp = self.table.len();
        let dst = out.plane_mut(0)?;
        for y in 0..height as usize {
            let srow = &src[y * src_stride..];
            let drow = &mut dst[y * dst_stride..];
            for x in 0..width as usize {
                let (s, d) = (x * self.src_bpp, x * dst_bpp);
                for (j, from) in self.table.iter().enumerate() {
                    drow[d + j] = from.map_or(0xFF, |k| srow[s + k]);
                }
            }
        }
        Ok(out)
    }

    fn clean(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgra_to_rgb_and_argb() {
        let pixels = vec![10, 20, 30, 40, 50, 60, 70, 80];
        let image = ImageWrapper::from_packed(0, 0, 2, 1, PixelFormat::BGRA, pixels, 8).unwrap();

        let mut csc = SwizzleConverter::new(CscParams::same_size(2, 1, PixelFormat::BGRA, PixelFormat::RGB)).unwrap();
        let out = csc.convert_image(&image).unwrap();
        assert_eq!(&out.get_plane_bytes(0).unwrap()[..6], &[30, 20, 10, 70, 60, 50]);

        let mut csc = SwizzleConverter::new(CscParams::same_size(2, 1, PixelFormat::BGRA, PixelFormat::ARGB)).unwrap();
        let out = csc.convert_image(&image).unwrap();
        assert_eq!(&out.get_plane_bytes(0).unwrap()[..8], &[40, 30, 20, 10, 80, 70, 60, 50]);
    }

    #[test]
    fn test_padding_byte_becomes_opaque() {
        let image = ImageWrapper::from_packed(0, 0, 1, 1, PixelFormat::BGRX, vec![1, 2, 3, 0], 4).unwrap();
        let mut csc = SwizzleConverter::new(CscParams::same_size(1, 1, PixelFormat::BGRX, PixelFormat::RGBA)).unwrap();
        let out = csc.convert_image(&image).unwrap();
        assert_eq!(&out.get_plane_bytes(0).unwrap()[..4], &[3, 2, 1, 255]);
    }

    #[test]
    fn test_rejects_scaling_and_planar() {
        let mut params = CscParams::same_size(4, 4, PixelFormat::BGRX, PixelFormat::RGBX);
        params.dst_width = 2;
        assert!(matches!(SwizzleConverter::new(params), Err(Error::UnsupportedFormat(_))));
        let params = CscParams::same_size(4, 4, PixelFormat::BGRX, PixelFormat::YUV420P);
        assert!(matches!(SwizzleConverter::new(params), Err(Error::UnsupportedFormat(_))));
    }
}
