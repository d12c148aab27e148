//! ソフトウェア色空間変換
//!
//! 固定小数点の参照実装です。パック RGB 系とプレーナ形式のあらゆる
//! 組み合わせを扱い、最近傍サンプリングでスケーリングします。
//! 16 ビット形式と YUV444P を含む変換はスケーリングできません。
//!
//! 画素ループは自分のバッファだけに触れ、共有状態を持たないため、
//! どのワーカースレッドで実行しても安全です。

use log::debug;

use super::matrix::{narrow16, widen8, ForwardMatrix, InverseMatrix};
use super::{check_source, ColorspaceConverter, CscParams};
use crate::codec::image::ImageWrapper;
use crate::codec::pixel_format::{PackedLayout, PixelFormat};
use crate::codec::registry::CodecSpec;
use crate::error::{Error, Result};

/// 実装名
pub const NAME: &str = "csc_software";

#[derive(Debug, Clone, Copy)]
enum Route {
    PackedToPacked {
        src: PackedLayout,
        dst: PackedLayout,
        /// アルファをコピーする場合の元オフセット
        alpha: Option<usize>,
    },
    PackedToYuv { src: PackedLayout },
    PackedToYuv16 { src: PackedLayout },
    PackedToGbrp { src: PackedLayout, wide: bool },
    YuvToPacked { dst: PackedLayout },
    Yuv16ToPacked { dst: PackedLayout },
    GbrpToPacked { dst: PackedLayout, wide: bool },
}

fn resolve_route(src: PixelFormat, dst: PixelFormat) -> Option<Route> {
    match (src.packed_layout(), dst.packed_layout()) {
        (Some(s), Some(d)) => Some(Route::PackedToPacked {
            src: s,
            dst: d,
            alpha: if src.has_alpha() && dst.has_alpha() { s.x } else { None },
        }),
        (Some(s), None) => Some(match dst {
            PixelFormat::YUV444P16 => Route::PackedToYuv16 { src: s },
            PixelFormat::GBRP => Route::PackedToGbrp { src: s, wide: false },
            PixelFormat::GBRP16 => Route::PackedToGbrp { src: s, wide: true },
            _ => Route::PackedToYuv { src: s },
        }),
        (None, Some(d)) => Some(match src {
            PixelFormat::YUV444P16 => Route::Yuv16ToPacked { dst: d },
            PixelFormat::GBRP => Route::GbrpToPacked { dst: d, wide: false },
            PixelFormat::GBRP16 => Route::GbrpToPacked { dst: d, wide: true },
            _ => Route::YuvToPacked { dst: d },
        }),
        (None, None) => None,
    }
}

/// スケーリングを許可する組み合わせかどうか
pub fn allows_scaling(src: PixelFormat, dst: PixelFormat) -> bool {
    let fixed_size = |f: PixelFormat| f.is_high_bit_depth() || f == PixelFormat::YUV444P;
    !(fixed_size(src) || fixed_size(dst))
}

/// 入力フォーマットから変換できる出力フォーマット
pub fn supported_outputs(src: PixelFormat) -> Vec<PixelFormat> {
    PixelFormat::ALL
        .iter()
        .copied()
        .filter(|&dst| resolve_route(src, dst).is_some())
        .collect()
}

/// 登録する仕様（入力フォーマットごとに 1 件）
pub fn specs() -> Vec<CodecSpec> {
    PixelFormat::ALL
        .iter()
        .map(|&src| {
            CodecSpec::csc(NAME, src, supported_outputs(src), create)
                .with_speed(60)
                .with_setup_cost(10)
                .with_scaling(true)
        })
        .collect()
}

/// ファクトリ
pub fn create(params: CscParams) -> Result<Box<dyn ColorspaceConverter>> {
    Ok(Box::new(SoftwareConverter::new(params)?))
}

/// 出力座標から入力座標への最近傍対応（画素中心で対応付け）
fn nearest_map(src_len: u32, dst_len: u32) -> Vec<usize> {
    let (src_len, dst_len) = (src_len as u64, dst_len as u64);
    (0..dst_len)
        .map(|d| (((2 * d + 1) * src_len) / (2 * dst_len)).min(src_len - 1) as usize)
        .collect()
}

#[inline]
fn read16(buf: &[u8], i: usize) -> u16 {
    u16::from_le_bytes([buf[i], buf[i + 1]])
}

#[inline]
fn write16(buf: &mut [u8], i: usize, v: u16) {
    buf[i..i + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_rgb(row: &mut [u8], d: usize, layout: &PackedLayout, rgb: (u8, u8, u8), alpha: u8) {
    row[d + layout.r] = rgb.0;
    row[d + layout.g] = rgb.1;
    row[d + layout.b] = rgb.2;
    if let Some(x) = layout.x {
        row[d + x] = alpha;
    }
}

/// ソフトウェア変換器
pub struct SoftwareConverter {
    params: CscParams,
    route: Route,
    x_map: Vec<usize>,
    y_map: Vec<usize>,
    closed: bool,
}

impl SoftwareConverter {
    pub fn new(params: CscParams) -> Result<Self> {
        params.validate_dimensions()?;
        let route = resolve_route(params.src_format, params.dst_format).ok_or_else(|| {
            Error::UnsupportedFormat(format!(
                "{} -> {} の変換はサポートされていません",
                params.src_format, params.dst_format
            ))
        })?;
        if params.is_scaling() && !allows_scaling(params.src_format, params.dst_format) {
            return Err(Error::UnsupportedFormat(format!(
                "{} -> {} はスケーリングできません（{}x{} -> {}x{}）",
                params.src_format,
                params.dst_format,
                params.src_width,
                params.src_height,
                params.dst_width,
                params.dst_height
            )));
        }
        debug!(
            target: "csc",
            "{}: {}x{} {} -> {}x{} {}",
            NAME,
            params.src_width,
            params.src_height,
            params.src_format,
            params.dst_width,
            params.dst_height,
            params.dst_format
        );
        Ok(Self {
            route,
            x_map: nearest_map(params.src_width, params.dst_width),
            y_map: nearest_map(params.src_height, params.dst_height),
            params,
            closed: false,
        })
    }

    fn packed_to_packed(
        &self,
        image: &ImageWrapper,
        out: &mut ImageWrapper,
        s: PackedLayout,
        d: PackedLayout,
        alpha: Option<usize>,
    ) -> Result<()> {
        let src = image.get_plane_bytes(0)?;
        let src_stride = image.rowstride(0)?;
        let dst_stride = out.rowstride(0)?;
        let dst = out.plane_mut(0)?;
        for (dy, &sy) in self.y_map.iter().enumerate() {
            let srow = &src[sy * src_stride..];
            let drow = &mut dst[dy * dst_stride..];
            for (dx, &sx) in self.x_map.iter().enumerate() {
                let i = sx * s.bpp;
                let a = alpha.map_or(255, |a| srow[i + a]);
                put_rgb(drow, dx * d.bpp, &d, (srow[i + s.r], srow[i + s.g], srow[i + s.b]), a);
            }
        }
        Ok(())
    }

    fn packed_to_yuv(&self, image: &ImageWrapper, out: &mut ImageWrapper, s: PackedLayout) -> Result<()> {
        let matrix = ForwardMatrix::for_range(self.params.options.full_range);
        let format = self.params.dst_format;
        let interleaved = format == PixelFormat::NV12;
        let (cdx, cdy) = format.subsampling(1);
        let (cdx, cdy) = (cdx as usize, cdy as usize);
        let (cw, ch) = format.plane_dimensions(1, self.params.dst_width, self.params.dst_height);
        let (dw, dh) = (self.x_map.len(), self.y_map.len());

        let src = image.get_plane_bytes(0)?;
        let src_stride = image.rowstride(0)?;
        let strides = out.rowstrides().to_vec();
        let planes = out.planes_mut()?;
        let (luma, chroma) = planes.split_at_mut(1);
        let luma = &mut luma[0];

        let pixel = |dx: usize, dy: usize| {
            let i = self.y_map[dy] * src_stride + self.x_map[dx] * s.bpp;
            (src[i + s.r], src[i + s.g], src[i + s.b])
        };

        for dy in 0..dh {
            let row = dy * strides[0];
            for dx in 0..dw {
                let (r, g, b) = pixel(dx, dy);
                luma[row + dx] = matrix.luma(r, g, b);
            }
        }

        for cy in 0..ch as usize {
            for cx in 0..cw as usize {
                let (mut rs, mut gs, mut bs, mut n) = (0u32, 0u32, 0u32, 0u32);
                for dy in cy * cdy..((cy + 1) * cdy).min(dh) {
                    for dx in cx * cdx..((cx + 1) * cdx).min(dw) {
                        let (r, g, b) = pixel(dx, dy);
                        rs += r as u32;
                        gs += g as u32;
                        bs += b as u32;
                        n += 1;
                    }
                }
                let avg = |sum: u32| ((sum + n / 2) / n) as u8;
                let (u, v) = matrix.chroma(avg(rs), avg(gs), avg(bs));
                if interleaved {
                    let i = cy * strides[1] + cx * 2;
                    chroma[0][i] = u;
                    chroma[0][i + 1] = v;
                } else {
                    chroma[0][cy * strides[1] + cx] = u;
                    chroma[1][cy * strides[2] + cx] = v;
                }
            }
        }
        Ok(())
    }

    fn packed_to_yuv16(&self, image: &ImageWrapper, out: &mut ImageWrapper, s: PackedLayout) -> Result<()> {
        let matrix = ForwardMatrix::for_range(self.params.options.full_range);
        let src = image.get_plane_bytes(0)?;
        let src_stride = image.rowstride(0)?;
        let strides = out.rowstrides().to_vec();
        let planes = out.planes_mut()?;
        for (dy, &sy) in self.y_map.iter().enumerate() {
            for (dx, &sx) in self.x_map.iter().enumerate() {
                let i = sy * src_stride + sx * s.bpp;
                let (y, u, v) = matrix.yuv16(src[i + s.r], src[i + s.g], src[i + s.b]);
                write16(&mut planes[0], dy * strides[0] + dx * 2, y);
                write16(&mut planes[1], dy * strides[1] + dx * 2, u);
                write16(&mut planes[2], dy * strides[2] + dx * 2, v);
            }
        }
        Ok(())
    }

    fn packed_to_gbrp(&self, image: &ImageWrapper, out: &mut ImageWrapper, s: PackedLayout, wide: bool) -> Result<()> {
        let src = image.get_plane_bytes(0)?;
        let src_stride = image.rowstride(0)?;
        let strides = out.rowstrides().to_vec();
        let planes = out.planes_mut()?;
        for (dy, &sy) in self.y_map.iter().enumerate() {
            for (dx, &sx) in self.x_map.iter().enumerate() {
                let i = sy * src_stride + sx * s.bpp;
                let channels = [src[i + s.g], src[i + s.b], src[i + s.r]];
                for (plane, value) in channels.into_iter().enumerate() {
                    let row = dy * strides[plane];
                    if wide {
                        write16(&mut planes[plane], row + dx * 2, widen8(value));
                    } else {
                        planes[plane][row + dx] = value;
                    }
                }
            }
        }
        Ok(())
    }

    fn yuv_to_packed(&self, image: &ImageWrapper, out: &mut ImageWrapper, d: PackedLayout) -> Result<()> {
        let matrix = InverseMatrix::for_range(image.full_range());
        let format = self.params.src_format;
        let interleaved = format == PixelFormat::NV12;
        let (cdx, cdy) = format.subsampling(1);
        let (cdx, cdy) = (cdx as usize, cdy as usize);

        let luma = image.get_plane_bytes(0)?;
        let luma_stride = image.rowstride(0)?;
        let u_plane = image.get_plane_bytes(1)?;
        let u_stride = image.rowstride(1)?;
        let (v_plane, v_stride) = if interleaved {
            (u_plane, u_stride)
        } else {
            (image.get_plane_bytes(2)?, image.rowstride(2)?)
        };

        let dst_stride = out.rowstride(0)?;
        let dst = out.plane_mut(0)?;
        for (dy, &sy) in self.y_map.iter().enumerate() {
            let cy = sy / cdy;
            let drow = &mut dst[dy * dst_stride..];
            for (dx, &sx) in self.x_map.iter().enumerate() {
                let cx = sx / cdx;
                let y = luma[sy * luma_stride + sx];
                let (u, v) = if interleaved {
                    let i = cy * u_stride + cx * 2;
                    (u_plane[i], u_plane[i + 1])
                } else {
                    (u_plane[cy * u_stride + cx], v_plane[cy * v_stride + cx])
                };
                put_rgb(drow, dx * d.bpp, &d, matrix.rgb(y, u, v), 255);
            }
        }
        Ok(())
    }

    fn yuv16_to_packed(&self, image: &ImageWrapper, out: &mut ImageWrapper, d: PackedLayout) -> Result<()> {
        let matrix = InverseMatrix::for_range(image.full_range());
        let planes = [
            image.get_plane_bytes(0)?,
            image.get_plane_bytes(1)?,
            image.get_plane_bytes(2)?,
        ];
        let strides = image.rowstrides().to_vec();
        let dst_stride = out.rowstride(0)?;
        let dst = out.plane_mut(0)?;
        for (dy, &sy) in self.y_map.iter().enumerate() {
            let drow = &mut dst[dy * dst_stride..];
            for (dx, &sx) in self.x_map.iter().enumerate() {
                let y = read16(planes[0], sy * strides[0] + sx * 2);
                let u = read16(planes[1], sy * strides[1] + sx * 2);
                let v = read16(planes[2], sy * strides[2] + sx * 2);
                put_rgb(drow, dx * d.bpp, &d, matrix.rgb16(y, u, v), 255);
            }
        }
        Ok(())
    }

    fn gbrp_to_packed(&self, image: &ImageWrapper, out: &mut ImageWrapper, d: PackedLayout, wide: bool) -> Result<()> {
        let planes = [
            image.get_plane_bytes(0)?,
            image.get_plane_bytes(1)?,
            image.get_plane_bytes(2)?,
        ];
        let strides = image.rowstrides().to_vec();
        let sample = |plane: usize, sx: usize, sy: usize| {
            if wide {
                narrow16(read16(planes[plane], sy * strides[plane] + sx * 2))
            } else {
                planes[plane][sy * strides[plane] + sx]
            }
        };
        let dst_stride = out.rowstride(0)?;
        let dst = out.plane_mut(0)?;
        for (dy, &sy) in self.y_map.iter().enumerate() {
            let drow = &mut dst[dy * dst_stride..];
            for (dx, &sx) in self.x_map.iter().enumerate() {
                let rgb = (sample(2, sx, sy), sample(0, sx, sy), sample(1, sx, sy));
                put_rgb(drow, dx * d.bpp, &d, rgb, 255);
            }
        }
        Ok(())
    }
}

impl ColorspaceConverter for SoftwareConverter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn params(&self) -> &CscParams {
        &self.params
    }

    fn convert_image(&mut self, image: &ImageWrapper) -> Result<ImageWrapper> {
        check_source(NAME, &self.params, self.closed, image)?;
        let p = &self.params;
        let mut out = ImageWrapper::allocate(image.x(), image.y(), p.dst_width, p.dst_height, p.dst_format)?;
        if p.dst_format.is_yuv() {
            out.set_full_range(p.options.full_range);
        }
        match self.route {
            Route::PackedToPacked { src, dst, alpha } => self.packed_to_packed(image, &mut out, src, dst, alpha)?,
            Route::PackedToYuv { src } => self.packed_to_yuv(image, &mut out, src)?,
            Route::PackedToYuv16 { src } => self.packed_to_yuv16(image, &mut out, src)?,
            Route::PackedToGbrp { src, wide } => self.packed_to_gbrp(image, &mut out, src, wide)?,
            Route::YuvToPacked { dst } => self.yuv_to_packed(image, &mut out, dst)?,
            Route::Yuv16ToPacked { dst } => self.yuv16_to_packed(image, &mut out, dst)?,
            Route::GbrpToPacked { dst, wide } => self.gbrp_to_packed(image, &mut out, dst, wide)?,
        }
        Ok(out)
    }

    fn clean(&mut self) {
        if !self.closed {
            self.closed = true;
            self.x_map = Vec::new();
            self.y_map = Vec::new();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SoftwareConverter {
    fn drop(&mut self) {
        self.clean();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::csc::CscOptions;

    fn bgrx(width: u32, height: u32, stride: usize, f: impl Fn(u32, u32) -> (u8, u8, u8)) -> ImageWrapper {
        let mut pixels = vec![0u8; stride * height as usize];
        for y in 0..height {
            for x in 0..width {
                let (r, g, b) = f(x, y);
                let i = y as usize * stride + x as usize * 4;
                pixels[i..i + 4].copy_from_slice(&[b, g, r, 0]);
            }
        }
        ImageWrapper::from_packed(0, 0, width, height, PixelFormat::BGRX, pixels, stride).unwrap()
    }

    fn roundtrip(image: &ImageWrapper, via: PixelFormat, full_range: bool) -> ImageWrapper {
        let (w, h) = (image.width(), image.height());
        let options = CscOptions { full_range };
        let mut to = SoftwareConverter::new(CscParams::same_size(w, h, PixelFormat::BGRX, via).with_options(options)).unwrap();
        let mid = to.convert_image(image).unwrap();
        assert_eq!(mid.full_range(), full_range || !via.is_yuv());
        let mut back = SoftwareConverter::new(CscParams::same_size(w, h, via, PixelFormat::BGRX)).unwrap();
        back.convert_image(&mid).unwrap()
    }

    fn max_diff(a: &ImageWrapper, b: &ImageWrapper) -> i32 {
        let mut worst = 0;
        for y in 0..a.height() {
            for x in 0..a.width() {
                let (p, q) = (a.rgb_at(x, y).unwrap(), b.rgb_at(x, y).unwrap());
                for c in 0..3 {
                    worst = worst.max((p[c] as i32 - q[c] as i32).abs());
                }
            }
        }
        worst
    }

    #[test]
    fn test_flat_blocks_roundtrip_through_every_planar_format() {
        // 2x2 ブロックごとに一定色なので 4:2:0 でも平均による誤差が出ない
        let image = bgrx(8, 6, 32, |x, y| ((x / 2 * 37) as u8, (y / 2 * 71) as u8, ((x / 2 + y / 2) * 29) as u8));
        for via in PixelFormat::PLANAR {
            for full_range in [true, false] {
                let out = roundtrip(&image, via, full_range);
                assert!(max_diff(&image, &out) <= 2, "{} full_range={}", via, full_range);
            }
        }
    }

    #[test]
    fn test_full_and_studio_luma_levels() {
        let image = bgrx(2, 2, 8, |x, _| if x == 0 { (0, 0, 0) } else { (255, 255, 255) });
        for (full_range, black, white) in [(true, 0, 255), (false, 16, 235)] {
            let params = CscParams::same_size(2, 2, PixelFormat::BGRX, PixelFormat::YUV444P)
                .with_options(CscOptions { full_range });
            let out = SoftwareConverter::new(params).unwrap().convert_image(&image).unwrap();
            let luma = out.get_plane_bytes(0).unwrap();
            let stride = out.rowstride(0).unwrap();
            assert_eq!(luma[0], black);
            assert_eq!(luma[1], white);
            assert_eq!(luma[stride + 1], white);
        }
    }

    #[test]
    fn test_chroma_is_block_average() {
        let image = bgrx(2, 2, 8, |x, y| if (x + y) % 2 == 0 { (255, 0, 0) } else { (0, 0, 255) });
        let out = SoftwareConverter::new(CscParams::same_size(2, 2, PixelFormat::BGRX, PixelFormat::YUV420P))
            .unwrap()
            .convert_image(&image)
            .unwrap();
        let (u, v) = ForwardMatrix::FULL.chroma(128, 0, 128);
        assert_eq!(out.get_plane_bytes(1).unwrap()[0], u);
        assert_eq!(out.get_plane_bytes(2).unwrap()[0], v);
    }

    #[test]
    fn test_range_flag_is_honored_on_decode() {
        let image = bgrx(4, 4, 16, |_, _| (200, 40, 90));
        let mut to = SoftwareConverter::new(
            CscParams::same_size(4, 4, PixelFormat::BGRX, PixelFormat::YUV420P)
                .with_options(CscOptions { full_range: false }),
        )
        .unwrap();
        let mut mid = to.convert_image(&image).unwrap();
        let mut back = SoftwareConverter::new(CscParams::same_size(4, 4, PixelFormat::YUV420P, PixelFormat::BGRX)).unwrap();
        assert!(max_diff(&image, &back.convert_image(&mid).unwrap()) <= 2);
        // レンジを取り違えると色がずれる
        mid.set_full_range(true);
        assert!(max_diff(&image, &back.convert_image(&mid).unwrap()) > 2);
    }

    #[test]
    fn test_scaling_rules() {
        let mut params = CscParams::same_size(8, 8, PixelFormat::BGRX, PixelFormat::YUV420P);
        params.dst_width = 4;
        params.dst_height = 4;
        let out = SoftwareConverter::new(params)
            .unwrap()
            .convert_image(&bgrx(8, 8, 32, |_, _| (10, 20, 30)))
            .unwrap();
        assert_eq!((out.width(), out.height()), (4, 4));

        params.dst_format = PixelFormat::YUV444P16;
        assert!(matches!(SoftwareConverter::new(params), Err(Error::UnsupportedFormat(_))));
        params.dst_format = PixelFormat::YUV444P;
        assert!(matches!(SoftwareConverter::new(params), Err(Error::UnsupportedFormat(_))));
    }

    #[test]
    fn test_unsupported_pair() {
        let params = CscParams::same_size(4, 4, PixelFormat::YUV420P, PixelFormat::NV12);
        assert!(matches!(SoftwareConverter::new(params), Err(Error::UnsupportedFormat(_))));
        assert!(supported_outputs(PixelFormat::YUV420P).iter().all(|f| f.is_packed()));
        assert_eq!(supported_outputs(PixelFormat::BGRX).len(), PixelFormat::ALL.len());
    }

    #[test]
    fn test_alpha_is_opaque_after_yuv() {
        let image = bgrx(2, 2, 8, |_, _| (1, 2, 3));
        let mut to = SoftwareConverter::new(CscParams::same_size(2, 2, PixelFormat::BGRX, PixelFormat::YUV444P)).unwrap();
        let mid = to.convert_image(&image).unwrap();
        let mut back = SoftwareConverter::new(CscParams::same_size(2, 2, PixelFormat::YUV444P, PixelFormat::RGBA)).unwrap();
        let out = back.convert_image(&mid).unwrap();
        assert_eq!(out.get_plane_bytes(0).unwrap()[3], 255);
    }

    #[test]
    fn test_closed_and_mismatched_input() {
        let mut csc = SoftwareConverter::new(CscParams::same_size(4, 4, PixelFormat::BGRX, PixelFormat::RGB)).unwrap();
        let wrong = bgrx(2, 2, 8, |_, _| (0, 0, 0));
        assert!(matches!(csc.convert_image(&wrong), Err(Error::InvalidParameter(_))));
        csc.clean();
        csc.clean();
        let image = bgrx(4, 4, 16, |_, _| (0, 0, 0));
        assert!(matches!(csc.convert_image(&image), Err(Error::InvalidState(_))));
    }
}
