//! 画素フォーマット
//!
//! パック形式（1 プレーンに画素をインターリーブ）とプレーナ形式
//! （チャンネルごとに独立したプレーン）を列挙し、プレーン数や
//! サブサンプリング、最小ストライドを導出します。

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// 画素フォーマット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PixelFormat {
    /// R, G, B（3 バイト）
    RGB,
    /// B, G, R（3 バイト）
    BGR,
    /// R, G, B, 未使用
    RGBX,
    /// B, G, R, 未使用
    BGRX,
    /// 未使用, R, G, B
    XRGB,
    /// 未使用, B, G, R
    XBGR,
    /// R, G, B, A
    RGBA,
    /// B, G, R, A
    BGRA,
    /// A, R, G, B
    ARGB,
    /// A, B, G, R
    ABGR,
    /// Y + 1/4 の U, V
    YUV420P,
    /// Y + 水平 1/2 の U, V
    YUV422P,
    /// Y, U, V 同解像度
    YUV444P,
    /// Y + UV インターリーブ（4:2:0）
    NV12,
    /// G, B, R 同解像度
    GBRP,
    /// 16 ビット（リトルエンディアン）の YUV444P
    YUV444P16,
    /// 16 ビット（リトルエンディアン）の GBRP
    GBRP16,
}

/// パック形式のチャンネル配置（バイトオフセット）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedLayout {
    pub r: usize,
    pub g: usize,
    pub b: usize,
    /// アルファまたは未使用バイトの位置
    pub x: Option<usize>,
    /// 1 画素のバイト数
    pub bpp: usize,
}

impl PixelFormat {
    /// すべてのフォーマット
    pub const ALL: [PixelFormat; 17] = [
        PixelFormat::RGB,
        PixelFormat::BGR,
        PixelFormat::RGBX,
        PixelFormat::BGRX,
        PixelFormat::XRGB,
        PixelFormat::XBGR,
        PixelFormat::RGBA,
        PixelFormat::BGRA,
        PixelFormat::ARGB,
        PixelFormat::ABGR,
        PixelFormat::YUV420P,
        PixelFormat::YUV422P,
        PixelFormat::YUV444P,
        PixelFormat::NV12,
        PixelFormat::GBRP,
        PixelFormat::YUV444P16,
        PixelFormat::GBRP16,
    ];

    /// パック RGB 系のフォーマット
    pub const PACKED: [PixelFormat; 10] = [
        PixelFormat::RGB,
        PixelFormat::BGR,
        PixelFormat::RGBX,
        PixelFormat::BGRX,
        PixelFormat::XRGB,
        PixelFormat::XBGR,
        PixelFormat::RGBA,
        PixelFormat::BGRA,
        PixelFormat::ARGB,
        PixelFormat::ABGR,
    ];

    /// プレーナ形式のフォーマット
    pub const PLANAR: [PixelFormat; 7] = [
        PixelFormat::YUV420P,
        PixelFormat::YUV422P,
        PixelFormat::YUV444P,
        PixelFormat::NV12,
        PixelFormat::GBRP,
        PixelFormat::YUV444P16,
        PixelFormat::GBRP16,
    ];

    /// フォーマット名
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::RGB => "RGB",
            PixelFormat::BGR => "BGR",
            PixelFormat::RGBX => "RGBX",
            PixelFormat::BGRX => "BGRX",
            PixelFormat::XRGB => "XRGB",
            PixelFormat::XBGR => "XBGR",
            PixelFormat::RGBA => "RGBA",
            PixelFormat::BGRA => "BGRA",
            PixelFormat::ARGB => "ARGB",
            PixelFormat::ABGR => "ABGR",
            PixelFormat::YUV420P => "YUV420P",
            PixelFormat::YUV422P => "YUV422P",
            PixelFormat::YUV444P => "YUV444P",
            PixelFormat::NV12 => "NV12",
            PixelFormat::GBRP => "GBRP",
            PixelFormat::YUV444P16 => "YUV444P16",
            PixelFormat::GBRP16 => "GBRP16",
        }
    }

    /// 名前から変換（大文字小文字は区別しない）
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str().eq_ignore_ascii_case(name))
    }

    /// パック形式かどうか
    pub fn is_packed(&self) -> bool {
        self.packed_layout().is_some()
    }

    /// プレーナ形式かどうか
    pub fn is_planar(&self) -> bool {
        !self.is_packed()
    }

    /// YUV 系かどうか（レンジ指定の影響を受ける）
    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            PixelFormat::YUV420P
                | PixelFormat::YUV422P
                | PixelFormat::YUV444P
                | PixelFormat::NV12
                | PixelFormat::YUV444P16
        )
    }

    /// 16 ビットサンプルかどうか
    pub fn is_high_bit_depth(&self) -> bool {
        matches!(self, PixelFormat::YUV444P16 | PixelFormat::GBRP16)
    }

    /// アルファチャンネルを持つかどうか
    pub fn has_alpha(&self) -> bool {
        matches!(
            self,
            PixelFormat::RGBA | PixelFormat::BGRA | PixelFormat::ARGB | PixelFormat::ABGR
        )
    }

    /// プレーン数
    pub fn plane_count(&self) -> usize {
        match self {
            f if f.is_packed() => 1,
            PixelFormat::NV12 => 2,
            _ => 3,
        }
    }

    /// 1 サンプルのバイト数（パック形式では 1 画素のバイト数）
    pub fn bytes_per_sample(&self) -> usize {
        if let Some(layout) = self.packed_layout() {
            return layout.bpp;
        }
        if self.is_high_bit_depth() {
            2
        } else {
            1
        }
    }

    /// 1 画素あたりの平均ビット数
    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            PixelFormat::RGB | PixelFormat::BGR => 24,
            f if f.is_packed() => 32,
            PixelFormat::YUV420P | PixelFormat::NV12 => 12,
            PixelFormat::YUV422P => 16,
            PixelFormat::YUV444P | PixelFormat::GBRP => 24,
            _ => 48,
        }
    }

    /// プレーンごとのサブサンプリング除数 (x, y)
    pub fn subsampling(&self, plane: usize) -> (u32, u32) {
        if plane == 0 {
            return (1, 1);
        }
        match self {
            PixelFormat::YUV420P | PixelFormat::NV12 => (2, 2),
            PixelFormat::YUV422P => (2, 1),
            _ => (1, 1),
        }
    }

    /// プレーンの幅と高さ（サンプル単位）
    pub fn plane_dimensions(&self, plane: usize, width: u32, height: u32) -> (u32, u32) {
        let (dx, dy) = self.subsampling(plane);
        ((width + dx - 1) / dx, (height + dy - 1) / dy)
    }

    /// プレーン 1 行に必要な最小バイト数
    pub fn min_stride(&self, plane: usize, width: u32) -> usize {
        let (plane_width, _) = self.plane_dimensions(plane, width, 1);
        let interleave = if *self == PixelFormat::NV12 && plane == 1 { 2 } else { 1 };
        plane_width as usize * self.bytes_per_sample() * interleave
    }

    /// パック形式のチャンネル配置
    pub fn packed_layout(&self) -> Option<PackedLayout> {
        let layout = |r, g, b, x, bpp| PackedLayout { r, g, b, x, bpp };
        Some(match self {
            PixelFormat::RGB => layout(0, 1, 2, None, 3),
            PixelFormat::BGR => layout(2, 1, 0, None, 3),
            PixelFormat::RGBX | PixelFormat::RGBA => layout(0, 1, 2, Some(3), 4),
            PixelFormat::BGRX | PixelFormat::BGRA => layout(2, 1, 0, Some(3), 4),
            PixelFormat::XRGB | PixelFormat::ARGB => layout(1, 2, 3, Some(0), 4),
            PixelFormat::XBGR | PixelFormat::ABGR => layout(3, 2, 1, Some(0), 4),
            _ => return None,
        })
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PixelFormat::from_name(s)
            .ok_or_else(|| Error::UnsupportedFormat(format!("不明な画素フォーマット: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_roundtrip() {
        for format in PixelFormat::ALL {
            assert_eq!(format.as_str().parse::<PixelFormat>().unwrap(), format);
        }
        assert_eq!(PixelFormat::from_name("bgrx"), Some(PixelFormat::BGRX));
        assert!("YUV411P".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_plane_arity() {
        assert_eq!(PixelFormat::BGRX.plane_count(), 1);
        assert_eq!(PixelFormat::NV12.plane_count(), 2);
        assert_eq!(PixelFormat::YUV420P.plane_count(), 3);
        assert_eq!(PixelFormat::GBRP16.plane_count(), 3);
        assert_eq!(PixelFormat::PACKED.len() + PixelFormat::PLANAR.len(), PixelFormat::ALL.len());
    }

    #[test]
    fn test_odd_dimensions_round_up() {
        assert_eq!(PixelFormat::YUV420P.plane_dimensions(1, 5, 3), (3, 2));
        assert_eq!(PixelFormat::YUV422P.plane_dimensions(2, 5, 3), (3, 3));
        assert_eq!(PixelFormat::NV12.min_stride(1, 5), 6);
        assert_eq!(PixelFormat::YUV444P16.min_stride(0, 5), 10);
        assert_eq!(PixelFormat::RGB.min_stride(0, 5), 15);
    }

    #[test]
    fn test_packed_layout() {
        let layout = PixelFormat::BGRX.packed_layout().unwrap();
        assert_eq!((layout.r, layout.g, layout.b, layout.x, layout.bpp), (2, 1, 0, Some(3), 4));
        let layout = PixelFormat::ARGB.packed_layout().unwrap();
        assert_eq!((layout.r, layout.g, layout.b, layout.x), (1, 2, 3, Some(0)));
        assert!(PixelFormat::GBRP.packed_layout().is_none());
    }
}
