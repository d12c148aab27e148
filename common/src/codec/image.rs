//! 画素バッファ
//!
//! `ImageWrapper` は 1 つの画面領域の画素データを所有します。プレーンの
//! 所有権はこの型だけが持ち、寿命を延ばす方法は `try_clone` による
//! ディープコピーのみです。`free` は何度呼んでも安全で、解放後のアクセスは
//! `Error::BufferFreed` になります。

use log::trace;

use super::pixel_format::PixelFormat;
use crate::error::{Error, Result};

/// 確保するストライドのアライメント
pub const STRIDE_ALIGN: usize = 32;

/// 末尾に追加で確保する行数（1 行先まで読むコーデック向け）
pub const PADDING_ROWS: usize = 1;

/// ストライドをアライメント境界に切り上げる
pub fn aligned_stride(min_stride: usize) -> usize {
    (min_stride + STRIDE_ALIGN - 1) / STRIDE_ALIGN * STRIDE_ALIGN
}

/// ゼロ埋めしたバッファを確保（失敗は `ResourceExhaustion`）
pub(crate) fn alloc_zeroed(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|e| {
        Error::ResourceExhaustion(format!("{} バイトのバッファを確保できません: {}", len, e))
    })?;
    buf.resize(len, 0);
    Ok(buf)
}

/// 画素バッファ
#[derive(Debug)]
pub struct ImageWrapper {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    planes: Option<Vec<Vec<u8>>>,
    rowstrides: Vec<usize>,
    full_range: bool,
}

impl ImageWrapper {
    /// 既存のプレーンバッファから作成
    ///
    /// 幅と高さが正であること、プレーン数がフォーマットと一致すること、
    /// 各ストライドが最小値以上であること、各バッファがストライド×高さ以上
    /// あることを検証します。
    pub fn new(
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        planes: Vec<Vec<u8>>,
        rowstrides: Vec<usize>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter(format!(
                "画像サイズが不正です: {}x{}",
                width, height
            )));
        }
        let plane_count = pixel_format.plane_count();
        if planes.len() != plane_count || rowstrides.len() != plane_count {
            return Err(Error::InvalidParameter(format!(
                "{} には {} プレーンが必要です（プレーン {}, ストライド {}）",
                pixel_format,
                plane_count,
                planes.len(),
                rowstrides.len()
            )));
        }
        for (plane, (buf, &stride)) in planes.iter().zip(&rowstrides).enumerate() {
            let min_stride = pixel_format.min_stride(plane, width);
            if stride < min_stride {
                return Err(Error::InvalidParameter(format!(
                    "プレーン {} のストライド {} は最小値 {} より小さいです",
                    plane, stride, min_stride
                )));
            }
            let (_, plane_height) = pixel_format.plane_dimensions(plane, width, height);
            let required = stride * plane_height as usize;
            if buf.len() < required {
                return Err(Error::BufferSizeMismatch(format!(
                    "プレーン {} は {} バイトですが {} バイト必要です",
                    plane,
                    buf.len(),
                    required
                )));
            }
        }
        Ok(Self {
            x,
            y,
            width,
            height,
            pixel_format,
            planes: Some(planes),
            rowstrides,
            full_range: true,
        })
    }

    /// パック形式の 1 プレーンから作成
    pub fn from_packed(
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        pixels: Vec<u8>,
        rowstride: usize,
    ) -> Result<Self> {
        if !pixel_format.is_packed() {
            return Err(Error::UnsupportedFormat(format!(
                "{} はパック形式ではありません",
                pixel_format
            )));
        }
        Self::new(x, y, width, height, pixel_format, vec![pixels], vec![rowstride])
    }

    /// ゼロ埋めしたプレーンを確保して作成
    ///
    /// ストライドは `STRIDE_ALIGN` に揃え、各プレーンは `PADDING_ROWS` 行
    /// 余分に確保します。
    pub fn allocate(x: u32, y: u32, width: u32, height: u32, pixel_format: PixelFormat) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter(format!(
                "画像サイズが不正です: {}x{}",
                width, height
            )));
        }
        let plane_count = pixel_format.plane_count();
        let mut planes = Vec::with_capacity(plane_count);
        let mut rowstrides = Vec::with_capacity(plane_count);
        for plane in 0..plane_count {
            let stride = aligned_stride(pixel_format.min_stride(plane, width));
            let (_, plane_height) = pixel_format.plane_dimensions(plane, width, height);
            planes.push(alloc_zeroed(stride * (plane_height as usize + PADDING_ROWS))?);
            rowstrides.push(stride);
        }
        Self::new(x, y, width, height, pixel_format, planes, rowstrides)
    }

    /// レンジ指定を変更して返す
    pub fn with_full_range(mut self, full_range: bool) -> Self {
        self.full_range = full_range;
        self
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// プレーン数
    pub fn planes(&self) -> usize {
        self.pixel_format.plane_count()
    }

    /// フルレンジ（0-255）かどうか。RGB 系では常に意味を持ちません。
    pub fn full_range(&self) -> bool {
        self.full_range
    }

    pub fn set_full_range(&mut self, full_range: bool) {
        self.full_range = full_range;
    }

    /// 表示位置を変更
    pub fn set_position(&mut self, x: u32, y: u32) {
        self.x = x;
        self.y = y;
    }

    /// プレーンのストライド
    pub fn rowstride(&self, plane: usize) -> Result<usize> {
        self.rowstrides
            .get(plane)
            .copied()
            .ok_or_else(|| Error::InvalidParameter(format!("プレーン {} は存在しません", plane)))
    }

    /// 全プレーンのストライド
    pub fn rowstrides(&self) -> &[usize] {
        &self.rowstrides
    }

    /// プレーンのバイト列
    pub fn get_plane_bytes(&self, plane: usize) -> Result<&[u8]> {
        let planes = self.planes.as_ref().ok_or_else(|| self.freed_error())?;
        planes
            .get(plane)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::InvalidParameter(format!("プレーン {} は存在しません", plane)))
    }

    /// プレーンの可変バイト列
    pub fn plane_mut(&mut self, plane: usize) -> Result<&mut [u8]> {
        let freed = self.freed_error();
        let planes = self.planes.as_mut().ok_or(freed)?;
        planes
            .get_mut(plane)
            .map(Vec::as_mut_slice)
            .ok_or_else(|| Error::InvalidParameter(format!("プレーン {} は存在しません", plane)))
    }

    /// 全プレーンを可変で借用
    pub(crate) fn planes_mut(&mut self) -> Result<&mut [Vec<u8>]> {
        let freed = self.freed_error();
        self.planes.as_mut().map(Vec::as_mut_slice).ok_or(freed)
    }

    /// 解放済みかどうか
    pub fn is_freed(&self) -> bool {
        self.planes.is_none()
    }

    /// プレーンを解放（冪等）
    pub fn free(&mut self) {
        if self.planes.take().is_some() {
            trace!(
                target: "codec",
                "{}x{} {} バッファを解放しました",
                self.width,
                self.height,
                self.pixel_format
            );
        }
    }

    /// 全プレーンをディープコピー
    pub fn try_clone(&self) -> Result<Self> {
        let source = self.planes.as_ref().ok_or_else(|| self.freed_error())?;
        let mut planes = Vec::with_capacity(source.len());
        for plane in source {
            let mut copy = alloc_zeroed(plane.len())?;
            copy.copy_from_slice(plane);
            planes.push(copy);
        }
        Ok(Self {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            planes: Some(planes),
            rowstrides: self.rowstrides.clone(),
            full_range: self.full_range,
        })
    }

    /// 矩形領域をコピーした新しい画像（パック形式のみ）
    ///
    /// 座標はこの画像の左上からの相対位置で、結果の位置は絶対座標になります。
    pub fn sub_image(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Self> {
        let layout = self.pixel_format.packed_layout().ok_or_else(|| {
            Error::UnsupportedFormat(format!("{} の部分画像は作成できません", self.pixel_format))
        })?;
        if width == 0
            || height == 0
            || x.saturating_add(width) > self.width
            || y.saturating_add(height) > self.height
        {
            return Err(Error::InvalidParameter(format!(
                "矩形 {}x{}+{}+{} は {}x{} の範囲外です",
                width, height, x, y, self.width, self.height
            )));
        }
        let src = self.get_plane_bytes(0)?;
        let src_stride = self.rowstrides[0];
        let mut sub = Self::allocate(self.x + x, self.y + y, width, height, self.pixel_format)?;
        let dst_stride = sub.rowstrides[0];
        let row_bytes = width as usize * layout.bpp;
        let offset = x as usize * layout.bpp;
        let dst = sub.plane_mut(0)?;
        for row in 0..height as usize {
            let s = (y as usize + row) * src_stride + offset;
            let d = row * dst_stride;
            dst[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
        sub.full_range = self.full_range;
        Ok(sub)
    }

    /// ストライドを変更して詰め直す（パック形式のみ）
    pub fn restride(&mut self, rowstride: usize) -> Result<()> {
        if !self.pixel_format.is_packed() {
            return Err(Error::UnsupportedFormat(format!(
                "{} のストライドは変更できません",
                self.pixel_format
            )));
        }
        let min_stride = self.pixel_format.min_stride(0, self.width);
        if rowstride < min_stride {
            return Err(Error::InvalidParameter(format!(
                "ストライド {} は最小値 {} より小さいです",
                rowstride, min_stride
            )));
        }
        let old_stride = self.rowstrides[0];
        if rowstride == old_stride {
            return Ok(());
        }
        let height = self.height as usize;
        let mut repacked = alloc_zeroed(rowstride * (height + PADDING_ROWS))?;
        let src = self.get_plane_bytes(0)?;
        for row in 0..height {
            repacked[row * rowstride..row * rowstride + min_stride]
                .copy_from_slice(&src[row * old_stride..row * old_stride + min_stride]);
        }
        self.planes = Some(vec![repacked]);
        self.rowstrides[0] = rowstride;
        Ok(())
    }

    /// プレーンをパディングなしの連続した行として追記
    pub fn append_plane_rows(&self, plane: usize, out: &mut Vec<u8>) -> Result<()> {
        let src = self.get_plane_bytes(plane)?;
        let stride = self.rowstride(plane)?;
        let row_bytes = self.pixel_format.min_stride(plane, self.width);
        let (_, rows) = self.pixel_format.plane_dimensions(plane, self.width, self.height);
        out.try_reserve(row_bytes * rows as usize)
            .map_err(|e| Error::ResourceExhaustion(e.to_string()))?;
        for row in 0..rows as usize {
            out.extend_from_slice(&src[row * stride..row * stride + row_bytes]);
        }
        Ok(())
    }

    /// パック形式の画素を (R, G, B) で取得
    pub fn rgb_at(&self, x: u32, y: u32) -> Result<[u8; 3]> {
        let layout = self.pixel_format.packed_layout().ok_or_else(|| {
            Error::UnsupportedFormat(format!("{} の画素は直接読めません", self.pixel_format))
        })?;
        if x >= self.width || y >= self.height {
            return Err(Error::InvalidParameter(format!("座標 ({}, {}) は範囲外です", x, y)));
        }
        let src = self.get_plane_bytes(0)?;
        let i = y as usize * self.rowstrides[0] + x as usize * layout.bpp;
        Ok([src[i + layout.r], src[i + layout.g], src[i + layout.b]])
    }

    fn freed_error(&self) -> Error {
        Error::BufferFreed(format!(
            "{}x{} {} バッファ",
            self.width, self.height, self.pixel_format
        ))
    }
}

impl Drop for ImageWrapper {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32, stride: usize) -> ImageWrapper {
        let mut pixels = vec![0u8; stride * height as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let i = y * stride + x * 4;
                pixels[i] = x as u8;
                pixels[i + 1] = y as u8;
                pixels[i + 2] = (x + y) as u8;
                pixels[i + 3] = 255;
            }
        }
        ImageWrapper::from_packed(0, 0, width, height, PixelFormat::BGRX, pixels, stride).unwrap()
    }

    #[test]
    fn test_construction_validation() {
        let err = ImageWrapper::from_packed(0, 0, 0, 4, PixelFormat::BGRX, vec![], 0).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));

        let err = ImageWrapper::from_packed(0, 0, 4, 4, PixelFormat::BGRX, vec![0; 64], 12).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));

        let err = ImageWrapper::from_packed(0, 0, 4, 4, PixelFormat::BGRX, vec![0; 63], 16).unwrap_err();
        assert!(matches!(err, Error::BufferSizeMismatch(_)));

        let err = ImageWrapper::new(
            0,
            0,
            4,
            4,
            PixelFormat::YUV420P,
            vec![vec![0; 16]],
            vec![4],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_allocate_alignment_and_padding() {
        let image = ImageWrapper::allocate(0, 0, 33, 17, PixelFormat::YUV420P).unwrap();
        assert_eq!(image.planes(), 3);
        assert_eq!(image.rowstride(0).unwrap(), 64);
        assert_eq!(image.rowstride(1).unwrap(), 32);
        assert_eq!(image.get_plane_bytes(0).unwrap().len(), 64 * 18);
        assert_eq!(image.get_plane_bytes(2).unwrap().len(), 32 * 10);
        assert!(image.rowstride(3).is_err());
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut image = gradient(4, 4, 16);
        image.free();
        image.free();
        assert!(image.is_freed());
        assert!(matches!(image.get_plane_bytes(0), Err(Error::BufferFreed(_))));
        assert!(matches!(image.try_clone(), Err(Error::BufferFreed(_))));
    }

    #[test]
    fn test_clone_outlives_original() {
        let mut image = gradient(4, 4, 16);
        let copy = image.try_clone().unwrap();
        image.free();
        assert_eq!(copy.rgb_at(3, 2).unwrap(), [5, 2, 3]);
    }

    #[test]
    fn test_sub_image() {
        let image = gradient(8, 8, 40);
        let sub = image.sub_image(2, 3, 4, 2).unwrap();
        assert_eq!((sub.x(), sub.y(), sub.width(), sub.height()), (2, 3, 4, 2));
        assert_eq!(sub.rgb_at(0, 0).unwrap(), image.rgb_at(2, 3).unwrap());
        assert_eq!(sub.rgb_at(3, 1).unwrap(), image.rgb_at(5, 4).unwrap());
        assert!(image.sub_image(6, 0, 4, 1).is_err());
    }

    #[test]
    fn test_restride() {
        let mut image = gradient(5, 3, 64);
        let before = image.rgb_at(4, 2).unwrap();
        image.restride(20).unwrap();
        assert_eq!(image.rowstride(0).unwrap(), 20);
        assert_eq!(image.rgb_at(4, 2).unwrap(), before);
        assert!(image.restride(19).is_err());
    }

    #[test]
    fn test_append_plane_rows_drops_padding() {
        let image = gradient(2, 2, 32);
        let mut out = Vec::new();
        image.append_plane_rows(0, &mut out).unwrap();
        assert_eq!(out.len(), 16);
        assert_eq!(&out[8..12], &[0, 1, 1, 255]);
    }
}
