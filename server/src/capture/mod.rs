//! キャプチャモジュール
//!
//! 画面フレームの取得と、前フレームとの差分計算を担当します。
//! フレームは BGRX の [`ImageWrapper`] として扱います。

pub mod diff;

pub use diff::{DiffCalculator, DiffConfig, DiffResult, Rectangle};

use remote_display_rs_common::codec::{ImageWrapper, PixelFormat};
use remote_display_rs_common::{Error, Result};

/// フレームの取得元
pub trait CaptureSource: Send {
    /// 画面サイズ
    fn size(&self) -> (u32, u32);

    /// 次のフレームを取得
    fn capture(&mut self) -> Result<ImageWrapper>;

    /// 名前（ログ用）
    fn name(&self) -> &str;
}

/// テストパターンを生成するキャプチャ元
///
/// グラデーションの背景上を四角形が移動するフレームを返します。
/// 実際の画面取得を持たない環境でも描画パイプライン全体を動かせます。
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame: u64,
    box_size: u32,
}

impl TestPatternSource {
    /// 新しいテストパターンを作成
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidParameter(format!(
                "キャプチャサイズが不正です: {}x{}",
                width, height
            )));
        }
        Ok(Self {
            width,
            height,
            frame: 0,
            box_size: (width.min(height) / 8).max(1),
        })
    }

    /// 生成済みフレーム数
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    fn box_origin(&self) -> (u32, u32) {
        let span_x = (self.width - self.box_size).max(1) as u64;
        let span_y = (self.height - self.box_size).max(1) as u64;
        let step = self.frame * self.box_size as u64;
        ((step % span_x) as u32, ((step / span_x * self.box_size as u64) % span_y) as u32)
    }
}

impl CaptureSource for TestPatternSource {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&mut self) -> Result<ImageWrapper> {
        let mut image = ImageWrapper::allocate(0, 0, self.width, self.height, PixelFormat::BGRX)?;
        let stride = image.rowstride(0)?;
        let (bx, by) = self.box_origin();
        let box_size = self.box_size;
        let (width, height) = (self.width as usize, self.height as usize);

        let plane = image.plane_mut(0)?;
        for y in 0..height {
            let row = &mut plane[y * stride..y * stride + width * 4];
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let inside = (x as u32) >= bx
                    && (x as u32) < bx + box_size
                    && (y as u32) >= by
                    && (y as u32) < by + box_size;
                if inside {
                    px.copy_from_slice(&[0x20, 0x40, 0xF0, 0]);
                } else {
                    let b = (x * 255 / width) as u8;
                    let g = (y * 255 / height) as u8;
                    px.copy_from_slice(&[b, g, 0x30, 0]);
                }
            }
        }
        self.frame += 1;
        Ok(image)
    }

    fn name(&self) -> &str {
        "test-pattern"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_frames() {
        let mut source = TestPatternSource::new(64, 48).unwrap();
        assert_eq!(source.size(), (64, 48));
        let first = source.capture().unwrap();
        assert_eq!(first.pixel_format(), PixelFormat::BGRX);
        assert_eq!((first.width(), first.height()), (64, 48));
        let second = source.capture().unwrap();
        assert_eq!(source.frame_count(), 2);

        // 四角形が動いた分だけ差分が出る
        let mut diff = DiffCalculator::default();
        diff.calculate(&first).unwrap();
        let result = diff.calculate(&second).unwrap();
        assert!(!result.is_empty());
        assert!(result.change_ratio < 1.0);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(TestPatternSource::new(0, 10).is_err());
    }
}
