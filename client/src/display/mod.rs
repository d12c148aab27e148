//! ディスプレイモジュール
//!
//! デコード済みの領域をフレームバッファに合成します。
//! 領域は BGRX の [`ImageWrapper`] として渡され、合成後に解放されます。

mod decoder;

pub use decoder::DrawHandler;

use std::path::Path;

use log::{debug, info};

use remote_display_rs_common::codec::{ImageWrapper, PixelFormat};
use remote_display_rs_common::{Error, Result};

use crate::error::ClientError;

/// 提示側が受け取る画素フォーマット
pub const PRESENT_FORMAT: PixelFormat = PixelFormat::BGRX;

/// デコード済み領域の提示先
pub trait Presenter: Send {
    /// 領域を提示（画像の所有権を受け取る）
    fn present(&mut self, region: ImageWrapper) -> Result<()>;

    /// 現在の画面内容
    fn snapshot(&self) -> Option<&ImageWrapper>;

    /// 提示した領域の数
    fn presented(&self) -> u64;
}

/// メモリ上のフレームバッファ
///
/// 領域が現在のサイズを超える場合は内容を保ったまま拡張します。
#[derive(Default)]
pub struct FramebufferPresenter {
    framebuffer: Option<ImageWrapper>,
    presented: u64,
}

impl FramebufferPresenter {
    /// 空のフレームバッファを作成
    pub fn new() -> Self {
        Self::default()
    }

    /// フレームバッファのサイズ
    pub fn size(&self) -> Option<(u32, u32)> {
        self.framebuffer.as_ref().map(|fb| (fb.width(), fb.height()))
    }

    fn ensure_size(&mut self, width: u32, height: u32) -> Result<&mut ImageWrapper> {
        let (cur_w, cur_h) = self.size().unwrap_or((0, 0));
        if width > cur_w || height > cur_h {
            let (new_w, new_h) = (width.max(cur_w), height.max(cur_h));
            let mut grown = ImageWrapper::allocate(0, 0, new_w, new_h, PRESENT_FORMAT)?;
            if let Some(old) = self.framebuffer.take() {
                blit(&mut grown, &old, 0, 0)?;
            }
            debug!("フレームバッファを拡張: {}x{}", new_w, new_h);
            self.framebuffer = Some(grown);
        }
        self.framebuffer
            .as_mut()
            .ok_or_else(|| Error::InvalidState("フレームバッファがありません".to_string()))
    }
}

impl Presenter for FramebufferPresenter {
    fn present(&mut self, mut region: ImageWrapper) -> Result<()> {
        if region.pixel_format() != PRESENT_FORMAT {
            return Err(Error::UnsupportedFormat(format!(
                "{} は提示できません（{} が必要です）",
                region.pixel_format(),
                PRESENT_FORMAT
            )));
        }
        let (x, y) = (region.x(), region.y());
        let framebuffer = self.ensure_size(x + region.width(), y + region.height())?;
        let result = blit(framebuffer, &region, x, y);
        region.free();
        result?;
        self.presented += 1;
        Ok(())
    }

    fn snapshot(&self) -> Option<&ImageWrapper> {
        self.framebuffer.as_ref()
    }

    fn presented(&self) -> u64 {
        self.presented
    }
}

/// `src` を `dst` の (x, y) にコピー（どちらも BGRX）
fn blit(dst: &mut ImageWrapper, src: &ImageWrapper, x: u32, y: u32) -> Result<()> {
    let row_bytes = src.width() as usize * 4;
    let src_stride = src.rowstride(0)?;
    let dst_stride = dst.rowstride(0)?;
    let src_bytes = src.get_plane_bytes(0)?;
    let offset = x as usize * 4;
    let plane = dst.plane_mut(0)?;
    for row in 0..src.height() as usize {
        let s = row * src_stride;
        let d = (y as usize + row) * dst_stride + offset;
        plane[d..d + row_bytes].copy_from_slice(&src_bytes[s..s + row_bytes]);
    }
    Ok(())
}

/// BGRX のフレームバッファを PNG に保存
pub fn save_png(image: &ImageWrapper, path: &Path) -> std::result::Result<(), ClientError> {
    let (width, height) = (image.width(), image.height());
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            rgb.extend_from_slice(&image.rgb_at(x, y)?);
        }
    }
    let buffer = ::image::RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| ClientError::Config("PNG バッファのサイズが一致しません".to_string()))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    buffer.save(path)?;
    info!("フレームバッファを保存しました: {} ({}x{})", path.display(), width, height);
    Ok(())
}
