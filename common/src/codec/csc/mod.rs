//! 色空間変換
//!
//! 変換器は構築時に (元サイズ, 元フォーマット, 出力サイズ, 出力フォーマット)
//! を固定し、以後は同じ形の画像を何枚でも変換します。チャンネル配置などの
//! 画素ごとに不変な情報は構築時に解決します。
//!
//! - [`software`]: 固定小数点の参照実装。すべての組み合わせとスケーリング
//! - [`swizzle`]: パック RGB 系どうしのバイト並べ替え（同サイズのみ）

pub mod matrix;
pub mod software;
pub mod swizzle;

pub use software::SoftwareConverter;
pub use swizzle::SwizzleConverter;

use super::image::ImageWrapper;
use super::pixel_format::PixelFormat;
use crate::error::{Error, Result};

/// 変換オプション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CscOptions {
    /// YUV 出力をフルレンジにするかどうか
    pub full_range: bool,
}

impl Default for CscOptions {
    fn default() -> Self {
        Self { full_range: true }
    }
}

/// 変換器の構築パラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CscParams {
    pub src_width: u32,
    pub src_height: u32,
    pub src_format: PixelFormat,
    pub dst_width: u32,
    pub dst_height: u32,
    pub dst_format: PixelFormat,
    pub options: CscOptions,
}

impl CscParams {
    /// 同じサイズのままフォーマットだけ変える変換
    pub fn same_size(width: u32, height: u32, src_format: PixelFormat, dst_format: PixelFormat) -> Self {
        Self {
            src_width: width,
            src_height: height,
            src_format,
            dst_width: width,
            dst_height: height,
            dst_format,
            options: CscOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CscOptions) -> Self {
        self.options = options;
        self
    }

    /// スケーリングを伴うかどうか
    pub fn is_scaling(&self) -> bool {
        self.src_width != self.dst_width || self.src_height != self.dst_height
    }

    pub(crate) fn validate_dimensions(&self) -> Result<()> {
        if self.src_width == 0 || self.src_height == 0 || self.dst_width == 0 || self.dst_height == 0 {
            return Err(Error::InvalidParameter(format!(
                "変換サイズが不正です: {}x{} -> {}x{}",
                self.src_width, self.src_height, self.dst_width, self.dst_height
            )));
        }
        Ok(())
    }
}

/// 色空間変換器
///
/// インスタンスは同時に 1 つのワーカーだけが所有します。
pub trait ColorspaceConverter: Send {
    /// 実装名（コーデック仕様の名前と同じ）
    fn name(&self) -> &'static str;

    /// 構築パラメータ
    fn params(&self) -> &CscParams;

    /// 画像を変換して新しい画像を返す
    fn convert_image(&mut self, image: &ImageWrapper) -> Result<ImageWrapper>;

    /// 内部資源を解放（冪等）
    fn clean(&mut self);

    fn is_closed(&self) -> bool;
}

/// 入力画像が構築パラメータと一致するか確認
pub(crate) fn check_source(name: &str, params: &CscParams, closed: bool, image: &ImageWrapper) -> Result<()> {
    if closed {
        return Err(Error::InvalidState(format!("{} はクローズ済みです", name)));
    }
    if image.pixel_format() != params.src_format
        || image.width() != params.src_width
        || image.height() != params.src_height
    {
        return Err(Error::InvalidParameter(format!(
            "{} は {}x{} {} を受け付けますが {}x{} {} が渡されました",
            name,
            params.src_width,
            params.src_height,
            params.src_format,
            image.width(),
            image.height(),
            image.pixel_format()
        )));
    }
    Ok(())
}
