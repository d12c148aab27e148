//! 画像差分計算モジュール
//!
//! 連続するキャプチャ間の差分をブロック単位で求め、
//! 変更のあった領域（ダメージ矩形）だけを送信できるようにします。

use log::trace;

use remote_display_rs_common::codec::ImageWrapper;
use remote_display_rs_common::Result;

/// 矩形領域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rectangle {
    /// X座標
    pub x: u32,
    /// Y座標
    pub y: u32,
    /// 幅
    pub width: u32,
    /// 高さ
    pub height: u32,
}

impl Rectangle {
    /// 新しい矩形を作成
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// 矩形の面積を取得
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// 矩形が別の矩形と重なっているか確認
    pub fn overlaps(&self, other: &Rectangle) -> bool {
        self.x < other.x + other.width
            && self.x + self.width > other.x
            && self.y < other.y + other.height
            && self.y + self.height > other.y
    }

    /// 重なっているか、辺を共有しているか
    pub fn touches(&self, other: &Rectangle) -> bool {
        self.x <= other.x + other.width
            && self.x + self.width >= other.x
            && self.y <= other.y + other.height
            && self.y + self.height >= other.y
    }

    /// 2つの矩形を包む矩形
    pub fn merge(&self, other: &Rectangle) -> Self {
        let min_x = self.x.min(other.x);
        let min_y = self.y.min(other.y);
        let max_x = (self.x + self.width).max(other.x + other.width);
        let max_y = (self.y + self.height).max(other.y + other.height);
        Rectangle::new(min_x, min_y, max_x - min_x, max_y - min_y)
    }
}

/// 差分結果
#[derive(Debug, Clone, PartialEq)]
pub struct DiffResult {
    /// 変更された領域
    pub changed_regions: Vec<Rectangle>,
    /// 変更されたピクセル数
    pub changed_pixels: u64,
    /// 合計ピクセル数
    pub total_pixels: u64,
    /// 変更率（0.0～1.0）
    pub change_ratio: f32,
}

impl DiffResult {
    fn full_frame(width: u32, height: u32) -> Self {
        let total_pixels = width as u64 * height as u64;
        Self {
            changed_regions: vec![Rectangle::new(0, 0, width, height)],
            changed_pixels: total_pixels,
            total_pixels,
            change_ratio: 1.0,
        }
    }

    /// 変更がないかどうか
    pub fn is_empty(&self) -> bool {
        self.changed_regions.is_empty()
    }
}

/// 差分計算の設定
#[derive(Debug, Clone, Copy)]
pub struct DiffConfig {
    /// ブロックサイズ
    pub block_size: u32,
    /// この値を超える色差のピクセルを「変更あり」と判定（0～255）
    pub threshold: u8,
    /// 変化したとみなすブロック内のピクセル比率
    pub change_ratio_threshold: f32,
    /// 隣接する差分領域をマージする
    pub merge_adjacent: bool,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            block_size: 32,
            threshold: 15,
            change_ratio_threshold: 0.05,
            merge_adjacent: true,
        }
    }
}

/// 差分計算機
///
/// 前回のフレームをコピーして保持し、次のフレームとブロックごとに比較します。
pub struct DiffCalculator {
    config: DiffConfig,
    previous: Option<ImageWrapper>,
}

impl DiffCalculator {
    /// 新しい差分計算機を作成
    pub fn new(config: DiffConfig) -> Self {
        Self {
            config,
            previous: None,
        }
    }

    /// 設定を取得
    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// 前回のフレームを破棄（次回は全画面を差分とする）
    pub fn clear_previous(&mut self) {
        self.previous = None;
    }

    /// 差分を計算
    ///
    /// 初回とサイズ変更時は画面全体を返します。
    pub fn calculate(&mut self, current: &ImageWrapper) -> Result<DiffResult> {
        let (width, height) = (current.width(), current.height());
        let result = match &self.previous {
            Some(prev)
                if prev.width() == width
                    && prev.height() == height
                    && prev.pixel_format() == current.pixel_format() =>
            {
                self.compare(prev, current)?
            }
            _ => DiffResult::full_frame(width, height),
        };
        trace!(
            "差分: {} 領域, 変更率 {:.3}",
            result.changed_regions.len(),
            result.change_ratio
        );
        self.previous = Some(current.try_clone()?);
        Ok(result)
    }

    fn compare(&self, prev: &ImageWrapper, current: &ImageWrapper) -> Result<DiffResult> {
        let (width, height) = (current.width(), current.height());
        let bpp = current.pixel_format().packed_layout().map(|l| l.bpp).unwrap_or(4);
        let (prev_bytes, prev_stride) = (prev.get_plane_bytes(0)?, prev.rowstride(0)?);
        let (cur_bytes, cur_stride) = (current.get_plane_bytes(0)?, current.rowstride(0)?);

        let block_size = self.config.block_size.max(1);
        let total_pixels = width as u64 * height as u64;
        let mut changed_blocks = Vec::new();
        let mut changed_pixels = 0u64;

        for by in (0..height).step_by(block_size as usize) {
            for bx in (0..width).step_by(block_size as usize) {
                let block_width = block_size.min(width - bx);
                let block_height = block_size.min(height - by);
                let mut block_changed = 0u64;

                for y in by..by + block_height {
                    let p_row = y as usize * prev_stride;
                    let c_row = y as usize * cur_stride;
                    for x in bx..bx + block_width {
                        let off = x as usize * bpp;
                        let p = &prev_bytes[p_row + off..p_row + off + 3];
                        let c = &cur_bytes[c_row + off..c_row + off + 3];
                        if pixel_diff(p, c) > self.config.threshold {
                            block_changed += 1;
                        }
                    }
                }

                let block_pixels = block_width as u64 * block_height as u64;
                let ratio = block_changed as f32 / block_pixels as f32;
                if block_changed > 0 && ratio >= self.config.change_ratio_threshold {
                    changed_blocks.push(Rectangle::new(bx, by, block_width, block_height));
                    changed_pixels += block_changed;
                }
            }
        }

        let changed_regions = if self.config.merge_adjacent {
            merge_adjacent_regions(changed_blocks)
        } else {
            changed_blocks
        };

        Ok(DiffResult {
            changed_regions,
            changed_pixels,
            total_pixels,
            change_ratio: changed_pixels as f32 / total_pixels as f32,
        })
    }
}

impl Default for DiffCalculator {
    fn default() -> Self {
        Self::new(DiffConfig::default())
    }
}

/// 3 チャンネルの色差の平均（4 バイト目は無視）
fn pixel_diff(p1: &[u8], p2: &[u8]) -> u8 {
    let sum: u32 = p1
        .iter()
        .zip(p2)
        .map(|(a, b)| (*a as i16 - *b as i16).unsigned_abs() as u32)
        .sum();
    (sum / 3) as u8
}

/// 接している領域を包含矩形にまとめる
fn merge_adjacent_regions(regions: Vec<Rectangle>) -> Vec<Rectangle> {
    let mut result: Vec<Rectangle> = Vec::with_capacity(regions.len());
    for region in regions {
        let mut current = region;
        // 統合で広がった矩形が既存の結果と接する場合もあるので繰り返す
        loop {
            let before = result.len();
            result.retain(|r| {
                if current.touches(r) {
                    current = current.merge(r);
                    false
                } else {
                    true
                }
            });
            if result.len() == before {
                break;
            }
        }
        result.push(current);
    }
    result.sort_by_key(|r| (r.y, r.x));
    result
}
