//! コーデックレジストリとスコアリング
//!
//! 起動時に、利用可能な変換器・エンコーダ・デコーダがそれぞれ
//! `CodecSpec` を登録します。呼び出し側は候補を検索し、品質・速度・
//! 初期化コストの重み付きスコアで順位付けして、構築に失敗した候補は
//! 次点に切り替えます。
//!
//! レジストリは起動後は読み取り専用で、検索にロックは不要です。

use std::cmp::Reverse;
use std::fmt;

use log::{debug, info, trace};

use super::csc::{self, ColorspaceConverter, CscParams};
use super::pixel_format::PixelFormat;
use super::video::{Decoder, Encoder};
use super::{planar, rgb};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};

/// 変換器のファクトリ
pub type CscFactory = fn(CscParams) -> Result<Box<dyn ColorspaceConverter>>;
/// エンコーダのファクトリ
pub type EncoderFactory = fn() -> Box<dyn Encoder>;
/// デコーダのファクトリ
pub type DecoderFactory = fn() -> Box<dyn Decoder>;

/// 実装の生成関数
#[derive(Debug, Clone, Copy)]
pub enum CodecFactory {
    Csc(CscFactory),
    Encoder(EncoderFactory),
    Decoder(DecoderFactory),
}

/// 実装の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    Csc,
    Encoder,
    Decoder,
}

/// 既定の最大寸法
pub const DEFAULT_MAX_SIZE: u32 = 8192;

/// 1 つの実装の能力とコスト
#[derive(Debug, Clone)]
pub struct CodecSpec {
    /// 実装名
    pub name: &'static str,
    /// 対応するエンコーディング（変換器では `None`）
    pub encoding: Option<&'static str>,
    /// 入力フォーマット（デコーダでは `None`）
    pub input_format: Option<PixelFormat>,
    /// 出力できるフォーマット（エンコーダでは空）
    pub output_formats: Vec<PixelFormat>,
    /// 品質の上限（0-100）
    pub quality: u8,
    /// 速度（0-100）
    pub speed: u8,
    /// 初期化コスト（0-100）
    pub setup_cost: u8,
    /// スケーリングできるかどうか
    pub can_scale: bool,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// 幅に適用するマスク（例: 0xFFFE は偶数のみ）
    pub width_mask: u32,
    pub height_mask: u32,
    pub factory: CodecFactory,
}

impl CodecSpec {
    fn base(name: &'static str, factory: CodecFactory) -> Self {
        Self {
            name,
            encoding: None,
            input_format: None,
            output_formats: Vec::new(),
            quality: 100,
            speed: 50,
            setup_cost: 0,
            can_scale: false,
            min_width: 1,
            min_height: 1,
            max_width: DEFAULT_MAX_SIZE,
            max_height: DEFAULT_MAX_SIZE,
            width_mask: 0xFFFF,
            height_mask: 0xFFFF,
            factory,
        }
    }

    /// 変換器の仕様
    pub fn csc(name: &'static str, input: PixelFormat, outputs: Vec<PixelFormat>, factory: CscFactory) -> Self {
        Self {
            input_format: Some(input),
            output_formats: outputs,
            ..Self::base(name, CodecFactory::Csc(factory))
        }
    }

    /// エンコーダの仕様
    pub fn encoder(name: &'static str, encoding: &'static str, input: PixelFormat, factory: EncoderFactory) -> Self {
        Self {
            encoding: Some(encoding),
            input_format: Some(input),
            ..Self::base(name, CodecFactory::Encoder(factory))
        }
    }

    /// デコーダの仕様
    pub fn decoder(
        name: &'static str,
        encoding: &'static str,
        outputs: Vec<PixelFormat>,
        factory: DecoderFactory,
    ) -> Self {
        Self {
            encoding: Some(encoding),
            output_formats: outputs,
            ..Self::base(name, CodecFactory::Decoder(factory))
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality.min(100);
        self
    }

    pub fn with_speed(mut self, speed: u8) -> Self {
        self.speed = speed.min(100);
        self
    }

    pub fn with_setup_cost(mut self, setup_cost: u8) -> Self {
        self.setup_cost = setup_cost.min(100);
        self
    }

    pub fn with_scaling(mut self, can_scale: bool) -> Self {
        self.can_scale = can_scale;
        self
    }

    pub fn with_size_limits(mut self, min_width: u32, min_height: u32, max_width: u32, max_height: u32) -> Self {
        self.min_width = min_width;
        self.min_height = min_height;
        self.max_width = max_width;
        self.max_height = max_height;
        self
    }

    pub fn with_masks(mut self, width_mask: u32, height_mask: u32) -> Self {
        self.width_mask = width_mask;
        self.height_mask = height_mask;
        self
    }

    pub fn kind(&self) -> CodecKind {
        match self.factory {
            CodecFactory::Csc(_) => CodecKind::Csc,
            CodecFactory::Encoder(_) => CodecKind::Encoder,
            CodecFactory::Decoder(_) => CodecKind::Decoder,
        }
    }

    /// この寸法を扱えるかどうか
    pub fn can_handle(&self, width: u32, height: u32) -> bool {
        width >= self.min_width
            && height >= self.min_height
            && width <= self.max_width
            && height <= self.max_height
            && width & self.width_mask == width
            && height & self.height_mask == height
    }

    /// 寸法を検査（扱えなければ `UnsupportedFormat`）
    pub fn check_size(&self, width: u32, height: u32) -> Result<()> {
        if self.can_handle(width, height) {
            Ok(())
        } else {
            Err(Error::UnsupportedFormat(format!(
                "{} は {}x{} を扱えません（{}x{} から {}x{}、マスク {:#x}/{:#x}）",
                self.name,
                width,
                height,
                self.min_width,
                self.min_height,
                self.max_width,
                self.max_height,
                self.width_mask,
                self.height_mask
            )))
        }
    }

    /// 指定フォーマットを出力できるかどうか
    pub fn produces(&self, format: PixelFormat) -> bool {
        self.output_formats.contains(&format)
    }
}

impl fmt::Display for CodecSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(q={}, s={}, setup={})",
            self.name, self.quality, self.speed, self.setup_cost
        )
    }
}

/// スコアリングの目標値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreTarget {
    pub quality: u8,
    pub speed: u8,
    pub min_quality: u8,
    pub min_speed: u8,
}

impl Default for ScoreTarget {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for ScoreTarget {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            quality: config.quality,
            speed: config.speed,
            min_quality: config.min_quality,
            min_speed: config.min_speed,
        }
    }
}

/// 使用中のパイプライン（初期化コストの免除判定に使う）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineKey {
    pub csc: Option<&'static str>,
    /// エンコーダへの入力フォーマット
    pub csc_format: PixelFormat,
    pub encoder: &'static str,
    pub width: u32,
    pub height: u32,
}

/// 順位付けされたパイプライン候補
#[derive(Debug, Clone)]
pub struct PipelineOption<'a> {
    pub score: i32,
    pub csc: Option<&'a CodecSpec>,
    pub csc_format: PixelFormat,
    pub encoder: &'a CodecSpec,
}

impl PipelineOption<'_> {
    /// この候補を表すキー
    pub fn key(&self, width: u32, height: u32) -> PipelineKey {
        PipelineKey {
            csc: self.csc.map(|spec| spec.name),
            csc_format: self.csc_format,
            encoder: self.encoder.name,
            width,
            height,
        }
    }
}

fn clamp_score(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

fn distance_score(value: f64, minimum: u8, target: u8) -> f64 {
    if value < minimum as f64 {
        0.0
    } else {
        100.0 - (value - target as f64).abs()
    }
}

/// 変換（任意）とエンコードの組み合わせのスコア
///
/// 寸法を扱えない組み合わせは `None` です。
pub fn score_pipeline(
    csc: Option<&CodecSpec>,
    csc_format: PixelFormat,
    encoder: &CodecSpec,
    width: u32,
    height: u32,
    target: &ScoreTarget,
    current: Option<&PipelineKey>,
) -> Option<i32> {
    if csc.map_or(false, |spec| !spec.can_handle(width, height)) || !encoder.can_handle(width, height) {
        return None;
    }

    let mut quality = clamp_score(encoder.quality as f64);
    if matches!(
        csc_format,
        PixelFormat::YUV420P | PixelFormat::YUV422P | PixelFormat::YUV444P
    ) {
        // サブサンプリングの分だけ品質を下げる
        let div = 0.5
            + (0..3)
                .map(|plane| {
                    let (dx, dy) = csc_format.subsampling(plane);
                    (dx + dy) as f64 / 2.0 / 3.0
                })
                .sum::<f64>();
        quality /= div;
    }
    if let Some(spec) = csc {
        if spec.quality < 100 {
            quality *= spec.quality as f64 / 100.0;
        }
    }
    let qscore = distance_score(quality, target.min_quality, target.quality);

    let mut speed = clamp_score(encoder.speed as f64);
    if let Some(spec) = csc {
        speed *= spec.speed as f64 / 100.0;
    }
    let sscore = distance_score(speed, target.min_speed, target.speed);

    let same_size = |key: &PipelineKey| key.width == width && key.height == height;
    let csc_score = match csc {
        Some(spec) => {
            let reused = current.map_or(false, |key| {
                key.csc == Some(spec.name) && key.csc_format == csc_format && same_size(key)
            });
            if reused {
                100.0
            } else {
                100.0 - spec.setup_cost as f64
            }
        }
        None => 100.0,
    };
    let reused = current.map_or(false, |key| {
        key.encoder == encoder.name && key.csc_format == csc_format && same_size(key)
    });
    let encoder_score = if reused {
        100.0
    } else {
        100.0 - encoder.setup_cost as f64
    };
    let edge_score = (csc_score + encoder_score) / 2.0;

    let score = ((qscore + sscore + edge_score) / 3.0) as i32;
    trace!(
        target: "codec",
        "score({:?}, {}, {}, {}x{}) = {} (q={:.1}, s={:.1}, e={:.1})",
        csc.map(|spec| spec.name),
        csc_format,
        encoder.name,
        width,
        height,
        score,
        qscore,
        sscore,
        edge_score
    );
    Some(score)
}

/// 変換器単体のスコア（デコード後の変換に使う）
pub fn score_csc(spec: &CodecSpec, width: u32, height: u32, target: &ScoreTarget, current: Option<&'static str>) -> Option<i32> {
    if !spec.can_handle(width, height) {
        return None;
    }
    let qscore = distance_score(spec.quality as f64, target.min_quality, target.quality);
    let sscore = distance_score(spec.speed as f64, target.min_speed, target.speed);
    let edge_score = if current == Some(spec.name) {
        100.0
    } else {
        100.0 - spec.setup_cost as f64
    };
    Some(((qscore + sscore + edge_score) / 3.0) as i32)
}

/// コーデックレジストリ
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    specs: Vec<CodecSpec>,
    forced_csc: Option<String>,
}

impl CodecRegistry {
    /// 空のレジストリ
    pub fn new() -> Self {
        Self::default()
    }

    /// 組み込みの実装をすべて登録したレジストリ
    ///
    /// `image-codecs` 機能が無効なビルドでは png/jpeg は登録されません。
    pub fn with_defaults(config: &PipelineConfig) -> Result<Self> {
        let mut registry = Self::new();
        for spec in csc::swizzle::specs()
            .into_iter()
            .chain(csc::software::specs())
            .chain(rgb::specs())
            .chain(planar::specs())
        {
            registry.register(spec);
        }
        #[cfg(feature = "image-codecs")]
        for spec in super::still::specs() {
            registry.register(spec);
        }
        registry.set_forced_csc(config.forced_csc.as_deref())?;
        info!(
            target: "codec",
            "コーデックを登録しました: エンコーディング {:?}, 仕様 {} 件",
            registry.encoder_encodings(),
            registry.specs.len()
        );
        Ok(registry)
    }

    /// 仕様を登録
    pub fn register(&mut self, spec: CodecSpec) {
        debug!(target: "codec", "登録: {} {:?}", spec, spec.kind());
        self.specs.push(spec);
    }

    /// 変換器を 1 つに固定（`None` で解除）
    pub fn set_forced_csc(&mut self, name: Option<&str>) -> Result<()> {
        if let Some(name) = name {
            let known = self
                .specs
                .iter()
                .any(|spec| spec.kind() == CodecKind::Csc && spec.name == name);
            if !known {
                return Err(Error::Config(format!("変換器 '{}' は登録されていません", name)));
            }
            info!(target: "codec", "変換器を {} に固定します", name);
        }
        self.forced_csc = name.map(str::to_string);
        Ok(())
    }

    pub fn forced_csc(&self) -> Option<&str> {
        self.forced_csc.as_deref()
    }

    /// 登録済みのすべての仕様
    pub fn specs(&self) -> &[CodecSpec] {
        &self.specs
    }

    /// `src` から `dst` へ変換できる変換器の仕様（登録順）
    pub fn find_specs(&self, src: PixelFormat, dst: PixelFormat) -> Vec<&CodecSpec> {
        self.specs
            .iter()
            .filter(|spec| spec.kind() == CodecKind::Csc)
            .filter(|spec| self.forced_csc.as_deref().map_or(true, |name| spec.name == name))
            .filter(|spec| spec.input_format == Some(src) && spec.produces(dst))
            .collect()
    }

    /// エンコーディングのエンコーダ仕様（登録順）
    pub fn encoder_specs(&self, encoding: &str) -> Vec<&CodecSpec> {
        self.specs
            .iter()
            .filter(|spec| spec.kind() == CodecKind::Encoder && spec.encoding == Some(encoding))
            .collect()
    }

    /// エンコーディングのデコーダ仕様（登録順）
    pub fn decoder_specs(&self, encoding: &str) -> Vec<&CodecSpec> {
        self.specs
            .iter()
            .filter(|spec| spec.kind() == CodecKind::Decoder && spec.encoding == Some(encoding))
            .collect()
    }

    /// エンコードできるエンコーディング名（重複なし、登録順）
    pub fn encoder_encodings(&self) -> Vec<String> {
        self.encodings_of(CodecKind::Encoder)
    }

    /// デコードできるエンコーディング名（重複なし、登録順）
    pub fn decoder_encodings(&self) -> Vec<String> {
        self.encodings_of(CodecKind::Decoder)
    }

    fn encodings_of(&self, kind: CodecKind) -> Vec<String> {
        let mut encodings: Vec<String> = Vec::new();
        for spec in self.specs.iter().filter(|spec| spec.kind() == kind) {
            if let Some(encoding) = spec.encoding {
                if !encodings.iter().any(|e| e == encoding) {
                    encodings.push(encoding.to_string());
                }
            }
        }
        encodings
    }

    /// 変換器を順位付け（スコアの降順、同点は登録順）
    pub fn rank_csc(
        &self,
        src: PixelFormat,
        dst: PixelFormat,
        width: u32,
        height: u32,
        target: &ScoreTarget,
        current: Option<&'static str>,
    ) -> Vec<(i32, &CodecSpec)> {
        let mut ranked: Vec<(i32, &CodecSpec)> = self
            .find_specs(src, dst)
            .into_iter()
            .filter_map(|spec| score_csc(spec, width, height, target, current).map(|score| (score, spec)))
            .collect();
        ranked.sort_by_key(|(score, _)| Reverse(*score));
        ranked
    }

    /// 入力フォーマットからエンコーディングまでのパイプラインを順位付け
    ///
    /// エンコーダが入力を直接受け付ける場合は変換なしの候補、そうでなければ
    /// 変換器を挟む候補を作ります。スコアの降順で、同点は登録順です。
    pub fn rank_pipelines(
        &self,
        src_format: PixelFormat,
        encoding: &str,
        width: u32,
        height: u32,
        target: &ScoreTarget,
        current: Option<&PipelineKey>,
    ) -> Vec<PipelineOption<'_>> {
        let mut options = Vec::new();
        for encoder in self.encoder_specs(encoding) {
            let Some(encoder_input) = encoder.input_format else {
                continue;
            };
            if encoder_input == src_format {
                if let Some(score) = score_pipeline(None, src_format, encoder, width, height, target, current) {
                    options.push(PipelineOption {
                        score,
                        csc: None,
                        csc_format: src_format,
                        encoder,
                    });
                }
                continue;
            }
            for csc in self.find_specs(src_format, encoder_input) {
                if let Some(score) = score_pipeline(Some(csc), encoder_input, encoder, width, height, target, current) {
                    options.push(PipelineOption {
                        score,
                        csc: Some(csc),
                        csc_format: encoder_input,
                        encoder,
                    });
                }
            }
        }
        options.sort_by_key(|option| Reverse(option.score));
        options
    }
}

/// 仕様から変換器を作成
pub fn new_converter(spec: &CodecSpec, params: CscParams) -> Result<Box<dyn ColorspaceConverter>> {
    let factory = match spec.factory {
        CodecFactory::Csc(factory) => factory,
        _ => {
            return Err(Error::InvalidParameter(format!(
                "{} は変換器ではありません",
                spec.name
            )))
        }
    };
    if spec.input_format != Some(params.src_format) || !spec.produces(params.dst_format) {
        return Err(Error::UnsupportedFormat(format!(
            "{} は {} -> {} を扱えません",
            spec.name, params.src_format, params.dst_format
        )));
    }
    spec.check_size(params.src_width, params.src_height)?;
    spec.check_size(params.dst_width, params.dst_height)?;
    if params.is_scaling() && !spec.can_scale {
        return Err(Error::UnsupportedFormat(format!("{} はスケーリングできません", spec.name)));
    }
    factory(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::csc::SwizzleConverter;
    use crate::codec::rgb::RgbEncoder;

    fn swizzle(params: CscParams) -> Result<Box<dyn ColorspaceConverter>> {
        Ok(Box::new(SwizzleConverter::new(params)?))
    }

    fn rgb_encoder() -> Box<dyn Encoder> {
        Box::new(RgbEncoder::new())
    }

    fn synthetic() -> CodecRegistry {
        let mut registry = CodecRegistry::new();
        registry.register(
            CodecSpec::csc("slow", PixelFormat::BGRX, vec![PixelFormat::RGB], swizzle)
                .with_speed(20)
                .with_setup_cost(50),
        );
        registry.register(
            CodecSpec::csc("fast", PixelFormat::BGRX, vec![PixelFormat::RGB], swizzle)
                .with_speed(100)
                .with_masks(0xFFFE, 0xFFFE),
        );
        registry.register(CodecSpec::encoder("enc", "rgb", PixelFormat::RGB, rgb_encoder).with_speed(80));
        registry
    }

    #[test]
    fn test_find_specs() {
        let registry = synthetic();
        let names: Vec<_> = registry
            .find_specs(PixelFormat::BGRX, PixelFormat::RGB)
            .iter()
            .map(|spec| spec.name)
            .collect();
        assert_eq!(names, vec!["slow", "fast"]);
        assert!(registry.find_specs(PixelFormat::RGB, PixelFormat::BGRX).is_empty());
    }

    #[test]
    fn test_ranking_prefers_fast_and_respects_masks() {
        let registry = synthetic();
        let target = ScoreTarget {
            quality: 100,
            speed: 100,
            min_quality: 0,
            min_speed: 0,
        };
        let ranked = registry.rank_pipelines(PixelFormat::BGRX, "rgb", 64, 64, &target, None);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].csc.map(|spec| spec.name), Some("fast"));
        assert!(ranked[0].score > ranked[1].score);

        // 奇数幅はマスクに合わない
        let ranked = registry.rank_pipelines(PixelFormat::BGRX, "rgb", 63, 64, &target, None);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].csc.map(|spec| spec.name), Some("slow"));
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let registry = CodecRegistry::with_defaults(&PipelineConfig::default()).unwrap();
        let target = ScoreTarget::default();
        let order = |registry: &CodecRegistry| -> Vec<(i32, Option<&'static str>, PixelFormat, &'static str)> {
            registry
                .rank_pipelines(PixelFormat::BGRX, "planar", 128, 96, &target, None)
                .iter()
                .map(|o| (o.score, o.csc.map(|s| s.name), o.csc_format, o.encoder.name))
                .collect()
        };
        let first = order(&registry);
        assert!(!first.is_empty());
        for _ in 0..5 {
            assert_eq!(order(&registry), first);
        }
    }

    #[test]
    fn test_setup_cost_waived_for_current_pipeline() {
        let registry = synthetic();
        let target = ScoreTarget::default();
        let slow = registry.find_specs(PixelFormat::BGRX, PixelFormat::RGB)[0];
        let encoder = registry.encoder_specs("rgb")[0];
        let fresh = score_pipeline(Some(slow), PixelFormat::RGB, encoder, 32, 32, &target, None).unwrap();
        let key = PipelineKey {
            csc: Some("slow"),
            csc_format: PixelFormat::RGB,
            encoder: "enc",
            width: 32,
            height: 32,
        };
        let reused = score_pipeline(Some(slow), PixelFormat::RGB, encoder, 32, 32, &target, Some(&key)).unwrap();
        assert!(reused > fresh);
    }

    #[test]
    fn test_subsampling_lowers_quality_score() {
        let registry = CodecRegistry::with_defaults(&PipelineConfig::default()).unwrap();
        let target = ScoreTarget {
            quality: 100,
            speed: 50,
            min_quality: 0,
            min_speed: 0,
        };
        let score_for = |format: PixelFormat| {
            registry
                .rank_pipelines(PixelFormat::BGRX, "planar", 64, 64, &target, None)
                .into_iter()
                .find(|o| o.csc_format == format && o.csc.map(|s| s.name) == Some(csc::software::NAME))
                .map(|o| o.score)
                .unwrap()
        };
        assert!(score_for(PixelFormat::GBRP) > score_for(PixelFormat::YUV444P));
        assert!(score_for(PixelFormat::YUV444P) > score_for(PixelFormat::YUV420P));
    }

    #[test]
    fn test_forced_csc() {
        let mut registry = CodecRegistry::with_defaults(&PipelineConfig::default()).unwrap();
        assert!(registry.find_specs(PixelFormat::BGRX, PixelFormat::RGB).len() >= 2);
        registry.set_forced_csc(Some(csc::software::NAME)).unwrap();
        let specs = registry.find_specs(PixelFormat::BGRX, PixelFormat::RGB);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, csc::software::NAME);
        assert!(matches!(registry.set_forced_csc(Some("csc_missing")), Err(Error::Config(_))));
    }

    #[test]
    fn test_new_converter_checks() {
        let registry = synthetic();
        let fast = registry.find_specs(PixelFormat::BGRX, PixelFormat::RGB)[1];
        let params = CscParams::same_size(15, 16, PixelFormat::BGRX, PixelFormat::RGB);
        assert!(matches!(new_converter(fast, params), Err(Error::UnsupportedFormat(_))));
        let params = CscParams::same_size(16, 16, PixelFormat::BGRX, PixelFormat::RGB);
        assert!(new_converter(fast, params).is_ok());
    }

    #[test]
    fn test_default_encodings() {
        let registry = CodecRegistry::with_defaults(&PipelineConfig::default()).unwrap();
        let encodings = registry.encoder_encodings();
        assert!(encodings.contains(&"rgb".to_string()));
        assert!(encodings.contains(&"planar".to_string()));
        assert_eq!(registry.decoder_encodings().len(), encodings.len());
    }
}
