//! 設定管理
//!
//! プロトコルと画像パイプラインのチューニング設定を読み込み、保存します。
//! ファイル形式は拡張子（`.json` / `.toml`）で判定し、環境変数で個別の
//! キーを上書きできます。

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::compression::{self, CompressionAlgorithm};
use crate::error::{Error, Result};

/// 環境変数の既定プレフィックス
pub const ENV_PREFIX: &str = "RDS_";

/// 設定形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    /// JSON 形式
    #[default]
    Json,
    /// TOML 形式
    Toml,
}

impl ConfigFormat {
    /// ファイル拡張子から設定形式を判定
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| match ext.to_lowercase().as_str() {
                "json" => Some(ConfigFormat::Json),
                "toml" => Some(ConfigFormat::Toml),
                _ => None,
            })
    }
}

/// プロトコル設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// 圧縮器の優先順位
    pub compressors: Vec<String>,
    /// 圧縮レベル（0-9）
    pub compression_level: u8,
    /// これより小さいフレームは圧縮しない（バイト）
    pub min_compress_size: usize,
    /// ブロブをチャンクとして分割するかどうか
    pub chunks: bool,
    /// これより小さいブロブは本体に残す（0 ならすべて分割）
    pub inline_threshold: usize,
    /// 受信ペイロードの最大サイズ（バイト）
    pub max_packet_size: usize,
    /// 保持できるチャンクの最大数
    pub max_pending_chunks: usize,
    /// 保持できるチャンクの合計バイト数
    pub max_pending_bytes: usize,
    /// チャンク待ちのタイムアウト（ミリ秒）
    pub chunk_timeout_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            compressors: vec!["lz4".to_string(), "zlib".to_string()],
            compression_level: 1,
            min_compress_size: 378,
            chunks: true,
            inline_threshold: 0,
            max_packet_size: 64 * 1024 * 1024,
            max_pending_chunks: 16,
            max_pending_bytes: 256 * 1024 * 1024,
            chunk_timeout_ms: 10_000,
        }
    }
}

/// 画像パイプライン設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// ワーカースレッド数（0 なら利用可能なコア数）
    pub max_threads: usize,
    /// 色空間変換器の強制指定（テスト用）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced_csc: Option<String>,
    /// 目標品質（0-100）
    pub quality: u8,
    /// 目標速度（0-100）
    pub speed: u8,
    /// 最低品質
    pub min_quality: u8,
    /// 最低速度
    pub min_speed: u8,
    /// コーデックごとのスレッド数の上書き
    pub codec_threads: BTreeMap<String, usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_threads: 0,
            forced_csc: None,
            quality: 80,
            speed: 50,
            min_quality: 30,
            min_speed: 0,
            codec_threads: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// 実際に使うワーカースレッド数
    pub fn worker_threads(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if self.max_threads == 0 {
            available
        } else {
            self.max_threads.min(available).max(1)
        }
    }

    /// コーデックのスレッド数（上書きがなければ `default`）
    pub fn codec_thread_count(&self, codec: &str, default: usize) -> usize {
        self.codec_threads.get(codec).copied().unwrap_or(default)
    }
}

/// チューニング設定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// プロトコル設定
    pub protocol: ProtocolConfig,
    /// 画像パイプライン設定
    pub pipeline: PipelineConfig,
}

impl TuningConfig {
    /// ファイルから設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)
            .ok_or_else(|| Error::Config(format!("設定ファイルの形式を判定できません: {}", path.display())))?;
        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content, format)?;
        debug!("設定を読み込みました: {}", path.display());
        Ok(config)
    }

    /// 文字列から設定を解析
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let config: Self = match format {
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| Error::Config(format!("JSONの解析に失敗しました: {}", e)))?,
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| Error::Config(format!("TOMLの解析に失敗しました: {}", e)))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// 設定をファイルに保存
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path).unwrap_or_default();
        let content = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("JSONのシリアライズに失敗しました: {}", e)))?,
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("TOMLのシリアライズに失敗しました: {}", e)))?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// 環境変数で設定を上書き
    pub fn apply_env(&mut self, prefix: &str) -> Result<()> {
        self.apply_overrides(prefix, std::env::vars())
    }

    /// キーと値の組で設定を上書き
    ///
    /// `prefix` で始まらないキーは無視します。
    pub fn apply_overrides<I>(&mut self, prefix: &str, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(prefix) else {
                continue;
            };
            match name {
                "COMPRESSORS" => {
                    self.protocol.compressors = value
                        .split(',')
                        .map(|s| s.trim().to_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect();
                }
                "COMPRESSION_LEVEL" => self.protocol.compression_level = parse_number(&key, &value)?,
                "MAX_THREADS" => self.pipeline.max_threads = parse_number(&key, &value)?,
                "FORCED_CSC" => {
                    self.pipeline.forced_csc = if value.trim().is_empty() {
                        None
                    } else {
                        Some(value.trim().to_string())
                    };
                }
                "QUALITY" => self.pipeline.quality = parse_number(&key, &value)?,
                "SPEED" => self.pipeline.speed = parse_number(&key, &value)?,
                _ => continue,
            }
            debug!("環境変数で設定を上書き: {}={}", key, value);
        }
        self.validate()
    }

    /// 値の範囲を検証
    pub fn validate(&self) -> Result<()> {
        let protocol = &self.protocol;
        for name in &protocol.compressors {
            match CompressionAlgorithm::from_name(name) {
                Some(CompressionAlgorithm::None) | None => {
                    return Err(Error::Config(format!("未知の圧縮器です: {}", name)));
                }
                Some(_) => {}
            }
        }
        if protocol.compression_level > 9 {
            return Err(Error::Config(format!(
                "compression_level は 0-9 の範囲で指定してください: {}",
                protocol.compression_level
            )));
        }
        if protocol.max_packet_size == 0 || protocol.max_packet_size > compression::MAX_SIZE {
            return Err(Error::Config(format!(
                "max_packet_size は 1-{} の範囲で指定してください: {}",
                compression::MAX_SIZE,
                protocol.max_packet_size
            )));
        }
        if protocol.max_pending_chunks == 0 {
            return Err(Error::Config("max_pending_chunks は 1 以上にしてください".to_string()));
        }

        let pipeline = &self.pipeline;
        for (name, value) in [
            ("quality", pipeline.quality),
            ("speed", pipeline.speed),
            ("min_quality", pipeline.min_quality),
            ("min_speed", pipeline.min_speed),
        ] {
            if value > 100 {
                return Err(Error::Config(format!("{} は 0-100 の範囲で指定してください: {}", name, value)));
            }
        }
        if pipeline.min_quality > pipeline.quality {
            return Err(Error::Config("min_quality が quality を超えています".to_string()));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} の値が数値ではありません: {}", key, value)))
}
