//! クライアント設定

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use remote_display_rs_common::config::{ConfigFormat, ENV_PREFIX};
use remote_display_rs_common::TuningConfig;

use crate::error::ClientError;

/// クライアント設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// 接続先ホスト
    pub host: String,
    /// 接続先ポート
    pub port: u16,
    /// 受け付けるエンコーディング（優先順、空ならデコードできるものすべて）
    pub encodings: Vec<String>,
    /// 終了時にフレームバッファを書き出す PNG ファイル
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_png: Option<PathBuf>,
    /// この数の draw を受け取ったら切断する
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_draws: Option<u64>,
    /// ping の間隔(秒)
    pub ping_interval: u64,
    /// プロトコルと画像パイプラインのチューニング
    pub tuning: TuningConfig,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            encodings: Vec::new(),
            output_png: None,
            max_draws: None,
            ping_interval: 5,
            tuning: TuningConfig::default(),
        }
    }
}

impl ClientSettings {
    /// ファイルから設定を読み込み
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path).ok_or_else(|| {
            ClientError::Config(format!("設定ファイルの形式を判定できません: {}", path.display()))
        })?;
        let content = fs::read_to_string(path)?;
        let settings: Self = match format {
            ConfigFormat::Json => serde_json::from_str(&content).map_err(|e| ClientError::Config(e.to_string()))?,
            ConfigFormat::Toml => toml::from_str(&content).map_err(|e| ClientError::Config(e.to_string()))?,
        };
        settings.tuning.validate()?;
        Ok(settings)
    }

    /// 環境変数でチューニングを上書き
    pub fn apply_env(&mut self) -> Result<(), ClientError> {
        self.tuning.apply_env(ENV_PREFIX)?;
        Ok(())
    }

    /// 接続先アドレス文字列
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// hello で通知するエンコーディング
    ///
    /// 設定の順序を保ち、デコードできないものは除きます。
    pub fn announced_encodings(&self, decodable: &[String]) -> Vec<String> {
        if self.encodings.is_empty() {
            return decodable.to_vec();
        }
        self.encodings
            .iter()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| decodable.iter().any(|d| d == e))
            .collect()
    }
}
