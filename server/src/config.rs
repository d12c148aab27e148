//! サーバー設定
//!
//! サーバーの設定情報を管理するモジュール

use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use remote_display_rs_common::config::{ConfigFormat, ENV_PREFIX};
use remote_display_rs_common::TuningConfig;

use crate::error::ServerError;

/// サーバー設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// ネットワーク設定
    pub network: NetworkSettings,
    /// キャプチャ設定
    pub capture: CaptureSettings,
    /// プロトコルと画像パイプラインのチューニング
    pub tuning: TuningConfig,
}

/// ネットワーク設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// バインドアドレス
    pub bind_address: String,
    /// ポート番号
    pub port: u16,
    /// 最大接続数
    pub max_connections: usize,
    /// クライアントタイムアウト(秒)
    pub client_timeout: u64,
}

/// キャプチャ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// キャプチャ幅
    pub width: u32,
    /// キャプチャ高さ
    pub height: u32,
    /// フレームレート
    pub frame_rate: u32,
    /// 優先エンコーディング
    pub encoding: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9000,
            max_connections: 5,
            client_timeout: 60,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            encoding: "rgb".to_string(),
        }
    }
}

impl ServerSettings {
    /// ファイルから設定を読み込み
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path).ok_or_else(|| {
            ServerError::Config(format!("設定ファイルの形式を判定できません: {}", path.display()))
        })?;
        let content = fs::read_to_string(path)?;
        let settings: Self = match format {
            ConfigFormat::Json => serde_json::from_str(&content)
                .map_err(|e| ServerError::Config(format!("JSONの解析に失敗しました: {}", e)))?,
            ConfigFormat::Toml => toml::from_str(&content)
                .map_err(|e| ServerError::Config(format!("TOMLの解析に失敗しました: {}", e)))?,
        };
        settings.validate()?;
        debug!("サーバー設定を読み込みました: {}", path.display());
        Ok(settings)
    }

    /// 設定をファイルに保存
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ServerError> {
        let path = path.as_ref();
        let content = match ConfigFormat::from_path(path).unwrap_or_default() {
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| ServerError::Config(e.to_string()))?,
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// 環境変数でチューニングを上書き
    pub fn apply_env(&mut self) -> Result<(), ServerError> {
        self.tuning.apply_env(ENV_PREFIX)?;
        Ok(())
    }

    /// 値を検証
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.network.max_connections == 0 {
            return Err(ServerError::Config("max_connections は 1 以上が必要です".to_string()));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ServerError::Config(format!(
                "キャプチャサイズが不正です: {}x{}",
                self.capture.width, self.capture.height
            )));
        }
        if self.capture.frame_rate == 0 || self.capture.frame_rate > 240 {
            return Err(ServerError::Config(format!(
                "フレームレートが範囲外です: {}",
                self.capture.frame_rate
            )));
        }
        if self.capture.encoding.trim().is_empty() {
            return Err(ServerError::Config("エンコーディングが空です".to_string()));
        }
        self.tuning.validate()?;
        Ok(())
    }

    /// バインドするアドレス文字列
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.network.bind_address, self.network.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = ServerSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.bind_addr(), "0.0.0.0:9000");
        assert_eq!(settings.capture.encoding, "rgb");
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        let mut settings = ServerSettings::default();
        settings.network.port = 9100;
        settings.capture.encoding = "planar".to_string();
        settings.tuning.pipeline.quality = 55;
        settings.save(&path).unwrap();
        assert_eq!(ServerSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        fs::write(&path, r#"{ "capture": { "width": 320, "height": 200 } }"#).unwrap();
        let settings = ServerSettings::load(&path).unwrap();
        assert_eq!((settings.capture.width, settings.capture.height), (320, 200));
        assert_eq!(settings.capture.frame_rate, 30);
        assert_eq!(settings.network.port, 9000);
    }

    #[test]
    fn test_invalid_values() {
        let mut settings = ServerSettings::default();
        settings.capture.frame_rate = 0;
        assert!(matches!(settings.validate(), Err(ServerError::Config(_))));

        let mut settings = ServerSettings::default();
        settings.tuning.pipeline.quality = 200;
        assert!(settings.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        fs::write(&path, "port: 1").unwrap();
        assert!(ServerSettings::load(&path).is_err());
    }
}
