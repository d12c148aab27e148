//! リモートディスプレイ共通ライブラリ
//!
//! サーバーとクライアントの両方で使用する、ワイヤプロトコルと
//! 画像パイプラインを提供します。
//!
//! - [`protocol`]: フレーム、シリアライズ、チャンク、送受信、ディスパッチ
//! - [`compression`]: フレームごとの圧縮器
//! - [`codec`]: 画素バッファ、色空間変換、コーデックの選択
//! - [`config`]: チューニング設定

pub mod codec;
pub mod compression;
pub mod config;
pub mod error;
pub mod protocol;
pub mod utils;

// 主要コンポーネントを再エクスポート
pub use config::TuningConfig;
pub use error::{Error, ErrorCode, Result};

/// ライブラリのバージョン
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// プラットフォーム名を取得
pub fn get_platform_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "Windows"
    } else if cfg!(target_os = "macos") {
        "macOS"
    } else if cfg!(target_os = "linux") {
        "Linux"
    } else {
        "Unknown"
    }
}
