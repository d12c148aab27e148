//! ユーティリティモジュール
//!
//! 各種ユーティリティ機能を提供します。

pub mod logging;
pub mod time;

/// パス関連のユーティリティ
pub mod path {
    use std::path::PathBuf;

    /// 設定ディレクトリを取得
    pub fn get_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("remote-display-rs")
    }

    /// 既定のチューニング設定ファイルのパス
    pub fn default_tuning_path() -> PathBuf {
        get_config_dir().join("tuning.toml")
    }
}

/// 数値関連のユーティリティ
pub mod number {
    /// バイト単位を人間が読みやすい形式に変換
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

        if bytes == 0 {
            return "0 B".to_string();
        }

        let bytes_f64 = bytes as f64;
        let exponent = (bytes_f64.ln() / 1024_f64.ln()).floor() as usize;
        let exponent = exponent.min(UNITS.len() - 1);
        let value = bytes_f64 / 1024_f64.powi(exponent as i32);

        if exponent == 0 {
            format!("{} {}", value as u64, UNITS[exponent])
        } else {
            format!("{:.2} {}", value, UNITS[exponent])
        }
    }

    /// 圧縮率（百分率）
    pub fn ratio_percent(compressed: u64, original: u64) -> f64 {
        if original == 0 {
            100.0
        } else {
            compressed as f64 * 100.0 / original as f64
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_format_bytes() {
            assert_eq!(format_bytes(0), "0 B");
            assert_eq!(format_bytes(512), "512 B");
            assert_eq!(format_bytes(1536), "1.50 KB");
            assert_eq!(format_bytes(64 * 1024 * 1024), "64.00 MB");
        }

        #[test]
        fn test_ratio() {
            assert_eq!(ratio_percent(50, 200), 25.0);
            assert_eq!(ratio_percent(10, 0), 100.0);
        }
    }
}
