//! ロギング機能
//!
//! `log` ファサードのバックエンドとして `env_logger` を設定します。
//! `RUST_LOG` が設定されていればそちらを優先します。

use std::fs::OpenOptions;
use std::path::Path;

use log::LevelFilter;

use crate::error::{Error, Result};

/// 文字列からログレベルを解析
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_uppercase().as_str() {
        "OFF" => Some(LevelFilter::Off),
        "TRACE" => Some(LevelFilter::Trace),
        "DEBUG" => Some(LevelFilter::Debug),
        "INFO" => Some(LevelFilter::Info),
        "WARN" | "WARNING" => Some(LevelFilter::Warn),
        "ERROR" | "ERR" | "FATAL" | "CRITICAL" => Some(LevelFilter::Error),
        _ => None,
    }
}

/// ロガーを初期化
///
/// `log_file` を指定した場合は標準エラーではなくファイルに追記します。
/// 2 回目以降の呼び出しは何もしません。
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let level = parse_level(level)
        .ok_or_else(|| Error::Config(format!("不明なログレベルです: {}", level)))?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format_timestamp_millis();
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    // テストなどで既に初期化されている場合は無視
    let _ = builder.try_init();
    Ok(())
}

/// パニック時のログ記録ハンドラーを設定
pub fn set_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => s.as_str(),
                None => "Unknown panic payload",
            },
        };

        let location = match panic_info.location() {
            Some(loc) => format!(" at {}:{}", loc.file(), loc.line()),
            None => String::new(),
        };

        eprintln!("パニックが発生しました: {}{}", message, location);
        log::error!("パニックが発生しました: {}{}", message, location);
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info"), Some(LevelFilter::Info));
        assert_eq!(parse_level("Warning"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("fatal"), Some(LevelFilter::Error));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_init_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("test.log");
        init_logging("debug", Some(&path)).unwrap();
        assert!(path.exists());
        assert!(init_logging("nonsense", None).is_err());
    }
}
