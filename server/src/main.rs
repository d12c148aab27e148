//! リモートディスプレイサーバーエントリポイント

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use remote_display_rs_common::utils::logging::{init_logging, set_panic_hook};
use remote_display_rs_common::utils::path::default_tuning_path;
use remote_display_rs_common::{get_platform_name, TuningConfig, VERSION};
use remote_display_rs_server::capture::{CaptureSource, TestPatternSource};
use remote_display_rs_server::network::CaptureFactory;
use remote_display_rs_server::{ServerError, ServerSettings, TcpServer};

/// コマンドライン引数
#[derive(Parser, Debug)]
#[command(name = "remote-display-server")]
#[command(about = "リモートディスプレイサーバー", long_about = None)]
#[command(version)]
struct Args {
    /// サーバー設定ファイル（.toml / .json）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// チューニング設定ファイル（server 設定の tuning を置き換える）
    #[arg(long)]
    tuning: Option<PathBuf>,

    /// バインドアドレス
    #[arg(short, long)]
    bind: Option<String>,

    /// ポート番号
    #[arg(short, long)]
    port: Option<u16>,

    /// 優先エンコーディング（rgb, planar, png, jpeg）
    #[arg(short, long)]
    encoding: Option<String>,

    /// キャプチャサイズ（例: 1280x720）
    #[arg(long)]
    size: Option<String>,

    /// フレームレート
    #[arg(long)]
    fps: Option<u32>,

    /// ログレベル
    #[arg(long, default_value = "info")]
    log_level: String,

    /// ログファイル
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn parse_size(size: &str) -> Option<(u32, u32)> {
    let (w, h) = size.split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn load_settings(args: &Args) -> Result<ServerSettings> {
    let mut settings = match &args.config {
        Some(path) => ServerSettings::load(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?,
        None => ServerSettings::default(),
    };

    let tuning_path = args.tuning.clone().or_else(|| {
        let path = default_tuning_path();
        path.exists().then_some(path)
    });
    if let Some(path) = tuning_path {
        settings.tuning = TuningConfig::from_file(&path)
            .with_context(|| format!("チューニング設定を読み込めません: {}", path.display()))?;
    }

    if let Some(bind) = &args.bind {
        settings.network.bind_address = bind.clone();
    }
    if let Some(port) = args.port {
        settings.network.port = port;
    }
    if let Some(encoding) = &args.encoding {
        settings.capture.encoding = encoding.to_lowercase();
    }
    if let Some(size) = &args.size {
        let (width, height) =
            parse_size(size).with_context(|| format!("キャプチャサイズの形式が不正です: {}", size))?;
        settings.capture.width = width;
        settings.capture.height = height;
    }
    if let Some(fps) = args.fps {
        settings.capture.frame_rate = fps;
    }

    settings.apply_env().context("環境変数の設定が不正です")?;
    settings.validate().context("設定が不正です")?;
    Ok(settings)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_file.as_deref()).context("ロガーを初期化できません")?;
    set_panic_hook();

    info!("リモートディスプレイサーバー v{} ({})", VERSION, get_platform_name());
    let settings = load_settings(&args)?;

    let factory: CaptureFactory = Arc::new(|settings: &ServerSettings| -> Result<Box<dyn CaptureSource>, ServerError> {
        let source = TestPatternSource::new(settings.capture.width, settings.capture.height)?;
        Ok(Box::new(source))
    });
    let mut server = TcpServer::new(settings, factory).context("サーバーを作成できません")?;
    info!("エンコーディング: {:?}", server.registry().encoder_encodings());
    let addr = server.start().context("待ち受けを開始できません")?;
    info!("接続待ち: {}", addr);

    while server.is_running() {
        thread::sleep(Duration::from_millis(500));
    }
    server.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1280x720"), Some((1280, 720)));
        assert_eq!(parse_size("64X48"), Some((64, 48)));
        assert_eq!(parse_size("wide"), None);
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from(["remote-display-server", "--port", "9100", "-e", "PLANAR", "--size", "320x200"]);
        let settings = load_settings(&args).unwrap();
        assert_eq!(settings.network.port, 9100);
        assert_eq!(settings.capture.encoding, "planar");
        assert_eq!((settings.capture.width, settings.capture.height), (320, 200));
    }
}
