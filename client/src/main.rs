//! リモートディスプレイクライアントエントリポイント

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use remote_display_rs_client::display::{save_png, FramebufferPresenter};
use remote_display_rs_client::{ClientSettings, RemoteDisplayClient};
use remote_display_rs_common::utils::logging::{init_logging, set_panic_hook};
use remote_display_rs_common::utils::path::default_tuning_path;
use remote_display_rs_common::{get_platform_name, TuningConfig, VERSION};

/// コマンドライン引数
#[derive(Parser, Debug)]
#[command(name = "remote-display-client")]
#[command(about = "リモートディスプレイクライアント", long_about = None)]
#[command(version)]
struct Args {
    /// クライアント設定ファイル（.toml / .json）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// チューニング設定ファイル
    #[arg(long)]
    tuning: Option<PathBuf>,

    /// 接続先ホスト
    #[arg(long)]
    host: Option<String>,

    /// 接続先ポート
    #[arg(short, long)]
    port: Option<u16>,

    /// 受け付けるエンコーディング（カンマ区切り、優先順）
    #[arg(short, long, value_delimiter = ',')]
    encodings: Vec<String>,

    /// 終了時にフレームバッファを保存する PNG（ディレクトリなら日時から名前を付ける）
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// この数の draw を受け取ったら切断する
    #[arg(long)]
    max_draws: Option<u64>,

    /// ログレベル
    #[arg(long, default_value = "info")]
    log_level: String,

    /// ログファイル
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn load_settings(args: &Args) -> Result<ClientSettings> {
    let mut settings = match &args.config {
        Some(path) => ClientSettings::load(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?,
        None => ClientSettings::default(),
    };

    let tuning_path = args.tuning.clone().or_else(|| {
        let path = default_tuning_path();
        path.exists().then_some(path)
    });
    if let Some(path) = tuning_path {
        settings.tuning = TuningConfig::from_file(&path)
            .with_context(|| format!("チューニング設定を読み込めません: {}", path.display()))?;
    }

    if let Some(host) = &args.host {
        settings.host = host.clone();
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if !args.encodings.is_empty() {
        settings.encodings = args.encodings.clone();
    }
    if let Some(output) = &args.output {
        settings.output_png = Some(output.clone());
    }
    if let Some(max) = args.max_draws {
        settings.max_draws = Some(max);
    }

    settings.apply_env().context("環境変数の設定が不正です")?;
    settings.tuning.validate().context("設定が不正です")?;
    Ok(settings)
}

/// ディレクトリが指定された場合は日時からファイル名を作る
fn snapshot_path(output: &Path) -> PathBuf {
    if output.is_dir() {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        output.join(format!("frame-{}.png", stamp))
    } else {
        output.to_path_buf()
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_file.as_deref()).context("ロガーを初期化できません")?;
    set_panic_hook();

    info!("リモートディスプレイクライアント v{} ({})", VERSION, get_platform_name());
    let settings = load_settings(&args)?;
    let output = settings.output_png.clone();

    let client = RemoteDisplayClient::connect(settings).context("サーバーに接続できません")?;
    info!("通知するエンコーディング: {:?}", client.encodings());
    let summary = client
        .run(Box::new(FramebufferPresenter::new()))
        .context("接続が異常終了しました")?;

    info!(
        "draw {} (失敗 {}), レイテンシ {}",
        summary.draws,
        summary.failures,
        summary
            .latency_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string())
    );

    if let Some(output) = output {
        match summary.presenter.snapshot() {
            Some(framebuffer) => {
                save_png(framebuffer, &snapshot_path(&output)).context("フレームバッファを保存できません")?
            }
            None => warn!("draw を受信しなかったため {} は書き出しません", output.display()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "remote-display-client",
            "--host",
            "10.1.2.3",
            "-p",
            "9100",
            "-e",
            "planar,rgb",
            "--max-draws",
            "3",
        ]);
        let settings = load_settings(&args).unwrap();
        assert_eq!(settings.server_addr(), "10.1.2.3:9100");
        assert_eq!(settings.encodings, vec!["planar".to_string(), "rgb".to_string()]);
        assert_eq!(settings.max_draws, Some(3));
    }

    #[test]
    fn test_snapshot_path() {
        let dir = tempfile::tempdir().unwrap();
        let named = snapshot_path(dir.path());
        assert_eq!(named.parent(), Some(dir.path()));
        assert!(named.to_string_lossy().ends_with(".png"));

        let file = dir.path().join("out.png");
        assert_eq!(snapshot_path(&file), file);
    }
}
