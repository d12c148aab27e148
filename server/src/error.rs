//! サーバーのエラー型

use std::io;
use thiserror::Error;

/// サーバーエラー
#[derive(Error, Debug)]
pub enum ServerError {
    /// I/Oエラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] io::Error),

    /// プロトコルまたは画像パイプラインのエラー
    #[error(transparent)]
    Common(#[from] remote_display_rs_common::Error),

    /// 設定エラー
    #[error("設定エラー: {0}")]
    Config(String),

    /// キャプチャエラー
    #[error("キャプチャエラー: {0}")]
    Capture(String),

    /// スレッドエラー
    #[error("スレッドエラー: {0}")]
    Thread(String),
}
