//! クライアントのエラー型

use std::io;
use thiserror::Error;

/// クライアントエラー
#[derive(Error, Debug)]
pub enum ClientError {
    /// I/Oエラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] io::Error),

    /// プロトコルまたは画像パイプラインのエラー
    #[error(transparent)]
    Common(#[from] remote_display_rs_common::Error),

    /// 接続エラー
    #[error("接続エラー: {0}")]
    Connection(String),

    /// 設定エラー
    #[error("設定エラー: {0}")]
    Config(String),

    /// 画像の保存エラー
    #[error("画像を保存できません: {0}")]
    Image(#[from] image::ImageError),
}
