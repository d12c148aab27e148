//! ネットワークモジュール
//!
//! リモートディスプレイサーバーとの TCP 接続を担当します。

mod tcp_client;

pub use tcp_client::{ClientSummary, RemoteDisplayClient};

use std::fmt;

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP 接続済み
    Connected,
    /// hello を送信してサーバーの応答待ち
    Negotiating,
    /// 切断済み
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "接続済み"),
            ConnectionState::Negotiating => write!(f, "ネゴシエーション中"),
            ConnectionState::Disconnected => write!(f, "切断"),
        }
    }
}
