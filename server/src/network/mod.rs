//! ネットワークモジュール
//!
//! クライアントからの TCP 接続を受け付け、接続ごとのセッションで
//! ネゴシエーション、描画パケットの送信、確認応答の処理を行います。

pub mod session;
pub mod tcp_server;

pub use session::{ClientSession, SessionSummary};
pub use tcp_server::{CaptureFactory, TcpServer};

use chrono::{DateTime, Local};

/// セッション情報
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// セッションID
    pub id: String,
    /// クライアントアドレス
    pub client_addr: String,
    /// 接続時刻
    pub connected_at: DateTime<Local>,
}

impl SessionInfo {
    /// 新しいセッション情報を作成
    pub fn new(client_addr: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            client_addr,
            connected_at: Local::now(),
        }
    }

    /// ログ用の短いID
    pub fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }

    /// 接続してからの秒数
    pub fn connected_secs(&self) -> i64 {
        (Local::now() - self.connected_at).num_seconds()
    }
}
