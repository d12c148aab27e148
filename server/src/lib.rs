//! リモートディスプレイサーバーライブラリ
//!
//! 画面のダメージ領域をエンコードしてクライアントに送るサーバーです。

pub mod capture;
pub mod config;
pub mod error;
pub mod network;

pub use config::ServerSettings;
pub use error::ServerError;
pub use network::TcpServer;
