//! リモートディスプレイクライアント
//!
//! サーバーから受け取った draw パケットをデコードし、
//! フレームバッファに合成して確認応答を返します。

pub mod config;
pub mod display;
pub mod error;
pub mod network;

pub use config::ClientSettings;
pub use error::ClientError;
pub use network::{ClientSummary, ConnectionState, RemoteDisplayClient};
