//! 通信プロトコル
//!
//! サーバーとクライアントの間でやり取りするワイヤプロトコルを定義します。
//! 1 本のバイトストリーム上で、型付きの構造化メッセージと大きなバイナリ
//! ペイロードを多重化します。
//!
//! - [`header`]: 8 バイトのフレームヘッダ
//! - [`value`] / [`serializer`]: 構造化メッセージとそのバイナリ表現
//! - [`chunks`]: ブロブのチャンク分割と再構築
//! - [`frame_buffer`]: 部分的な読み込みの蓄積
//! - [`transport`]: 接続ごとの送受信ループ
//! - [`dispatch`]: 型タグによるハンドラ呼び出し

pub mod chunks;
pub mod dispatch;
pub mod frame_buffer;
pub mod header;
pub mod serializer;
pub mod transport;
pub mod value;

pub use chunks::{split_message, ChunkAssembler, ChunkLimits, SplitMessage};
pub use dispatch::{DispatchOutcome, Dispatcher, Handler, PacketType};
pub use frame_buffer::{Frame, FrameBuffer, DEFAULT_MAX_PACKET_SIZE};
pub use header::{encode_header, try_decode_header, Header, HEADER_SIZE, MAGIC, MAX_CHUNK_INDEX};
pub use serializer::{decode_message, encode_message};
pub use transport::{
    hello_capabilities, FrameReader, Negotiated, PacketSender, Protocol, ProtocolOptions, ProtocolStats,
};
pub use value::{Message, Value};

