//! パケットのディスパッチ
//!
//! 型タグを既知のパケット型に変換し、登録されたハンドラを呼び出します。
//! ハンドラのない型タグは `DispatchOutcome::NoHandler` として報告されます。

use std::collections::HashMap;
use std::fmt;

use log::{trace, warn};

use super::value::Message;
use crate::error::Result;

/// 既知のパケット型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// 能力ネゴシエーション
    Hello,
    /// 切断通知
    Disconnect,
    /// 疎通確認
    Ping,
    /// 疎通確認の応答
    PingEcho,
    /// 画面領域の描画
    Draw,
    /// 描画完了の確認応答
    DamageSequence,
    /// その他の型タグ
    Other(String),
}

impl PacketType {
    /// 型タグから変換
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "hello" => PacketType::Hello,
            "disconnect" => PacketType::Disconnect,
            "ping" => PacketType::Ping,
            "ping_echo" => PacketType::PingEcho,
            "draw" => PacketType::Draw,
            "damage-sequence" => PacketType::DamageSequence,
            other => PacketType::Other(other.to_string()),
        }
    }

    /// 型タグ文字列
    pub fn as_str(&self) -> &str {
        match self {
            PacketType::Hello => "hello",
            PacketType::Disconnect => "disconnect",
            PacketType::Ping => "ping",
            PacketType::PingEcho => "ping_echo",
            PacketType::Draw => "draw",
            PacketType::DamageSequence => "damage-sequence",
            PacketType::Other(tag) => tag,
        }
    }

    /// この型のメッセージを作成
    pub fn message(&self) -> Message {
        Message::new(self.as_str())
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&Message> for PacketType {
    fn from(message: &Message) -> Self {
        PacketType::from_tag(message.packet_type())
    }
}

/// ディスパッチ結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// ハンドラが処理した
    Handled,
    /// ハンドラが登録されていない
    NoHandler(PacketType),
}

/// パケットハンドラ
pub type Handler<C> = Box<dyn FnMut(&mut C, Message) -> Result<()> + Send>;

/// パケット型からハンドラへの対応表
///
/// `C` はハンドラに渡される接続ごとのコンテキストです。
pub struct Dispatcher<C> {
    handlers: HashMap<PacketType, Handler<C>>,
}

impl<C> Dispatcher<C> {
    /// 空のディスパッチャを作成
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// ハンドラを登録（同じ型の既存ハンドラは置き換え）
    pub fn set_handler<F>(&mut self, packet_type: PacketType, handler: F)
    where
        F: FnMut(&mut C, Message) -> Result<()> + Send + 'static,
    {
        if self.handlers.insert(packet_type.clone(), Box::new(handler)).is_some() {
            trace!(target: "protocol", "'{}' のハンドラを置き換えました", packet_type);
        }
    }

    /// ハンドラを削除
    pub fn remove_handler(&mut self, packet_type: &PacketType) -> bool {
        self.handlers.remove(packet_type).is_some()
    }

    /// ハンドラが登録されているかどうか
    pub fn has_handler(&self, packet_type: &PacketType) -> bool {
        self.handlers.contains_key(packet_type)
    }

    /// メッセージをハンドラに渡す
    pub fn dispatch(&mut self, context: &mut C, message: Message) -> Result<DispatchOutcome> {
        let packet_type = PacketType::from(&message);
        match self.handlers.get_mut(&packet_type) {
            Some(handler) => {
                trace!(target: "protocol", "受信: {}", message);
                handler(context, message)?;
                Ok(DispatchOutcome::Handled)
            }
            None => {
                warn!(target: "protocol", "'{}' パケットのハンドラがありません", packet_type);
                Ok(DispatchOutcome::NoHandler(packet_type))
            }
        }
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_tag_mapping() {
        for tag in ["hello", "disconnect", "ping", "ping_echo", "draw", "damage-sequence"] {
            let packet_type = PacketType::from_tag(tag);
            assert!(!matches!(packet_type, PacketType::Other(_)));
            assert_eq!(packet_type.as_str(), tag);
        }
        assert_eq!(
            PacketType::from_tag("cursor"),
            PacketType::Other("cursor".to_string())
        );
    }

    #[test]
    fn test_dispatch_to_handler() {
        let mut dispatcher: Dispatcher<Vec<u64>> = Dispatcher::new();
        dispatcher.set_handler(PacketType::Ping, |seen, msg| {
            seen.push(msg.uint_arg(1)?);
            Ok(())
        });

        let mut seen = Vec::new();
        let outcome = dispatcher
            .dispatch(&mut seen, Message::new("ping").with(42u64))
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(seen, vec![42]);
    }

    #[test]
    fn test_unknown_tag() {
        let mut dispatcher: Dispatcher<()> = Dispatcher::new();
        let outcome = dispatcher.dispatch(&mut (), Message::new("bell")).unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::NoHandler(PacketType::Other("bell".to_string()))
        );
    }

    #[test]
    fn test_handler_error_propagates() {
        let mut dispatcher: Dispatcher<()> = Dispatcher::new();
        dispatcher.set_handler(PacketType::Draw, |_, msg| {
            msg.str_arg(1)?;
            Ok(())
        });
        let result = dispatcher.dispatch(&mut (), Message::new("draw").with(1u64));
        assert!(matches!(result, Err(Error::Decode(_))));
        assert!(dispatcher.remove_handler(&PacketType::Draw));
        assert!(!dispatcher.has_handler(&PacketType::Draw));
    }
}
