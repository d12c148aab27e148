//! 構造化メッセージの値モデル
//!
//! メッセージは先頭要素が型タグ（文字列）の順序付き列です。残りの要素は
//! 整数、文字列、真偽値、入れ子のリスト・マップ、バイナリブロブです。

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// メッセージの要素
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// 符号付き整数
    Int(i64),
    /// 符号なし整数
    UInt(u64),
    /// 真偽値
    Bool(bool),
    /// UTF-8 文字列
    Str(String),
    /// バイナリブロブ
    Bytes(Vec<u8>),
    /// 入れ子のリスト
    List(Vec<Value>),
    /// 文字列キーのマップ（キーの順序は意味を持たない）
    Map(BTreeMap<String, Value>),
    /// 別チャンクで送られるブロブの位置を示すプレースホルダ
    ///
    /// チャンク 0 のペイロード内にのみ現れ、再構築時に置き換えられます。
    Placeholder,
}

impl Value {
    /// 値の種類名を取得（エラーメッセージ用）
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Placeholder => "placeholder",
        }
    }

    /// 符号付き整数として取得
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// 符号なし整数として取得
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// 真偽値として取得
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(v) => Some(*v != 0),
            Value::UInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// 文字列として取得
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// バイト列として取得
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// リストとして取得
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// マップとして取得
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// 文字列のリストとして取得（文字列以外の要素は無視）
    pub fn as_str_list(&self) -> Vec<String> {
        self.as_list()
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    /// 文字列リストの値を作成
    pub fn str_list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(|s| Value::Str(s.into())).collect())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::UInt(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(l) => write!(f, "[{} items]", l.len()),
            Value::Map(m) => write!(f, "{{{} keys}}", m.len()),
            Value::Placeholder => write!(f, "<chunk>"),
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::UInt(u64::from(value))
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::UInt(value as u64)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(value.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

/// 構造化メッセージ（パケット）
///
/// 先頭要素は常に型タグの文字列です。送信のたびに新しく構築します。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    items: Vec<Value>,
}

impl Message {
    /// 型タグを指定して新しいメッセージを作成
    pub fn new(packet_type: impl Into<String>) -> Self {
        Self {
            items: vec![Value::Str(packet_type.into())],
        }
    }

    /// 要素列からメッセージを作成（先頭が文字列であることを検証）
    pub fn from_items(items: Vec<Value>) -> Result<Self> {
        match items.first() {
            Some(Value::Str(_)) => Ok(Self { items }),
            Some(other) => Err(Error::Decode(format!(
                "メッセージの先頭要素が文字列ではありません: {}",
                other.kind()
            ))),
            None => Err(Error::Decode("空のメッセージです".to_string())),
        }
    }

    /// 要素を追加（ビルダー形式）
    pub fn with(mut self, value: impl Into<Value>) -> Self {
        self.items.push(value.into());
        self
    }

    /// 要素を追加
    pub fn push(&mut self, value: impl Into<Value>) {
        self.items.push(value.into());
    }

    /// 型タグを取得
    pub fn packet_type(&self) -> &str {
        self.items.first().and_then(Value::as_str).unwrap_or("")
    }

    /// 要素数（型タグを含む）
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// 型タグ以外の要素がないかどうか
    pub fn is_empty(&self) -> bool {
        self.items.len() <= 1
    }

    /// 指定位置の要素を取得
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.items.get(index)
    }

    /// 指定位置の要素を置き換え
    pub fn set(&mut self, index: usize, value: Value) -> Result<()> {
        if index == 0 {
            return Err(Error::InvalidParameter("型タグは置き換えできません".to_string()));
        }
        let slot = self
            .items
            .get_mut(index)
            .ok_or_else(|| Error::InvalidParameter(format!("位置 {} は範囲外です", index)))?;
        *slot = value;
        Ok(())
    }

    /// 全要素を参照
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// 型タグ以外の要素を可変参照で取得
    pub(crate) fn args_mut(&mut self) -> &mut [Value] {
        &mut self.items[1..]
    }

    /// 全要素を取り出す
    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    fn arg(&self, index: usize) -> Result<&Value> {
        self.items.get(index).ok_or_else(|| {
            Error::Decode(format!(
                "'{}' パケットに位置 {} の要素がありません",
                self.packet_type(),
                index
            ))
        })
    }

    fn mismatch(&self, index: usize, expected: &str, found: &Value) -> Error {
        Error::Decode(format!(
            "'{}' パケットの位置 {}: {} を期待しましたが {} でした",
            self.packet_type(),
            index,
            expected,
            found.kind()
        ))
    }

    /// 指定位置の要素を符号付き整数として取得
    pub fn int_arg(&self, index: usize) -> Result<i64> {
        let value = self.arg(index)?;
        value.as_i64().ok_or_else(|| self.mismatch(index, "int", value))
    }

    /// 指定位置の要素を符号なし整数として取得
    pub fn uint_arg(&self, index: usize) -> Result<u64> {
        let value = self.arg(index)?;
        value.as_u64().ok_or_else(|| self.mismatch(index, "uint", value))
    }

    /// 指定位置の要素を文字列として取得
    pub fn str_arg(&self, index: usize) -> Result<&str> {
        let value = self.arg(index)?;
        value.as_str().ok_or_else(|| self.mismatch(index, "str", value))
    }

    /// 指定位置の要素をバイト列として取得
    pub fn bytes_arg(&self, index: usize) -> Result<&[u8]> {
        let value = self.arg(index)?;
        value.as_bytes().ok_or_else(|| self.mismatch(index, "bytes", value))
    }

    /// 指定位置の要素をマップとして取得
    pub fn map_arg(&self, index: usize) -> Result<&BTreeMap<String, Value>> {
        let value = self.arg(index)?;
        value.as_map().ok_or_else(|| self.mismatch(index, "map", value))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.packet_type())?;
        for (i, item) in self.items.iter().skip(1).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let msg = Message::new("draw").with(1u32).with(-5i64).with("png").with(vec![1u8, 2, 3]);
        assert_eq!(msg.packet_type(), "draw");
        assert_eq!(msg.len(), 5);
        assert_eq!(msg.uint_arg(1).unwrap(), 1);
        assert_eq!(msg.int_arg(2).unwrap(), -5);
        assert_eq!(msg.str_arg(3).unwrap(), "png");
        assert_eq!(msg.bytes_arg(4).unwrap(), &[1, 2, 3]);
        assert!(matches!(msg.str_arg(1), Err(Error::Decode(_))));
        assert!(matches!(msg.int_arg(9), Err(Error::Decode(_))));
    }

    #[test]
    fn test_from_items_requires_tag() {
        assert!(Message::from_items(vec![Value::Int(1)]).is_err());
        assert!(Message::from_items(vec![]).is_err());
        assert!(Message::from_items(vec![Value::from("ping")]).is_ok());
    }

    #[test]
    fn test_integer_views() {
        assert_eq!(Value::UInt(u64::MAX).as_i64(), None);
        assert_eq!(Value::Int(-1).as_u64(), None);
        assert_eq!(Value::Int(7).as_u64(), Some(7));
        assert_eq!(Value::UInt(7).as_i64(), Some(7));
    }

    #[test]
    fn test_cannot_replace_tag() {
        let mut msg = Message::new("ping").with(1u64);
        assert!(msg.set(0, Value::from("pong")).is_err());
        msg.set(1, Value::from(2u64)).unwrap();
        assert_eq!(msg.uint_arg(1).unwrap(), 2);
    }
}
