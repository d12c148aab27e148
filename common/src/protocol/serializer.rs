//! 構造化メッセージのシリアライザ
//!
//! 型タグ付き・長さ前置きのバイナリ形式です。区切り文字を使わないため、
//! 任意のバイト値を含むブロブをエスケープせずに運べます。
//!
//! | タグ | 内容 |
//! |---|---|
//! | `i` | 符号付き整数（i64 BE） |
//! | `u` | 符号なし整数（u64 BE） |
//! | `T` / `F` | 真偽値 |
//! | `s` | 文字列（u32 長 + UTF-8） |
//! | `b` | ブロブ（u32 長 + バイト列） |
//! | `l` | リスト（u32 要素数 + 要素） |
//! | `d` | マップ（u32 要素数 + (キー文字列, 値) の列） |
//! | `p` | チャンクのプレースホルダ |

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};

use super::value::{Message, Value};
use crate::error::{Error, Result};

const TAG_INT: u8 = b'i';
const TAG_UINT: u8 = b'u';
const TAG_TRUE: u8 = b'T';
const TAG_FALSE: u8 = b'F';
const TAG_STR: u8 = b's';
const TAG_BYTES: u8 = b'b';
const TAG_LIST: u8 = b'l';
const TAG_MAP: u8 = b'd';
const TAG_PLACEHOLDER: u8 = b'p';

/// 入れ子の最大深さ
const MAX_DEPTH: usize = 64;

/// メッセージをエンコード
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(64);
    encode_list(message.items(), &mut buf, 0)?;
    Ok(buf.to_vec())
}

/// 単一の値をエンコード
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(16);
    encode_into(value, &mut buf, 0)?;
    Ok(buf.to_vec())
}

/// バイト列からメッセージをデコード
///
/// 末尾に余分なバイトがある場合も含め、不正な入力はすべて `Decode` エラーです。
pub fn decode_message(data: &[u8]) -> Result<Message> {
    match decode_value(data)? {
        Value::List(items) => Message::from_items(items),
        other => Err(Error::Decode(format!(
            "メッセージはリストである必要があります: {}",
            other.kind()
        ))),
    }
}

/// バイト列から単一の値をデコード
pub fn decode_value(data: &[u8]) -> Result<Value> {
    let mut buf = data;
    let value = decode_from(&mut buf, 0)?;
    if buf.has_remaining() {
        return Err(Error::Decode(format!(
            "末尾に {} バイトの余分なデータがあります",
            buf.remaining()
        )));
    }
    Ok(value)
}

fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidParameter(format!("要素が大きすぎます: {}", len)))
}

fn encode_list(items: &[Value], buf: &mut BytesMut, depth: usize) -> Result<()> {
    buf.put_u8(TAG_LIST);
    buf.put_u32(length_prefix(items.len())?);
    for item in items {
        encode_into(item, buf, depth + 1)?;
    }
    Ok(())
}

fn encode_into(value: &Value, buf: &mut BytesMut, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::InvalidParameter("入れ子が深すぎます".to_string()));
    }
    match value {
        Value::Int(v) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*v);
        }
        Value::UInt(v) => {
            buf.put_u8(TAG_UINT);
            buf.put_u64(*v);
        }
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            buf.put_u32(length_prefix(s.len())?);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            buf.put_u32(length_prefix(b.len())?);
            buf.put_slice(b);
        }
        Value::List(items) => encode_list(items, buf, depth)?,
        Value::Map(map) => {
            buf.put_u8(TAG_MAP);
            buf.put_u32(length_prefix(map.len())?);
            for (key, item) in map {
                buf.put_u32(length_prefix(key.len())?);
                buf.put_slice(key.as_bytes());
                encode_into(item, buf, depth + 1)?;
            }
        }
        Value::Placeholder => buf.put_u8(TAG_PLACEHOLDER),
    }
    Ok(())
}

fn need(buf: &&[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Decode(format!(
            "{} の途中でデータが切れています（必要 {} バイト、残り {} バイト）",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn read_len(buf: &mut &[u8], what: &str) -> Result<usize> {
    need(buf, 4, what)?;
    Ok(buf.get_u32() as usize)
}

fn read_string(buf: &mut &[u8], what: &str) -> Result<String> {
    let len = read_len(buf, what)?;
    need(buf, len, what)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| Error::Decode(format!("{} が UTF-8 ではありません: {}", what, e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn decode_from(buf: &mut &[u8], depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::Decode("入れ子が深すぎます".to_string()));
    }
    need(buf, 1, "型タグ")?;
    let tag = buf.get_u8();
    let value = match tag {
        TAG_INT => {
            need(buf, 8, "整数")?;
            Value::Int(buf.get_i64())
        }
        TAG_UINT => {
            need(buf, 8, "整数")?;
            Value::UInt(buf.get_u64())
        }
        TAG_TRUE => Value::Bool(true),
        TAG_FALSE => Value::Bool(false),
        TAG_STR => Value::Str(read_string(buf, "文字列")?),
        TAG_BYTES => {
            let len = read_len(buf, "ブロブ")?;
            need(buf, len, "ブロブ")?;
            let data = buf[..len].to_vec();
            buf.advance(len);
            Value::Bytes(data)
        }
        TAG_LIST => {
            let count = read_len(buf, "リスト")?;
            // 各要素は最低 1 バイトなので、残りより多い要素数は不正
            if count > buf.remaining() {
                return Err(Error::Decode(format!("リストの要素数 {} が不正です", count)));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_from(buf, depth + 1)?);
            }
            Value::List(items)
        }
        TAG_MAP => {
            let count = read_len(buf, "マップ")?;
            if count > buf.remaining() / 5 {
                return Err(Error::Decode(format!("マップの要素数 {} が不正です", count)));
            }
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = read_string(buf, "マップのキー")?;
                let item = decode_from(buf, depth + 1)?;
                if map.insert(key.clone(), item).is_some() {
                    return Err(Error::Decode(format!("マップのキー '{}' が重複しています", key)));
                }
            }
            Value::Map(map)
        }
        TAG_PLACEHOLDER => Value::Placeholder,
        other => {
            return Err(Error::Decode(format!("不明な型タグです: {:#04x}", other)));
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_message() -> Message {
        let mut options = BTreeMap::new();
        options.insert("csc".to_string(), Value::from("YUV420P"));
        options.insert("quality".to_string(), Value::from(80u32));
        options.insert("full_range".to_string(), Value::from(true));
        Message::new("draw")
            .with(1u64)
            .with(-20i64)
            .with("planar")
            .with((0..=255u8).collect::<Vec<u8>>())
            .with(Value::List(vec![Value::from(1i32), Value::from("x"), Value::List(vec![])]))
            .with(options)
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = sample_message();
        let data = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&data).unwrap(), msg);
    }

    #[test]
    fn test_signedness_preserved() {
        let msg = Message::new("t").with(5u64).with(5i64);
        let decoded = decode_message(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(decoded.get(1), Some(&Value::UInt(5)));
        assert_eq!(decoded.get(2), Some(&Value::Int(5)));
    }

    #[test]
    fn test_truncated_input() {
        let data = encode_message(&sample_message()).unwrap();
        for len in 0..data.len() {
            assert!(
                matches!(decode_message(&data[..len]), Err(Error::Decode(_))),
                "長さ {} の切り詰めが受理されました",
                len
            );
        }
    }

    #[test]
    fn test_trailing_garbage() {
        let mut data = encode_message(&sample_message()).unwrap();
        data.push(0);
        assert!(matches!(decode_message(&data), Err(Error::Decode(_))));
    }

    #[test]
    fn test_bad_tag_and_utf8() {
        assert!(matches!(decode_value(&[b'?']), Err(Error::Decode(_))));
        assert!(matches!(
            decode_value(&[TAG_STR, 0, 0, 0, 2, 0xC3, 0x28]),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_huge_count_rejected() {
        assert!(matches!(
            decode_value(&[TAG_LIST, 0xFF, 0xFF, 0xFF, 0xFF]),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_message_must_start_with_tag() {
        let data = encode_value(&Value::List(vec![Value::Int(1)])).unwrap();
        assert!(matches!(decode_message(&data), Err(Error::Decode(_))));
        let data = encode_value(&Value::Int(1)).unwrap();
        assert!(matches!(decode_message(&data), Err(Error::Decode(_))));
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Int),
            any::<u64>().prop_map(Value::UInt),
            any::<bool>().prop_map(Value::Bool),
            ".{0,12}".prop_map(Value::Str),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                prop::collection::btree_map("[a-z_]{0,8}", inner, 0..6).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_serializer_roundtrip(tag in "[a-z-]{1,16}", items in prop::collection::vec(arb_value(), 0..6)) {
            let mut msg = Message::new(tag);
            for item in items {
                msg.push(item);
            }
            let data = encode_message(&msg).unwrap();
            prop_assert_eq!(decode_message(&data).unwrap(), msg);
        }
    }
}
