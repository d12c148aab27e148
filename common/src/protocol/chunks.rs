//! チャンク分割と再構築
//!
//! バイナリブロブを含むメッセージは N+1 個のフレームで送られます。
//! フレーム 0 はブロブの位置をプレースホルダに置き換えたメッセージ本体、
//! フレーム 1..N はそれぞれ 1 つのブロブで、チャンク番号がメッセージ内の
//! 位置を示します。受信側はブロブを番号ごとに保持し、フレーム 0 で参照された
//! ブロブがすべて揃った時点でメッセージを組み立てて配送します。

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, trace};

use super::header::MAX_CHUNK_INDEX;
use super::value::{Message, Value};
use crate::error::{Error, Result};

/// 送信用に分割されたメッセージ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitMessage {
    /// プレースホルダ入りのメッセージ本体（チャンク 0）
    pub message: Message,
    /// (チャンク番号, ブロブ) の列
    pub blobs: Vec<(u8, Vec<u8>)>,
}

/// トップレベルのブロブをチャンクとして切り出す
///
/// `inline_threshold` 未満のブロブと、位置が 255 を超えるブロブは本体に残します。
pub fn split_message(message: Message, inline_threshold: usize) -> SplitMessage {
    let mut message = message;
    let mut blobs = Vec::new();
    for (offset, item) in message.args_mut().iter_mut().enumerate() {
        let position = offset + 1;
        if position > MAX_CHUNK_INDEX as usize {
            break;
        }
        let is_large_blob = matches!(item, Value::Bytes(b) if b.len() >= inline_threshold);
        if is_large_blob {
            if let Value::Bytes(data) = std::mem::replace(item, Value::Placeholder) {
                blobs.push((position as u8, data));
            }
        }
    }
    SplitMessage { message, blobs }
}

/// 再構築の上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    /// 保持できるブロブの最大数
    pub max_pending_chunks: usize,
    /// 保持できるブロブの合計バイト数
    pub max_pending_bytes: usize,
    /// フレーム 0 がブロブを待てる最大時間
    pub timeout: Duration,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_pending_chunks: 16,
            max_pending_bytes: 256 * 1024 * 1024,
            timeout: Duration::from_millis(10_000),
        }
    }
}

/// 待機中のメッセージ本体
#[derive(Debug)]
struct Deferred {
    message: Message,
    missing: Vec<usize>,
    since: Instant,
}

/// 接続ごとのチャンク再構築器
#[derive(Debug)]
pub struct ChunkAssembler {
    limits: ChunkLimits,
    pending: BTreeMap<u8, Bytes>,
    pending_bytes: usize,
    deferred: Option<Deferred>,
}

impl ChunkAssembler {
    /// 上限を指定して作成
    pub fn new(limits: ChunkLimits) -> Self {
        Self {
            limits,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            deferred: None,
        }
    }

    /// 保持中のブロブ数
    pub fn pending_chunks(&self) -> usize {
        self.pending.len()
    }

    /// 保持中のブロブの合計バイト数
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// ブロブ待ちのメッセージがあるかどうか
    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    /// ブロブチャンクを受け取る
    ///
    /// 待機中のメッセージがこれで完成した場合はそれを返します。
    pub fn push_blob(&mut self, index: u8, data: Bytes) -> Result<Option<Message>> {
        if index == 0 {
            return Err(Error::InvalidParameter("チャンク 0 はブロブではありません".to_string()));
        }
        if self.pending.contains_key(&index) {
            return Err(Error::FrameProtocol(format!("チャンク {} が重複しています", index)));
        }
        if let Some(deferred) = &self.deferred {
            if !deferred.missing.contains(&(index as usize)) {
                return Err(Error::FrameProtocol(format!(
                    "チャンク {} は '{}' パケットのプレースホルダではありません",
                    index,
                    deferred.message.packet_type()
                )));
            }
        }
        if self.pending.len() >= self.limits.max_pending_chunks {
            return Err(Error::FrameProtocol(format!(
                "保持中のチャンクが上限 {} に達しました",
                self.limits.max_pending_chunks
            )));
        }
        if self.pending_bytes + data.len() > self.limits.max_pending_bytes {
            return Err(Error::FrameProtocol(format!(
                "保持中のチャンクが上限 {} バイトを超えます",
                self.limits.max_pending_bytes
            )));
        }
        trace!(target: "protocol", "チャンク {} を保持（{} バイト）", index, data.len());
        self.pending_bytes += data.len();
        self.pending.insert(index, data);

        let complete = match &mut self.deferred {
            Some(deferred) => {
                deferred.missing.retain(|&position| position != index as usize);
                deferred.missing.is_empty()
            }
            None => false,
        };
        if complete {
            if let Some(deferred) = self.deferred.take() {
                return self.splice(deferred.message).map(Some);
            }
        }
        Ok(None)
    }

    /// メッセージ本体（チャンク 0）を受け取る
    ///
    /// 参照するブロブがすべて揃っていれば組み立てたメッセージを返し、
    /// 足りなければ後続のブロブを待ちます。
    pub fn push_message(&mut self, message: Message) -> Result<Option<Message>> {
        if self.deferred.is_some() {
            return Err(Error::FrameProtocol(
                "前のメッセージがブロブを待っている間にチャンク 0 を受信しました".to_string(),
            ));
        }

        let mut referenced = Vec::new();
        for (position, item) in message.items().iter().enumerate() {
            match item {
                Value::Placeholder if position > 0 => referenced.push(position),
                Value::List(_) | Value::Map(_) if contains_placeholder(item) => {
                    return Err(Error::Decode(
                        "プレースホルダはトップレベルにのみ置けます".to_string(),
                    ));
                }
                _ => {}
            }
        }

        if let Some(stray) = self
            .pending
            .keys()
            .find(|index| !referenced.contains(&(**index as usize)))
        {
            return Err(Error::FrameProtocol(format!(
                "チャンク {} はメッセージから参照されていません",
                stray
            )));
        }

        let missing: Vec<usize> = referenced
            .into_iter()
            .filter(|position| !self.pending.contains_key(&(*position as u8)))
            .collect();
        if missing.is_empty() {
            return self.splice(message).map(Some);
        }

        debug!(
            target: "protocol",
            "'{}' パケットはチャンク {:?} を待機します",
            message.packet_type(),
            missing
        );
        self.deferred = Some(Deferred {
            message,
            missing,
            since: Instant::now(),
        });
        Ok(None)
    }

    /// 待機時間の上限を確認する
    pub fn check_timeout(&self, now: Instant) -> Result<()> {
        if let Some(deferred) = &self.deferred {
            if now.saturating_duration_since(deferred.since) > self.limits.timeout {
                return Err(Error::FrameProtocol(format!(
                    "'{}' パケットのチャンク {:?} が {:?} 以内に届きませんでした",
                    deferred.message.packet_type(),
                    deferred.missing,
                    self.limits.timeout
                )));
            }
        }
        Ok(())
    }

    /// 再構築中の状態をすべて破棄
    pub fn discard(&mut self) {
        if !self.pending.is_empty() || self.deferred.is_some() {
            debug!(
                target: "protocol",
                "再構築中のチャンク {} 個（{} バイト）を破棄",
                self.pending.len(),
                self.pending_bytes
            );
        }
        self.pending.clear();
        self.pending_bytes = 0;
        self.deferred = None;
    }

    fn splice(&mut self, message: Message) -> Result<Message> {
        let mut message = message;
        let pending = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        for (index, data) in pending {
            if !matches!(message.get(index as usize), Some(Value::Placeholder)) {
                return Err(Error::FrameProtocol(format!(
                    "チャンク {} の位置にプレースホルダがありません",
                    index
                )));
            }
            message.set(index as usize, Value::Bytes(data.to_vec()))?;
        }
        Ok(message)
    }
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::new(ChunkLimits::default())
    }
}

fn contains_placeholder(value: &Value) -> bool {
    match value {
        Value::Placeholder => true,
        Value::List(items) => items.iter().any(contains_placeholder),
        Value::Map(map) => map.values().any(contains_placeholder),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blob_message() -> Message {
        Message::new("draw")
            .with(1u64)
            .with(vec![1u8, 2, 3])
            .with("rgb")
            .with(vec![9u8; 40])
    }

    #[test]
    fn test_split_replaces_blobs() {
        let split = split_message(two_blob_message(), 0);
        assert_eq!(split.blobs.len(), 2);
        assert_eq!(split.blobs[0].0, 2);
        assert_eq!(split.blobs[1].0, 4);
        assert_eq!(split.message.get(2), Some(&Value::Placeholder));
        assert_eq!(split.message.get(3), Some(&Value::from("rgb")));
    }

    #[test]
    fn test_inline_threshold() {
        let split = split_message(two_blob_message(), 10);
        assert_eq!(split.blobs.len(), 1);
        assert_eq!(split.message.get(2), Some(&Value::Bytes(vec![1, 2, 3])));
    }

    #[test]
    fn test_message_first_then_blobs() {
        let split = split_message(two_blob_message(), 0);
        let mut assembler = ChunkAssembler::default();
        assert_eq!(assembler.push_message(split.message).unwrap(), None);
        assert!(assembler.has_deferred());
        let (i1, b1) = split.blobs[0].clone();
        let (i2, b2) = split.blobs[1].clone();
        assert_eq!(assembler.push_blob(i2, Bytes::from(b2)).unwrap(), None);
        let message = assembler.push_blob(i1, Bytes::from(b1)).unwrap().unwrap();
        assert_eq!(message, two_blob_message());
        assert_eq!(assembler.pending_chunks(), 0);
        assert_eq!(assembler.pending_bytes(), 0);
    }

    #[test]
    fn test_duplicate_chunk() {
        let mut assembler = ChunkAssembler::default();
        assembler.push_blob(2, Bytes::from_static(b"a")).unwrap();
        assert!(matches!(
            assembler.push_blob(2, Bytes::from_static(b"b")),
            Err(Error::FrameProtocol(_))
        ));
    }

    #[test]
    fn test_pending_limits() {
        let limits = ChunkLimits {
            max_pending_chunks: 2,
            max_pending_bytes: 10,
            timeout: Duration::from_secs(1),
        };
        let mut assembler = ChunkAssembler::new(limits);
        assembler.push_blob(1, Bytes::from_static(b"12345")).unwrap();
        assert!(matches!(
            assembler.push_blob(2, Bytes::from_static(b"123456")),
            Err(Error::FrameProtocol(_))
        ));
        assembler.push_blob(2, Bytes::from_static(b"1")).unwrap();
        assert!(matches!(
            assembler.push_blob(3, Bytes::from_static(b"1")),
            Err(Error::FrameProtocol(_))
        ));
    }

    #[test]
    fn test_unreferenced_blob() {
        let mut assembler = ChunkAssembler::default();
        assembler.push_blob(5, Bytes::from_static(b"x")).unwrap();
        assert!(matches!(
            assembler.push_message(Message::new("ping")),
            Err(Error::FrameProtocol(_))
        ));
    }

    #[test]
    fn test_stray_blob_while_waiting() {
        let mut assembler = ChunkAssembler::default();
        let message = Message::new("draw").with(Value::Placeholder).with("rgb");
        assert_eq!(assembler.push_message(message).unwrap(), None);
        // 位置 2 は文字列でありプレースホルダではない
        assert!(matches!(
            assembler.push_blob(2, Bytes::from_static(b"evil")),
            Err(Error::FrameProtocol(_))
        ));
        assert_eq!(assembler.pending_chunks(), 0);

        let message = assembler.push_blob(1, Bytes::from_static(b"real")).unwrap().unwrap();
        assert_eq!(message.get(1), Some(&Value::Bytes(b"real".to_vec())));
        assert_eq!(message.get(2), Some(&Value::from("rgb")));
    }

    #[test]
    fn test_blob_before_message_at_plain_argument() {
        let mut assembler = ChunkAssembler::default();
        assembler.push_blob(2, Bytes::from_static(b"evil")).unwrap();
        let message = Message::new("draw").with(Value::Placeholder).with("rgb");
        assert!(matches!(assembler.push_message(message), Err(Error::FrameProtocol(_))));
    }

    #[test]
    fn test_second_message_while_waiting() {
        let split = split_message(two_blob_message(), 0);
        let mut assembler = ChunkAssembler::default();
        assembler.push_message(split.message).unwrap();
        assert!(matches!(
            assembler.push_message(Message::new("ping")),
            Err(Error::FrameProtocol(_))
        ));
    }

    #[test]
    fn test_timeout() {
        let limits = ChunkLimits {
            timeout: Duration::from_millis(50),
            ..ChunkLimits::default()
        };
        let split = split_message(two_blob_message(), 0);
        let mut assembler = ChunkAssembler::new(limits);
        assembler.push_message(split.message).unwrap();
        assert!(assembler.check_timeout(Instant::now()).is_ok());
        let later = Instant::now() + Duration::from_millis(100);
        assert!(matches!(assembler.check_timeout(later), Err(Error::FrameProtocol(_))));
        assembler.discard();
        assert!(assembler.check_timeout(later).is_ok());
    }

    #[test]
    fn test_nested_placeholder_rejected() {
        let message = Message::new("bad").with(Value::List(vec![Value::Placeholder]));
        let mut assembler = ChunkAssembler::default();
        assert!(matches!(assembler.push_message(message), Err(Error::Decode(_))));
    }
}
