//! 接続ごとのトランスポート
//!
//! バイトストリームを所有し、部分的な読み込みを蓄積してフレームを切り出し、
//! 解凍・デシリアライズ・チャンク再構築を経てメッセージを配送します。
//! 送信側は共有可能な `PacketSender` で、メッセージ単位でロックを取るため
//! 異なるメッセージのフレームが混ざることはありません。

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::chunks::{split_message, ChunkAssembler, ChunkLimits, SplitMessage};
use super::dispatch::{DispatchOutcome, Dispatcher, PacketType};
use super::frame_buffer::{Frame, FrameBuffer};
use super::header::encode_header;
use super::serializer::{decode_message, encode_message};
use super::value::{Message, Value};
use crate::compression::{self, CompressionAlgorithm};
use crate::config::ProtocolConfig;
use crate::error::{Error, ErrorCode, Result};

/// 読み込みタイムアウト（停止フラグとチャンク待ちの確認間隔）
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 1 回の read で使うバッファサイズ
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// トランスポートの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolOptions {
    /// 圧縮器の優先順位
    pub compressors: Vec<CompressionAlgorithm>,
    /// 圧縮レベル
    pub compression_level: u8,
    /// これより小さいフレームは圧縮しない
    pub min_compress_size: usize,
    /// ブロブをチャンクとして分割するかどうか
    pub chunks: bool,
    /// これより小さいブロブは本体に残す
    pub inline_threshold: usize,
    /// 受信ペイロードの最大サイズ
    pub max_packet_size: usize,
    /// チャンク再構築の上限
    pub limits: ChunkLimits,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

impl From<&ProtocolConfig> for ProtocolOptions {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            compressors: config
                .compressors
                .iter()
                .filter_map(|name| CompressionAlgorithm::from_name(name))
                .collect(),
            compression_level: config.compression_level,
            min_compress_size: config.min_compress_size,
            chunks: config.chunks,
            inline_threshold: config.inline_threshold,
            max_packet_size: config.max_packet_size.min(compression::MAX_SIZE),
            limits: ChunkLimits {
                max_pending_chunks: config.max_pending_chunks,
                max_pending_bytes: config.max_pending_bytes,
                timeout: Duration::from_millis(config.chunk_timeout_ms),
            },
        }
    }
}

/// hello パケットに載せる能力マップを作成
pub fn hello_capabilities(options: &ProtocolOptions, encodings: &[String]) -> BTreeMap<String, Value> {
    let mut caps = BTreeMap::new();
    caps.insert("version".to_string(), Value::from(crate::VERSION));
    caps.insert(
        "compressors".to_string(),
        Value::str_list(options.compressors.iter().map(|c| c.as_str())),
    );
    caps.insert("chunks".to_string(), Value::from(options.chunks));
    caps.insert("max_packet_size".to_string(), Value::from(options.max_packet_size));
    caps.insert("encodings".to_string(), Value::str_list(encodings.iter().cloned()));
    caps
}

/// ネゴシエーションの結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// 送信に使う圧縮器
    pub compressor: CompressionAlgorithm,
    /// チャンク分割を使うかどうか
    pub chunks: bool,
    /// ピアが受け付ける最大ペイロード
    pub peer_max_packet_size: usize,
    /// ピアのバージョン
    pub peer_version: String,
    /// ピアが対応するエンコーディング
    pub encodings: Vec<String>,
}

/// 接続の統計情報
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStats {
    /// 受信メッセージ数
    pub input_packets: u64,
    /// 受信フレーム数
    pub input_frames: u64,
    /// 受信バイト数
    pub input_bytes: u64,
    /// 送信メッセージ数
    pub output_packets: u64,
    /// 送信フレーム数
    pub output_frames: u64,
    /// 送信バイト数
    pub output_bytes: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    input_packets: AtomicU64,
    input_frames: AtomicU64,
    input_bytes: AtomicU64,
    output_packets: AtomicU64,
    output_frames: AtomicU64,
    output_bytes: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ProtocolStats {
        ProtocolStats {
            input_packets: self.input_packets.load(Ordering::Relaxed),
            input_frames: self.input_frames.load(Ordering::Relaxed),
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_packets: self.output_packets.load(Ordering::Relaxed),
            output_frames: self.output_frames.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
        }
    }
}

struct SenderState<W> {
    writer: W,
    preferred: Vec<CompressionAlgorithm>,
    compressor: CompressionAlgorithm,
    compression_level: u8,
    min_compress_size: usize,
    chunks_enabled: bool,
    chunks: bool,
    inline_threshold: usize,
    peer_max_packet_size: usize,
    closed: bool,
}

impl<W: Write> SenderState<W> {
    fn write_frame(&mut self, index: u8, data: &[u8], stats: &StatsCounters) -> Result<()> {
        let compressed = if self.compressor != CompressionAlgorithm::None && data.len() >= self.min_compress_size {
            let compressed = compression::compress(data, self.compressor, self.compression_level)?;
            // 圧縮で大きくなる場合は無圧縮で送る
            if compressed.data.len() < data.len() {
                Some(compressed)
            } else {
                None
            }
        } else {
            None
        };
        let (level_byte, payload) = match &compressed {
            Some(c) => (c.level_byte, c.data.as_slice()),
            None => (0, data),
        };

        let header = encode_header(payload.len() as u32, level_byte, index);
        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        stats.output_frames.fetch_add(1, Ordering::Relaxed);
        stats
            .output_bytes
            .fetch_add((header.len() + payload.len()) as u64, Ordering::Relaxed);
        trace!(
            target: "protocol",
            "フレーム送信: index={}, level={:#04x}, {} -> {} バイト",
            index,
            level_byte,
            data.len(),
            payload.len()
        );
        Ok(())
    }

    fn write_message(&mut self, split: &SplitMessage, payload: &[u8], stats: &StatsCounters) -> Result<()> {
        for (index, blob) in &split.blobs {
            self.write_frame(*index, blob, stats)?;
        }
        self.write_frame(0, payload, stats)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// 送信ハンドル（複製してハンドラやワーカーから使える）
pub struct PacketSender<W> {
    state: Arc<Mutex<SenderState<W>>>,
    stats: Arc<StatsCounters>,
}

impl<W> Clone for PacketSender<W> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<W: Write> PacketSender<W> {
    fn new(writer: W, options: &ProtocolOptions, stats: Arc<StatsCounters>) -> Self {
        let state = SenderState {
            writer,
            preferred: options.compressors.clone(),
            // ネゴシエーションまでは無圧縮・分割なしで送る
            compressor: CompressionAlgorithm::None,
            compression_level: options.compression_level,
            min_compress_size: options.min_compress_size,
            chunks_enabled: options.chunks,
            chunks: false,
            inline_threshold: options.inline_threshold,
            peer_max_packet_size: options.max_packet_size,
            closed: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            stats,
        }
    }

    /// メッセージを送信
    ///
    /// ブロブのチャンクを先に書き、最後にメッセージ本体（チャンク 0）を書きます。
    pub fn send(&self, message: Message) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed(format!(
                "'{}' パケットを送信できません",
                message.packet_type()
            )));
        }

        let split = if state.chunks {
            split_message(message, state.inline_threshold)
        } else {
            SplitMessage {
                message,
                blobs: Vec::new(),
            }
        };
        let payload = encode_message(&split.message)?;

        // 途中で失敗してストリームが壊れないよう、書き込む前にサイズを確認する
        let limit = state.peer_max_packet_size;
        let oversized = split
            .blobs
            .iter()
            .map(|(_, blob)| blob.len())
            .chain(std::iter::once(payload.len()))
            .find(|len| *len > limit);
        if let Some(len) = oversized {
            return Err(Error::InvalidParameter(format!(
                "'{}' パケットの {} バイトのペイロードはピアの上限 {} を超えています",
                split.message.packet_type(),
                len,
                limit
            )));
        }

        match state.write_message(&split, &payload, &self.stats) {
            Ok(()) => {
                self.stats.output_packets.fetch_add(1, Ordering::Relaxed);
                trace!(target: "protocol", "送信: {}", split.message);
                Ok(())
            }
            Err(e) => {
                state.closed = true;
                Err(e)
            }
        }
    }

    /// 切断パケットを送信して送信側を閉じる
    pub fn send_disconnect(&self, code: ErrorCode, reason: &str) -> Result<()> {
        let message = PacketType::Disconnect
            .message()
            .with(code as i64)
            .with(reason);
        let result = self.send(message);
        self.close();
        result
    }

    /// ピアの能力マップを適用
    pub fn apply_peer_capabilities(&self, caps: &BTreeMap<String, Value>) -> Negotiated {
        let mut state = self.state.lock();
        let remote = caps.get("compressors").map(Value::as_str_list).unwrap_or_default();
        let compressor = compression::negotiate_compressor(&state.preferred, &remote);
        let chunks = state.chunks_enabled && caps.get("chunks").and_then(Value::as_bool).unwrap_or(false);
        state.compressor = compressor;
        state.chunks = chunks;
        if let Some(max) = caps.get("max_packet_size").and_then(Value::as_u64) {
            state.peer_max_packet_size = (max as usize).min(compression::MAX_SIZE);
        }
        let negotiated = Negotiated {
            compressor: state.compressor,
            chunks: state.chunks,
            peer_max_packet_size: state.peer_max_packet_size,
            peer_version: caps
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            encodings: caps.get("encodings").map(Value::as_str_list).unwrap_or_default(),
        };
        info!(
            target: "protocol",
            "ネゴシエーション完了: 圧縮={}, チャンク={}, ピアのバージョン={}",
            negotiated.compressor.as_str(),
            negotiated.chunks,
            negotiated.peer_version
        );
        negotiated
    }

    /// 送信側を閉じる（冪等）
    pub fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            let _ = state.writer.flush();
            state.closed = true;
        }
    }

    /// 送信側が閉じられているかどうか
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// 統計情報を取得
    pub fn stats(&self) -> ProtocolStats {
        self.stats.snapshot()
    }
}

/// 受信側
pub struct FrameReader<R> {
    reader: R,
    buffer: FrameBuffer,
    assembler: ChunkAssembler,
    max_packet_size: usize,
    read_buf: Vec<u8>,
    running: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
}

impl<R: Read> FrameReader<R> {
    fn new(reader: R, options: &ProtocolOptions, running: Arc<AtomicBool>, stats: Arc<StatsCounters>) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::with_max_packet_size(options.max_packet_size),
            assembler: ChunkAssembler::new(options.limits),
            max_packet_size: options.max_packet_size,
            read_buf: vec![0u8; READ_BUFFER_SIZE],
            running,
            stats,
        }
    }

    /// 次のメッセージを読む
    ///
    /// ストリームが正常に閉じられた、または停止が要求された場合は `None` です。
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            // バッファ済みのフレームを 1 つずつ処理し、メッセージが完成したら
            // 次のフレームを解析する前に返す
            while let Some(frame) = self.buffer.try_extract_one()? {
                if let Some(message) = self.process_frame(frame)? {
                    self.stats.input_packets.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(message));
                }
            }
            if !self.running.load(Ordering::Acquire) {
                return Ok(None);
            }
            self.assembler.check_timeout(Instant::now())?;

            match self.reader.read(&mut self.read_buf) {
                Ok(0) => {
                    if !self.buffer.is_empty() || self.assembler.has_deferred() {
                        return Err(Error::ConnectionClosed(
                            "フレームの途中でストリームが閉じられました".to_string(),
                        ));
                    }
                    return Ok(None);
                }
                Ok(n) => {
                    self.stats.input_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    self.buffer.extend(&self.read_buf[..n]);
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn process_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        self.stats.input_frames.fetch_add(1, Ordering::Relaxed);
        let header = frame.header;
        let payload = compression::decompress(&frame.payload, header.compression_level, self.max_packet_size)?;
        trace!(
            target: "protocol",
            "フレーム受信: index={}, level={:#04x}, {} -> {} バイト",
            header.chunk_index,
            header.compression_level,
            frame.payload.len(),
            payload.len()
        );
        if header.is_message() {
            let message = decode_message(&payload)?;
            self.assembler.push_message(message)
        } else {
            self.assembler.push_blob(header.chunk_index, Bytes::from(payload))
        }
    }

    /// 再構築中のチャンクを破棄
    fn discard(&mut self) {
        self.assembler.discard();
        self.buffer.clear();
    }
}

/// 1 接続分のプロトコル
pub struct Protocol<R, W> {
    reader: FrameReader<R>,
    sender: PacketSender<W>,
    running: Arc<AtomicBool>,
    options: ProtocolOptions,
}

impl Protocol<TcpStream, TcpStream> {
    /// TCP ストリームからプロトコルを作成
    pub fn from_tcp(stream: TcpStream, options: ProtocolOptions) -> Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;
        let writer = stream.try_clone()?;
        Ok(Self::new(stream, writer, options))
    }

    /// 読み書きを止めてソケットを閉じる
    pub fn shutdown(&mut self) {
        self.close();
        let _ = self.reader.reader.shutdown(Shutdown::Both);
    }
}

impl<R: Read, W: Write> Protocol<R, W> {
    /// 読み込み側と書き込み側からプロトコルを作成
    pub fn new(reader: R, writer: W, options: ProtocolOptions) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(StatsCounters::default());
        Self {
            reader: FrameReader::new(reader, &options, Arc::clone(&running), Arc::clone(&stats)),
            sender: PacketSender::new(writer, &options, stats),
            running,
            options,
        }
    }

    /// 送信ハンドルを取得
    pub fn sender(&self) -> PacketSender<W> {
        self.sender.clone()
    }

    /// 設定を取得
    pub fn options(&self) -> &ProtocolOptions {
        &self.options
    }

    /// メッセージを送信
    pub fn send(&self, message: Message) -> Result<()> {
        self.sender.send(message)
    }

    /// hello パケットを送信
    pub fn send_hello(&self, encodings: &[String]) -> Result<()> {
        let caps = hello_capabilities(&self.options, encodings);
        self.sender.send(PacketType::Hello.message().with(caps))
    }

    /// 受信した hello パケットを適用
    pub fn apply_hello(&self, hello: &Message) -> Result<Negotiated> {
        let caps = hello.map_arg(1)?;
        Ok(self.sender.apply_peer_capabilities(caps))
    }

    /// 切断パケットを送信して閉じる
    pub fn send_disconnect(&mut self, code: ErrorCode, reason: &str) -> Result<()> {
        let result = self.sender.send_disconnect(code, reason);
        self.close();
        result
    }

    /// 次のメッセージを読む
    pub fn read_message(&mut self) -> Result<Option<Message>> {
        self.reader.read_message()
    }

    /// 接続が開いているかどうか
    pub fn is_open(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.sender.is_closed()
    }

    /// 停止ハンドルを取得（別スレッドから読み込みを止める）
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// 統計情報を取得
    pub fn stats(&self) -> ProtocolStats {
        self.sender.stats()
    }

    /// 接続を閉じる
    ///
    /// 読み込みを止め、再構築中のチャンクを破棄してから送信側を閉じます。
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        self.reader.discard();
        self.sender.close();
    }

    /// 受信ループ
    ///
    /// メッセージを到着順にディスパッチャへ渡します。致命的なエラーでは
    /// 切断パケットを送ってから接続を閉じます。
    pub fn run<C>(&mut self, dispatcher: &mut Dispatcher<C>, context: &mut C) -> Result<()> {
        let result = self.run_loop(dispatcher, context);
        if let Err(e) = &result {
            if e.is_fatal() && !self.sender.is_closed() {
                warn!(target: "protocol", "接続を閉じます: {}", e);
                let _ = self.sender.send_disconnect(e.code(), &e.to_string());
            }
        }
        self.close();
        result
    }

    fn run_loop<C>(&mut self, dispatcher: &mut Dispatcher<C>, context: &mut C) -> Result<()> {
        while let Some(message) = self.read_message()? {
            let packet_type = PacketType::from(&message);
            if packet_type == PacketType::Disconnect {
                info!(
                    target: "protocol",
                    "ピアが切断しました: code={}, reason={}",
                    message.int_arg(1).unwrap_or(0),
                    message.str_arg(2).unwrap_or("")
                );
                if dispatcher.has_handler(&packet_type) {
                    dispatcher.dispatch(context, message)?;
                }
                return Ok(());
            }

            match dispatcher.dispatch(context, message) {
                Ok(DispatchOutcome::Handled) => {}
                Ok(DispatchOutcome::NoHandler(packet_type)) => {
                    debug!(target: "protocol", "'{}' パケットを無視しました", packet_type);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(target: "protocol", "'{}' の処理に失敗しました: {}", packet_type, e);
                }
            }
        }
        Ok(())
    }
}
