//! クライアントセッション管理
//!
//! 1 つの接続に対するセッションです。受信スレッドでパケットを
//! ディスパッチし、キャプチャスレッドでダメージ領域をエンコードして
//! `draw` パケットを送ります。
//!
//! 終了時の順序: 受信を止める → 再構築中のチャンクを破棄 →
//! 実行中のエンコードジョブを待つ → コーデックを閉じる。

use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use remote_display_rs_common::codec::{
    CodecRegistry, DamageAck, DrawPacket, ImageWrapper, JobHandle, RegionEncoder, WorkerPool,
};
use remote_display_rs_common::config::PipelineConfig;
use remote_display_rs_common::utils::number::{format_bytes, ratio_percent};
use remote_display_rs_common::protocol::{
    Dispatcher, Message, PacketSender, PacketType, Protocol, ProtocolOptions, ProtocolStats,
};
use remote_display_rs_common::utils::time::{current_time_millis, Timeout, Timer};
use remote_display_rs_common::{Error, ErrorCode, Result};

use super::SessionInfo;
use crate::capture::{CaptureSource, DiffCalculator};
use crate::config::ServerSettings;
use crate::error::ServerError;

/// 画面全体を表すウィンドウID
pub const ROOT_WID: u64 = 1;

/// 確認応答を待つ draw パケットの上限（超えたらキャプチャを休む）
const MAX_UNACKED_DRAWS: u64 = 64;

/// 停止フラグを確認する間隔
const STOP_POLL: Duration = Duration::from_millis(20);

/// 送信済みと確認済みの draw パケット数
#[derive(Debug, Default, Clone, Copy)]
struct AckState {
    sent: u64,
    acked: u64,
    failures: u64,
}

/// 受信スレッドとキャプチャスレッドで共有する状態
struct SessionShared {
    encoding: Mutex<Option<String>>,
    activity: Mutex<Timeout>,
    acks: Mutex<AckState>,
    refresh: AtomicBool,
    next_sequence: AtomicU64,
    pings: AtomicU64,
}

impl SessionShared {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            encoding: Mutex::new(None),
            activity: Mutex::new(Timeout::new(idle_timeout)),
            acks: Mutex::new(AckState::default()),
            refresh: AtomicBool::new(false),
            next_sequence: AtomicU64::new(1),
            pings: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.activity.lock().reset();
    }

    fn unacked(&self) -> u64 {
        let acks = self.acks.lock();
        acks.sent.saturating_sub(acks.acked)
    }
}

/// 受信ハンドラのコンテキスト
struct SessionContext {
    session_id: String,
    sender: PacketSender<TcpStream>,
    shared: Arc<SessionShared>,
    stop: Arc<AtomicBool>,
    server_encodings: Vec<String>,
    preferred_encoding: String,
}

/// セッション終了時の集計
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    /// 送信した draw パケット数
    pub draws_sent: u64,
    /// 確認応答の数
    pub draws_acked: u64,
    /// 描画に失敗した確認応答の数
    pub draw_failures: u64,
    /// 受信した ping の数
    pub pings: u64,
    /// 接続の統計
    pub stats: ProtocolStats,
}

/// クライアントセッション
pub struct ClientSession {
    info: SessionInfo,
    settings: ServerSettings,
    registry: Arc<CodecRegistry>,
    protocol: Protocol<TcpStream, TcpStream>,
}

impl ClientSession {
    /// 新しいクライアントセッションを作成
    pub fn new(
        info: SessionInfo,
        stream: TcpStream,
        settings: ServerSettings,
        registry: Arc<CodecRegistry>,
    ) -> std::result::Result<Self, ServerError> {
        let options = ProtocolOptions::from(&settings.tuning.protocol);
        let protocol = Protocol::from_tcp(stream, options)?;
        Ok(Self {
            info,
            settings,
            registry,
            protocol,
        })
    }

    /// セッション情報を取得
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// 停止ハンドル（サーバー停止時に受信ループを止める）
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.protocol.stop_handle()
    }

    /// セッションを実行（接続が閉じるまで戻らない）
    pub fn run(mut self, source: Box<dyn CaptureSource>) -> std::result::Result<SessionSummary, ServerError> {
        let session_id = self.info.short_id().to_string();
        info!(
            target: "session",
            "[{}] セッション開始: {} ({}, {}x{})",
            session_id,
            self.info.client_addr,
            source.name(),
            source.size().0,
            source.size().1
        );

        let server_encodings = self.registry.encoder_encodings();
        self.protocol.send_hello(&server_encodings)?;

        let idle_timeout = Duration::from_secs(self.settings.network.client_timeout.max(1));
        let shared = Arc::new(SessionShared::new(idle_timeout));
        let stop = self.protocol.stop_handle();
        let sender = self.protocol.sender();

        let capture = CaptureLoop {
            session_id: session_id.clone(),
            source,
            sender: sender.clone(),
            shared: Arc::clone(&shared),
            stop: Arc::clone(&stop),
            registry: Arc::clone(&self.registry),
            pipeline: self.settings.tuning.pipeline.clone(),
            frame_interval: Duration::from_millis(1000 / self.settings.capture.frame_rate.max(1) as u64),
        };
        let capture_thread = thread::Builder::new()
            .name(format!("capture-{}", session_id))
            .spawn(move || capture.run())?;

        let mut dispatcher = Self::dispatcher();
        let mut context = SessionContext {
            session_id: session_id.clone(),
            sender,
            shared: Arc::clone(&shared),
            stop,
            server_encodings,
            preferred_encoding: self.settings.capture.encoding.clone(),
        };
        // run は終了時に受信を止め、チャンクを破棄して送信側を閉じる
        let result = self.protocol.run(&mut dispatcher, &mut context);
        if let Err(e) = &result {
            warn!(target: "session", "[{}] 受信ループが終了しました: {}", session_id, e);
        }

        // キャプチャスレッドはジョブを待ってからコーデックを閉じる
        match capture_thread.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "session", "[{}] キャプチャが失敗しました: {}", session_id, e),
            Err(_) => warn!(target: "session", "[{}] キャプチャスレッドがパニックしました", session_id),
        }
        self.protocol.shutdown();

        let acks = *shared.acks.lock();
        let summary = SessionSummary {
            draws_sent: acks.sent,
            draws_acked: acks.acked,
            draw_failures: acks.failures,
            pings: shared.pings.load(Ordering::Relaxed),
            stats: self.protocol.stats(),
        };
        info!(
            target: "session",
            "[{}] セッション終了: {}秒, draw {}/{} 確認済み, 送信 {}",
            session_id,
            self.info.connected_secs(),
            summary.draws_acked,
            summary.draws_sent,
            format_bytes(summary.stats.output_bytes)
        );
        Ok(summary)
    }

    fn dispatcher() -> Dispatcher<SessionContext> {
        let mut dispatcher = Dispatcher::new();
        dispatcher.set_handler(PacketType::Hello, handle_hello);
        dispatcher.set_handler(PacketType::Ping, handle_ping);
        dispatcher.set_handler(PacketType::DamageSequence, handle_damage_sequence);
        dispatcher.set_handler(PacketType::Disconnect, handle_disconnect);
        dispatcher
    }
}

/// ピアと共通のエンコーディングを選ぶ（設定の優先エンコーディングを優先）
fn choose_encoding(preferred: &str, server: &[String], client: &[String]) -> Option<String> {
    let usable = |name: &str| server.iter().any(|s| s == name) && client.iter().any(|c| c == name);
    if usable(preferred) {
        return Some(preferred.to_string());
    }
    client.iter().find(|name| usable(name.as_str())).cloned()
}

fn handle_hello(ctx: &mut SessionContext, message: Message) -> Result<()> {
    ctx.shared.touch();
    let caps = message.map_arg(1)?;
    let negotiated = ctx.sender.apply_peer_capabilities(caps);
    match choose_encoding(&ctx.preferred_encoding, &ctx.server_encodings, &negotiated.encodings) {
        Some(encoding) => {
            info!(
                target: "session",
                "[{}] エンコーディング: {} (クライアント {})",
                ctx.session_id,
                encoding,
                negotiated.peer_version
            );
            *ctx.shared.encoding.lock() = Some(encoding);
            ctx.shared.refresh.store(true, Ordering::Release);
            Ok(())
        }
        None => {
            let reason = format!("共通のエンコーディングがありません: {:?}", negotiated.encodings);
            warn!(target: "session", "[{}] {}", ctx.session_id, reason);
            let result = ctx.sender.send_disconnect(ErrorCode::UnsupportedFormat, &reason);
            ctx.stop.store(false, Ordering::Release);
            result
        }
    }
}

fn handle_ping(ctx: &mut SessionContext, message: Message) -> Result<()> {
    ctx.shared.touch();
    ctx.shared.pings.fetch_add(1, Ordering::Relaxed);
    let echo = PacketType::PingEcho
        .message()
        .with(message.uint_arg(1)?)
        .with(current_time_millis());
    ctx.sender.send(echo)
}

fn handle_damage_sequence(ctx: &mut SessionContext, message: Message) -> Result<()> {
    ctx.shared.touch();
    let ack = DamageAck::from_message(&message)?;
    let mut acks = ctx.shared.acks.lock();
    acks.acked += 1;
    if ack.is_success() {
        trace!(
            target: "session",
            "[{}] 描画完了: seq={}, {}x{}, {}us",
            ctx.session_id,
            ack.sequence,
            ack.width,
            ack.height,
            ack.decode_time_us
        );
    } else {
        acks.failures += 1;
        warn!(
            target: "session",
            "[{}] クライアントが描画に失敗しました: seq={}: {}",
            ctx.session_id,
            ack.sequence,
            ack.message
        );
        // 全画面を送り直す
        ctx.shared.refresh.store(true, Ordering::Release);
    }
    Ok(())
}

fn handle_disconnect(ctx: &mut SessionContext, message: Message) -> Result<()> {
    let code = ErrorCode::from_i64(message.int_arg(1).unwrap_or(0));
    info!(
        target: "session",
        "[{}] クライアントが切断しました: {} ({})",
        ctx.session_id,
        code.as_str(),
        message.str_arg(2).unwrap_or("")
    );
    Ok(())
}

type EncoderStack = Arc<Mutex<Vec<RegionEncoder>>>;

/// キャプチャとエンコードのループ
struct CaptureLoop {
    session_id: String,
    source: Box<dyn CaptureSource>,
    sender: PacketSender<TcpStream>,
    shared: Arc<SessionShared>,
    stop: Arc<AtomicBool>,
    registry: Arc<CodecRegistry>,
    pipeline: PipelineConfig,
    frame_interval: Duration,
}

impl CaptureLoop {
    fn run(mut self) -> Result<()> {
        let mut pool = WorkerPool::new(&format!("encode-{}", self.session_id), self.pipeline.worker_threads())?;
        let encoders: EncoderStack = Arc::new(Mutex::new(Vec::new()));
        let mut diff = DiffCalculator::default();
        let mut jobs: VecDeque<JobHandle<Result<()>>> = VecDeque::new();

        let result = self.capture_frames(&pool, &encoders, &mut diff, &mut jobs);

        // 実行中のジョブを待ってからコーデックを閉じる
        for job in jobs.drain(..) {
            let _ = job.wait();
        }
        pool.shutdown();
        for mut encoder in encoders.lock().drain(..) {
            encoder.close();
        }
        debug!(target: "session", "[{}] キャプチャを停止しました", self.session_id);
        result
    }

    fn capture_frames(
        &mut self,
        pool: &WorkerPool,
        encoders: &EncoderStack,
        diff: &mut DiffCalculator,
        jobs: &mut VecDeque<JobHandle<Result<()>>>,
    ) -> Result<()> {
        while self.stop.load(Ordering::Acquire) {
            let timer = Timer::start();

            if self.shared.activity.lock().is_elapsed() {
                warn!(target: "session", "[{}] クライアントタイムアウト", self.session_id);
                let _ = self.sender.send_disconnect(ErrorCode::TimeoutError, "アイドルタイムアウト");
                self.stop.store(false, Ordering::Release);
                break;
            }

            let encoding = self.shared.encoding.lock().clone();
            match encoding {
                Some(encoding) if self.shared.unacked() < MAX_UNACKED_DRAWS => {
                    if self.shared.refresh.swap(false, Ordering::AcqRel) {
                        diff.clear_previous();
                    }
                    self.capture_once(&encoding, pool, encoders, diff, jobs)?;
                }
                Some(_) => {
                    debug!(
                        target: "session",
                        "[{}] 確認応答待ちが多いためフレームを飛ばします ({})",
                        self.session_id,
                        self.shared.unacked()
                    );
                }
                // hello を受け取るまでは送らない
                None => {}
            }

            self.sleep_until(timer, self.frame_interval);
        }
        Ok(())
    }

    fn capture_once(
        &mut self,
        encoding: &str,
        pool: &WorkerPool,
        encoders: &EncoderStack,
        diff: &mut DiffCalculator,
        jobs: &mut VecDeque<JobHandle<Result<()>>>,
    ) -> Result<()> {
        let frame = self.source.capture()?;
        let damage = diff.calculate(&frame)?;
        if damage.is_empty() {
            return Ok(());
        }
        trace!(
            target: "session",
            "[{}] ダメージ: {} 領域 ({:.1}%)",
            self.session_id,
            damage.changed_regions.len(),
            damage.change_ratio * 100.0
        );

        for rect in &damage.changed_regions {
            // ワーカーが埋まっている間は古いジョブから待つ
            while pool.is_saturated() {
                match jobs.pop_front() {
                    Some(job) => self.finish_job(job),
                    None => break,
                }
            }
            let region = frame.sub_image(rect.x, rect.y, rect.width, rect.height)?;
            let job = RegionJob {
                encoding: encoding.to_string(),
                region,
                sequence: self.shared.next_sequence.fetch_add(1, Ordering::Relaxed),
                encoders: Arc::clone(encoders),
                registry: Arc::clone(&self.registry),
                pipeline: self.pipeline.clone(),
                sender: self.sender.clone(),
                shared: Arc::clone(&self.shared),
            };
            jobs.push_back(pool.submit(move || job.run())?);
        }

        while let Some(job) = jobs.pop_front() {
            self.finish_job(job);
        }
        Ok(())
    }

    fn finish_job(&self, job: JobHandle<Result<()>>) {
        match job.wait() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(target: "session", "[{}] 領域のエンコードに失敗しました: {}", self.session_id, e);
                if !matches!(e, Error::ConnectionClosed(_)) {
                    self.shared.refresh.store(true, Ordering::Release);
                }
            }
            Err(e) => warn!(target: "session", "[{}] エンコードジョブが失われました: {}", self.session_id, e),
        }
    }

    fn sleep_until(&self, timer: Timer, interval: Duration) {
        while self.stop.load(Ordering::Acquire) {
            let elapsed = timer.elapsed();
            if elapsed >= interval {
                break;
            }
            thread::sleep((interval - elapsed).min(STOP_POLL));
        }
    }
}

/// 1 領域分のエンコードと送信
struct RegionJob {
    encoding: String,
    region: ImageWrapper,
    sequence: u64,
    encoders: EncoderStack,
    registry: Arc<CodecRegistry>,
    pipeline: PipelineConfig,
    sender: PacketSender<TcpStream>,
    shared: Arc<SessionShared>,
}

impl RegionJob {
    fn run(self) -> Result<()> {
        let RegionJob {
            encoding,
            region,
            sequence,
            encoders,
            registry,
            pipeline,
            sender,
            shared,
        } = self;

        let mut encoder = encoders
            .lock()
            .pop()
            .unwrap_or_else(|| RegionEncoder::new(registry, &encoding, &pipeline));
        encoder.set_encoding(&encoding);

        let (x, y, width, height) = (region.x(), region.y(), region.width(), region.height());
        let encoded = encoder.encode(region);
        encoders.lock().push(encoder);

        let packet = DrawPacket::new(ROOT_WID, x, y, width, height, sequence, encoded?);
        trace!(
            target: "session",
            "draw: seq={}, {}x{}+{}+{}, {} {} バイト ({:.1}%)",
            sequence,
            width,
            height,
            x,
            y,
            packet.encoding,
            packet.data.len(),
            ratio_percent(packet.data.len() as u64, width as u64 * height as u64 * 4)
        );
        sender.send(packet.to_message())?;
        shared.acks.lock().sent += 1;
        Ok(())
    }
}
