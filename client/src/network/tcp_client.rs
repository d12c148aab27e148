//! TCP クライアント実装
//!
//! サーバーに接続して hello を交換し、draw パケットをデコードして
//! 確認応答を返します。別スレッドから定期的に ping を送ります。

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use remote_display_rs_common::codec::CodecRegistry;
use remote_display_rs_common::protocol::{
    Dispatcher, Message, Negotiated, PacketSender, PacketType, Protocol, ProtocolOptions, ProtocolStats,
};
use remote_display_rs_common::utils::number::format_bytes;
use remote_display_rs_common::utils::time::{current_time_millis, format_timestamp};
use remote_display_rs_common::{ErrorCode, Result};

use super::ConnectionState;
use crate::config::ClientSettings;
use crate::display::{DrawHandler, Presenter};
use crate::error::ClientError;

/// 停止フラグを確認する間隔
const STOP_POLL: Duration = Duration::from_millis(50);

/// 受信ハンドラのコンテキスト
struct ClientContext {
    sender: PacketSender<TcpStream>,
    stop: Arc<AtomicBool>,
    draw: DrawHandler,
    negotiated: Option<Negotiated>,
    latency_ms: Option<u64>,
    max_draws: Option<u64>,
    server_disconnect: Option<(ErrorCode, String)>,
}

/// 接続終了時の集計
pub struct ClientSummary {
    /// 処理した draw の数
    pub draws: u64,
    /// 描画に失敗した draw の数
    pub failures: u64,
    /// 最後に測ったレイテンシ（ミリ秒）
    pub latency_ms: Option<u64>,
    /// ネゴシエーション結果
    pub negotiated: Option<Negotiated>,
    /// サーバーからの切断理由
    pub server_disconnect: Option<(ErrorCode, String)>,
    /// 接続の統計
    pub stats: ProtocolStats,
    /// 提示先（フレームバッファの内容を取り出せる）
    pub presenter: Box<dyn Presenter>,
}

/// リモートディスプレイクライアント
pub struct RemoteDisplayClient {
    settings: ClientSettings,
    registry: Arc<CodecRegistry>,
    protocol: Protocol<TcpStream, TcpStream>,
    state: ConnectionState,
}

impl RemoteDisplayClient {
    /// サーバーに接続
    pub fn connect(settings: ClientSettings) -> std::result::Result<Self, ClientError> {
        let addr = settings.server_addr();
        let stream = TcpStream::connect(&addr)
            .map_err(|e| ClientError::Connection(format!("{} に接続できません: {}", addr, e)))?;
        let registry = Arc::new(CodecRegistry::with_defaults(&settings.tuning.pipeline)?);
        let protocol = Protocol::from_tcp(stream, ProtocolOptions::from(&settings.tuning.protocol))?;
        info!("接続しました: {}", addr);
        Ok(Self {
            settings,
            registry,
            protocol,
            state: ConnectionState::Connected,
        })
    }

    /// 接続状態
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// hello で通知するエンコーディング
    pub fn encodings(&self) -> Vec<String> {
        self.settings.announced_encodings(&self.registry.decoder_encodings())
    }

    /// 停止ハンドル
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.protocol.stop_handle()
    }

    /// 接続が閉じるまで draw を受信して提示
    pub fn run(mut self, presenter: Box<dyn Presenter>) -> std::result::Result<ClientSummary, ClientError> {
        let encodings = self.encodings();
        if encodings.is_empty() {
            return Err(ClientError::Config("デコードできるエンコーディングがありません".to_string()));
        }
        self.protocol.send_hello(&encodings)?;
        self.state = ConnectionState::Negotiating;

        let stop = self.protocol.stop_handle();
        let sender = self.protocol.sender();
        let ping_thread = spawn_pinger(
            sender.clone(),
            Arc::clone(&stop),
            Duration::from_secs(self.settings.ping_interval.max(1)),
        )?;

        let mut dispatcher = Self::dispatcher();
        let mut context = ClientContext {
            sender,
            stop,
            draw: DrawHandler::new(Arc::clone(&self.registry), &self.settings.tuning.pipeline, presenter),
            negotiated: None,
            latency_ms: None,
            max_draws: self.settings.max_draws,
            server_disconnect: None,
        };
        let result = self.protocol.run(&mut dispatcher, &mut context);
        self.state = ConnectionState::Disconnected;
        if ping_thread.join().is_err() {
            warn!("ping スレッドがパニックしました");
        }
        context.draw.close();
        self.protocol.shutdown();
        result?;

        info!(
            "切断しました: draw {} (失敗 {}), 受信 {}",
            context.draw.draws(),
            context.draw.failures(),
            format_bytes(self.protocol.stats().input_bytes)
        );
        Ok(ClientSummary {
            draws: context.draw.draws(),
            failures: context.draw.failures(),
            latency_ms: context.latency_ms,
            negotiated: context.negotiated,
            server_disconnect: context.server_disconnect,
            stats: self.protocol.stats(),
            presenter: context.draw.into_presenter(),
        })
    }

    fn dispatcher() -> Dispatcher<ClientContext> {
        let mut dispatcher = Dispatcher::new();
        dispatcher.set_handler(PacketType::Hello, handle_hello);
        dispatcher.set_handler(PacketType::Draw, handle_draw);
        dispatcher.set_handler(PacketType::PingEcho, handle_ping_echo);
        dispatcher.set_handler(PacketType::Ping, handle_ping);
        dispatcher.set_handler(PacketType::Disconnect, handle_disconnect);
        dispatcher
    }
}

fn spawn_pinger(
    sender: PacketSender<TcpStream>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("ping".to_string()).spawn(move || {
        let mut waited = Duration::ZERO;
        while stop.load(Ordering::Acquire) {
            thread::sleep(STOP_POLL);
            waited += STOP_POLL;
            if waited < interval {
                continue;
            }
            waited = Duration::ZERO;
            if let Err(e) = sender.send(PacketType::Ping.message().with(current_time_millis())) {
                debug!("ping を送信できません: {}", e);
                break;
            }
        }
    })
}

fn handle_hello(ctx: &mut ClientContext, message: Message) -> Result<()> {
    let negotiated = ctx.sender.apply_peer_capabilities(message.map_arg(1)?);
    info!(
        "サーバー v{}: 圧縮={}, エンコーディング={:?}",
        negotiated.peer_version,
        negotiated.compressor.as_str(),
        negotiated.encodings
    );
    ctx.negotiated = Some(negotiated);
    Ok(())
}

fn handle_draw(ctx: &mut ClientContext, message: Message) -> Result<()> {
    let ack = ctx.draw.handle(message)?;
    ctx.sender.send(ack.to_message())?;
    if let Some(max) = ctx.max_draws {
        if ctx.draw.draws() >= max {
            info!("{} 個の draw を受信したので切断します", max);
            ctx.sender.send_disconnect(ErrorCode::Success, "完了")?;
            ctx.stop.store(false, Ordering::Release);
        }
    }
    Ok(())
}

fn handle_ping_echo(ctx: &mut ClientContext, message: Message) -> Result<()> {
    let sent = message.uint_arg(1)?;
    let latency = current_time_millis().saturating_sub(sent);
    match message.uint_arg(2) {
        Ok(server_time) => debug!("レイテンシ: {}ms (サーバー時刻 {})", latency, format_timestamp(server_time)),
        Err(_) => debug!("レイテンシ: {}ms", latency),
    }
    ctx.latency_ms = Some(latency);
    Ok(())
}

fn handle_ping(ctx: &mut ClientContext, message: Message) -> Result<()> {
    let echo = PacketType::PingEcho
        .message()
        .with(message.uint_arg(1)?)
        .with(current_time_millis());
    ctx.sender.send(echo)
}

fn handle_disconnect(ctx: &mut ClientContext, message: Message) -> Result<()> {
    let code = ErrorCode::from_i64(message.int_arg(1).unwrap_or(0));
    let reason = message.str_arg(2).unwrap_or("").to_string();
    if code == ErrorCode::Success {
        info!("サーバーが切断しました: {}", reason);
    } else {
        warn!("サーバーが切断しました: {} ({})", code.as_str(), reason);
    }
    ctx.server_disconnect = Some((code, reason));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::FramebufferPresenter;
    use remote_display_rs_common::codec::{DamageAck, DrawPacket, ImageWrapper, PixelFormat, RegionEncoder};
    use remote_display_rs_common::config::PipelineConfig;
    use std::net::TcpListener;

    /// 指定した型のメッセージが来るまで読む（ping は読み捨てる）
    fn read_until(protocol: &mut Protocol<TcpStream, TcpStream>, wanted: PacketType) -> Message {
        loop {
            let message = protocol.read_message().unwrap().expect("接続が閉じられました");
            if PacketType::from(&message) == wanted {
                return message;
            }
        }
    }

    fn solid_draw(sequence: u64) -> DrawPacket {
        let registry = Arc::new(CodecRegistry::with_defaults(&PipelineConfig::default()).unwrap());
        let pixels = [40u8, 80, 120, 0].repeat(8 * 6);
        let image = ImageWrapper::from_packed(0, 0, 8, 6, PixelFormat::BGRX, pixels, 32).unwrap();
        let mut encoder = RegionEncoder::new(registry, "rgb", &PipelineConfig::default());
        let encoded = encoder.encode(image).unwrap();
        DrawPacket::new(1, 2, 3, 8, 6, sequence, encoded)
    }

    #[test]
    fn test_client_decodes_draw_and_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut protocol = Protocol::from_tcp(stream, ProtocolOptions::default()).unwrap();
            let hello = read_until(&mut protocol, PacketType::Hello);
            let negotiated = protocol.apply_hello(&hello).unwrap();
            protocol.send_hello(&["rgb".to_string()]).unwrap();
            protocol.send(solid_draw(1).to_message()).unwrap();
            let ack = read_until(&mut protocol, PacketType::DamageSequence);
            let bye = read_until(&mut protocol, PacketType::Disconnect);
            protocol.shutdown();
            (negotiated, DamageAck::from_message(&ack).unwrap(), bye)
        });

        let settings = ClientSettings {
            port,
            encodings: vec!["rgb".to_string()],
            max_draws: Some(1),
            ..ClientSettings::default()
        };
        let client = RemoteDisplayClient::connect(settings).unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        let summary = client.run(Box::new(FramebufferPresenter::new())).unwrap();

        let (negotiated, ack, bye) = server.join().unwrap();
        assert_eq!(negotiated.encodings, vec!["rgb".to_string()]);
        assert!(ack.is_success(), "{}", ack.message);
        assert_eq!((ack.sequence, ack.width, ack.height), (1, 8, 6));
        assert_eq!(ErrorCode::from_i64(bye.int_arg(1).unwrap()), ErrorCode::Success);

        assert_eq!((summary.draws, summary.failures), (1, 0));
        assert!(summary.negotiated.is_some());
        let fb = summary.presenter.snapshot().unwrap();
        assert_eq!((fb.width(), fb.height()), (10, 9));
        assert_eq!(fb.rgb_at(2, 3).unwrap(), [120, 80, 40]);
        assert_eq!(fb.rgb_at(0, 0).unwrap(), [0, 0, 0]);
    }

    #[test]
    fn test_records_server_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut protocol = Protocol::from_tcp(stream, ProtocolOptions::default()).unwrap();
            read_until(&mut protocol, PacketType::Hello);
            protocol
                .send_disconnect(ErrorCode::UnsupportedFormat, "共通のエンコーディングがありません")
                .unwrap();
            protocol.shutdown();
        });

        let settings = ClientSettings {
            port,
            ..ClientSettings::default()
        };
        let summary = RemoteDisplayClient::connect(settings)
            .unwrap()
            .run(Box::new(FramebufferPresenter::new()))
            .unwrap();
        server.join().unwrap();

        let (code, _) = summary.server_disconnect.unwrap();
        assert_eq!(code, ErrorCode::UnsupportedFormat);
        assert_eq!(summary.draws, 0);
        assert!(summary.presenter.snapshot().is_none());
    }

    #[test]
    fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let settings = ClientSettings {
            port,
            ..ClientSettings::default()
        };
        assert!(matches!(RemoteDisplayClient::connect(settings), Err(ClientError::Connection(_))));
    }
}
