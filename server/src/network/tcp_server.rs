//! TCP サーバー実装
//!
//! リスナースレッドで接続を受け付け、クライアントごとにセッションスレッドを
//! 起動します。

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use remote_display_rs_common::codec::CodecRegistry;

use super::session::ClientSession;
use super::SessionInfo;
use crate::capture::CaptureSource;
use crate::config::ServerSettings;
use crate::error::ServerError;

/// セッションごとのキャプチャ元を作る関数
pub type CaptureFactory =
    Arc<dyn Fn(&ServerSettings) -> Result<Box<dyn CaptureSource>, ServerError> + Send + Sync>;

/// 接続中のセッション
struct SessionEntry {
    client_addr: String,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionEntry>>>;

/// TCP サーバー
pub struct TcpServer {
    settings: ServerSettings,
    registry: Arc<CodecRegistry>,
    capture_factory: CaptureFactory,
    listener_thread: Option<thread::JoinHandle<()>>,
    sessions: SessionMap,
    running: Arc<AtomicBool>,
    server_addr: Option<SocketAddr>,
}

impl TcpServer {
    /// 新しいTCPサーバーを作成
    pub fn new(settings: ServerSettings, capture_factory: CaptureFactory) -> Result<Self, ServerError> {
        settings.validate()?;
        let registry = CodecRegistry::with_defaults(&settings.tuning.pipeline)?;
        Ok(Self {
            settings,
            registry: Arc::new(registry),
            capture_factory,
            listener_thread: None,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            server_addr: None,
        })
    }

    /// 待ち受けを開始
    pub fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.server_addr.filter(|_| self.is_running()) {
            return Ok(addr);
        }

        let bind_addr = self.settings.bind_addr();
        let listener = TcpListener::bind(&bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.server_addr = Some(local_addr);
        self.running.store(true, Ordering::Release);

        let settings = self.settings.clone();
        let registry = Arc::clone(&self.registry);
        let factory = Arc::clone(&self.capture_factory);
        let sessions = Arc::clone(&self.sessions);
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new().name("tcp-listener".to_string()).spawn(move || {
            info!("TCPサーバー起動: {}", local_addr);
            while running.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        reap_finished(&sessions);
                        let count = sessions.lock().len();
                        if count >= settings.network.max_connections {
                            warn!("最大接続数到達: {}/{} ({} を拒否)", count, settings.network.max_connections, addr);
                            drop(stream);
                            continue;
                        }
                        if let Err(e) = spawn_session(stream, addr, &settings, &registry, &factory, &sessions) {
                            error!("セッションを開始できません ({}): {}", addr, e);
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        error!("接続受付エラー: {}", e);
                        thread::sleep(Duration::from_millis(500));
                    }
                }
            }
            info!("TCPサーバー停止");
        })?;
        self.listener_thread = Some(handle);
        Ok(local_addr)
    }

    /// 待ち受けを止め、すべてのセッションを閉じる
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.listener_thread.take() {
            if handle.join().is_err() {
                error!("リスナースレッドの終了に失敗しました");
            }
        }

        let entries: Vec<SessionEntry> = self.sessions.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            entry.stop.store(false, Ordering::Release);
        }
        for mut entry in entries {
            if let Some(handle) = entry.thread.take() {
                if handle.join().is_err() {
                    error!("セッションスレッドの終了に失敗しました: {}", entry.client_addr);
                }
            }
        }
        self.server_addr = None;
    }

    /// 起動中かどうか
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 接続中のクライアント数
    pub fn connected_clients(&self) -> usize {
        reap_finished(&self.sessions);
        self.sessions.lock().len()
    }

    /// 待ち受けアドレス
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// コーデックレジストリ
    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.registry
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

/// 終了したセッションを一覧から外す
fn reap_finished(sessions: &SessionMap) {
    let mut sessions = sessions.lock();
    sessions.retain(|id, entry| {
        let finished = entry.thread.as_ref().map_or(true, |handle| handle.is_finished());
        if finished {
            if let Some(handle) = entry.thread.take() {
                let _ = handle.join();
            }
            debug!("セッションを回収しました: {}", id);
        }
        !finished
    });
}

fn spawn_session(
    stream: TcpStream,
    addr: SocketAddr,
    settings: &ServerSettings,
    registry: &Arc<CodecRegistry>,
    factory: &CaptureFactory,
    sessions: &SessionMap,
) -> Result<(), ServerError> {
    // accept したソケットはリスナーの非ブロッキング設定を引き継ぐことがある
    stream.set_nonblocking(false)?;
    let info = SessionInfo::new(addr.to_string());
    let id = info.id.clone();
    let source = factory(settings)?;
    let session = ClientSession::new(info, stream, settings.clone(), Arc::clone(registry))?;
    let stop = session.stop_handle();

    let thread_name = format!("session-{}", session.info().short_id());
    let handle = thread::Builder::new().name(thread_name).spawn(move || {
        if let Err(e) = session.run(source) {
            warn!(target: "session", "セッションエラー ({}): {}", addr, e);
        }
    })?;

    sessions.lock().insert(
        id,
        SessionEntry {
            client_addr: addr.to_string(),
            stop,
            thread: Some(handle),
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TestPatternSource;
    use remote_display_rs_common::codec::DrawPacket;
    use remote_display_rs_common::protocol::{PacketType, Protocol, ProtocolOptions};
    use remote_display_rs_common::ErrorCode;

    fn test_settings() -> ServerSettings {
        let mut settings = ServerSettings::default();
        settings.network.bind_address = "127.0.0.1".to_string();
        settings.network.port = 0;
        settings.network.max_connections = 1;
        settings.capture.width = 64;
        settings.capture.height = 48;
        settings.capture.frame_rate = 20;
        settings.tuning.pipeline.max_threads = 2;
        settings
    }

    fn pattern_factory() -> CaptureFactory {
        Arc::new(|settings: &ServerSettings| -> Result<Box<dyn CaptureSource>, ServerError> {
            let source = TestPatternSource::new(settings.capture.width, settings.capture.height)?;
            Ok(Box::new(source))
        })
    }

    #[test]
    fn test_session_sends_draws_and_answers_ping() {
        let mut server = TcpServer::new(test_settings(), pattern_factory()).unwrap();
        let addr = server.start().unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = Protocol::from_tcp(stream, ProtocolOptions::default()).unwrap();
        client.send_hello(&["rgb".to_string()]).unwrap();
        client.send(PacketType::Ping.message().with(42u64)).unwrap();

        let mut got_hello = false;
        let mut got_echo = false;
        let mut draw = None;
        while !(got_hello && got_echo && draw.is_some()) {
            let message = client.read_message().unwrap().unwrap();
            match PacketType::from(&message) {
                PacketType::Hello => {
                    client.apply_hello(&message).unwrap();
                    got_hello = true;
                }
                PacketType::PingEcho => {
                    assert_eq!(message.uint_arg(1).unwrap(), 42);
                    got_echo = true;
                }
                PacketType::Draw => {
                    if draw.is_none() {
                        draw = Some(DrawPacket::from_message(message).unwrap());
                    }
                }
                other => panic!("予期しないパケット: {}", other),
            }
        }

        // 最初の draw は画面全体
        let draw = draw.unwrap();
        assert_eq!((draw.x, draw.y, draw.width, draw.height), (0, 0, 64, 48));
        assert_eq!(draw.encoding, "rgb");
        assert_eq!(server.connected_clients(), 1);

        client.send_disconnect(ErrorCode::Success, "終了").unwrap();
        client.shutdown();
        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.connected_clients(), 0);
    }

    #[test]
    fn test_no_common_encoding_disconnects() {
        let mut server = TcpServer::new(test_settings(), pattern_factory()).unwrap();
        let addr = server.start().unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let mut client = Protocol::from_tcp(stream, ProtocolOptions::default()).unwrap();
        client.send_hello(&["h264".to_string()]).unwrap();
        let disconnect = loop {
            let message = client.read_message().unwrap().unwrap();
            if PacketType::from(&message) == PacketType::Disconnect {
                break message;
            }
        };
        assert_eq!(
            ErrorCode::from_i64(disconnect.int_arg(1).unwrap()),
            ErrorCode::UnsupportedFormat
        );
        client.shutdown();
        server.stop();
    }
}
