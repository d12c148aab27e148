//! draw パケットの処理
//!
//! 受信した領域をデコードして提示し、`damage-sequence` で確認応答を返します。
//! 1 領域のデコード失敗は接続を閉じず、エラーの説明を確認応答に載せます。

use std::sync::Arc;

use log::{trace, warn};

use remote_display_rs_common::codec::{CodecRegistry, DamageAck, DrawPacket, RegionDecoder};
use remote_display_rs_common::config::PipelineConfig;
use remote_display_rs_common::protocol::Message;
use remote_display_rs_common::utils::time::Timer;
use remote_display_rs_common::Result;

use super::{Presenter, PRESENT_FORMAT};

/// draw パケットのハンドラ
pub struct DrawHandler {
    decoder: RegionDecoder,
    presenter: Box<dyn Presenter>,
    draws: u64,
    failures: u64,
}

impl DrawHandler {
    /// 新しいハンドラを作成
    pub fn new(registry: Arc<CodecRegistry>, config: &PipelineConfig, presenter: Box<dyn Presenter>) -> Self {
        Self {
            decoder: RegionDecoder::new(registry, PRESENT_FORMAT, config),
            presenter,
            draws: 0,
            failures: 0,
        }
    }

    /// draw メッセージを処理して確認応答を返す
    ///
    /// メッセージの形式が不正な場合だけエラーを返します。
    pub fn handle(&mut self, message: Message) -> Result<DamageAck> {
        let draw = DrawPacket::from_message(message)?;
        let timer = Timer::start();
        let outcome = self
            .decoder
            .decode(&draw)
            .and_then(|region| self.presenter.present(region));
        let decode_time_us = timer.elapsed_micros();
        self.draws += 1;

        let message = match outcome {
            Ok(()) => {
                trace!(
                    target: "codec",
                    "draw seq={} {} {}x{}+{}+{}: {}us",
                    draw.sequence,
                    draw.encoding,
                    draw.width,
                    draw.height,
                    draw.x,
                    draw.y,
                    decode_time_us
                );
                String::new()
            }
            Err(e) => {
                self.failures += 1;
                warn!(target: "codec", "draw seq={} ({}) を描画できません: {}", draw.sequence, draw.encoding, e);
                e.to_string()
            }
        };

        Ok(DamageAck {
            sequence: draw.sequence,
            wid: draw.wid,
            width: draw.width,
            height: draw.height,
            decode_time_us,
            message,
        })
    }

    /// 処理した draw の数
    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// 描画に失敗した draw の数
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// 提示先
    pub fn presenter(&self) -> &dyn Presenter {
        self.presenter.as_ref()
    }

    /// デコーダを閉じる
    pub fn close(&mut self) {
        self.decoder.close();
    }

    /// 提示先を取り出す
    pub fn into_presenter(self) -> Box<dyn Presenter> {
        self.presenter
    }
}
