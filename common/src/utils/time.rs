//! 時間ユーティリティ
//!
//! 時間処理に関連するユーティリティ機能を提供します。

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, Utc};

/// 現在のUNIXタイムスタンプ（ミリ秒）を取得
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// タイムスタンプ（ミリ秒）をローカル時刻の文字列に変換
pub fn format_timestamp(timestamp_millis: u64) -> String {
    let seconds = (timestamp_millis / 1000) as i64;
    let nanos = ((timestamp_millis % 1000) * 1_000_000) as u32;
    match DateTime::<Utc>::from_timestamp(seconds, nanos) {
        Some(dt) => dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => "Invalid timestamp".to_string(),
    }
}

/// タイムアウト処理を提供するラッパー
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    start: Instant,
    duration: Duration,
}

impl Timeout {
    /// 新しいタイムアウトを作成
    pub fn new(duration: Duration) -> Self {
        Self {
            start: Instant::now(),
            duration,
        }
    }

    /// タイムアウトしたかどうか確認
    pub fn is_elapsed(&self) -> bool {
        self.start.elapsed() >= self.duration
    }

    /// タイムアウトまでの残り時間を取得
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.start.elapsed())
    }

    /// タイムアウトをリセット
    pub fn reset(&mut self) {
        self.start = Instant::now();
    }
}

/// 経過時間を測定するタイマー
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// 新しいタイマーを作成して開始
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// 経過時間を取得
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// 経過時間をマイクロ秒で取得
    pub fn elapsed_micros(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout() {
        let mut timeout = Timeout::new(Duration::from_millis(20));
        assert!(!timeout.is_elapsed());
        std::thread::sleep(Duration::from_millis(30));
        assert!(timeout.is_elapsed());
        assert_eq!(timeout.remaining(), Duration::ZERO);
        timeout.reset();
        assert!(!timeout.is_elapsed());
    }

    #[test]
    fn test_format_timestamp() {
        assert_ne!(format_timestamp(current_time_millis()), "Invalid timestamp");
    }
}
