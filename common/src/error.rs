//! エラー型定義
//!
//! ワイヤプロトコルと画像パイプラインで使用する共通エラー型を定義します。
//! プロトコル層のエラーは接続にとって致命的であり、画像パイプラインのエラーは
//! 呼び出し単位で報告されます（自動リトライは行いません）。

use std::fmt;
use std::io;
use thiserror::Error;

/// 共通エラー
#[derive(Error, Debug)]
pub enum Error {
    /// 入出力エラー
    #[error("I/Oエラー: {0}")]
    Io(#[from] io::Error),

    /// フレームプロトコル違反（不正なマジックバイト、フラグ、圧縮識別子など）
    #[error("フレームプロトコルエラー: {0}")]
    FrameProtocol(String),

    /// 構造化データのデコード失敗（切り詰め、不正な型タグなど）
    #[error("デコードエラー: {0}")]
    Decode(String),

    /// 登録されたコーデック仕様が存在しないフォーマットの組み合わせ
    #[error("サポートされていないフォーマット: {0}")]
    UnsupportedFormat(String),

    /// ネイティブコーデックが1フレームの処理に失敗した
    #[error("コーデックエラー: {0}")]
    CodecFailure(String),

    /// プレーンバッファがストライド×高さより小さい
    #[error("バッファサイズ不一致: {0}")]
    BufferSizeMismatch(String),

    /// 画素バッファやコーデックバッファの確保に失敗した
    #[error("リソース不足: {0}")]
    ResourceExhaustion(String),

    /// 解放済みバッファへのアクセス
    #[error("解放済みのバッファです: {0}")]
    BufferFreed(String),

    /// 状態遷移の誤用（未初期化やクローズ済みのインスタンスの使用）
    #[error("無効な状態: {0}")]
    InvalidState(String),

    /// 無効なパラメータ
    #[error("無効なパラメータ: {0}")]
    InvalidParameter(String),

    /// 設定エラー
    #[error("設定エラー: {0}")]
    Config(String),

    /// タイムアウト
    #[error("タイムアウト: {0}")]
    Timeout(String),

    /// 接続はすでに閉じられている
    #[error("接続が閉じられました: {0}")]
    ConnectionClosed(String),
}

impl Error {
    /// 対応するエラーコードを取得
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) => ErrorCode::IoError,
            Error::FrameProtocol(_) => ErrorCode::FrameProtocolError,
            Error::Decode(_) => ErrorCode::DecodeError,
            Error::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            Error::CodecFailure(_) => ErrorCode::CodecFailure,
            Error::BufferSizeMismatch(_) => ErrorCode::BufferSizeMismatch,
            Error::ResourceExhaustion(_) => ErrorCode::ResourceExhaustion,
            Error::BufferFreed(_) => ErrorCode::BufferFreed,
            Error::InvalidState(_) => ErrorCode::InvalidState,
            Error::InvalidParameter(_) => ErrorCode::InvalidParameter,
            Error::Config(_) => ErrorCode::ConfigError,
            Error::Timeout(_) => ErrorCode::TimeoutError,
            Error::ConnectionClosed(_) => ErrorCode::ConnectionClosed,
        }
    }

    /// 接続を閉じるべきエラーかどうか
    ///
    /// フレーム境界が信頼できなくなったエラーは常に致命的です。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::FrameProtocol(_)
                | Error::Decode(_)
                | Error::Timeout(_)
                | Error::ConnectionClosed(_)
        )
    }

    /// 一時的なリソース不足かどうか（呼び出し側はバックプレッシャーをかける）
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Error::ResourceExhaustion(_))
    }
}

/// エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// 成功
    Success = 0,
    /// I/Oエラー
    IoError = 2,
    /// フレームプロトコルエラー
    FrameProtocolError = 3,
    /// デコードエラー
    DecodeError = 4,
    /// サポートされていないフォーマット
    UnsupportedFormat = 5,
    /// コーデックエラー
    CodecFailure = 6,
    /// バッファサイズ不一致
    BufferSizeMismatch = 7,
    /// リソース不足
    ResourceExhaustion = 8,
    /// 解放済みバッファ
    BufferFreed = 9,
    /// 無効な状態
    InvalidState = 10,
    /// 無効なパラメータ
    InvalidParameter = 11,
    /// 設定エラー
    ConfigError = 12,
    /// タイムアウト
    TimeoutError = 13,
    /// 接続終了
    ConnectionClosed = 14,
    /// その他のエラー
    Other = 99,
}

impl ErrorCode {
    /// エラーコードから文字列表現を取得
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::IoError => "IoError",
            ErrorCode::FrameProtocolError => "FrameProtocolError",
            ErrorCode::DecodeError => "DecodeError",
            ErrorCode::UnsupportedFormat => "UnsupportedFormat",
            ErrorCode::CodecFailure => "CodecFailure",
            ErrorCode::BufferSizeMismatch => "BufferSizeMismatch",
            ErrorCode::ResourceExhaustion => "ResourceExhaustion",
            ErrorCode::BufferFreed => "BufferFreed",
            ErrorCode::InvalidState => "InvalidState",
            ErrorCode::InvalidParameter => "InvalidParameter",
            ErrorCode::ConfigError => "ConfigError",
            ErrorCode::TimeoutError => "TimeoutError",
            ErrorCode::ConnectionClosed => "ConnectionClosed",
            ErrorCode::Other => "Other",
        }
    }

    /// 数値からエラーコードを取得
    pub fn from_i64(code: i64) -> Self {
        match code {
            0 => ErrorCode::Success,
            2 => ErrorCode::IoError,
            3 => ErrorCode::FrameProtocolError,
            4 => ErrorCode::DecodeError,
            5 => ErrorCode::UnsupportedFormat,
            6 => ErrorCode::CodecFailure,
            7 => ErrorCode::BufferSizeMismatch,
            8 => ErrorCode::ResourceExhaustion,
            9 => ErrorCode::BufferFreed,
            10 => ErrorCode::InvalidState,
            11 => ErrorCode::InvalidParameter,
            12 => ErrorCode::ConfigError,
            13 => ErrorCode::TimeoutError,
            14 => ErrorCode::ConnectionClosed,
            _ => ErrorCode::Other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.as_str(), *self as i32)
    }
}

/// 結果型のエイリアス
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [
            ErrorCode::Success,
            ErrorCode::FrameProtocolError,
            ErrorCode::DecodeError,
            ErrorCode::CodecFailure,
            ErrorCode::ConnectionClosed,
        ] {
            assert_eq!(ErrorCode::from_i64(code as i64), code);
        }
        assert_eq!(ErrorCode::from_i64(12345), ErrorCode::Other);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::FrameProtocol("bad magic".into()).is_fatal());
        assert!(Error::Decode("truncated".into()).is_fatal());
        assert!(!Error::CodecFailure("frame dropped".into()).is_fatal());
        assert!(!Error::UnsupportedFormat("RGB->XYZ".into()).is_fatal());
        assert!(Error::ResourceExhaustion("oom".into()).is_resource_exhaustion());
    }
}
