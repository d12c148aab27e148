//! 画像パイプライン
//!
//! 画素バッファのデータモデル、色空間変換、コーデックの登録と選択、
//! エンコーダとデコーダのライフサイクルを扱います。
//!
//! サーバー側の流れ: キャプチャした領域 → 色空間変換（必要な場合）→
//! エンコード → `draw` パケット。クライアント側はその逆です。

pub mod csc;
pub mod image;
pub mod pipeline;
pub mod pixel_format;
pub mod planar;
pub mod pool;
pub mod registry;
pub mod rgb;
#[cfg(feature = "image-codecs")]
pub mod still;
pub mod video;

pub use self::image::ImageWrapper;
pub use csc::{ColorspaceConverter, CscOptions, CscParams};
pub use pipeline::{DamageAck, DrawPacket, RegionDecoder, RegionEncoder};
pub use pixel_format::PixelFormat;
pub use pool::{JobHandle, WorkerPool};
pub use registry::{CodecRegistry, CodecSpec, ScoreTarget};
pub use video::{CodecOptions, CodecState, Decoder, EncodedImage, Encoder, EncoderOptions};
