//! BT.601 変換行列（固定小数点）
//!
//! 係数は 2^16 倍した整数で保持し、積和の後に丸めてシフトします。
//! 浮動小数点を使わないため、どのプラットフォームでも同じ結果になります。

/// 固定小数点のシフト量
pub const SHIFT: u32 = 16;

const ROUND: i64 = 1 << (SHIFT - 1);

#[inline]
fn clamp8(v: i64) -> u8 {
    v.clamp(0, 255) as u8
}

#[inline]
fn clamp16(v: i64) -> u16 {
    v.clamp(0, 65535) as u16
}

#[inline]
fn fixed(v: i64) -> i64 {
    (v + ROUND) >> SHIFT
}

/// RGB → YUV 行列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardMatrix {
    y: [i64; 3],
    u: [i64; 3],
    v: [i64; 3],
    /// 輝度オフセット（8 ビット換算）
    y_offset: i64,
}

impl ForwardMatrix {
    /// フルレンジ（Y: 0-255, UV: 0-255）
    ///
    /// 色差は最大係数 0.5 を使う。0.439 ではスタジオレンジの幅（16-240）にしか届かない。
    pub const FULL: ForwardMatrix = ForwardMatrix {
        y: [19595, 38470, 7471],
        u: [-11059, -21709, 32768],
        v: [32768, -27439, -5329],
        y_offset: 0,
    };

    /// スタジオレンジ（Y: 16-235, UV: 16-240）
    pub const STUDIO: ForwardMatrix = ForwardMatrix {
        y: [16829, 33039, 6416],
        u: [-9714, -19070, 28784],
        v: [28784, -24103, -4681],
        y_offset: 16,
    };

    pub fn for_range(full_range: bool) -> Self {
        if full_range {
            Self::FULL
        } else {
            Self::STUDIO
        }
    }

    #[inline]
    fn dot(c: &[i64; 3], r: i64, g: i64, b: i64) -> i64 {
        c[0] * r + c[1] * g + c[2] * b
    }

    /// 輝度
    #[inline]
    pub fn luma(&self, r: u8, g: u8, b: u8) -> u8 {
        let (r, g, b) = (r as i64, g as i64, b as i64);
        clamp8(fixed(Self::dot(&self.y, r, g, b)) + self.y_offset)
    }

    /// 色差 (U, V)
    #[inline]
    pub fn chroma(&self, r: u8, g: u8, b: u8) -> (u8, u8) {
        let (r, g, b) = (r as i64, g as i64, b as i64);
        (
            clamp8(fixed(Self::dot(&self.u, r, g, b)) + 128),
            clamp8(fixed(Self::dot(&self.v, r, g, b)) + 128),
        )
    }

    /// 16 ビット出力（入力は 8 ビットを 257 倍に拡張）
    #[inline]
    pub fn yuv16(&self, r: u8, g: u8, b: u8) -> (u16, u16, u16) {
        let (r, g, b) = (r as i64 * 257, g as i64 * 257, b as i64 * 257);
        (
            clamp16(fixed(Self::dot(&self.y, r, g, b)) + self.y_offset * 257),
            clamp16(fixed(Self::dot(&self.u, r, g, b)) + 32768),
            clamp16(fixed(Self::dot(&self.v, r, g, b)) + 32768),
        )
    }
}

/// YUV → RGB 行列
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InverseMatrix {
    y_scale: i64,
    y_offset: i64,
    r_v: i64,
    g_u: i64,
    g_v: i64,
    b_u: i64,
}

impl InverseMatrix {
    /// フルレンジ
    pub const FULL: InverseMatrix = InverseMatrix {
        y_scale: 65536,
        y_offset: 0,
        r_v: 91881,
        g_u: -22554,
        g_v: -46802,
        b_u: 116130,
    };

    /// スタジオレンジ
    pub const STUDIO: InverseMatrix = InverseMatrix {
        y_scale: 76309,
        y_offset: 16,
        r_v: 104597,
        g_u: -25675,
        g_v: -53279,
        b_u: 132201,
    };

    pub fn for_range(full_range: bool) -> Self {
        if full_range {
            Self::FULL
        } else {
            Self::STUDIO
        }
    }

    #[inline]
    fn apply(&self, y: i64, u: i64, v: i64) -> (i64, i64, i64) {
        let y = y * self.y_scale;
        (
            fixed(y + self.r_v * v),
            fixed(y + self.g_u * u + self.g_v * v),
            fixed(y + self.b_u * u),
        )
    }

    /// 8 ビット YUV → RGB
    #[inline]
    pub fn rgb(&self, y: u8, u: u8, v: u8) -> (u8, u8, u8) {
        let (r, g, b) = self.apply(y as i64 - self.y_offset, u as i64 - 128, v as i64 - 128);
        (clamp8(r), clamp8(g), clamp8(b))
    }

    /// 16 ビット YUV → 8 ビット RGB
    #[inline]
    pub fn rgb16(&self, y: u16, u: u16, v: u16) -> (u8, u8, u8) {
        let (r, g, b) = self.apply(
            y as i64 - self.y_offset * 257,
            u as i64 - 32768,
            v as i64 - 32768,
        );
        (narrow16(clamp16(r)), narrow16(clamp16(g)), narrow16(clamp16(b)))
    }
}

/// 8 ビット値を 16 ビットに拡張
#[inline]
pub fn widen8(v: u8) -> u16 {
    v as u16 * 257
}

/// 16 ビット値を 8 ビットに丸める
#[inline]
pub fn narrow16(v: u16) -> u8 {
    ((v as u32 + 128) / 257).min(255) as u8
}
