//! Conversion between 32-bit words and single-precision floats.
//!
//! Float opcodes compute in `f64` and narrow the result back to `f32`
//! when it is stored, so every stored value is a valid single.

/// Bit pattern stored for every NaN result.
pub const NAN_BITS: u32 = 0x7F80_0001;

pub const POS_INF_BITS: u32 = 0x7F80_0000;
pub const NEG_INF_BITS: u32 = 0xFF80_0000;
pub const ONE_BITS: u32 = 0x3F80_0000;
pub const MINUS_ONE_BITS: u32 = 0xBF80_0000;

/// Interprets a word as an IEEE-754 single.
pub fn decode(val: u32) -> f64 {
    f32::from_bits(val) as f64
}

/// Narrows a host float to single precision and returns its bits.
pub fn encode(val: f64) -> u32 {
    if val.is_nan() {
        return NAN_BITS;
    }
    (val as f32).to_bits()
}

pub fn is_nan(val: u32) -> bool {
    val & 0x7F80_0000 == 0x7F80_0000 && val & 0x007F_FFFF != 0
}

pub fn is_inf(val: u32) -> bool {
    val == POS_INF_BITS || val == NEG_INF_BITS
}

/// `ftonumz`: truncate toward zero, saturating at the signed 32-bit range.
pub fn to_int_truncate(val: u32) -> u32 {
    let f = decode(val);
    let res = if val & 0x8000_0000 == 0 {
        if f.is_nan() || f.is_infinite() || f > i32::MAX as f64 {
            i32::MAX
        } else {
            f.floor() as i32
        }
    } else if f.is_nan() || f.is_infinite() || f < i32::MIN as f64 {
        i32::MIN
    } else {
        f.ceil() as i32
    };
    res as u32
}

/// `ftonumn`: round half away from zero, saturating.
pub fn to_int_round(val: u32) -> u32 {
    let f = decode(val);
    let res = if val & 0x8000_0000 == 0 {
        if f.is_nan() || f.is_infinite() {
            i32::MAX
        } else {
            let r = f.round();
            if r > i32::MAX as f64 {
                i32::MAX
            } else {
                r as i32
            }
        }
    } else if f.is_nan() || f.is_infinite() {
        i32::MIN
    } else {
        let r = f.round();
        if r < i32::MIN as f64 {
            i32::MIN
        } else {
            r as i32
        }
    };
    res as u32
}

/// `fmod`: returns (remainder, quotient). A zero quotient keeps the sign
/// implied by the operands.
pub fn modulo(a: u32, b: u32) -> (u32, u32) {
    let fa = decode(a);
    let fb = decode(b);
    let rem = fa % fb;
    let mut quo = encode((fa - rem) / fb);
    if quo == 0 || quo == 0x8000_0000 {
        quo = (a ^ b) & 0x8000_0000;
    }
    (encode(rem), quo)
}

pub fn pow(a: u32, b: u32) -> u32 {
    if a == ONE_BITS {
        return ONE_BITS;
    }
    if a == MINUS_ONE_BITS && is_inf(b) {
        return ONE_BITS;
    }
    encode(decode(a).powf(decode(b)))
}

/// `jfeq` comparison: `a` and `b` are equal when they differ by no more
/// than the magnitude of `delta`.
pub fn approx_eq(a: u32, b: u32, delta: u32) -> bool {
    if is_nan(delta) {
        return false;
    }
    if is_inf(a) && is_inf(b) {
        return a == b;
    }
    let eps = decode(delta & 0x7FFF_FFFF);
    let diff = decode(b) - decode(a);
    diff <= eps && diff >= -eps
}
