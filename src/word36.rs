//! 36-bit and 72-bit one's-complement words.
//!
//! Words are carried in the low-order bits of a `u64`. Every routine here
//! masks its result back down to 36 bits, so callers never see stray high
//! order bits. Negation is a bitwise NOT, and there are two zeroes.
use serde::{Deserialize, Serialize};
use std::fmt;

pub const BIT_MASK: u64 = 0o777_777_777_777;
pub const NEGATIVE_BIT: u64 = 0o400_000_000_000;
pub const POSITIVE_ZERO: u64 = 0;
pub const NEGATIVE_ZERO: u64 = BIT_MASK;

/// Largest magnitude representable in one word.
pub const MAX_MAGNITUDE: i64 = 0o377_777_777_777;

const BIT_MASK_72: u128 = (1u128 << 72) - 1;
const MAX_MAGNITUDE_72: i128 = (1i128 << 71) - 1;

pub fn is_negative(word: u64) -> bool {
    word & NEGATIVE_BIT != 0
}

pub fn is_zero(word: u64) -> bool {
    word == POSITIVE_ZERO || word == NEGATIVE_ZERO
}

pub fn negate(word: u64) -> u64 {
    !word & BIT_MASK
}

/// Converts a native integer to one's-complement form.
/// Magnitudes beyond 35 bits are truncated; use `fits` to check first.
pub fn from_i64(value: i64) -> u64 {
    if value < 0 {
        negate(value.unsigned_abs() & BIT_MASK)
    } else {
        value as u64 & BIT_MASK
    }
}

pub fn to_i64(word: u64) -> i64 {
    let word = word & BIT_MASK;
    if is_negative(word) {
        -(negate(word) as i64)
    } else {
        word as i64
    }
}

pub fn fits(value: i64) -> bool {
    value >= -MAX_MAGNITUDE && value <= MAX_MAGNITUDE
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AdditionResult {
    pub value: u64,
    pub carry: bool,
    pub overflow: bool,
}

/// One's-complement addition with end-around carry.
///
/// A negative zero sum is normalized to positive zero unless both addends
/// were themselves negative zero, which is how the hardware's subtractive
/// adder behaves.
pub fn add(addend1: u64, addend2: u64) -> AdditionResult {
    let a = addend1 & BIT_MASK;
    let b = addend2 & BIT_MASK;
    let raw = a + b;
    let carry = raw > BIT_MASK;
    let mut value = raw & BIT_MASK;
    if carry {
        value = (value + 1) & BIT_MASK;
    }
    if value == NEGATIVE_ZERO && a != b {
        value = POSITIVE_ZERO;
    }

    let overflow = is_negative(a) == is_negative(b) && is_negative(value) != is_negative(a);
    AdditionResult { value, carry, overflow }
}

/// Identifies a sub-range of a 36-bit word. Bit 0 is the most significant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub starting_bit: u32,
    pub field_size: u32,
}

impl FieldDescriptor {
    /// The whole word.
    pub const W: FieldDescriptor = FieldDescriptor { starting_bit: 0, field_size: 36 };

    pub fn new(starting_bit: u32, field_size: u32) -> Self {
        FieldDescriptor { starting_bit, field_size }
    }

    pub fn is_valid(&self) -> bool {
        self.field_size >= 1 && self.field_size <= 36 && self.starting_bit + self.field_size <= 36
    }

    pub fn mask(&self) -> u64 {
        if self.field_size >= 36 {
            BIT_MASK
        } else {
            (1u64 << self.field_size) - 1
        }
    }

    pub fn shift(&self) -> u32 {
        36 - (self.starting_bit + self.field_size)
    }

    /// Pulls the field out of a word as an unsigned quantity.
    pub fn extract(&self, word: u64) -> u64 {
        (word >> self.shift()) & self.mask()
    }

    /// Widens a field value to 36 bits, propagating the field's top bit.
    pub fn sign_extend(&self, field: u64) -> u64 {
        if self.field_size < 36 && field & (1u64 << (self.field_size - 1)) != 0 {
            field | (!self.mask() & BIT_MASK)
        } else {
            field
        }
    }
}

impl fmt::Display for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}:{}]", self.starting_bit, self.field_size)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Integration {
    pub value: u64,
    pub truncated: bool,
}

/// Adds `addend` into the field of `word` described by `fd`.
///
/// The field is sign-extended from its own width before the addition. A
/// positive sum is truncated when it has bits above the field; a negative
/// one when any bit above the field is clear. Only the low order bits are
/// kept either way. Bits outside the field are never disturbed.
pub fn integrate(word: u64, fd: FieldDescriptor, addend: i64) -> Integration {
    let word = word & BIT_MASK;
    if addend == 0 {
        return Integration { value: word, truncated: false };
    }

    let mask = fd.mask();
    let shift = fd.shift();

    let field = fd.sign_extend(fd.extract(word));
    let sum = add(field, from_i64(addend));
    let low = sum.value & mask;
    let spills = if sum.value & NEGATIVE_BIT == 0 {
        (sum.value & !mask & BIT_MASK) != 0
    } else {
        (sum.value | mask) != BIT_MASK
    };
    let truncated = !fits(addend) || sum.overflow || spills;

    let value = (word & !(mask << shift) & BIT_MASK) | (low << shift);
    Integration { value, truncated }
}

/// A 72-bit one's-complement quantity held as two 36-bit words, most
/// significant first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct DoubleWord36 {
    pub words: [u64; 2],
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DoubleResult {
    pub value: DoubleWord36,
    pub overflow: bool,
}

impl DoubleWord36 {
    pub const POSITIVE_ZERO: DoubleWord36 = DoubleWord36 { words: [0, 0] };
    pub const NEGATIVE_ZERO: DoubleWord36 = DoubleWord36 { words: [BIT_MASK, BIT_MASK] };

    pub fn new(high: u64, low: u64) -> Self {
        DoubleWord36 { words: [high & BIT_MASK, low & BIT_MASK] }
    }

    /// Sign-extends a single word into 72 bits.
    pub fn from_word(word: u64) -> Self {
        let word = word & BIT_MASK;
        let high = if is_negative(word) { BIT_MASK } else { 0 };
        DoubleWord36 { words: [high, word] }
    }

    pub fn from_i64(value: i64) -> Self {
        DoubleWord36::from_i128(value as i128).value
    }

    pub fn from_i128(value: i128) -> DoubleResult {
        let overflow = value > MAX_MAGNITUDE_72 || value < -MAX_MAGNITUDE_72;
        let magnitude = value.unsigned_abs() & (BIT_MASK_72 >> 1);
        let bits = if value < 0 { !magnitude & BIT_MASK_72 } else { magnitude };
        DoubleResult { value: DoubleWord36::from_bits(bits), overflow }
    }

    fn from_bits(bits: u128) -> Self {
        let bits = bits & BIT_MASK_72;
        DoubleWord36 { words: [(bits >> 36) as u64, (bits as u64) & BIT_MASK] }
    }

    fn bits(&self) -> u128 {
        ((self.words[0] as u128) << 36) | self.words[1] as u128
    }

    pub fn is_negative(&self) -> bool {
        is_negative(self.words[0])
    }

    pub fn is_zero(&self) -> bool {
        *self == DoubleWord36::POSITIVE_ZERO || *self == DoubleWord36::NEGATIVE_ZERO
    }

    pub fn high(&self) -> u64 {
        self.words[0]
    }

    pub fn low(&self) -> u64 {
        self.words[1]
    }

    pub fn to_i128(&self) -> i128 {
        let bits = self.bits();
        if self.is_negative() {
            -((!bits & BIT_MASK_72) as i128)
        } else {
            bits as i128
        }
    }

    /// True when the high-order word holds nothing but the sign of the low
    /// order word, so the value can be carried in a single word.
    pub fn fits_in_word(&self) -> bool {
        let value = self.to_i128();
        value >= -(MAX_MAGNITUDE as i128) && value <= MAX_MAGNITUDE as i128
    }

    /// The value as a single signed word, or `None` if it needs 72 bits.
    pub fn to_i64(&self) -> Option<i64> {
        if self.fits_in_word() {
            Some(self.to_i128() as i64)
        } else {
            None
        }
    }

    /// The value reduced to one 36-bit word (low-order bits). For values that
    /// fit in a word this is exact, negative zero included.
    pub fn to_word(&self) -> u64 {
        self.words[1]
    }

    pub fn negate(&self) -> Self {
        DoubleWord36::from_bits(!self.bits())
    }

    pub fn add(&self, other: &DoubleWord36) -> DoubleResult {
        let sum = self.to_i128() + other.to_i128();
        let mut result = DoubleWord36::from_i128(sum);
        if sum == 0 && self.is_zero() && other.is_zero() && self.is_negative() && other.is_negative() {
            result.value = DoubleWord36::NEGATIVE_ZERO;
        }
        result
    }

    pub fn subtract(&self, other: &DoubleWord36) -> DoubleResult {
        self.add(&other.negate())
    }

    pub fn multiply(&self, other: &DoubleWord36) -> DoubleResult {
        match self.to_i128().checked_mul(other.to_i128()) {
            Some(product) => DoubleWord36::from_i128(product),
            None => DoubleResult { value: DoubleWord36::POSITIVE_ZERO, overflow: true },
        }
    }

    /// Returns (quotient, remainder), or `None` when dividing by zero.
    pub fn divide(&self, other: &DoubleWord36) -> Option<(DoubleWord36, DoubleWord36)> {
        let divisor = other.to_i128();
        if divisor == 0 {
            return None;
        }
        let dividend = self.to_i128();
        Some((
            DoubleWord36::from_i128(dividend / divisor).value,
            DoubleWord36::from_i128(dividend % divisor).value,
        ))
    }

    pub fn and(&self, other: &DoubleWord36) -> Self {
        DoubleWord36::from_bits(self.bits() & other.bits())
    }

    pub fn or(&self, other: &DoubleWord36) -> Self {
        DoubleWord36::from_bits(self.bits() | other.bits())
    }

    pub fn xor(&self, other: &DoubleWord36) -> Self {
        DoubleWord36::from_bits(self.bits() ^ other.bits())
    }

    pub fn not(&self) -> Self {
        self.negate()
    }

    /// Logical shift; positive counts shift left, negative counts shift right.
    pub fn shift(&self, count: i64) -> Self {
        if count >= 72 || count <= -72 {
            DoubleWord36::POSITIVE_ZERO
        } else if count >= 0 {
            DoubleWord36::from_bits(self.bits() << count)
        } else {
            DoubleWord36::from_bits(self.bits() >> (-count))
        }
    }
}

impl fmt::Display for DoubleWord36 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.words[0] == 0 {
            write!(f, "{:012o}", self.words[1])
        } else {
            write!(f, "{:012o}{:012o}", self.words[0], self.words[1])
        }
    }
}

pub const ASCII_BLANK: u64 = 0o040;
pub const FIELDATA_BLANK: u64 = 0o05;

pub const ASCII_FROM_FIELDATA: [char; 64] = [
    '@', '[', ']', '#', '^', ' ', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J',
    'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z',
    ')', '-', '+', '<', '=', '>', '&', '$', '*', '(', '%', ':', '?', '!', ',', '\\',
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', '\'', ';', '/', '.', '"', '_',
];

/// Fieldata code for a character; anything without a Fieldata glyph becomes
/// a blank.
pub fn fieldata_from_char(ch: char) -> u64 {
    let upper = ch.to_ascii_uppercase();
    ASCII_FROM_FIELDATA
        .iter()
        .position(|&c| c == upper)
        .map(|p| p as u64)
        .unwrap_or(FIELDATA_BLANK)
}

/// Packs text four 9-bit characters per word, blank-filling the last word.
pub fn pack_ascii(text: &str) -> Vec<u64> {
    pack(text.chars().map(|c| (c as u64) & 0o777), 4, 9, ASCII_BLANK)
}

/// Packs text six 6-bit Fieldata characters per word, blank-filling the last
/// word.
pub fn pack_fieldata(text: &str) -> Vec<u64> {
    pack(text.chars().map(fieldata_from_char), 6, 6, FIELDATA_BLANK)
}

fn pack<I: Iterator<Item = u64>>(codes: I, per_word: usize, bits: u32, blank: u64) -> Vec<u64> {
    let codes: Vec<u64> = codes.collect();
    let mut words = Vec::with_capacity((codes.len() + per_word - 1) / per_word);
    for chunk in codes.chunks(per_word) {
        let mut word = 0u64;
        for cx in 0..per_word {
            word = (word << bits) | chunk.get(cx).copied().unwrap_or(blank);
        }
        words.push(word);
    }
    words
}

/// Errors raised when a floating point value will not fit the word format.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FloatError {
    CharacteristicOverflow,
    CharacteristicUnderflow,
}

impl fmt::Display for FloatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FloatError::CharacteristicOverflow => write!(f, "Characteristic overflow"),
            FloatError::CharacteristicUnderflow => write!(f, "Characteristic underflow"),
        }
    }
}

// Splits a finite, non-zero value into (negative, exponent, 53-bit mantissa)
// such that |value| = mantissa / 2^53 * 2^exponent with the mantissa's top bit
// set.
fn decompose(value: f64) -> Option<(bool, i32, u64)> {
    if value == 0.0 || !value.is_normal() {
        return None;
    }
    let bits = value.to_bits();
    let negative = bits >> 63 != 0;
    let exponent = ((bits >> 52) & 0x7ff) as i32 - 1022;
    let mantissa = (bits & ((1u64 << 52) - 1)) | (1u64 << 52);
    Some((negative, exponent, mantissa))
}

/// Single precision: sign(1) characteristic(8, bias 128) mantissa(27).
/// Negative values are the one's complement of the positive encoding.
pub fn float_to_word(value: f64) -> Result<u64, FloatError> {
    if value.is_infinite() || value.is_nan() {
        return Err(FloatError::CharacteristicOverflow);
    }
    let (negative, exponent, mantissa) = match decompose(value) {
        Some(parts) => parts,
        None if value == 0.0 => return Ok(if value.is_sign_negative() { NEGATIVE_ZERO } else { 0 }),
        None => return Err(FloatError::CharacteristicUnderflow),
    };
    if exponent < -128 {
        return Err(FloatError::CharacteristicUnderflow);
    } else if exponent > 127 {
        return Err(FloatError::CharacteristicOverflow);
    }

    let characteristic = (exponent + 128) as u64;
    let word = (characteristic << 27) | (mantissa >> 26);
    Ok(if negative { negate(word) } else { word })
}

/// Double precision: sign(1) characteristic(11, bias 1024) mantissa(60).
pub fn float_to_double_word(value: f64) -> Result<DoubleWord36, FloatError> {
    if value.is_infinite() || value.is_nan() {
        return Err(FloatError::CharacteristicOverflow);
    }
    let (negative, exponent, mantissa) = match decompose(value) {
        Some(parts) => parts,
        None if value == 0.0 => {
            return Ok(if value.is_sign_negative() {
                DoubleWord36::NEGATIVE_ZERO
            } else {
                DoubleWord36::POSITIVE_ZERO
            })
        }
        None => return Err(FloatError::CharacteristicUnderflow),
    };
    if exponent < -1024 {
        return Err(FloatError::CharacteristicUnderflow);
    } else if exponent > 1023 {
        return Err(FloatError::CharacteristicOverflow);
    }

    let characteristic = (exponent + 1024) as u128;
    let bits = (characteristic << 60) | ((mantissa as u128) << 7);
    let dw = DoubleWord36::from_bits(bits);
    Ok(if negative { dw.negate() } else { dw })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_end_around_carry() {
        assert_eq!(add(from_i64(5), from_i64(-3)).value, 2);
        assert_eq!(add(from_i64(-5), from_i64(3)).value, from_i64(-2));
        assert_eq!(add(from_i64(5), from_i64(-5)).value, POSITIVE_ZERO);
        assert_eq!(add(NEGATIVE_ZERO, NEGATIVE_ZERO).value, NEGATIVE_ZERO);
        assert!(add(0o377_777_777_777, 1).overflow);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(from_i64(-1), 0o777_777_777_776);
        assert_eq!(to_i64(0o777_777_777_776), -1);
        assert_eq!(to_i64(NEGATIVE_ZERO), 0);
        assert_eq!(to_i64(from_i64(-0o1234)), -0o1234);
    }

    #[test]
    fn test_integrate_h2() {
        let fd = FieldDescriptor::new(18, 18);
        let word = 0o123456_000100;
        let result = integrate(word, fd, 5);
        assert_eq!(result.value, 0o123456_000105);
        assert!(!result.truncated);
    }

    #[test]
    fn test_integrate_round_trip() {
        let words = [0u64, 0o123456_654321, 0o000777_000100, 0o400000_000000];
        for &word in words.iter() {
            for size in 1..=36u32 {
                for start in [0u32, 36 - size].iter() {
                    let fd = FieldDescriptor::new(*start, size);
                    // Negative zero fields lose their sign through any non-zero addition.
                    let f = fd.extract(word);
                    if size > 1 && f == fd.mask() {
                        continue;
                    }
                    let limit = if size == 1 { 0 } else { (fd.mask() >> 1) as i64 };
                    let field_value = if size > 1 && f & (1 << (size - 1)) != 0 {
                        -((!f & fd.mask()) as i64)
                    } else {
                        f as i64
                    };
                    for &addend in [1i64, 3, 0o777, limit].iter() {
                        if addend > limit || field_value + addend > limit || field_value - addend < -limit {
                            continue;
                        }
                        let first = integrate(word, fd, addend);
                        assert!(!first.truncated);
                        let second = integrate(first.value, fd, -addend);
                        assert!(!second.truncated);
                        assert_eq!(second.value, word, "fd {} addend {}", fd, addend);
                    }
                }
            }
        }
    }

    #[test]
    fn test_integrate_truncation() {
        let fd = FieldDescriptor::new(18, 18);
        let result = integrate(0o777777_377777, fd, 0o400001);
        assert!(result.truncated);
        assert_eq!(result.value, 0o777777_000000);

        let fd = FieldDescriptor::new(30, 6);
        let result = integrate(0, fd, -0o200);
        assert!(result.truncated);
        assert_eq!(result.value, 0o77);
    }

    #[test]
    fn test_integrate_fills_field_unsigned() {
        let fd = FieldDescriptor::new(18, 18);
        let result = integrate(0, fd, 0o400000);
        assert!(!result.truncated);
        assert_eq!(result.value, 0o400000);

        let result = integrate(0o777777_377777, fd, 1);
        assert!(!result.truncated);
        assert_eq!(result.value, 0o777777_400000);

        let result = integrate(0, fd, 0o1000000);
        assert!(result.truncated);
    }

    #[test]
    fn test_integrate_negative_field() {
        // Field holds -1 in 12 bits.
        let fd = FieldDescriptor::new(24, 12);
        let result = integrate(0o7776, fd, 3);
        assert!(!result.truncated);
        assert_eq!(result.value, 2);
    }

    #[test]
    fn test_double_word() {
        let dw = DoubleWord36::from_i64(-5);
        assert_eq!(dw.words, [BIT_MASK, 0o777_777_777_772]);
        assert!(dw.fits_in_word());
        assert_eq!(dw.to_word(), from_i64(-5));

        let big = DoubleWord36::from_i128(1i128 << 40).value;
        assert!(!big.fits_in_word());
        assert_eq!(big.words, [0o20, 0]);

        let sum = DoubleWord36::from_i64(7).add(&DoubleWord36::from_i64(-9));
        assert_eq!(sum.value.to_i128(), -2);
        assert!(!sum.overflow);

        let (q, r) = DoubleWord36::from_i64(17).divide(&DoubleWord36::from_i64(5)).unwrap();
        assert_eq!(q.to_i128(), 3);
        assert_eq!(r.to_i128(), 2);
        assert!(DoubleWord36::from_i64(1).divide(&DoubleWord36::POSITIVE_ZERO).is_none());
    }

    #[test]
    fn test_double_word_shift() {
        let one = DoubleWord36::from_i64(1);
        assert_eq!(one.shift(3).to_i128(), 8);
        assert_eq!(DoubleWord36::from_i64(0o100).shift(-3).to_i128(), 0o10);
        assert_eq!(one.shift(36).words, [1, 0]);
    }

    #[test]
    fn test_pack_ascii() {
        assert_eq!(pack_ascii("A"), vec![0o101_040_040_040]);
        assert_eq!(pack_ascii("ABCDE"), vec![0o101_102_103_104, 0o105_040_040_040]);
        assert!(pack_ascii("").is_empty());
    }

    #[test]
    fn test_pack_fieldata() {
        assert_eq!(pack_fieldata("A"), vec![0o06_05_05_05_05_05]);
        assert_eq!(pack_fieldata("@"), vec![0o00_05_05_05_05_05]);
        assert_eq!(fieldata_from_char('a'), 0o06);
        assert_eq!(fieldata_from_char('9'), 0o71);
    }

    #[test]
    fn test_float_to_word() {
        // 1.0 = 0.5 * 2^1
        assert_eq!(float_to_word(1.0).unwrap(), (129u64 << 27) | (1u64 << 26));
        assert_eq!(float_to_word(-1.0).unwrap(), negate((129u64 << 27) | (1u64 << 26)));
        assert_eq!(float_to_word(0.0).unwrap(), 0);
        assert_eq!(float_to_word(1.0e300), Err(FloatError::CharacteristicOverflow));
    }

    #[test]
    fn test_float_to_double_word() {
        let dw = float_to_double_word(1.0).unwrap();
        assert_eq!(dw.words[0], (1025u64 << 24) | (1u64 << 23));
        assert_eq!(dw.words[1], 0);
        assert!(float_to_double_word(-2.5).unwrap().is_negative());
    }
}
