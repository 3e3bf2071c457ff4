use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
pub type Fixed64 = I32F32;

/// Ticks are the atomic unit of controller time.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only for initialization, never in the tick loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Checked division for Fixed64 that returns None on zero divisor or overflow.
#[inline]
pub fn checked_div_64(a: Fixed64, b: Fixed64) -> Option<Fixed64> {
    a.checked_div(b)
}

/// Mean of a set of fixed-point values. Returns zero for an empty set.
pub fn mean(values: impl IntoIterator<Item = Fixed64>) -> Fixed64 {
    let mut sum = Fixed64::ZERO;
    let mut count = 0u32;
    for v in values {
        sum = sum.saturating_add(v);
        count += 1;
    }
    if count == 0 {
        return Fixed64::ZERO;
    }
    checked_div_64(sum, Fixed64::from_num(count)).unwrap_or(Fixed64::ZERO)
}

/// Mean of a set of tick counts, rounded half away from zero.
pub fn rounded_mean_ticks(values: impl IntoIterator<Item = Ticks>) -> Ticks {
    let mut sum: u128 = 0;
    let mut count: u128 = 0;
    for v in values {
        sum += u128::from(v);
        count += 1;
    }
    if count == 0 {
        return 0;
    }
    ((sum * 2 + count) / (count * 2)) as Ticks
}
