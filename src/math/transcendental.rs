//! Self-contained transcendental library (C2): `sqrt`, `exp`, `log`,
//! `sin`, `cos`, `tan`, `tanh`, `pow`, plus the small helpers every
//! numerical kernel in this crate needs (`fabs`, `floor`, `ceil`,
//! `isnan`, `isinf`). None of these call into `f32`'s own
//! `sqrt`/`exp`/`ln`/... methods -- range reduction plus rational-
//! polynomial approximation only, matching IEEE-754 to within 1e-5
//! relative error on finite, in-range inputs (`spec.md` §4.2).

/// π, to f32 precision.
pub const PI: f32 = 3.14159265358979323846;
/// Euler's number.
pub const E: f32 = 2.71828182845904523536;
/// Golden ratio φ = (1 + √5) / 2.
pub const PHI: f32 = 1.61803398874989484820;
/// Λ = 3 / 144000, a small constant used by the lattice map's
/// per-token perturbation amplitude.
pub const LAMBDA: f32 = 3.0 / 144000.0;

#[inline]
pub fn fabs(x: f32) -> f32 {
    f32::from_bits(x.to_bits() & 0x7fff_ffff)
}

#[inline]
pub fn isnan(x: f32) -> bool {
    let bits = x.to_bits();
    (bits & 0x7f80_0000 == 0x7f80_0000) && (bits & 0x007f_ffff != 0)
}

#[inline]
pub fn isinf(x: f32) -> bool {
    let bits = x.to_bits() & 0x7fff_ffff;
    bits == 0x7f80_0000
}

pub fn floor(x: f32) -> f32 {
    if isnan(x) || isinf(x) {
        return x;
    }
    let i = x as i64 as f32;
    if x < 0.0 && i != x {
        i - 1.0
    } else {
        i
    }
}

pub fn ceil(x: f32) -> f32 {
    if isnan(x) || isinf(x) {
        return x;
    }
    let i = x as i64 as f32;
    if x > 0.0 && i != x {
        i + 1.0
    } else {
        i
    }
}

/// Sentinel returned by `log`/`sqrt` on out-of-domain input. Callers in
/// the forward/backward kernels and the optimizer substitute a clamped
/// value rather than propagate this -- per `spec.md` §4.2.
pub const NAN_SENTINEL: f32 = f32::NAN;

/// Square root via a bit-hack seed (the classic fast-inverse-sqrt style
/// initial guess) refined by two Newton iterations on `f(y) = y^2 - x`.
/// Returns the NaN sentinel for negative inputs.
pub fn sqrt(x: f32) -> f32 {
    if isnan(x) {
        return x;
    }
    if x < 0.0 {
        return NAN_SENTINEL;
    }
    if x == 0.0 || isinf(x) {
        return x;
    }
    // Initial guess: halve the biased exponent (the classic Quake
    // inverse-sqrt trick, inverted here to seed sqrt directly).
    let i = x.to_bits();
    let guess_bits = 0x1fbd_1df5 + (i >> 1);
    let mut y = f32::from_bits(guess_bits);
    // Two rounds of Newton's method on y = (y + x/y) / 2.
    y = 0.5 * (y + x / y);
    y = 0.5 * (y + x / y);
    y
}

/// Natural log via IEEE-754 decomposition (`x = m * 2^e`, `1 <= m < 2`),
/// one extra half-step to re-center `m` into `[sqrt(0.5), sqrt(2))`, and
/// the `atanh`-based series `ln(1+f) = 2*atanh(f/(2+f))` for `ln(m)`,
/// then `ln(x) = ln(m) + e * ln(2)`. The re-centering keeps `f` small
/// enough (`|f| < 0.5 / sqrt(2)` after scaling) that this series
/// converges fast enough everywhere on the reduced range to hold
/// 1e-5 relative error, unlike a plain `f - f^2/2 + f^3/3 - ...`
/// expansion directly on `[1, 2)`, which loses accuracy badly as `m`
/// approaches 2.
/// Returns the NaN sentinel for `x <= 0`.
pub fn log(x: f32) -> f32 {
    if isnan(x) {
        return x;
    }
    if x <= 0.0 {
        return NAN_SENTINEL;
    }
    if isinf(x) {
        return x;
    }
    const LN2: f32 = 0.6931471805599453;
    const SQRT2: f32 = 1.4142135623730951;
    let bits = x.to_bits();
    let mut exp = ((bits >> 23) & 0xff) as i32 - 127;
    let mantissa_bits = (bits & 0x007f_ffff) | 0x3f80_0000; // m in [1, 2)
    let mut m = f32::from_bits(mantissa_bits);

    if m > SQRT2 {
        m *= 0.5;
        exp += 1;
    }

    let f = m - 1.0;
    let s = f / (2.0 + f);
    let s2 = s * s;
    let poly = 1.0 + s2 * (1.0 / 3.0 + s2 * (1.0 / 5.0 + s2 * (1.0 / 7.0 + s2 * (1.0 / 9.0 + s2 * (1.0 / 11.0)))));
    let ln_m = 2.0 * s * poly;

    exp as f32 * LN2 + ln_m
}

/// `exp(x)` via range reduction `x = n*ln2 + r` (`|r| <= ln2/2`) and a
/// Taylor polynomial for `exp(r)`, scaled back by `2^n` through direct
/// bit manipulation of the exponent field.
pub fn exp(x: f32) -> f32 {
    if isnan(x) {
        return x;
    }
    if x > 88.0 {
        return f32::INFINITY;
    }
    if x < -88.0 {
        return 0.0;
    }
    const LN2: f32 = 0.6931471805599453;
    const INV_LN2: f32 = 1.4426950408889634;

    let n = floor(x * INV_LN2 + 0.5);
    let r = x - n * LN2;

    // exp(r) for |r| <= ln2/2, 8-term Taylor series.
    let mut term = 1.0f32;
    let mut sum = 1.0f32;
    for k in 1..=8 {
        term *= r / k as f32;
        sum += term;
    }

    let n_i = n as i32;
    scale_by_pow2(sum, n_i)
}

/// Multiplies `x` by `2^n` by adjusting the IEEE-754 exponent field
/// directly, falling back to repeated doubling/halving for exponents
/// that would overflow a single field adjustment.
fn scale_by_pow2(x: f32, n: i32) -> f32 {
    if x == 0.0 || isnan(x) || isinf(x) {
        return x;
    }
    let bits = x.to_bits();
    let exp_field = ((bits >> 23) & 0xff) as i32;
    let new_exp = exp_field + n;
    if (1..254).contains(&new_exp) {
        let new_bits = (bits & 0x807f_ffff) | ((new_exp as u32) << 23);
        f32::from_bits(new_bits)
    } else if new_exp >= 254 {
        f32::INFINITY.copysign(x)
    } else if new_exp <= 0 {
        0.0f32.copysign(x)
    } else {
        x
    }
}

/// Reduces `x` into `[-pi, pi]` using the standard two-step Cody-Waite
/// reduction against `2*pi` split into high/low parts for accuracy.
fn reduce_angle(x: f32) -> f32 {
    const TWO_PI_HI: f32 = 6.28125;
    const TWO_PI_LO: f32 = 0.0019353071795864768;
    let k = floor(x / (2.0 * PI) + 0.5);
    let r = (x - k * TWO_PI_HI) - k * TWO_PI_LO;
    if r > PI {
        r - 2.0 * PI
    } else if r < -PI {
        r + 2.0 * PI
    } else {
        r
    }
}

/// `sin(x)`: reduces to `[-pi, pi]`, then folds that into `[-pi/2,
/// pi/2]` via quadrant symmetry (`sin(r) = sin(pi - r)` for `r >
/// pi/2`, `sin(r) = sin(-pi - r)` for `r < -pi/2`) before evaluating an
/// 11th-order odd Taylor polynomial. The polynomial alone, evaluated
/// directly on the full `[-pi, pi]` range, only holds 1e-5 relative
/// error near zero -- at `r` close to `+-pi` it is off by tens of
/// percent, which is why the extra fold into a quarter-turn is needed
/// to meet the `spec.md` §4.2 accuracy bound everywhere.
pub fn sin(x: f32) -> f32 {
    if isnan(x) || isinf(x) {
        return NAN_SENTINEL;
    }
    let mut r = reduce_angle(x);
    if r > PI / 2.0 {
        r = PI - r;
    } else if r < -PI / 2.0 {
        r = -PI - r;
    }
    let r2 = r * r;
    r * (1.0
        + r2 * (-1.0 / 6.0
            + r2 * (1.0 / 120.0
                + r2 * (-1.0 / 5040.0 + r2 * (1.0 / 362_880.0 + r2 * (-1.0 / 39_916_800.0))))))
}

/// `cos(x) = sin(x + pi/2)`, sharing the same reduction/polynomial path.
pub fn cos(x: f32) -> f32 {
    if isnan(x) || isinf(x) {
        return NAN_SENTINEL;
    }
    sin(x + PI / 2.0)
}

pub fn tan(x: f32) -> f32 {
    let c = cos(x);
    if fabs(c) < 1e-12 {
        return f32::INFINITY.copysign(sin(x));
    }
    sin(x) / c
}

/// `tanh(x) = (e^{2x} - 1) / (e^{2x} + 1)`, saturating for large `|x|`
/// to avoid the subtraction losing precision (and to match the
/// well-defined limits +/-1).
pub fn tanh(x: f32) -> f32 {
    if isnan(x) {
        return x;
    }
    if x > 20.0 {
        return 1.0;
    }
    if x < -20.0 {
        return -1.0;
    }
    let e2x = exp(2.0 * x);
    (e2x - 1.0) / (e2x + 1.0)
}

/// `base^exp = exp(exp * ln(base))` for `base > 0`; exact repeated
/// squaring for non-negative integer exponents on any base, to keep
/// e.g. `pow(x, 2.0)` free of transcendental round-trip error.
pub fn pow(base: f32, exponent: f32) -> f32 {
    if base == 0.0 {
        return if exponent == 0.0 { 1.0 } else { 0.0 };
    }
    if exponent == floor(exponent) && fabs(exponent) <= 64.0 {
        let mut n = exponent as i64;
        let negative = n < 0;
        n = n.abs();
        let mut result = 1.0f32;
        let mut b = base;
        while n > 0 {
            if n & 1 == 1 {
                result *= b;
            }
            b *= b;
            n >>= 1;
        }
        return if negative { 1.0 / result } else { result };
    }
    if base < 0.0 {
        return NAN_SENTINEL;
    }
    exp(exponent * log(base))
}
