//! GF(2^16) arithmetic (spec §4 component 4: "word size 16").
//!
//! Built once as a pair of log/antilog tables over the field's 65536
//! elements, the classic approach for software Galois-field multiplication
//! at this word size (as used by VELOC/FTI's own `galois_*` routines in
//! `original_source/src/vmem/postckpt.c`).

use once_cell::sync::Lazy;

const FIELD_SIZE: u32 = 1 << 16;
const FIELD_MAX: u32 = FIELD_SIZE - 1;
/// Primitive polynomial for GF(2^16): x^16 + x^12 + x^3 + x + 1.
const PRIM_POLY: u32 = 0x1100B;

struct Tables {
    exp: Vec<u16>,
    log: Vec<u16>,
}

static TABLES: Lazy<Tables> = Lazy::new(build_tables);

fn build_tables() -> Tables {
    let mut exp = vec![0u16; FIELD_MAX as usize];
    let mut log = vec![0u16; FIELD_SIZE as usize];
    let mut x: u32 = 1;
    for i in 0..FIELD_MAX {
        exp[i as usize] = x as u16;
        log[x as usize] = i as u16;
        x <<= 1;
        if x & FIELD_SIZE != 0 {
            x ^= PRIM_POLY;
        }
    }
    Tables { exp, log }
}

fn exp(i: u32) -> u16 {
    TABLES.exp[(i % FIELD_MAX) as usize]
}

/// Multiply two field elements.
pub fn gf_mul(a: u16, b: u16) -> u16 {
    if a == 0 || b == 0 {
        return 0;
    }
    let la = TABLES.log[a as usize] as u32;
    let lb = TABLES.log[b as usize] as u32;
    exp(la + lb)
}

/// Multiplicative inverse of a nonzero field element.
pub fn gf_inverse(a: u16) -> u16 {
    assert_ne!(a, 0, "zero has no multiplicative inverse in GF(2^16)");
    let la = TABLES.log[a as usize] as u32;
    exp(FIELD_MAX - la)
}

/// Divide `a` by `b` (`b` must be nonzero).
pub fn gf_div(a: u16, b: u16) -> u16 {
    if a == 0 {
        return 0;
    }
    gf_mul(a, gf_inverse(b))
}

/// `1 / b`, the building block for the Vandermonde generator matrix
/// (spec §4.5 `galois_single_divide(1, i XOR (k+j), w)`).
pub fn single_divide_into_one(b: u16) -> u16 {
    gf_div(1, b)
}

/// XOR `src` into `dst` byte-for-byte (spec's `galois_region_xor`).
pub fn region_xor(dst: &mut [u8], src: &[u8]) {
    assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Multiply every 16-bit little-endian word of `src` by `val` over
/// GF(2^16), writing into `dst` — either overwriting it (`accumulate =
/// false`) or XOR-accumulating (`accumulate = true`), matching
/// `galois_w16_region_multiply(data, matVal, bs, coding, init)`.
pub fn region_multiply_w16(src: &[u8], val: u16, dst: &mut [u8], accumulate: bool) {
    assert_eq!(src.len(), dst.len());
    assert_eq!(src.len() % 2, 0, "GF(2^16) regions must have even length");
    for i in (0..src.len()).step_by(2) {
        let word = u16::from_le_bytes([src[i], src[i + 1]]);
        let product = gf_mul(word, val).to_le_bytes();
        if accumulate {
            dst[i] ^= product[0];
            dst[i + 1] ^= product[1];
        } else {
            dst[i] = product[0];
            dst[i + 1] = product[1];
        }
    }
}
