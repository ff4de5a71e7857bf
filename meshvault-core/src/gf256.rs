//! GF(2^8) arithmetic
//!
//! Field elements are bytes. Addition is XOR; multiplication goes through
//! log/exp tables built at compile time over the primitive polynomial
//! x^8 + x^4 + x^3 + x^2 + 1 (0x11D) with generator 2.
//!
//! Everything here is a pure function over bytes or byte slices, plus a small
//! dense [`Matrix`] type used to build and invert coding matrices.

const PRIMITIVE_POLY: u16 = 0x11D;

const fn build_tables() -> ([u8; 512], [u8; 256]) {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= PRIMITIVE_POLY;
        }
        i += 1;
    }
    // exp is doubled so log(a) + log(b) never needs a modulo
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    (exp, log)
}

const TABLES: ([u8; 512], [u8; 256]) = build_tables();

/// Antilog table: `EXP[i] = 2^i`, doubled to 512 entries
pub static EXP: [u8; 512] = TABLES.0;

/// Log table: `LOG[2^i] = i`; `LOG[0]` is unused
pub static LOG: [u8; 256] = TABLES.1;

/// Field addition (and subtraction)
#[inline]
pub fn add(a: u8, b: u8) -> u8 {
    a ^ b
}

/// Field multiplication
#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
}

/// Field division. Returns `None` when dividing by zero.
#[inline]
pub fn div(a: u8, b: u8) -> Option<u8> {
    if b == 0 {
        return None;
    }
    if a == 0 {
        return Some(0);
    }
    Some(EXP[LOG[a as usize] as usize + 255 - LOG[b as usize] as usize])
}

/// Multiplicative inverse. Returns `None` for zero.
#[inline]
pub fn inv(a: u8) -> Option<u8> {
    div(1, a)
}

/// `a` raised to `n`, with `0^0 = 1`
pub fn pow(a: u8, n: usize) -> u8 {
    if n == 0 {
        return 1;
    }
    if a == 0 {
        return 0;
    }
    EXP[(LOG[a as usize] as usize * n) % 255]
}

/// Full multiplication row for a constant: `table[x] = c * x`
pub fn mul_table(c: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    for (x, slot) in table.iter_mut().enumerate() {
        *slot = mul(c, x as u8);
    }
    table
}

/// `dst[i] ^= c * src[i]` for every byte
pub fn mul_add_slice(c: u8, src: &[u8], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), dst.len());
    match c {
        0 => {}
        1 => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= *s;
            }
        }
        _ => {
            let table = mul_table(c);
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= table[*s as usize];
            }
        }
    }
}

/// Dense row-major matrix over GF(2^8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    /// All-zero matrix
    pub fn zero(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0u8; rows * cols],
        }
    }

    /// Identity matrix of size `n`
    pub fn identity(n: usize) -> Self {
        let mut m = Self::zero(n, n);
        for i in 0..n {
            m.set(i, i, 1);
        }
        m
    }

    /// Vandermonde matrix with `V[r][c] = r^c`.
    ///
    /// Any `cols` distinct rows are linearly independent as long as
    /// `rows <= 256`.
    pub fn vandermonde(rows: usize, cols: usize) -> Self {
        debug_assert!(rows <= 256);
        let mut m = Self::zero(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                m.set(r, c, pow(r as u8, c));
            }
        }
        m
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, value: u8) {
        self.data[r * self.cols + c] = value;
    }

    /// Borrow a single row
    pub fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    /// Matrix product `self * rhs`. Returns `None` on dimension mismatch.
    pub fn multiply(&self, rhs: &Matrix) -> Option<Matrix> {
        if self.cols != rhs.rows {
            return None;
        }
        let mut out = Matrix::zero(self.rows, rhs.cols);
        for r in 0..self.rows {
            for c in 0..rhs.cols {
                let mut acc = 0u8;
                for i in 0..self.cols {
                    acc ^= mul(self.get(r, i), rhs.get(i, c));
                }
                out.set(r, c, acc);
            }
        }
        Some(out)
    }

    /// New matrix made of the given rows, in order
    pub fn select_rows(&self, rows: &[usize]) -> Matrix {
        let mut out = Matrix::zero(rows.len(), self.cols);
        for (i, &r) in rows.iter().enumerate() {
            out.data[i * self.cols..(i + 1) * self.cols].copy_from_slice(self.row(r));
        }
        out
    }

    /// Top-left `rows x cols` block
    pub fn top_left(&self, rows: usize, cols: usize) -> Matrix {
        let mut out = Matrix::zero(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                out.set(r, c, self.get(r, c));
            }
        }
        out
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for c in 0..self.cols {
            self.data.swap(a * self.cols + c, b * self.cols + c);
        }
    }

    /// Inverse via Gauss-Jordan elimination. `None` if singular or not square.
    pub fn invert(&self) -> Option<Matrix> {
        if self.rows != self.cols {
            return None;
        }
        let n = self.rows;
        let mut work = self.clone();
        let mut out = Matrix::identity(n);

        for col in 0..n {
            let pivot = (col..n).find(|&r| work.get(r, col) != 0)?;
            work.swap_rows(col, pivot);
            out.swap_rows(col, pivot);

            let scale = inv(work.get(col, col))?;
            for c in 0..n {
                work.set(col, c, mul(work.get(col, c), scale));
                out.set(col, c, mul(out.get(col, c), scale));
            }

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work.get(r, col);
                if factor == 0 {
                    continue;
                }
                for c in 0..n {
                    let w = work.get(r, c) ^ mul(factor, work.get(col, c));
                    work.set(r, c, w);
                    let o = out.get(r, c) ^ mul(factor, out.get(col, c));
                    out.set(r, c, o);
                }
            }
        }

        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_consistent() {
        for a in 1..=255u8 {
            assert_eq!(EXP[LOG[a as usize] as usize], a);
        }
        assert_eq!(EXP[0], 1);
        assert_eq!(EXP[255], 1);
    }

    #[test]
    fn test_mul_identities() {
        for a in 0..=255u8 {
            assert_eq!(mul(a, 0), 0);
            assert_eq!(mul(a, 1), a);
            if a != 0 {
                assert_eq!(mul(a, inv(a).unwrap()), 1);
            }
        }
        assert!(inv(0).is_none());
        assert!(div(7, 0).is_none());
    }

    #[test]
    fn test_mul_is_distributive() {
        for a in [3u8, 29, 142, 255] {
            for b in [0u8, 1, 77, 200] {
                for c in [5u8, 64, 250] {
                    assert_eq!(mul(a, b ^ c), mul(a, b) ^ mul(a, c));
                }
            }
        }
    }

    #[test]
    fn test_known_products() {
        // 2^8 and 2^14 reduced by 0x11D
        assert_eq!(mul(2, 0x80), 0x1D);
        assert_eq!(mul(0x80, 0x80), 0x13);
        assert_eq!(pow(2, 8), 0x1D);
        assert_eq!(pow(0, 0), 1);
        assert_eq!(pow(0, 3), 0);
    }

    #[test]
    fn test_mul_add_slice() {
        let src = [1u8, 2, 3, 200];
        let mut dst = [9u8, 9, 9, 9];
        mul_add_slice(7, &src, &mut dst);
        for i in 0..4 {
            assert_eq!(dst[i], 9 ^ mul(7, src[i]));
        }

        let mut unchanged = [4u8; 4];
        mul_add_slice(0, &src, &mut unchanged);
        assert_eq!(unchanged, [4u8; 4]);
    }

    #[test]
    fn test_matrix_inverse_roundtrip() {
        let v = Matrix::vandermonde(6, 6);
        let inverse = v.invert().unwrap();
        assert_eq!(v.multiply(&inverse).unwrap(), Matrix::identity(6));
    }

    #[test]
    fn test_singular_matrix() {
        let mut m = Matrix::zero(2, 2);
        m.set(0, 0, 3);
        m.set(0, 1, 5);
        m.set(1, 0, 3);
        m.set(1, 1, 5);
        assert!(m.invert().is_none());
    }

    #[test]
    fn test_any_vandermonde_rows_invertible() {
        let v = Matrix::vandermonde(16, 10);
        for skip in 0..6 {
            let rows: Vec<usize> = (skip..skip + 10).collect();
            assert!(v.select_rows(&rows).invert().is_some());
        }
    }
}
