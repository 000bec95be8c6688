/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Erasure coding of chunks into pieces.
//!
//! A chunk of up to `k * piece_size` bytes is split into `k` data pieces and extended with `m` parity
//! pieces so that any `k` of the `k + m` pieces are enough to rebuild the chunk. The code is a
//! systematic Reed-Solomon code over GF(2^8): the first `k` pieces are the chunk itself, and the parity
//! rows of the generator matrix form a Cauchy matrix, so every `k x k` submatrix of the generator is
//! invertible.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::errors::RenterError;

/// Pluggable erasure coding scheme. Every chunk of a file uses the same coder.
pub trait ErasureCoder: Send + Sync {
    /// Number of pieces needed to recover a chunk (`k`).
    fn min_pieces(&self) -> usize;

    /// Total number of pieces produced per chunk (`k + m`).
    fn num_pieces(&self) -> usize;

    /// Split `data` into `num_pieces` pieces of `piece_size` bytes each. `data` must not be longer than
    /// `min_pieces * piece_size`; shorter data is zero-padded.
    fn encode(&self, data: &[u8], piece_size: usize) -> Result<Vec<Vec<u8>>, RenterError>;

    /// Rebuild the first `length` bytes of the chunk from any `min_pieces` of its pieces.
    fn recover(&self, pieces: &[Option<Vec<u8>>], length: usize) -> Result<Vec<u8>, RenterError>;
}

/// Persistable description of an erasure code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct ErasureCode {
    pub data_pieces: u8,
    pub parity_pieces: u8,
}

impl ErasureCode {
    /// Default redundancy for user files: 10-of-30.
    pub const DEFAULT: ErasureCode = ErasureCode {
        data_pieces: 10,
        parity_pieces: 20,
    };

    pub fn new(data_pieces: u8, parity_pieces: u8) -> Result<ErasureCode, RenterError> {
        if data_pieces == 0 {
            return Err(RenterError::InvalidArgument("erasure code needs at least one data piece".into()));
        }
        if data_pieces as usize + parity_pieces as usize > 256 {
            return Err(RenterError::InvalidArgument("erasure code cannot have more than 256 pieces".into()));
        }
        Ok(ErasureCode {
            data_pieces,
            parity_pieces,
        })
    }

    pub fn min_pieces(&self) -> usize {
        self.data_pieces as usize
    }

    pub fn num_pieces(&self) -> usize {
        self.data_pieces as usize + self.parity_pieces as usize
    }

    /// The coder implementing this code.
    pub fn coder(&self) -> ReedSolomon {
        ReedSolomon::new(self.data_pieces as usize, self.parity_pieces as usize)
    }
}

/* ↓↓↓ GF(2^8) arithmetic, generator polynomial x^8 + x^4 + x^3 + x^2 + 1 ↓↓↓ */

const fn build_exp_table() -> [u8; 512] {
    let mut exp = [0u8; 512];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        exp[i + 255] = x as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= 0x11d;
        }
        i += 1;
    }
    exp[510] = exp[0];
    exp[511] = exp[1];
    exp
}

const fn build_log_table(exp: &[u8; 512]) -> [u8; 256] {
    let mut log = [0u8; 256];
    let mut i = 0;
    while i < 255 {
        log[exp[i] as usize] = i as u8;
        i += 1;
    }
    log
}

const EXP: [u8; 512] = build_exp_table();
const LOG: [u8; 256] = build_log_table(&EXP);

fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
}

fn gf_inv(a: u8) -> u8 {
    // Callers never invert zero: Cauchy entries and pivots are non-zero by construction.
    EXP[255 - LOG[a as usize] as usize]
}

/// `dst ^= c * src`, element-wise.
fn mul_add_slice(dst: &mut [u8], src: &[u8], c: u8) {
    if c == 0 {
        return;
    }
    let mut table = [0u8; 256];
    for (x, entry) in table.iter_mut().enumerate() {
        *entry = gf_mul(c, x as u8);
    }
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= table[*s as usize];
    }
}

/// Invert a square matrix in place with Gauss-Jordan elimination. Returns `None` if singular.
fn invert(mut matrix: Vec<Vec<u8>>) -> Option<Vec<Vec<u8>>> {
    let n = matrix.len();
    let mut inverse: Vec<Vec<u8>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1 } else { 0 }).collect())
        .collect();
    for col in 0..n {
        let pivot = (col..n).find(|&row| matrix[row][col] != 0)?;
        matrix.swap(col, pivot);
        inverse.swap(col, pivot);
        let scale = gf_inv(matrix[col][col]);
        for j in 0..n {
            matrix[col][j] = gf_mul(matrix[col][j], scale);
            inverse[col][j] = gf_mul(inverse[col][j], scale);
        }
        for row in 0..n {
            if row == col || matrix[row][col] == 0 {
                continue;
            }
            let factor = matrix[row][col];
            for j in 0..n {
                matrix[row][j] ^= gf_mul(factor, matrix[col][j]);
                inverse[row][j] ^= gf_mul(factor, inverse[col][j]);
            }
        }
    }
    Some(inverse)
}

/// Systematic Reed-Solomon coder with `data` data pieces and `parity` parity pieces.
#[derive(Clone, Debug)]
pub struct ReedSolomon {
    data: usize,
    parity: usize,
    // Row `i` of the generator matrix, for every piece `i`.
    generator: Vec<Vec<u8>>,
}

impl ReedSolomon {
    pub fn new(data: usize, parity: usize) -> ReedSolomon {
        let mut generator = Vec::with_capacity(data + parity);
        for i in 0..data {
            generator.push((0..data).map(|j| if i == j { 1 } else { 0 }).collect());
        }
        for i in 0..parity {
            let x = (data + i) as u8;
            let row: Vec<u8> = (0..data).map(|j| gf_inv(x ^ j as u8)).collect();
            // Scaling a parity row keeps every square submatrix invertible. Normalising the first
            // coefficient to 1 makes 1-of-N parity pieces exact copies of the data.
            let scale = gf_inv(row[0]);
            generator.push(row.iter().map(|c| gf_mul(*c, scale)).collect());
        }
        ReedSolomon { data, parity, generator }
    }
}

impl ErasureCoder for ReedSolomon {
    fn min_pieces(&self) -> usize {
        self.data
    }

    fn num_pieces(&self) -> usize {
        self.data + self.parity
    }

    fn encode(&self, data: &[u8], piece_size: usize) -> Result<Vec<Vec<u8>>, RenterError> {
        if data.len() > self.data * piece_size {
            return Err(RenterError::InvalidArgument(format!(
                "cannot encode {} bytes into {} pieces of {} bytes",
                data.len(),
                self.data,
                piece_size
            )));
        }
        let mut pieces: Vec<Vec<u8>> = (0..self.data)
            .map(|i| {
                let mut piece = vec![0u8; piece_size];
                let start = (i * piece_size).min(data.len());
                let end = ((i + 1) * piece_size).min(data.len());
                piece[..end - start].copy_from_slice(&data[start..end]);
                piece
            })
            .collect();
        for row in &self.generator[self.data..] {
            let mut parity = vec![0u8; piece_size];
            for (j, coefficient) in row.iter().enumerate() {
                mul_add_slice(&mut parity, &pieces[j], *coefficient);
            }
            pieces.push(parity);
        }
        Ok(pieces)
    }

    fn recover(&self, pieces: &[Option<Vec<u8>>], length: usize) -> Result<Vec<u8>, RenterError> {
        if pieces.len() != self.num_pieces() {
            return Err(RenterError::InvalidArgument(format!(
                "expected {} pieces, got {}",
                self.num_pieces(),
                pieces.len()
            )));
        }
        let available: Vec<usize> = (0..pieces.len()).filter(|&i| pieces[i].is_some()).take(self.data).collect();
        if available.len() < self.data {
            return Err(RenterError::InvalidArgument(format!(
                "need {} pieces to recover, only {} available",
                self.data,
                available.len()
            )));
        }
        let piece_size = pieces[available[0]].as_ref().map(|p| p.len()).unwrap_or(0);
        if available.iter().any(|&i| pieces[i].as_ref().map(|p| p.len()) != Some(piece_size)) {
            return Err(RenterError::InvalidArgument("pieces have different sizes".into()));
        }

        let mut out = Vec::with_capacity(self.data * piece_size);
        if available.iter().enumerate().all(|(pos, &i)| pos == i) {
            // Every data piece is present.
            for &i in &available {
                if let Some(piece) = &pieces[i] {
                    out.extend_from_slice(piece);
                }
            }
        } else {
            let sub: Vec<Vec<u8>> = available.iter().map(|&i| self.generator[i].clone()).collect();
            let inverse = invert(sub).ok_or_else(|| RenterError::Critical("erasure matrix is singular".into()))?;
            for row in inverse.iter() {
                let mut data_piece = vec![0u8; piece_size];
                for (pos, &i) in available.iter().enumerate() {
                    if let Some(piece) = &pieces[i] {
                        mul_add_slice(&mut data_piece, piece, row[pos]);
                    }
                }
                out.extend_from_slice(&data_piece);
            }
        }
        if length > out.len() {
            return Err(RenterError::InvalidArgument(format!(
                "requested {} bytes but chunk only holds {}",
                length,
                out.len()
            )));
        }
        out.truncate(length);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_k_pieces_recover_the_chunk() {
        let coder = ErasureCode::new(3, 2).unwrap().coder();
        let data: Vec<u8> = (0..250u32).map(|i| (i * 7 % 251) as u8).collect();
        let pieces = coder.encode(&data, 100).unwrap();
        assert_eq!(pieces.len(), 5);
        assert_eq!(&pieces[0][..100], &data[..100]);

        for missing_a in 0..5 {
            for missing_b in missing_a + 1..5 {
                let partial: Vec<Option<Vec<u8>>> = pieces
                    .iter()
                    .enumerate()
                    .map(|(i, p)| if i == missing_a || i == missing_b { None } else { Some(p.clone()) })
                    .collect();
                assert_eq!(coder.recover(&partial, data.len()).unwrap(), data);
            }
        }
    }

    #[test]
    fn too_few_pieces_is_an_error() {
        let coder = ErasureCode::new(2, 1).unwrap().coder();
        let pieces = coder.encode(b"hello", 4).unwrap();
        let partial = vec![Some(pieces[0].clone()), None, None];
        assert!(coder.recover(&partial, 5).is_err());
    }

    #[test]
    fn one_of_n_pieces_are_copies() {
        let coder = ErasureCode::new(1, 3).unwrap().coder();
        let pieces = coder.encode(b"abc", 3).unwrap();
        assert!(pieces.iter().all(|p| p == b"abc"));
    }
}
