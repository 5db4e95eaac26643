use super::DType;
use half::f16;

pub const QK: usize = 32;

fn push_f16(dst: &mut Vec<u8>, x: f32) {
    dst.extend_from_slice(&f16::from_f32(x).to_bits().to_le_bytes());
}

fn read_f16(src: &[u8], at: usize) -> f32 {
    f16::from_bits(u16::from_le_bytes([src[at], src[at + 1]])).to_f32()
}

fn read_u32(src: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

// Value with the largest magnitude, sign preserved.
fn signed_absmax(block: &[f32]) -> f32 {
    let mut amax = 0.0f32;
    let mut max = 0.0f32;
    for &x in block {
        if x.abs() > amax {
            amax = x.abs();
            max = x;
        }
    }
    max
}

fn min_max(block: &[f32]) -> (f32, f32) {
    block.iter().fold((f32::MAX, f32::MIN), |(lo, hi), &x| (lo.min(x), hi.max(x)))
}

fn inverse(d: f32) -> f32 {
    if d != 0.0 {
        1.0 / d
    } else {
        0.0
    }
}

/// Appends the block encoding of `src` to `dst`. `src.len()` must be a multiple of [`QK`].
pub fn quantize_row(dtype: DType, src: &[f32], dst: &mut Vec<u8>) {
    for block in src.chunks_exact(QK) {
        match dtype {
            DType::Q4_0 => {
                let d = signed_absmax(block) / -8.0;
                let id = inverse(d);
                push_f16(dst, d);
                for j in 0..QK / 2 {
                    let x0 = ((block[j] * id + 8.5) as u8).min(15);
                    let x1 = ((block[j + QK / 2] * id + 8.5) as u8).min(15);
                    dst.push(x0 | (x1 << 4));
                }
            }
            DType::Q4_1 => {
                let (min, max) = min_max(block);
                let d = (max - min) / 15.0;
                let id = inverse(d);
                push_f16(dst, d);
                push_f16(dst, min);
                for j in 0..QK / 2 {
                    let x0 = (((block[j] - min) * id + 0.5) as u8).min(15);
                    let x1 = (((block[j + QK / 2] - min) * id + 0.5) as u8).min(15);
                    dst.push(x0 | (x1 << 4));
                }
            }
            DType::Q5_0 => {
                let d = signed_absmax(block) / -16.0;
                let id = inverse(d);
                let mut qh = 0u32;
                let mut qs = [0u8; QK / 2];
                for j in 0..QK / 2 {
                    let x0 = ((block[j] * id + 16.5) as u8).min(31);
                    let x1 = ((block[j + QK / 2] * id + 16.5) as u8).min(31);
                    qs[j] = (x0 & 0x0F) | ((x1 & 0x0F) << 4);
                    qh |= (((x0 & 0x10) >> 4) as u32) << j;
                    qh |= (((x1 & 0x10) >> 4) as u32) << (j + QK / 2);
                }
                push_f16(dst, d);
                dst.extend_from_slice(&qh.to_le_bytes());
                dst.extend_from_slice(&qs);
            }
            DType::Q5_1 => {
                let (min, max) = min_max(block);
                let d = (max - min) / 31.0;
                let id = inverse(d);
                let mut qh = 0u32;
                let mut qs = [0u8; QK / 2];
                for j in 0..QK / 2 {
                    let x0 = (((block[j] - min) * id + 0.5) as u8).min(31);
                    let x1 = (((block[j + QK / 2] - min) * id + 0.5) as u8).min(31);
                    qs[j] = (x0 & 0x0F) | ((x1 & 0x0F) << 4);
                    qh |= (((x0 & 0x10) >> 4) as u32) << j;
                    qh |= (((x1 & 0x10) >> 4) as u32) << (j + QK / 2);
                }
                push_f16(dst, d);
                push_f16(dst, min);
                dst.extend_from_slice(&qh.to_le_bytes());
                dst.extend_from_slice(&qs);
            }
            DType::Q8_0 => {
                let amax = block.iter().fold(0.0f32, |a, &x| a.max(x.abs()));
                let d = amax / 127.0;
                let id = inverse(d);
                push_f16(dst, d);
                for &x in block {
                    dst.push((x * id).round() as i8 as u8);
                }
            }
            DType::F32 | DType::F16 => unreachable!("float types are not block encoded"),
        }
    }
}

/// Decodes one row of blocks into `dst`.
pub fn dequantize_row(dtype: DType, src: &[u8], dst: &mut [f32]) {
    let type_size = dtype.type_size();
    for (block, out) in src.chunks_exact(type_size).zip(dst.chunks_exact_mut(QK)) {
        match dtype {
            DType::Q4_0 => {
                let d = read_f16(block, 0);
                for j in 0..QK / 2 {
                    let b = block[2 + j];
                    out[j] = ((b & 0x0F) as i32 - 8) as f32 * d;
                    out[j + QK / 2] = ((b >> 4) as i32 - 8) as f32 * d;
                }
            }
            DType::Q4_1 => {
                let d = read_f16(block, 0);
                let m = read_f16(block, 2);
                for j in 0..QK / 2 {
                    let b = block[4 + j];
                    out[j] = (b & 0x0F) as f32 * d + m;
                    out[j + QK / 2] = (b >> 4) as f32 * d + m;
                }
            }
            DType::Q5_0 => {
                let d = read_f16(block, 0);
                let qh = read_u32(block, 2);
                for j in 0..QK / 2 {
                    let b = block[6 + j];
                    let h0 = (((qh >> j) << 4) & 0x10) as u8;
                    let h1 = ((qh >> (j + 12)) & 0x10) as u8;
                    out[j] = (((b & 0x0F) | h0) as i32 - 16) as f32 * d;
                    out[j + QK / 2] = (((b >> 4) | h1) as i32 - 16) as f32 * d;
                }
            }
            DType::Q5_1 => {
                let d = read_f16(block, 0);
                let m = read_f16(block, 2);
                let qh = read_u32(block, 4);
                for j in 0..QK / 2 {
                    let b = block[8 + j];
                    let h0 = (((qh >> j) << 4) & 0x10) as u8;
                    let h1 = ((qh >> (j + 12)) & 0x10) as u8;
                    out[j] = ((b & 0x0F) | h0) as f32 * d + m;
                    out[j + QK / 2] = ((b >> 4) | h1) as f32 * d + m;
                }
            }
            DType::Q8_0 => {
                let d = read_f16(block, 0);
                for j in 0..QK {
                    out[j] = (block[2 + j] as i8) as f32 * d;
                }
            }
            DType::F32 | DType::F16 => unreachable!("float types are not block encoded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Vec<f32> {
        (0..64).map(|i| (i as f32 - 31.5) / 8.0).collect()
    }

    fn max_error(dtype: DType) -> f32 {
        let src = ramp();
        let mut bytes = Vec::new();
        quantize_row(dtype, &src, &mut bytes);
        assert_eq!(bytes.len(), dtype.row_bytes(src.len()).unwrap());

        let mut out = vec![0.0; src.len()];
        dequantize_row(dtype, &bytes, &mut out);
        src.iter().zip(&out).map(|(a, b)| (a - b).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_q8_0_is_close() {
        assert!(max_error(DType::Q8_0) < 0.02);
    }

    #[test]
    fn test_five_bit_formats_are_close() {
        assert!(max_error(DType::Q5_0) < 0.15);
        assert!(max_error(DType::Q5_1) < 0.1);
    }

    #[test]
    fn test_four_bit_formats_are_close() {
        assert!(max_error(DType::Q4_0) < 0.3);
        assert!(max_error(DType::Q4_1) < 0.2);
    }

    #[test]
    fn test_zero_block() {
        let mut bytes = Vec::new();
        quantize_row(DType::Q4_0, &[0.0; QK], &mut bytes);
        let mut out = vec![1.0; QK];
        dequantize_row(DType::Q4_0, &bytes, &mut out);
        assert!(out.iter().all(|&x| x == 0.0));
    }
}
