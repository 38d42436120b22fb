//! Pixel format conversion: native 4:2:2 -> I420 -> ARGB
//!
//! All functions are pure. Buffer sizes are preconditions: a mismatch is a
//! programming error and panics instead of truncating or padding.
//!
//! "ARGB" follows the libyuv naming: one little-endian 32-bit word per pixel,
//! so the bytes in memory are B, G, R, A. This is what X11 `ZPixmap` images
//! with depth 24/32 and most little-endian display surfaces expect.

use crate::capture::{FrameDimensions, PixelFormat};

/// Convert one raw frame into a newly allocated I420 buffer.
pub fn to_i420(raw: &[u8], dims: FrameDimensions, format: PixelFormat) -> Vec<u8> {
    let mut out = vec![0u8; dims.i420_len()];
    to_i420_into(raw, dims, format, &mut out);
    out
}

/// Convert one I420 buffer into a newly allocated ARGB buffer.
pub fn to_argb(i420: &[u8], dims: FrameDimensions) -> Vec<u8> {
    let mut out = vec![0u8; dims.argb_len()];
    to_argb_into(i420, dims, &mut out);
    out
}

/// Convert a raw 4:2:2 frame into I420, writing into `out`.
///
/// Luma is copied sample for sample. Each 4:2:0 chroma sample is the
/// rounded average of the two vertically adjacent 4:2:2 samples it covers.
pub fn to_i420_into(raw: &[u8], dims: FrameDimensions, format: PixelFormat, out: &mut [u8]) {
    assert_eq!(
        raw.len(),
        format.frame_len(dims),
        "raw {:?} frame size does not match {}",
        format,
        dims
    );
    assert_eq!(out.len(), dims.i420_len(), "I420 buffer size does not match {}", dims);

    let w = dims.width() as usize;
    let h = dims.height() as usize;
    let half = w / 2;

    let (y_plane, chroma) = out.split_at_mut(dims.luma_len());
    let (u_plane, v_plane) = chroma.split_at_mut(dims.chroma_len());

    match format {
        PixelFormat::I422 => {
            let (src_y, src_chroma) = raw.split_at(dims.luma_len());
            let (src_u, src_v) = src_chroma.split_at(half * h);
            y_plane.copy_from_slice(src_y);
            subsample_plane(src_u, u_plane, half);
            subsample_plane(src_v, v_plane, half);
        }
        PixelFormat::Yuyv | PixelFormat::Uyvy => {
            // byte offsets inside one Y0 U Y1 V / U Y0 V Y1 macropixel
            let (y_off, u_off, v_off) = match format {
                PixelFormat::Yuyv => (0, 1, 3),
                _ => (1, 0, 2),
            };
            let stride = w * 2;

            for (src, dst) in raw.chunks_exact(stride).zip(y_plane.chunks_exact_mut(w)) {
                for (px, y) in src.chunks_exact(2).zip(dst.iter_mut()) {
                    *y = px[y_off];
                }
            }

            let rows = raw.chunks_exact(stride * 2);
            let u_rows = u_plane.chunks_exact_mut(half);
            let v_rows = v_plane.chunks_exact_mut(half);
            for ((pair, u_row), v_row) in rows.zip(u_rows).zip(v_rows) {
                let (top, bottom) = pair.split_at(stride);
                let macro_pixels = top.chunks_exact(4).zip(bottom.chunks_exact(4));
                for ((t, b), (u, v)) in macro_pixels.zip(u_row.iter_mut().zip(v_row.iter_mut())) {
                    *u = average(t[u_off], b[u_off]);
                    *v = average(t[v_off], b[v_off]);
                }
            }
        }
    }
}

/// Convert I420 into packed ARGB (B, G, R, A bytes), writing into `out`.
///
/// BT.601 limited range with 8-bit fixed-point coefficients. Alpha is
/// always 255.
pub fn to_argb_into(i420: &[u8], dims: FrameDimensions, out: &mut [u8]) {
    assert_eq!(i420.len(), dims.i420_len(), "I420 buffer size does not match {}", dims);
    assert_eq!(out.len(), dims.argb_len(), "ARGB buffer size does not match {}", dims);

    let w = dims.width() as usize;
    let half = w / 2;

    let (y_plane, chroma) = i420.split_at(dims.luma_len());
    let (u_plane, v_plane) = chroma.split_at(dims.chroma_len());

    for (row, (y_row, out_row)) in y_plane
        .chunks_exact(w)
        .zip(out.chunks_exact_mut(w * 4))
        .enumerate()
    {
        let u_row = &u_plane[(row / 2) * half..][..half];
        let v_row = &v_plane[(row / 2) * half..][..half];
        for (col, (&y, px)) in y_row.iter().zip(out_row.chunks_exact_mut(4)).enumerate() {
            let [r, g, b] = yuv_to_rgb(y, u_row[col / 2], v_row[col / 2]);
            px.copy_from_slice(&[b, g, r, 255]);
        }
    }
}

/// BT.601 limited range YUV -> RGB.
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    [
        clamp((c + 409 * e + 128) >> 8),
        clamp((c - 100 * d - 208 * e + 128) >> 8),
        clamp((c + 516 * d + 128) >> 8),
    ]
}

#[inline]
fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[inline]
fn average(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) >> 1) as u8
}

/// Halve a full-height chroma plane vertically.
fn subsample_plane(src: &[u8], dst: &mut [u8], width: usize) {
    for (pair, out) in src.chunks_exact(width * 2).zip(dst.chunks_exact_mut(width)) {
        let (top, bottom) = pair.split_at(width);
        for ((&t, &b), o) in top.iter().zip(bottom).zip(out.iter_mut()) {
            *o = average(t, b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameSource, SyntheticSource};

    fn frame(dims: FrameDimensions, format: PixelFormat, yuv: [u8; 3]) -> Vec<u8> {
        let mut src = SyntheticSource::solid(dims, format, yuv);
        src.start_stream().unwrap();
        let mut raw = vec![0u8; format.frame_len(dims)];
        src.fetch_frame(&mut raw).unwrap();
        raw
    }

    #[test]
    fn output_sizes() {
        for (w, h) in [(2, 2), (4, 2), (16, 8), (752, 480), (1920, 1080)] {
            let dims = FrameDimensions::new(w, h).unwrap();
            let raw = vec![0u8; PixelFormat::Yuyv.frame_len(dims)];
            let i420 = to_i420(&raw, dims, PixelFormat::Yuyv);
            assert_eq!(i420.len(), (w * h * 3 / 2) as usize);
            assert_eq!(to_argb(&i420, dims).len(), (w * h * 4) as usize);
        }
    }

    #[test]
    fn white_survives_both_stages() {
        let dims = FrameDimensions::new(8, 4).unwrap();
        for format in [PixelFormat::I422, PixelFormat::Yuyv, PixelFormat::Uyvy] {
            let i420 = to_i420(&frame(dims, format, [235, 128, 128]), dims, format);
            assert!(i420[..dims.luma_len()].iter().all(|&y| y == 235));
            assert!(i420[dims.luma_len()..].iter().all(|&c| c == 128));

            let argb = to_argb(&i420, dims);
            for px in argb.chunks_exact(4) {
                for &channel in &px[..3] {
                    assert!(channel >= 253, "{:?}", px);
                }
                assert_eq!(px[3], 255);
            }
        }
    }

    #[test]
    fn black_and_mid_gray() {
        assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
        assert_eq!(yuv_to_rgb(126, 128, 128), [128, 128, 128]);
    }

    #[test]
    fn argb_bytes_are_bgra_in_memory() {
        let dims = FrameDimensions::new(2, 2).unwrap();
        // BT.601 red
        let i420 = to_i420(&frame(dims, PixelFormat::I422, [81, 90, 240]), dims, PixelFormat::I422);
        let argb = to_argb(&i420, dims);
        assert_eq!(&argb[..4], &[0, 0, 255, 255]);
    }

    #[test]
    fn luma_passes_through_untouched() {
        let dims = FrameDimensions::new(4, 2).unwrap();
        #[rustfmt::skip]
        let raw = [
            10, 100, 11, 200,   12, 100, 13, 200,
            20, 50,  21, 60,    22, 50,  23, 60,
        ];
        let i420 = to_i420(&raw, dims, PixelFormat::Yuyv);
        assert_eq!(&i420[..8], &[10, 11, 12, 13, 20, 21, 22, 23]);
    }

    #[test]
    fn chroma_averages_vertical_pairs_with_rounding() {
        let dims = FrameDimensions::new(4, 2).unwrap();
        #[rustfmt::skip]
        let raw = [
            0, 100, 0, 200,   0, 7, 0, 9,
            0, 51,  0, 60,    0, 8, 0, 10,
        ];
        let i420 = to_i420(&raw, dims, PixelFormat::Yuyv);
        // U: (100+51+1)/2 = 76, (7+8+1)/2 = 8; V: (200+60+1)/2 = 130, (9+10+1)/2 = 10
        assert_eq!(&i420[8..], &[76, 8, 130, 10]);

        let uyvy: Vec<u8> = raw
            .chunks_exact(4)
            .flat_map(|m| [m[1], m[0], m[3], m[2]])
            .collect();
        assert_eq!(to_i420(&uyvy, dims, PixelFormat::Uyvy), i420);
    }

    #[test]
    fn planar_and_packed_agree() {
        let dims = FrameDimensions::new(4, 4).unwrap();
        let w = 4;
        let mut yuyv = Vec::new();
        let mut y = Vec::new();
        let mut u = Vec::new();
        let mut v = Vec::new();
        for row in 0..4u8 {
            for pair in 0..2u8 {
                let (y0, y1, cu, cv) = (row * 10 + pair, row * 10 + pair + 5, 40 + row * 3, 90 + pair * 7 + row);
                yuyv.extend_from_slice(&[y0, cu, y1, cv]);
                y.extend_from_slice(&[y0, y1]);
                u.push(cu);
                v.push(cv);
            }
        }
        assert_eq!(y.len(), w * 4);
        let planar = [y, u, v].concat();
        assert_eq!(
            to_i420(&planar, dims, PixelFormat::I422),
            to_i420(&yuyv, dims, PixelFormat::Yuyv)
        );
    }

    #[test]
    fn conversions_are_deterministic() {
        let dims = FrameDimensions::new(64, 32).unwrap();
        let mut src = SyntheticSource::bars(dims, PixelFormat::Yuyv);
        src.start_stream().unwrap();
        let mut raw = vec![0u8; PixelFormat::Yuyv.frame_len(dims)];
        src.fetch_frame(&mut raw).unwrap();

        let first = to_i420(&raw, dims, PixelFormat::Yuyv);
        let second = to_i420(&raw, dims, PixelFormat::Yuyv);
        assert_eq!(first, second);
        assert_eq!(to_argb(&first, dims), to_argb(&second, dims));
    }

    #[test]
    #[should_panic(expected = "frame size does not match")]
    fn short_raw_frame_is_a_defect() {
        let dims = FrameDimensions::new(4, 2).unwrap();
        to_i420(&[0u8; 8], dims, PixelFormat::Yuyv);
    }
}
