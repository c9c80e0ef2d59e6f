extern crate blockhash;
extern crate image;

use image::imageops::{self, FilterType};
use image::GrayImage;
use rustdct::{Dct2, DctPlanner};

use super::PIXEL_SIGNATURE_SIZE;

/// Ratio between the DCT input size and the hash size for [dct_hash].
const DCT_HIGHFREQ_FACTOR: u32 = 4;

#[inline]
fn resize(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    imageops::resize(image, width, height, FilterType::Lanczos3)
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.is_empty() {
        0.0
    } else if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Frequency-domain hash: the low-frequency corner of a 2-D DCT-II, thresholded at its median.
pub(crate) fn dct_hash(image: &GrayImage, hash_size: u32) -> Vec<bool> {
    let n = hash_size * DCT_HIGHFREQ_FACTOR;
    let small = resize(image, n, n);
    let n = n as usize;
    let hash_size = hash_size as usize;

    let mut planner = DctPlanner::new();
    let dct = planner.plan_dct2(n);

    // Rows first, then columns via a transpose. After the second pass `coeffs[c * n + r]`
    // holds the coefficient at row `r`, column `c`.
    let mut rows: Vec<f64> = small.as_raw().iter().map(|&p| f64::from(p)).collect();
    for row in rows.chunks_exact_mut(n) {
        dct.process_dct2(row);
    }
    let mut coeffs = vec![0.0; n * n];
    for r in 0..n {
        for c in 0..n {
            coeffs[c * n + r] = rows[r * n + c];
        }
    }
    for col in coeffs.chunks_exact_mut(n) {
        dct.process_dct2(col);
    }

    let mut low_freq = Vec::with_capacity(hash_size * hash_size);
    for r in 0..hash_size {
        for c in 0..hash_size {
            low_freq.push(coeffs[c * n + r]);
        }
    }
    let med = median(&low_freq);
    low_freq.into_iter().map(|v| v > med).collect()
}

/// Gradient hash: one bit per horizontally adjacent pixel pair, set when brightness increases.
pub(crate) fn gradient_hash(image: &GrayImage, hash_size: u32) -> Vec<bool> {
    let small = resize(image, hash_size + 1, hash_size);
    let mut bits = Vec::with_capacity((hash_size * hash_size) as usize);
    for y in 0..hash_size {
        for x in 0..hash_size {
            bits.push(small.get_pixel(x + 1, y)[0] > small.get_pixel(x, y)[0]);
        }
    }
    bits
}

/// Mean hash: each pixel of a `hash_size` square thumbnail compared to the thumbnail mean.
pub(crate) fn mean_hash(image: &GrayImage, hash_size: u32) -> Vec<bool> {
    let small = resize(image, hash_size, hash_size);
    let pixels = small.as_raw();
    let mean = pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / pixels.len() as f64;
    pixels.iter().map(|&p| f64::from(p) > mean).collect()
}

// One level of a 2-D Haar decomposition, keeping only the LL (approximation) band.
fn haar_ll(values: &[f64], size: usize) -> Vec<f64> {
    let half = size / 2;
    let mut out = Vec::with_capacity(half * half);
    for y in 0..half {
        for x in 0..half {
            let (r0, r1) = (2 * y * size, (2 * y + 1) * size);
            let sum = values[r0 + 2 * x]
                + values[r0 + 2 * x + 1]
                + values[r1 + 2 * x]
                + values[r1 + 2 * x + 1];
            out.push(sum / 2.0);
        }
    }
    out
}

/// Multi-resolution hash: Haar approximation coefficients of a power-of-two thumbnail with the
/// DC component removed, thresholded at their median.
///
/// `hash_size` must be a power of two.
pub(crate) fn wavelet_hash(image: &GrayImage, hash_size: u32) -> Vec<bool> {
    let smaller_side = image.width().min(image.height()).max(1);
    // Largest power of two that fits in the frame, but never below the hash size.
    let natural_scale = 1u32 << (31 - smaller_side.leading_zeros());
    let scale = natural_scale.max(hash_size);
    let small = resize(image, scale, scale);

    let mut values: Vec<f64> = small
        .as_raw()
        .iter()
        .map(|&p| f64::from(p) / 255.0)
        .collect();

    // The coarsest LL coefficient is proportional to the mean; zeroing it subtracts the mean.
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter_mut().for_each(|v| *v -= mean);

    let mut size = scale as usize;
    while size > hash_size as usize {
        values = haar_ll(&values, size);
        size /= 2;
    }

    let med = median(&values);
    values.into_iter().map(|v| v > med).collect()
}

// Wraps a GRAY8 image to implement [blockhash::Image].
struct GrayFrameView<'a> {
    inner: &'a GrayImage,
}

impl<'a> blockhash::Image for GrayFrameView<'a> {
    #[inline(always)]
    fn dimensions(&self) -> (u32, u32) {
        self.inner.dimensions()
    }

    #[inline(always)]
    fn get_pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let luma = self.inner.get_pixel(x, y)[0];
        [luma, luma, luma, 0xFF] // alpha defaults to 0xFF
    }
}

/// Block-mean hash computed by the `blockhash` crate.
///
/// Returns `None` for hash sizes the crate does not provide (anything but 4, 8, 12 and 16).
pub(crate) fn block_hash(image: &GrayImage, hash_size: u32) -> Option<Vec<u8>> {
    let view = GrayFrameView { inner: image };
    let bytes = match hash_size {
        4 => <[u8; 2]>::from(blockhash::blockhash16(&view)).to_vec(),
        8 => <[u8; 8]>::from(blockhash::blockhash64(&view)).to_vec(),
        12 => <[u8; 18]>::from(blockhash::blockhash144(&view)).to_vec(),
        16 => <[u8; 32]>::from(blockhash::blockhash256(&view)).to_vec(),
        _ => return None,
    };
    Some(bytes)
}

/// Direct-pixel reduction: a fixed-size grayscale thumbnail, flattened row by row.
pub(crate) fn pixel_thumbnail(image: &GrayImage) -> Vec<u8> {
    resize(image, PIXEL_SIGNATURE_SIZE, PIXEL_SIGNATURE_SIZE).into_raw()
}

#[cfg(test)]
mod test {
    use super::*;

    fn ramp(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| image::Luma([((x * 3 + y * 2) % 256) as u8]))
    }

    fn checkerboard(width: u32, height: u32, cell: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            image::Luma([if (x / cell + y / cell) % 2 == 0 { 40 } else { 220 }])
        })
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
    }

    #[test]
    fn test_hash_lengths() {
        let img = ramp(160, 90);
        assert_eq!(dct_hash(&img, 8).len(), 64);
        assert_eq!(gradient_hash(&img, 8).len(), 64);
        assert_eq!(mean_hash(&img, 16).len(), 256);
        assert_eq!(wavelet_hash(&img, 8).len(), 64);
        assert_eq!(block_hash(&img, 12).unwrap().len(), 18);
        assert!(block_hash(&img, 10).is_none());
        assert_eq!(pixel_thumbnail(&img).len(), 64 * 64);
    }

    #[test]
    fn test_gradient_hash_follows_brightness() {
        // Brightness grows left to right, so every pair increases.
        let img = GrayImage::from_fn(90, 80, |x, _| image::Luma([(x * 2) as u8]));
        assert!(gradient_hash(&img, 8).into_iter().all(|b| b));
    }

    #[test]
    fn test_mean_hash_of_split_frame() {
        let img = GrayImage::from_fn(64, 64, |x, _| image::Luma([if x < 32 { 0 } else { 255 }]));
        let bits = mean_hash(&img, 4);
        for row in bits.chunks(4) {
            assert_eq!(row, &[false, false, true, true]);
        }
    }

    #[test]
    fn test_hashes_differ_between_patterns() {
        let (a, b) = (ramp(128, 96), checkerboard(128, 96, 16));
        assert_ne!(dct_hash(&a, 8), dct_hash(&b, 8));
        assert_ne!(wavelet_hash(&a, 8), wavelet_hash(&b, 8));
    }

    #[test]
    fn test_wavelet_hash_small_frame() {
        // Frames smaller than the hash are upscaled to the hash size.
        let img = checkerboard(6, 5, 2);
        assert_eq!(wavelet_hash(&img, 8).len(), 64);
    }
}
