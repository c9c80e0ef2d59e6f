use std::fmt::Display;
use std::str::FromStr;

use image::GrayImage;
use serde::Serialize;

use super::hash;
use crate::{Error, Result};

const MAX_HASH_SIZE: usize = 1024;

/// Supported signature algorithms.
///
/// The four perceptual hashes and `BlockHash` produce bit-vector signatures compared by
/// Hamming distance. `Sad` produces a grayscale thumbnail compared by the sum of absolute
/// differences.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// DCT-based perceptual hash. A good general choice.
    PHash,
    /// Difference (gradient) hash. Fast, good for video.
    DHash,
    /// Average hash. Fastest but less robust.
    AHash,
    /// Wavelet hash. Most robust but slowest. Requires a power-of-two hash size.
    WHash,
    /// Block-mean hash. Only hash sizes 4, 8, 12 and 16 are available.
    BlockHash,
    /// Sum of absolute differences over a 64x64 grayscale thumbnail.
    Sad,
}

impl Algorithm {
    pub const ALL: [Algorithm; 6] = [
        Algorithm::PHash,
        Algorithm::DHash,
        Algorithm::AHash,
        Algorithm::WHash,
        Algorithm::BlockHash,
        Algorithm::Sad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PHash => "phash",
            Self::DHash => "dhash",
            Self::AHash => "ahash",
            Self::WHash => "whash",
            Self::BlockHash => "blockhash",
            Self::Sad => "sad",
        }
    }

    /// Returns `true` if this algorithm produces bit-vector signatures.
    pub fn is_hash(&self) -> bool {
        !matches!(self, Self::Sad)
    }

    /// Checks that `hash_size` can be used with this algorithm. `Sad` ignores the hash size.
    pub fn validate_hash_size(&self, hash_size: usize) -> Result<()> {
        let valid = match self {
            Self::Sad => true,
            Self::PHash | Self::DHash | Self::AHash => hash_size > 0,
            Self::WHash => hash_size.is_power_of_two(),
            Self::BlockHash => matches!(hash_size, 4 | 8 | 12 | 16),
        };
        // Thumbnail sides are `u32`, and the DCT input is four times the hash size.
        if !valid || (self.is_hash() && hash_size > MAX_HASH_SIZE) {
            return Err(Error::InvalidHashSize {
                algorithm: *self,
                hash_size,
            });
        }
        Ok(())
    }
}

impl Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or(Error::UnsupportedAlgorithm(s))
    }
}

/// A fixed-length bit-vector, packed into 64-bit words.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BitSignature {
    words: Vec<u64>,
    len: usize,
}

impl BitSignature {
    pub fn from_bits(bits: impl IntoIterator<Item = bool>) -> Self {
        let mut words = Vec::new();
        let mut len = 0;
        for bit in bits {
            if len % 64 == 0 {
                words.push(0);
            }
            if bit {
                if let Some(word) = words.last_mut() {
                    *word |= 1 << (len % 64);
                }
            }
            len += 1;
        }
        Self { words, len }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_bits(
            bytes
                .iter()
                .flat_map(|byte| (0..8).map(move |i| byte & (1 << i) != 0)),
        )
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of differing bits. Both signatures must have the same length.
    #[inline]
    pub fn hamming(&self, other: &Self) -> u64 {
        self.words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| u64::from((a ^ b).count_ones()))
            .sum()
    }
}

/// A fixed-length vector of grayscale samples.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PixelSignature {
    pixels: Vec<u8>,
}

impl PixelSignature {
    pub fn new(pixels: Vec<u8>) -> Self {
        Self { pixels }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Sum of absolute differences. Both signatures must have the same length.
    #[inline]
    pub fn sad(&self, other: &Self) -> u64 {
        self.pixels
            .iter()
            .zip(&other.pixels)
            .map(|(&a, &b)| u64::from(a.abs_diff(b)))
            .sum()
    }
}

/// Variant and length of a [Signature]. Distances are only defined between equal shapes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SignatureShape {
    Bits(usize),
    Pixels(usize),
}

/// A comparable summary of a single frame.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Signature {
    Bits(BitSignature),
    Pixels(PixelSignature),
}

impl Signature {
    pub fn shape(&self) -> SignatureShape {
        match self {
            Self::Bits(b) => SignatureShape::Bits(b.len()),
            Self::Pixels(p) => SignatureShape::Pixels(p.len()),
        }
    }

    /// Returns the distance between two signatures, or `None` if their shapes differ.
    ///
    /// The distance is symmetric, and zero for identical signatures.
    #[inline]
    pub fn distance(&self, other: &Self) -> Option<u64> {
        match (self, other) {
            (Self::Bits(a), Self::Bits(b)) if a.len() == b.len() => Some(a.hamming(b)),
            (Self::Pixels(a), Self::Pixels(b)) if a.len() == b.len() => Some(a.sad(b)),
            _ => None,
        }
    }
}

/// Converts frames into [Signature]s with a fixed algorithm and hash size.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Extractor {
    algorithm: Algorithm,
    hash_size: u32,
}

impl Extractor {
    /// Constructs a new [Extractor], failing if `hash_size` is unusable with `algorithm`.
    pub fn new(algorithm: Algorithm, hash_size: usize) -> Result<Self> {
        algorithm.validate_hash_size(hash_size)?;
        Ok(Self {
            algorithm,
            hash_size: hash_size as u32,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Computes the signature of a single frame. This is a pure function of the frame.
    pub fn extract(&self, frame: &GrayImage) -> Signature {
        let size = self.hash_size;
        match self.algorithm {
            Algorithm::PHash => Signature::Bits(BitSignature::from_bits(hash::dct_hash(frame, size))),
            Algorithm::DHash => {
                Signature::Bits(BitSignature::from_bits(hash::gradient_hash(frame, size)))
            }
            Algorithm::AHash => Signature::Bits(BitSignature::from_bits(hash::mean_hash(frame, size))),
            Algorithm::WHash => {
                Signature::Bits(BitSignature::from_bits(hash::wavelet_hash(frame, size)))
            }
            Algorithm::BlockHash => {
                // The hash size was validated on construction.
                let bytes = hash::block_hash(frame, size).unwrap_or_default();
                Signature::Bits(BitSignature::from_bytes(&bytes))
            }
            Algorithm::Sad => Signature::Pixels(PixelSignature::new(hash::pixel_thumbnail(frame))),
        }
    }
}

/// Computes the signature of `frame` with the given algorithm and hash size.
pub fn extract(frame: &GrayImage, algorithm: Algorithm, hash_size: usize) -> Result<Signature> {
    Ok(Extractor::new(algorithm, hash_size)?.extract(frame))
}

/// Time-ordered signatures of one video, as produced by a single sampling pass.
///
/// Timestamps are strictly increasing and every signature has the same shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignatureSeries {
    timestamps: Vec<f64>,
    signatures: Vec<Signature>,
}

impl SignatureSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a signature, rejecting shape changes and non-increasing timestamps.
    pub fn push(&mut self, timestamp: f64, signature: Signature) -> Result<()> {
        if let Some(shape) = self.shape() {
            if signature.shape() != shape {
                return Err(Error::SignatureShapeMismatch);
            }
        }
        if let Some(&last) = self.timestamps.last() {
            if timestamp <= last {
                return Err(Error::UnorderedTimestamps {
                    previous: last,
                    timestamp,
                });
            }
        }
        self.timestamps.push(timestamp);
        self.signatures.push(signature);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn shape(&self) -> Option<SignatureShape> {
        self.signatures.first().map(Signature::shape)
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, &Signature)> {
        self.timestamps.iter().copied().zip(self.signatures.iter())
    }
}
