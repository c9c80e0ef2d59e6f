use std::path::PathBuf;

use serde::Serialize;

use crate::util;

/// Metadata for a single video stream, as reported by a [Backend](super::Backend).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VideoInfo {
    pub path: PathBuf,
    pub fps: f64,
    /// Duration in seconds.
    pub duration: f64,
    pub frame_count: usize,
    pub width: u32,
    pub height: u32,
}

/// Result of an offset search. This is output by [Finder::find_offset](super::Finder::find_offset).
///
/// A positive offset means the distorted video starts later in the content than the
/// reference. `confidence` is the winning average signature distance of the final phase:
/// lower is better, and values are only comparable between runs that use the same
/// algorithm and hash size.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OffsetResult {
    pub offset_frames: i64,
    pub offset_seconds: f64,
    pub offset_timestamp: String,
    pub confidence: f64,
    pub fps_used: f64,
    pub method: String,
}

impl OffsetResult {
    /// Builds a result, rounding `offset_seconds` to whole frames at `frame_rate`.
    pub(crate) fn new(
        offset_seconds: f64,
        frame_rate: f64,
        confidence: f64,
        fps_used: f64,
        method: String,
    ) -> Self {
        Self {
            offset_frames: (offset_seconds * frame_rate).round() as i64,
            offset_seconds,
            offset_timestamp: util::format_timestamp(offset_seconds),
            confidence,
            fps_used,
            method,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_offset_result_json_shape() {
        let result = OffsetResult::new(2.0, 25.0, 0.0, 10.0, "hierarchical_phash".to_string());
        let json = serde_json::to_string_pretty(&result).unwrap();
        insta::assert_snapshot!(json, @r###"
        {
          "offset_frames": 50,
          "offset_seconds": 2.0,
          "offset_timestamp": "00:00:02.000",
          "confidence": 0.0,
          "fps_used": 10.0,
          "method": "hierarchical_phash"
        }
        "###);
    }

    #[test]
    fn test_negative_offset_rounds_to_frames() {
        let result = OffsetResult::new(-2.04, 25.0, 3.5, 25.0, "frame_accurate_sad".to_string());
        assert_eq!(result.offset_frames, -51);
        assert_eq!(result.offset_timestamp, "-00:00:02.040");
    }
}
