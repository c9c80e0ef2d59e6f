use super::{CancelToken, Signature};
use crate::{Error, Result};

/// Best alignment between two signature series.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correlation {
    /// `dist[i]` is aligned with `ref[i + lag]`. Positive means the distorted content starts
    /// later than the reference.
    pub lag: i64,
    /// Average distance over the overlap at `lag`. Infinite when no lag was evaluated.
    pub distance: f64,
    pub lags_evaluated: usize,
}

impl Correlation {
    const DEGENERATE: Self = Self {
        lag: 0,
        distance: f64::INFINITY,
        lags_evaluated: 0,
    };

    /// Returns `true` if no lag had an overlap, i.e., one of the series was empty.
    pub fn is_degenerate(&self) -> bool {
        self.lags_evaluated == 0
    }
}

/// Finds the lag that minimizes the average distance between overlapping signatures.
///
/// See [correlate_with_cancel].
pub fn correlate(reference: &[Signature], distorted: &[Signature]) -> Result<Correlation> {
    correlate_with_cancel(reference, distorted, None)
}

/// Finds the lag that minimizes the average distance between overlapping signatures.
///
/// Every lag in `-(m - 1)..=(n - 1)` is scored, where `n` and `m` are the lengths of the two
/// series. Lags are scanned in ascending order and only a strictly smaller average replaces
/// the current best, so ties keep the most negative lag.
///
/// If either series is empty, no lag is scored and a degenerate [Correlation] is returned
/// (see [Correlation::is_degenerate]). Signatures of different shapes fail with
/// [Error::SignatureShapeMismatch]. The token, if any, is checked once per lag.
pub fn correlate_with_cancel(
    reference: &[Signature],
    distorted: &[Signature],
    cancel: Option<&CancelToken>,
) -> Result<Correlation> {
    if reference.is_empty() || distorted.is_empty() {
        return Ok(Correlation::DEGENERATE);
    }

    let shape = reference[0].shape();
    if reference
        .iter()
        .chain(distorted.iter())
        .any(|s| s.shape() != shape)
    {
        return Err(Error::SignatureShapeMismatch);
    }

    let _g = tracing::span!(
        tracing::Level::TRACE,
        "correlate",
        n = reference.len(),
        m = distorted.len()
    )
    .entered();

    let n = reference.len() as i64;
    let m = distorted.len() as i64;
    let mut best = Correlation::DEGENERATE;

    for lag in -(m - 1)..n {
        if cancel.map_or(false, CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }

        // Overlap: 0 <= i < m and 0 <= i + lag < n.
        let start = (-lag).max(0);
        let end = m.min(n - lag);
        if start >= end {
            continue;
        }

        let mut total = 0u64;
        for i in start..end {
            let d = &distorted[i as usize];
            let r = &reference[(i + lag) as usize];
            total += d.distance(r).ok_or(Error::SignatureShapeMismatch)?;
        }
        let average = total as f64 / (end - start) as f64;

        best.lags_evaluated += 1;
        if average < best.distance {
            best.lag = lag;
            best.distance = average;
        }
    }

    tracing::trace!(lag = best.lag, distance = best.distance, "correlation complete");

    Ok(best)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::video::{BitSignature, PixelSignature};

    fn bits(value: u64) -> Signature {
        Signature::Bits(BitSignature::from_bits((0..64).map(|i| value & (1 << i) != 0)))
    }

    // A deterministic series with distinct, well-separated signatures.
    fn series(len: usize, seed: u64) -> Vec<Signature> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                bits(x)
            })
            .collect()
    }

    #[test]
    fn test_evaluates_every_lag() {
        for (n, m) in [(1, 1), (1, 5), (7, 3), (10, 10), (4, 9)] {
            let c = correlate(&series(n, 1), &series(m, 2)).unwrap();
            assert_eq!(c.lags_evaluated, n + m - 1, "n={} m={}", n, m);
            assert!(c.lag >= -(m as i64 - 1) && c.lag <= n as i64 - 1);
        }
    }

    #[test]
    fn test_self_correlation() {
        let s = series(30, 7);
        let c = correlate(&s, &s).unwrap();
        assert_eq!(c.lag, 0);
        assert_eq!(c.distance, 0.0);
    }

    #[test]
    fn test_shifted_subseries() {
        let s = series(40, 11);
        for k in [1, 5, 12, 25] {
            // The distorted series starts k signatures into the reference.
            let c = correlate(&s, &s[k..]).unwrap();
            assert_eq!((c.lag, c.distance), (k as i64, 0.0));

            // The reference starts k signatures into the distorted series.
            let c = correlate(&s[k..], &s).unwrap();
            assert_eq!((c.lag, c.distance), (-(k as i64), 0.0));
        }
    }

    #[test]
    fn test_ties_keep_first_lag() {
        // Every lag has the same average distance.
        let s = vec![bits(0); 5];
        let c = correlate(&s, &s).unwrap();
        assert_eq!(c.lag, -4);
        assert_eq!(c.distance, 0.0);
    }

    #[test]
    fn test_pixel_signatures() {
        let px = |v: u8| Signature::Pixels(PixelSignature::new(vec![v; 16]));
        let reference: Vec<_> = [10, 50, 90, 130, 170].into_iter().map(px).collect();
        let distorted = vec![px(91), px(131)];
        let c = correlate(&reference, &distorted).unwrap();
        assert_eq!(c.lag, 2);
        assert_eq!(c.distance, 16.0);
    }

    #[test]
    fn test_empty_series_is_degenerate() {
        let s = series(4, 3);
        for c in [correlate(&s, &[]), correlate(&[], &s), correlate(&[], &[])] {
            let c = c.unwrap();
            assert!(c.is_degenerate());
            assert_eq!(c.lag, 0);
            assert!(c.distance.is_infinite());
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let reference = series(3, 5);
        let distorted = vec![Signature::Pixels(PixelSignature::new(vec![0; 64]))];
        assert!(matches!(
            correlate(&reference, &distorted),
            Err(Error::SignatureShapeMismatch)
        ));
    }

    #[test]
    fn test_cancellation() {
        let token = CancelToken::new();
        token.cancel();
        let s = series(5, 9);
        assert!(matches!(
            correlate_with_cancel(&s, &s, Some(&token)),
            Err(Error::Cancelled)
        ));
    }
}
