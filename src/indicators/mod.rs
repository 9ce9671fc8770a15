/// Calculate the full Exponential Moving Average series.
///
/// Seeds with the SMA of the first `period` values, so the output has
/// `prices.len() - period + 1` entries aligned to the tail of the input.
pub fn ema_series(prices: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let initial_sma: f64 = prices[..period].iter().sum::<f64>() / period as f64;

    let mut series = Vec::with_capacity(prices.len() - period + 1);
    let mut ema = initial_sma;
    series.push(ema);
    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
        series.push(ema);
    }
    Some(series)
}

/// MACD histogram series: (fast EMA − slow EMA) − signal EMA of that
/// difference. Returns entries aligned to the tail of the input.
pub fn macd_histogram_series(
    prices: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<Vec<f64>> {
    if fast >= slow {
        return None;
    }

    let fast_ema = ema_series(prices, fast)?;
    let slow_ema = ema_series(prices, slow)?;

    // Both series are tail-aligned; truncate the fast one to match.
    let offset = fast_ema.len() - slow_ema.len();
    let macd_line: Vec<f64> = slow_ema
        .iter()
        .zip(&fast_ema[offset..])
        .map(|(s, f)| f - s)
        .collect();

    let signal_line = ema_series(&macd_line, signal)?;
    let offset = macd_line.len() - signal_line.len();
    Some(
        signal_line
            .iter()
            .zip(&macd_line[offset..])
            .map(|(sig, macd)| macd - sig)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_series_seeds_with_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let ema = ema_series(&prices, 5).unwrap();
        assert_eq!(ema.len(), 2);
        assert_eq!(ema[0], 104.0); // SMA of the first five
        assert!(ema[1] > 104.0);
    }

    #[test]
    fn test_ema_insufficient_data() {
        assert!(ema_series(&[100.0, 101.0], 5).is_none());
    }

    #[test]
    fn test_macd_histogram_tracks_trend_flip() {
        // Long downtrend then a sharp reversal upward.
        let mut prices: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        prices.extend((0..30).map(|i| 140.0 + 3.0 * i as f64));

        let hist = macd_histogram_series(&prices, 12, 26, 9).unwrap();
        assert!(hist.first().unwrap() < &0.0);
        assert!(hist.last().unwrap() > &0.0);
    }

    #[test]
    fn test_macd_rejects_fast_ge_slow() {
        let prices: Vec<f64> = (0..60).map(|i| i as f64).collect();
        assert!(macd_histogram_series(&prices, 26, 12, 9).is_none());
    }
}
