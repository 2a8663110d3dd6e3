//! Indicator calculations (pure functions, no IO).
//!
//! Key invariant: indicator values at index `t` must depend only on inputs
//! `0..=t`. Values before an indicator's warmup are NaN; NaN inputs
//! propagate to NaN outputs.

/// Simple moving average over a fixed window.
pub fn sma(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 {
        return out;
    }

    let mut sum = 0.0;
    for i in 0..values.len() {
        sum += values[i];

        if i >= window {
            sum -= values[i - window];
        }

        if i + 1 >= window {
            out[i] = sum / window as f64;
        }
    }

    out
}

/// Exponential moving average over a fixed window.
///
/// Uses the standard EMA formula, seeded with the SMA of the first
/// `window` values:
/// - Multiplier (k) = 2 / (window + 1)
/// - EMA[t] = value[t] * k + EMA[t-1] * (1 - k)
pub fn ema(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() < window {
        return out;
    }

    let k = 2.0 / (window as f64 + 1.0);
    let seed: f64 = values[..window].iter().sum::<f64>() / window as f64;
    out[window - 1] = seed;

    let mut prev = seed;
    for i in window..values.len() {
        let v = values[i] * k + prev * (1.0 - k);
        out[i] = v;
        prev = v;
    }

    out
}

/// Relative Strength Index (Wilder).
///
/// First value at index `window`; gains/losses smoothed with alpha = 1/window.
pub fn rsi(values: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 || values.len() <= window {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=window {
        let delta = values[i] - values[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= window as f64;
    avg_loss /= window as f64;
    out[window] = rsi_from_averages(avg_gain, avg_loss);

    let alpha = 1.0 / window as f64;
    for i in window + 1..values.len() {
        let delta = values[i] - values[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = avg_gain * (1.0 - alpha) + gain * alpha;
        avg_loss = avg_loss * (1.0 - alpha) + loss * alpha;
        out[i] = rsi_from_averages(avg_gain, avg_loss);
    }

    out
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_gain.is_nan() || avg_loss.is_nan() {
        return f64::NAN;
    }
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            return 50.0;
        }
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// True Range for each bar.
///
/// TR = max(high - low, |high - prev_close|, |low - prev_close|);
/// the first bar has no previous close, so TR = high - low.
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let n = high.len();
    let mut out = Vec::with_capacity(n);
    if n == 0 {
        return out;
    }

    out.push(high[0] - low[0]);
    for i in 1..n {
        let prev_c = close[i - 1];
        let tr = (high[i] - low[i])
            .max((high[i] - prev_c).abs())
            .max((low[i] - prev_c).abs());
        out.push(tr);
    }

    out
}

/// Average True Range as the SMA of true ranges.
pub fn atr_sma(high: &[f64], low: &[f64], close: &[f64], window: usize) -> Vec<f64> {
    sma(&true_range(high, low, close), window)
}

/// Average True Range using Wilder smoothing (exponential, alpha = 1/window).
///
/// First ATR = SMA of the first `window` TRs; subsequent values use
/// ATR[t] = ATR[t-1] * (window-1)/window + TR[t]/window.
pub fn atr_wilder(high: &[f64], low: &[f64], close: &[f64], window: usize) -> Vec<f64> {
    let n = high.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 || n < window {
        return out;
    }

    let tr = true_range(high, low, close);
    let seed: f64 = tr[..window].iter().sum::<f64>() / window as f64;
    out[window - 1] = seed;

    let alpha = 1.0 / window as f64;
    let mut prev = seed;
    for i in window..n {
        let v = prev * (1.0 - alpha) + tr[i] * alpha;
        out[i] = v;
        prev = v;
    }

    out
}

/// MACD line, signal line, and histogram.
///
/// MACD = EMA(fast) - EMA(slow); signal = EMA(MACD, signal_window);
/// histogram = MACD - signal. Warmup of the signal line is
/// `slow + signal_window - 1` bars.
pub fn macd(
    values: &[f64],
    fast: usize,
    slow: usize,
    signal_window: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = values.len();
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);

    let mut macd_line = vec![f64::NAN; n];
    for i in 0..n {
        macd_line[i] = fast_ema[i] - slow_ema[i];
    }

    // Signal EMA runs over the defined portion of the MACD line.
    let mut signal_line = vec![f64::NAN; n];
    if slow > 0 && n >= slow {
        let defined = &macd_line[slow - 1..];
        let sig = ema(defined, signal_window);
        for (j, v) in sig.iter().enumerate() {
            signal_line[slow - 1 + j] = *v;
        }
    }

    let mut histogram = vec![f64::NAN; n];
    for i in 0..n {
        histogram[i] = macd_line[i] - signal_line[i];
    }

    (macd_line, signal_line, histogram)
}

/// Bollinger bands: (upper, middle, lower) with a population standard
/// deviation over the window.
pub fn bollinger(values: &[f64], window: usize, std_mult: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n = values.len();
    let middle = sma(values, window);
    let mut upper = vec![f64::NAN; n];
    let mut lower = vec![f64::NAN; n];
    if window == 0 {
        return (upper, middle, lower);
    }

    for i in 0..n {
        if i + 1 < window {
            continue;
        }
        let slice = &values[i + 1 - window..=i];
        let mean = middle[i];
        let variance = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / window as f64;
        let dev = variance.sqrt() * std_mult;
        upper[i] = mean + dev;
        lower[i] = mean - dev;
    }

    (upper, middle, lower)
}

/// Stochastic oscillator: raw %K smoothed by `k_smooth`, %D as SMA of %K.
pub fn stochastic(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    k_window: usize,
    k_smooth: usize,
    d_window: usize,
) -> (Vec<f64>, Vec<f64>) {
    let n = close.len();
    let mut raw_k = vec![f64::NAN; n];
    if k_window == 0 {
        return (raw_k.clone(), raw_k);
    }

    let hh = rolling_max(high, k_window);
    let ll = rolling_min(low, k_window);
    for i in 0..n {
        let range = hh[i] - ll[i];
        raw_k[i] = if range == 0.0 {
            50.0
        } else {
            (close[i] - ll[i]) / range * 100.0
        };
    }

    let k = sma_over_defined(&raw_k, k_smooth);
    let d = sma_over_defined(&k, d_window);
    (k, d)
}

/// SMA that skips the NaN warmup prefix instead of poisoning the output.
fn sma_over_defined(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    let first_defined = match values.iter().position(|v| !v.is_nan()) {
        Some(p) => p,
        None => return out,
    };
    let defined = &values[first_defined..];
    let inner = sma(defined, window);
    for (j, v) in inner.iter().enumerate() {
        out[first_defined + j] = *v;
    }
    out
}

/// Rolling maximum over the last `window` values (inclusive of current),
/// O(1) amortised via a monotonic deque.
pub fn rolling_max(values: &[f64], window: usize) -> Vec<f64> {
    rolling_extreme(values, window, |a, b| a >= b)
}

/// Rolling minimum over the last `window` values (inclusive of current).
pub fn rolling_min(values: &[f64], window: usize) -> Vec<f64> {
    rolling_extreme(values, window, |a, b| a <= b)
}

fn rolling_extreme(values: &[f64], window: usize, keep: fn(f64, f64) -> bool) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 {
        return out;
    }

    // Deque of indices whose values are in "winning" order.
    let mut deque: std::collections::VecDeque<usize> = std::collections::VecDeque::new();
    for i in 0..n {
        while let Some(&back) = deque.back() {
            if keep(values[i], values[back]) {
                deque.pop_back();
            } else {
                break;
            }
        }
        deque.push_back(i);

        if let Some(&front) = deque.front() {
            if i >= window && front <= i - window {
                deque.pop_front();
            }
        }

        if i + 1 >= window {
            out[i] = values[*deque.front().expect("deque never empty here")];
        }
    }

    out
}

/// Rolling volume-weighted average price over `window` bars, using the
/// typical price (H+L+C)/3.
pub fn rolling_vwap(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    volume: &[f64],
    window: usize,
) -> Vec<f64> {
    let n = close.len();
    let mut out = vec![f64::NAN; n];
    if window == 0 {
        return out;
    }

    let mut pv_sum = 0.0;
    let mut v_sum = 0.0;
    for i in 0..n {
        let typical = (high[i] + low[i] + close[i]) / 3.0;
        pv_sum += typical * volume[i];
        v_sum += volume[i];

        if i >= window {
            let j = i - window;
            let typical_j = (high[j] + low[j] + close[j]) / 3.0;
            pv_sum -= typical_j * volume[j];
            v_sum -= volume[j];
        }

        if i + 1 >= window {
            out[i] = if v_sum == 0.0 { f64::NAN } else { pv_sum / v_sum };
        }
    }

    out
}
