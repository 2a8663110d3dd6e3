//! Hot-loop benchmark: a full run over synthetic data.
//!
//! Keeps an eye on the per-bar cost of the trading loop (structures,
//! snapshot reads, rule evaluation, exchange phases). The loop should stay
//! O(1) per bar; regressions here usually mean an accidental per-bar scan.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use perplab_core::feed::Feed;
use perplab_core::play::Play;
use perplab_core::prelude::*;
use std::collections::BTreeMap;

const T0: i64 = 1_704_067_200_000;

fn demo_play() -> Play {
    serde_json::from_value(serde_json::json!({
        "id": "bench-ema-cross",
        "version": "1",
        "symbol": "BTCUSDT",
        "account": {
            "starting_equity_usdt": 10_000.0,
            "max_leverage": 10.0,
            "margin_mode": "isolated",
            "taker_fee_bps": 5.5,
            "maker_fee_bps": 2.0,
            "slippage_bps": 1.0,
            "maintenance_margin_rate": 0.005
        },
        "timeframes": {"exec": "1h"},
        "features": [
            {"key": "ema_9", "kind": "ema", "params": {"period": 9}},
            {"key": "ema_21", "kind": "ema", "params": {"period": 21}},
            {"key": "atr_14", "kind": "atr", "params": {"period": 14}}
        ],
        "structures": [
            {"key": "swings", "kind": "swing", "params": {"left": 3, "right": 3}},
            {"key": "trend", "kind": "trend", "depends_on": "swings"}
        ],
        "policy": {"direction": "long_short", "exit_mode": "first_hit"},
        "blocks": [
            {
                "id": "entry",
                "cases": [
                    {
                        "when": {"op": "all", "exprs": [
                            {"op": "cross_above", "lhs": "ema_9", "rhs": "ema_21"},
                            {"op": "eq", "lhs": "trend.direction", "rhs": 1}
                        ]},
                        "emit": [{"action": "entry_long"}]
                    },
                    {
                        "when": {"op": "cross_below", "lhs": "ema_9", "rhs": "ema_21"},
                        "emit": [{"action": "exit_long"}]
                    }
                ]
            }
        ],
        "risk": {
            "stop_loss": {"mode": "roi_pct", "pct": 2.0},
            "take_profit": {"mode": "roi_pct", "pct": 4.0},
            "sizing": {"mode": "percent_equity", "pct": 10.0, "leverage": 3.0}
        }
    }))
    .expect("bench play is well-formed")
}

fn synthetic_feeds(hours: usize) -> MultiFeed {
    let mut exec_bars = Vec::with_capacity(hours);
    let mut quote_bars = Vec::with_capacity(hours * 60);
    let mut price = 50_000.0;

    for h in 0..hours {
        let ts_open = T0 + h as i64 * 3_600_000;
        let open = price;
        // A deterministic wobble: slow sine drift plus hourly oscillation.
        let drift = ((h as f64) * 0.05).sin() * 400.0;
        let close = 50_000.0 + drift + ((h % 7) as f64 - 3.0) * 60.0;

        let mut high = open.max(close);
        let mut low = open.min(close);
        for m in 0..60i64 {
            let q_open = if m == 0 { open } else { price };
            let t = (m + 1) as f64 / 60.0;
            let q_close = open + (close - open) * t;
            let q_high = q_open.max(q_close) + 15.0;
            let q_low = q_open.min(q_close) - 15.0;
            high = high.max(q_high);
            low = low.min(q_low);
            let ts = ts_open + m * 60_000;
            quote_bars.push(Bar::new(ts, ts + 60_000, q_open, q_high, q_low, q_close, 10.0));
            price = q_close;
        }
        exec_bars.push(Bar::new(
            ts_open,
            ts_open + 3_600_000,
            open,
            high,
            low,
            close,
            600.0,
        ));
    }

    let exec = Feed::from_bars("BTCUSDT", Timeframe::H1, &exec_bars).expect("bench bars");
    let quote = Feed::from_bars("BTCUSDT", Timeframe::M1, &quote_bars).expect("bench quotes");
    let mut map = BTreeMap::new();
    map.insert(TfRole::Exec, exec);
    MultiFeed::new(map, quote).expect("bench store")
}

fn bench_bar_loop(c: &mut Criterion) {
    let play = demo_play();
    let feeds = synthetic_feeds(24 * 30);
    let config = RunConfig {
        window_start_ms: T0 + 100 * 3_600_000,
        window_end_ms: T0 + 24 * 30 * 3_600_000,
        rule_limits: RuleLimits::default(),
    };

    c.bench_function("run_backtest_30d_1h", |b| {
        b.iter(|| {
            let report = run_backtest(&play, black_box(feeds.clone()), config).expect("bench run");
            black_box(report.final_equity_usdt)
        })
    });
}

criterion_group!(benches, bench_bar_loop);
criterion_main!(benches);
