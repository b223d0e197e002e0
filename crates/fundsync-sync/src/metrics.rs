//! Derived fund metrics computed from a NAV series.

use fundsync_core::{FundMetrics, NavHistoryPoint};

pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;
pub const RISK_FREE_RATE: f64 = 0.02;

/// Computes drawdown, volatility, CAGR and Sharpe ratio over the cumulative NAV
/// of `series`. Non-positive or non-finite NAVs are ignored; fewer than two
/// usable points yields all-zero metrics. Never returns NaN or infinity.
pub fn compute_metrics(series: &[NavHistoryPoint]) -> FundMetrics {
    let mut points: Vec<&NavHistoryPoint> = series
        .iter()
        .filter(|p| p.cumulative_nav.is_finite() && p.cumulative_nav > 0.0)
        .collect();
    if points.len() < 2 {
        return FundMetrics::default();
    }
    points.sort_by_key(|p| p.nav_date);

    let navs: Vec<f64> = points.iter().map(|p| p.cumulative_nav).collect();
    let returns: Vec<f64> = navs.windows(2).map(|w| w[1] / w[0] - 1.0).collect();

    let max_drawdown = max_drawdown(&navs);
    let volatility = sample_stdev(&returns) * TRADING_DAYS_PER_YEAR.sqrt();

    let first = points[0];
    let last = points[points.len() - 1];
    let days = (last.nav_date - first.nav_date).num_days();
    let annualized_return = if days > 0 {
        (last.cumulative_nav / first.cumulative_nav).powf(365.0 / days as f64) - 1.0
    } else {
        0.0
    };

    let sharpe_ratio = if volatility > 0.0 {
        (annualized_return - RISK_FREE_RATE) / volatility
    } else {
        0.0
    };

    FundMetrics {
        max_drawdown: finite_or_zero(max_drawdown),
        volatility: finite_or_zero(volatility),
        sharpe_ratio: finite_or_zero(sharpe_ratio),
        annualized_return: finite_or_zero(annualized_return),
    }
}

fn max_drawdown(navs: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst = 0.0_f64;
    for &nav in navs {
        peak = peak.max(nav);
        if peak > 0.0 {
            worst = worst.max((peak - nav) / peak);
        }
    }
    worst
}

fn sample_stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
