//! Random forest classifier retrained on every history prefix.
//!
//! Each evaluation builds an indicator feature row per bar, labels the rows
//! whose forward window closes inside the history, fits a seeded forest on
//! the most recent labelled rows and classifies the last bar. Rows near the
//! end of the history are never labelled with prices the engine has not
//! released yet.

use super::indicators::{atr, bollinger, closes, ema_series, rsi, sma, volumes};
use super::{finite, Signal, SignalError, SignalProvider};
use crate::market::Candle;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::trace;

const FEATURES: usize = 16;
/// Bars of history in front of the oldest training row, enough for every
/// indicator window and for the EMAs to settle.
const FEATURE_WARMUP: usize = 60;
const MIN_TRAINING_ROWS: usize = 30;

type FeatureRow = [f64; FEATURES];

#[derive(Debug, Clone, Copy)]
struct Sample {
    features: FeatureRow,
    up: bool,
}

#[derive(Debug, Clone)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 50,
            max_depth: 8,
            min_samples_split: 5,
            min_samples_leaf: 2,
            seed: 42,
        }
    }
}

/// Predicts whether the close `horizon` bars ahead clears `threshold`.
#[derive(Debug, Clone)]
pub struct MlClassifier {
    pub horizon: usize,
    /// Forward return that counts as an up move.
    pub threshold: f64,
    pub train_window: usize,
    pub forest: ForestConfig,
}

impl Default for MlClassifier {
    fn default() -> Self {
        Self {
            horizon: 3,
            threshold: 0.001,
            train_window: 100,
            forest: ForestConfig::default(),
        }
    }
}

impl MlClassifier {
    /// Training rows and the feature row of the last bar.
    fn dataset(&self, history: &[Candle]) -> (Vec<Sample>, Option<FeatureRow>) {
        let span = self.train_window + self.horizon + FEATURE_WARMUP;
        let window = &history[history.len().saturating_sub(span)..];
        let rows = feature_rows(window);
        let prices = closes(window);
        let n = rows.len();

        let mut samples: Vec<Sample> = rows
            .iter()
            .enumerate()
            .take(n.saturating_sub(self.horizon))
            .filter_map(|(j, row)| {
                let features = (*row)?;
                let base = prices[j];
                if base <= 0.0 {
                    return None;
                }
                let forward = (prices[j + self.horizon] - base) / base;
                Some(Sample {
                    features,
                    up: forward > self.threshold,
                })
            })
            .collect();
        if samples.len() > self.train_window {
            samples.drain(..samples.len() - self.train_window);
        }

        (samples, rows.last().copied().flatten())
    }
}

impl SignalProvider for MlClassifier {
    fn name(&self) -> &'static str {
        "ml_classifier"
    }

    fn min_lookback(&self) -> usize {
        50
    }

    fn evaluate(&self, history: &[Candle]) -> Result<Signal, SignalError> {
        if history.len() < self.min_lookback() {
            return Ok(Signal::hold(0.0));
        }
        let (samples, current) = self.dataset(history);
        let Some(current) = current else {
            return Ok(Signal::hold(0.0));
        };
        if samples.len() < MIN_TRAINING_ROWS {
            return Ok(Signal::hold(0.0));
        }

        let forest = RandomForest::fit(&samples, &self.forest);
        let p_up = finite(forest.probability_up(&current), "forest probability")?;
        trace!(samples = samples.len(), p_up, "Forest prediction");

        let signal = if p_up >= 0.5 {
            Signal::buy(p_up.clamp(0.0, 1.0))
        } else {
            Signal::sell((1.0 - p_up).clamp(0.0, 1.0))
        };
        Ok(signal.with_reason(format!("forest p(up)={:.2}", p_up)))
    }
}

/// One row per bar: SMA 5/10/20, EMA 9/21, RSI 14, MACD line and signal,
/// Bollinger middle/upper/lower, ATR 14, 1/5/10-bar returns, volume ratio.
/// `None` until every indicator is defined.
fn feature_rows(window: &[Candle]) -> Vec<Option<FeatureRow>> {
    let prices = closes(window);
    let vols = volumes(window);
    let ema9 = ema_series(&prices, 9);
    let ema21 = ema_series(&prices, 21);
    let macd_line: Vec<f64> = ema_series(&prices, 12)
        .iter()
        .zip(ema_series(&prices, 26))
        .map(|(fast, slow)| fast - slow)
        .collect();
    let macd_signal = ema_series(&macd_line, 9);

    (0..window.len())
        .map(|j| {
            let upto = &prices[..=j];
            let change = |lag: usize| {
                let base = *prices.get(j.checked_sub(lag)?)?;
                (base != 0.0).then(|| prices[j] / base - 1.0)
            };
            let volume_ma = sma(&vols[..=j], 20).filter(|v| *v > 0.0)?;
            let bands = bollinger(upto, 20, 2.0)?;

            let row = [
                sma(upto, 5)?,
                sma(upto, 10)?,
                sma(upto, 20)?,
                ema9[j],
                ema21[j],
                rsi(upto, 14)?,
                macd_line[j],
                macd_signal[j],
                bands.middle,
                bands.upper,
                bands.lower,
                atr(&window[..=j], 14)?,
                change(1)?,
                change(5)?,
                change(10)?,
                vols[j] / volume_ma,
            ];
            row.iter().all(|v| v.is_finite()).then_some(row)
        })
        .collect()
}

#[derive(Debug)]
enum Node {
    Leaf {
        p_up: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn probability_up(&self, row: &FeatureRow) -> f64 {
        match self {
            Node::Leaf { p_up } => *p_up,
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if row[*feature] <= *threshold {
                    left.probability_up(row)
                } else {
                    right.probability_up(row)
                }
            }
        }
    }
}

struct SplitChoice {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// Binary Gini impurity for `up` positives out of `n`.
fn gini(up: usize, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = up as f64 / n as f64;
    2.0 * p * (1.0 - p)
}

struct TreeBuilder<'a> {
    samples: &'a [Sample],
    config: &'a ForestConfig,
    max_features: usize,
    rng: StdRng,
}

impl TreeBuilder<'_> {
    fn build(&mut self, indices: &[usize], depth: usize) -> Node {
        let n = indices.len();
        let up = indices.iter().filter(|&&i| self.samples[i].up).count();
        let impurity = gini(up, n);
        let leaf = || Node::Leaf {
            p_up: if n == 0 { 0.5 } else { up as f64 / n as f64 },
        };

        if depth >= self.config.max_depth
            || n < self.config.min_samples_split
            || impurity < 1e-10
        {
            return leaf();
        }
        let Some(split) = self.best_split(indices, up, impurity) else {
            return leaf();
        };

        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| self.samples[i].features[split.feature] <= split.threshold);
        Node::Split {
            feature: split.feature,
            threshold: split.threshold,
            left: Box::new(self.build(&left, depth + 1)),
            right: Box::new(self.build(&right, depth + 1)),
        }
    }

    /// Best midpoint split over a random feature subset, honoring the
    /// minimum leaf size. `None` when no split reduces impurity.
    fn best_split(&mut self, indices: &[usize], up: usize, impurity: f64) -> Option<SplitChoice> {
        let n = indices.len();
        let min_leaf = self.config.min_samples_leaf.max(1);
        let mut features: Vec<usize> = (0..FEATURES).collect();
        features.shuffle(&mut self.rng);
        features.truncate(self.max_features);

        let mut best: Option<SplitChoice> = None;
        for feature in features {
            let mut column: Vec<(f64, bool)> = indices
                .iter()
                .map(|&i| (self.samples[i].features[feature], self.samples[i].up))
                .collect();
            column.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_up = 0;
            for k in 0..n - 1 {
                if column[k].1 {
                    left_up += 1;
                }
                let left_n = k + 1;
                let right_n = n - left_n;
                if column[k].0 == column[k + 1].0 || left_n < min_leaf || right_n < min_leaf {
                    continue;
                }
                let weighted = (left_n as f64 * gini(left_up, left_n)
                    + right_n as f64 * gini(up - left_up, right_n))
                    / n as f64;
                let gain = impurity - weighted;
                if gain > best.as_ref().map_or(0.0, |b| b.gain) {
                    best = Some(SplitChoice {
                        feature,
                        threshold: (column[k].0 + column[k + 1].0) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// Bagged Gini trees with sqrt-sized random feature subsets.
#[derive(Debug)]
struct RandomForest {
    trees: Vec<Node>,
}

impl RandomForest {
    fn fit(samples: &[Sample], config: &ForestConfig) -> Self {
        let n = samples.len();
        let max_features = (FEATURES as f64).sqrt().ceil() as usize;

        let trees = (0..config.n_trees.max(1))
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(t as u64));
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                let mut builder = TreeBuilder {
                    samples,
                    config,
                    max_features,
                    rng,
                };
                builder.build(&bootstrap, 0)
            })
            .collect();

        Self { trees }
    }

    /// Mean of the per-tree leaf probabilities.
    fn probability_up(&self, row: &FeatureRow) -> f64 {
        let total: f64 = self.trees.iter().map(|t| t.probability_up(row)).sum();
        total / self.trees.len() as f64
    }
}
