//! Parameter sweep runner for backtesting optimization.
//!
//! Runs one backtest per risk-parameter combination, several at a time.

use crate::backtest::{BacktestEngine, BacktestResult, EngineConfig};
use crate::config::RiskConfig;
use crate::market::Candle;
use crate::strategy::SignalProvider;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Defines the parameter space to explore during optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpace {
    // Exit parameters
    pub stop_loss_pct: Vec<Decimal>,
    pub take_profit_pct: Vec<Decimal>,

    // Entry parameters
    pub min_confidence: Vec<f64>,
    pub position_size_pct: Vec<Decimal>,
    pub use_trend_filter: Vec<bool>,
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self {
            stop_loss_pct: vec![dec!(0.02), dec!(0.03), dec!(0.04), dec!(0.05)],
            take_profit_pct: vec![dec!(0.06), dec!(0.08), dec!(0.10), dec!(0.12)],
            min_confidence: vec![0.70, 0.75, 0.80],
            position_size_pct: vec![dec!(0.4), dec!(0.5), dec!(0.6)],
            use_trend_filter: vec![true, false],
        }
    }
}

impl ParameterSpace {
    /// Create a minimal parameter space for quick testing.
    pub fn minimal() -> Self {
        Self {
            stop_loss_pct: vec![dec!(0.03)],
            take_profit_pct: vec![dec!(0.06)],
            min_confidence: vec![0.70],
            position_size_pct: vec![dec!(0.4)],
            use_trend_filter: vec![false],
        }
    }

    /// Count total number of combinations.
    pub fn combination_count(&self) -> usize {
        self.stop_loss_pct.len()
            * self.take_profit_pct.len()
            * self.min_confidence.len()
            * self.position_size_pct.len()
            * self.use_trend_filter.len()
    }

    /// Generate all config combinations. Fields outside the space keep
    /// their values from `base`.
    pub fn generate_configs(&self, base: &RiskConfig) -> Vec<RiskConfig> {
        let mut configs = Vec::with_capacity(self.combination_count());

        for &stop_loss_pct in &self.stop_loss_pct {
            for &take_profit_pct in &self.take_profit_pct {
                for &min_confidence in &self.min_confidence {
                    for &position_size_pct in &self.position_size_pct {
                        for &use_trend_filter in &self.use_trend_filter {
                            configs.push(RiskConfig {
                                stop_loss_pct,
                                take_profit_pct,
                                min_confidence,
                                position_size_pct,
                                use_trend_filter,
                                ..base.clone()
                            });
                        }
                    }
                }
            }
        }

        configs
    }

    /// Describe a config's parameter values.
    pub fn describe_config(config: &RiskConfig) -> String {
        format!(
            "sl={:.1}% tp={:.1}% conf>{:.0}% size={:.0}% trend={}",
            config.stop_loss_pct * dec!(100),
            config.take_profit_pct * dec!(100),
            config.min_confidence * 100.0,
            config.position_size_pct * dec!(100),
            if config.use_trend_filter { "on" } else { "off" },
        )
    }
}

/// Results from a parameter sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepResults {
    /// All individual run results
    pub runs: Vec<(RiskConfig, BacktestResult)>,

    /// Best config by total return
    pub best_by_return: Option<usize>,

    /// Best config by Sharpe ratio
    pub best_by_sharpe: Option<usize>,

    /// Best config by Calmar ratio (return/drawdown)
    pub best_by_calmar: Option<usize>,

    /// Total combinations tested
    pub total_combinations: usize,

    /// Successful runs
    pub successful_runs: usize,

    /// Failed runs
    pub failed_runs: usize,
}

impl SweepResults {
    fn from_runs(runs: Vec<(RiskConfig, BacktestResult)>, total_combinations: usize) -> Self {
        let best_by = |metric: fn(&BacktestResult) -> f64| {
            runs.iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    metric(&a.1)
                        .partial_cmp(&metric(&b.1))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i)
        };

        let best_by_return = best_by(|r| r.metrics.total_return);
        let best_by_sharpe = best_by(|r| r.metrics.sharpe_ratio);
        let best_by_calmar = best_by(|r| r.metrics.calmar_ratio);
        let successful_runs = runs.len();

        Self {
            runs,
            best_by_return,
            best_by_sharpe,
            best_by_calmar,
            total_combinations,
            successful_runs,
            failed_runs: total_combinations - successful_runs,
        }
    }

    /// Get the best result by total return.
    pub fn best_return(&self) -> Option<&(RiskConfig, BacktestResult)> {
        self.best_by_return.map(|i| &self.runs[i])
    }

    /// Get the best result by Sharpe ratio.
    pub fn best_sharpe(&self) -> Option<&(RiskConfig, BacktestResult)> {
        self.best_by_sharpe.map(|i| &self.runs[i])
    }

    /// Get the best result by Calmar ratio.
    pub fn best_calmar(&self) -> Option<&(RiskConfig, BacktestResult)> {
        self.best_by_calmar.map(|i| &self.runs[i])
    }

    /// Export results to CSV.
    pub fn to_csv(&self, path: &str) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;

        // Header
        writeln!(
            file,
            "stop_loss_pct,take_profit_pct,min_confidence,position_size_pct,use_trend_filter,total_return_pct,sharpe_ratio,calmar_ratio,max_dd_pct,win_rate,trades,final_equity"
        )?;

        // Data rows
        for (config, result) in &self.runs {
            writeln!(
                file,
                "{},{},{},{},{},{:.4},{:.4},{:.4},{:.4},{:.4},{},{}",
                config.stop_loss_pct,
                config.take_profit_pct,
                config.min_confidence,
                config.position_size_pct,
                config.use_trend_filter,
                result.metrics.total_return * 100.0,
                result.metrics.sharpe_ratio,
                result.metrics.calmar_ratio,
                result.metrics.max_drawdown * 100.0,
                result.metrics.win_rate,
                result.metrics.total_trades,
                result.metrics.final_equity,
            )?;
        }

        Ok(())
    }

    /// Generate a summary comparison table.
    pub fn summary(&self) -> String {
        let mut s = String::new();

        s.push_str("═══════════════════════════════════════════════════════════════\n");
        s.push_str("PARAMETER SWEEP RESULTS\n");
        s.push_str("═══════════════════════════════════════════════════════════════\n");
        s.push_str(&format!(
            "Total: {} | Successful: {} | Failed: {}\n\n",
            self.total_combinations, self.successful_runs, self.failed_runs
        ));

        let sections = [
            ("BEST BY RETURN", self.best_return()),
            ("BEST BY SHARPE RATIO", self.best_sharpe()),
            ("BEST BY CALMAR RATIO", self.best_calmar()),
        ];
        for (title, best) in sections {
            if let Some((config, result)) = best {
                s.push_str(&format!("{}:\n", title));
                s.push_str(&format!("  Config: {}\n", ParameterSpace::describe_config(config)));
                s.push_str(&format!(
                    "  Return: {:.2}% | Sharpe: {:.3} | Calmar: {:.3} | MaxDD: {:.2}% | Trades: {}\n\n",
                    result.metrics.total_return * 100.0,
                    result.metrics.sharpe_ratio,
                    result.metrics.calmar_ratio,
                    result.metrics.max_drawdown * 100.0,
                    result.metrics.total_trades,
                ));
            }
        }

        s.push_str("═══════════════════════════════════════════════════════════════\n");

        s
    }
}

/// Parameter sweep runner for parallel backtesting.
pub struct SweepRunner {
    parameter_space: ParameterSpace,
    base_risk: RiskConfig,
    engine_config: EngineConfig,
    provider: Arc<dyn SignalProvider>,
    parallelism: usize,
}

impl SweepRunner {
    /// Create a new sweep runner.
    pub fn new(
        parameter_space: ParameterSpace,
        base_risk: RiskConfig,
        engine_config: EngineConfig,
        provider: Arc<dyn SignalProvider>,
        parallelism: usize,
    ) -> Self {
        Self {
            parameter_space,
            base_risk,
            engine_config,
            provider,
            parallelism: parallelism.max(1),
        }
    }

    /// Run the parameter sweep.
    ///
    /// Candles are shared read-only; every combination runs on its own
    /// engine with its own exchange and ledger.
    pub async fn run(&self, candles: Arc<Vec<Candle>>) -> Result<SweepResults> {
        let configs = self.parameter_space.generate_configs(&self.base_risk);
        let total_combinations = configs.len();

        info!(
            "Starting parameter sweep with {} combinations, parallelism={}",
            total_combinations, self.parallelism
        );

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut handles = Vec::with_capacity(configs.len());

        for (i, risk) in configs.into_iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("sweep semaphore closed")?;
            let candles = candles.clone();
            let provider = self.provider.clone();
            let engine_config = self.engine_config.clone();

            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let description = ParameterSpace::describe_config(&risk);

                match BacktestEngine::new(engine_config, risk.clone(), provider) {
                    Ok(engine) => {
                        let result = engine.run(&candles);
                        info!(
                            "[{}/{}] {}: Return={:.2}% Sharpe={:.3}",
                            i + 1,
                            total_combinations,
                            description,
                            result.metrics.total_return * 100.0,
                            result.metrics.sharpe_ratio
                        );
                        Some((risk, result))
                    }
                    Err(e) => {
                        warn!("[{}/{}] {} rejected: {}", i + 1, total_combinations, description, e);
                        None
                    }
                }
            });

            handles.push(handle);
        }

        // Collect results in combination order
        let mut runs = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => warn!("Sweep task panicked: {}", e),
            }
        }

        Ok(SweepResults::from_runs(runs, total_combinations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::candles_from_closes;
    use crate::strategy::EmaCross;

    fn create_test_candles() -> Arc<Vec<Candle>> {
        let closes: Vec<f64> = (0..240)
            .map(|i| 100.0 + (i as f64 / 10.0).sin() * 8.0 + i as f64 * 0.05)
            .collect();
        Arc::new(candles_from_closes(&closes))
    }

    #[test]
    fn test_parameter_space_count() {
        let space = ParameterSpace::default();

        // 4 * 4 * 3 * 3 * 2 = 288
        assert_eq!(space.combination_count(), 288);
        assert_eq!(space.generate_configs(&RiskConfig::default()).len(), 288);
    }

    #[test]
    fn test_minimal_space() {
        let space = ParameterSpace::minimal();
        assert_eq!(space.combination_count(), 1);
    }

    #[test]
    fn test_generate_configs_keeps_base_fields() {
        let space = ParameterSpace {
            stop_loss_pct: vec![dec!(0.02), dec!(0.04)],
            ..ParameterSpace::minimal()
        };
        let base = RiskConfig {
            quantity_step: dec!(0.01),
            ..RiskConfig::default()
        };

        let configs = space.generate_configs(&base);

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].stop_loss_pct, dec!(0.02));
        assert_eq!(configs[1].stop_loss_pct, dec!(0.04));
        assert!(configs.iter().all(|c| c.quantity_step == dec!(0.01)));
    }

    #[test]
    fn test_describe_config() {
        let desc = ParameterSpace::describe_config(&RiskConfig::default());

        assert!(desc.contains("sl=3.0%"));
        assert!(desc.contains("tp=6.0%"));
        assert!(desc.contains("trend=off"));
    }

    #[tokio::test]
    async fn test_sweep_runs_every_combination() {
        let space = ParameterSpace {
            stop_loss_pct: vec![dec!(0.02), dec!(0.05)],
            min_confidence: vec![0.0, 0.5],
            ..ParameterSpace::minimal()
        };
        let runner = SweepRunner::new(
            space,
            RiskConfig::default(),
            EngineConfig::default(),
            Arc::new(EmaCross::new(5, 20)),
            2,
        );

        let results = runner.run(create_test_candles()).await.unwrap();

        assert_eq!(results.total_combinations, 4);
        assert_eq!(results.successful_runs, 4);
        assert_eq!(results.failed_runs, 0);
        assert_eq!(results.runs[0].0.stop_loss_pct, dec!(0.02));
        assert_eq!(results.runs[3].0.stop_loss_pct, dec!(0.05));

        let (_, best) = results.best_return().unwrap();
        assert!(results
            .runs
            .iter()
            .all(|(_, r)| r.metrics.total_return <= best.metrics.total_return));
        assert!(results.summary().contains("BEST BY RETURN"));
    }

    #[tokio::test]
    async fn test_invalid_combination_counts_as_failed() {
        let space = ParameterSpace {
            stop_loss_pct: vec![dec!(0.03), Decimal::ZERO],
            ..ParameterSpace::minimal()
        };
        let runner = SweepRunner::new(
            space,
            RiskConfig::default(),
            EngineConfig::default(),
            Arc::new(EmaCross::new(5, 20)),
            1,
        );

        let results = runner.run(create_test_candles()).await.unwrap();

        assert_eq!(results.successful_runs, 1);
        assert_eq!(results.failed_runs, 1);
        assert_eq!(results.best_by_return, Some(0));
    }

    #[test]
    fn test_empty_results() {
        let results = SweepResults::from_runs(Vec::new(), 0);
        assert!(results.best_sharpe().is_none());
        assert!(results.summary().contains("Total: 0"));
    }
}
