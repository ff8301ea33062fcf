use crate::compare::DiffRecord;
use crate::scoring::{MetricWeights, RiskLabel, RiskPercentage, ScoreResult, ScoringConfig};

#[derive(Debug, Clone, Default)]
pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn weights(&self) -> &MetricWeights {
        &self.config.weights
    }

    pub fn compute(&self, diff: &DiffRecord) -> ScoreResult {
        let mut total = 0.0;
        let mut maximum = 0.0;

        for (metric, entry) in diff.iter() {
            let weight = self.config.weights.weight(metric);
            maximum += weight;
            if !entry.is_match {
                total += weight;
            }
        }

        let percentage = risk_percentage(total, maximum);
        let label = match percentage.value() {
            Some(pct) => self.config.thresholds.classify(f64::from(pct)),
            None => RiskLabel::Indeterminate,
        };

        ScoreResult {
            total,
            maximum,
            percentage,
            label,
        }
    }
}

pub fn risk_percentage(total: f64, maximum: f64) -> RiskPercentage {
    if maximum <= 0.0 {
        return RiskPercentage(None);
    }
    // Half-way values go to the even neighbour: 12.5% reads as 12%.
    let pct = (total / maximum * 100.0).round_ties_even().clamp(0.0, 100.0);
    RiskPercentage(Some(pct as u32))
}
