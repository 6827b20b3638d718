//! The standard sampler implementation.

use std::cmp::{min, Ordering};
use std::collections::HashMap;

use derive_more::{Deref, DerefMut};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

use crate::{Config, Sampler, Token};

/// Strings that interrupt a DRY repetition match.
pub const DRY_SEQUENCE_BREAKERS: [&str; 4] = ["\n", ":", "\"", "*"];

/// A candidate token with its raw score and (once normalised) its probability.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenData {
    /// The candidate token.
    pub id: Token,

    /// The raw, unnormalised score.
    pub logit: f32,

    /// The probability, valid after [`Candidates::softmax`].
    pub p: f32,
}

/// The set of tokens a sampler chooses from.
#[derive(Clone, Debug, Deref, DerefMut)]
pub struct Candidates(Vec<TokenData>);

impl Candidates {
    /// Builds one candidate per vocabulary entry from a logits row.
    pub fn from_logits(logits: &[f32]) -> Self {
        Self(
            logits
                .iter()
                .enumerate()
                .map(|(id, &logit)| TokenData {
                    id: Token(id as i32),
                    logit,
                    p: 0.0,
                })
                .collect(),
        )
    }

    /// Sorts candidates by descending logit and fills in their probabilities.
    pub fn softmax(&mut self) {
        self.0
            .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(Ordering::Equal));

        let Some(max) = self.0.first().map(|c| c.logit) else {
            return;
        };

        let mut sum = 0.0;
        for candidate in self.0.iter_mut() {
            candidate.p = (candidate.logit - max).exp();
            sum += candidate.p;
        }

        if sum > 0.0 {
            for candidate in self.0.iter_mut() {
                candidate.p /= sum;
            }
        }
    }

    /// Returns the candidate with the highest logit.
    pub fn argmax(&self) -> Option<Token> {
        self.0
            .iter()
            .max_by(|a, b| a.logit.partial_cmp(&b.logit).unwrap_or(Ordering::Equal))
            .map(|c| c.id)
    }
}

/// The "Don't Repeat Yourself" repetition penalty.
#[derive(Clone, Debug, PartialEq)]
pub struct DryPenalty {
    /// 0.0 = disabled
    pub multiplier: f32,

    /// Exponential growth of the penalty with repetition length.
    pub base: f32,

    /// Repetitions shorter than this are free.
    pub allowed_length: usize,

    /// How far back to look (-1 = whole history, 0 = disabled).
    pub penalty_last_n: i32,

    /// Tokens that interrupt a repetition match.
    pub sequence_breakers: Vec<Token>,
}

impl DryPenalty {
    /// Lowers the logit of every candidate that would extend a repetition of at least
    /// `allowed_length` tokens.
    pub fn apply(&self, candidates: &mut Candidates, history: &[Token]) {
        if self.multiplier <= 0.0 || self.penalty_last_n == 0 || history.len() < 2 {
            return;
        }

        let window = if self.penalty_last_n < 0 {
            history.len()
        } else {
            min(self.penalty_last_n as usize, history.len())
        };
        let history = &history[history.len() - window..];
        let last = history.len() - 1;

        // Longest repeated suffix each continuation would extend.
        let mut match_lengths: HashMap<Token, usize> = HashMap::new();

        for end in 0..last {
            let mut len = 0;
            while len <= end
                && history[end - len] == history[last - len]
                && !self.sequence_breakers.contains(&history[end - len])
            {
                len += 1;
            }

            if len == 0 {
                continue;
            }

            let next = history[end + 1];
            if self.sequence_breakers.contains(&next) {
                continue;
            }

            let entry = match_lengths.entry(next).or_insert(0);
            *entry = (*entry).max(len);
        }

        for candidate in candidates.iter_mut() {
            if let Some(&len) = match_lengths.get(&candidate.id) {
                if len >= self.allowed_length {
                    let penalty =
                        self.multiplier * self.base.powf((len - self.allowed_length) as f32);
                    trace!(token = candidate.id.0, len, penalty, "DRY penalty");
                    candidate.logit -= penalty;
                }
            }
        }
    }
}

/// One step of a [`StandardSampler`] chain.
#[derive(Clone, Debug, PartialEq)]
pub enum SamplerStage {
    /// Pick the most likely token; ends the chain.
    Greedy,
    /// Penalise repetitions.
    Dry(DryPenalty),
    /// Keep the smallest set of tokens whose cumulative probability reaches `p`.
    TopP(f32),
    /// Drop tokens less likely than `p` times the most likely one.
    MinP(f32),
    /// Divide every logit by the temperature.
    Temperature(f32),
    /// Draw from the remaining distribution; ends the chain.
    Distribution,
}

/// A sampler chain built from [`Config`].
pub struct StandardSampler {
    stages: Vec<SamplerStage>,
    rng: StdRng,
    seed: u64,
}

impl StandardSampler {
    /// A deterministic sampler that always picks the most likely token.
    pub fn new_greedy() -> Self {
        Self::from_stages(vec![SamplerStage::Greedy], 0)
    }

    /// Creates a sampler running `stages` in order.
    pub fn from_stages(stages: Vec<SamplerStage>, seed: u64) -> Self {
        Self {
            stages,
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Builds the chain described by `config`.
    ///
    /// A temperature of zero yields [`StandardSampler::new_greedy`]. Otherwise the chain is
    /// DRY → top-p → min-p → temperature → distribution, where DRY is only included when
    /// `sequence_breakers` could be computed (that is, a vocabulary and context exist).
    pub fn from_config(config: &Config, sequence_breakers: Option<Vec<Token>>) -> Self {
        if config.temperature == 0.0 {
            return Self::new_greedy();
        }

        let mut stages = Vec::with_capacity(5);

        if let Some(sequence_breakers) = sequence_breakers {
            if config.dry_multiplier > 0.0 {
                stages.push(SamplerStage::Dry(DryPenalty {
                    multiplier: config.dry_multiplier,
                    base: config.dry_base,
                    allowed_length: config.dry_allowed_length as usize,
                    penalty_last_n: config.dry_penalty_last_n,
                    sequence_breakers,
                }));
            }
        }

        stages.push(SamplerStage::TopP(config.top_p));
        stages.push(SamplerStage::MinP(config.min_p));
        stages.push(SamplerStage::Temperature(config.temperature));
        stages.push(SamplerStage::Distribution);

        Self::from_stages(stages, config.seed.unwrap_or_else(rand::random))
    }

    /// The stages this sampler runs, in order.
    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    /// The seed the random stage was initialised with.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

fn top_p(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if p >= 1.0 {
        return;
    }

    candidates.softmax();

    let mut cumulative = 0.0;
    let mut keep = candidates.len();
    for (i, candidate) in candidates.iter().enumerate() {
        cumulative += candidate.p;
        if cumulative >= p && i + 1 >= min_keep {
            keep = i + 1;
            break;
        }
    }

    candidates.truncate(keep);
}

fn min_p(candidates: &mut Candidates, p: f32, min_keep: usize) {
    if p <= 0.0 || candidates.is_empty() {
        return;
    }

    candidates.softmax();

    let threshold = candidates[0].p * p;
    let keep = candidates
        .iter()
        .position(|c| c.p < threshold)
        .unwrap_or(candidates.len())
        .max(min_keep);

    candidates.truncate(keep);
}

fn temperature(candidates: &mut Candidates, temp: f32) {
    if temp <= 0.0 {
        return;
    }

    for candidate in candidates.iter_mut() {
        candidate.logit /= temp;
    }
}

impl Sampler for StandardSampler {
    fn sample(&mut self, mut candidates: Candidates, history: &[Token]) -> Option<Token> {
        let Self { stages, rng, .. } = self;

        for stage in stages.iter() {
            match stage {
                SamplerStage::Greedy => return candidates.argmax(),
                SamplerStage::Dry(dry) => dry.apply(&mut candidates, history),
                SamplerStage::TopP(p) => top_p(&mut candidates, *p, 1),
                SamplerStage::MinP(p) => min_p(&mut candidates, *p, 1),
                SamplerStage::Temperature(t) => temperature(&mut candidates, *t),
                SamplerStage::Distribution => {
                    candidates.softmax();

                    return match WeightedIndex::new(candidates.iter().map(|c| c.p)) {
                        Ok(dist) => Some(candidates[dist.sample(rng)].id),
                        Err(_) => candidates.argmax(),
                    };
                }
            }
        }

        candidates.argmax()
    }
}
