use std::path::Path;

use anyhow::Context;
use itertools::Itertools;
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};
use serde_derive::{Deserialize, Serialize};

use super::{Family, Mutator};
use crate::{configuration::StrategyConfig, oracle::BugKind, syntax::SyntaxTree};

const FAMILIES: [Family; 3] = [Family::Structural, Family::NonStructural, Family::LanguageModel];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FamilyWeight {
    pub family: Family,
    pub weight: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeight {
    pub mutator: String,
    pub family: Family,
    pub weight: f64,
    #[serde(default)]
    pub picks: u64,
    #[serde(default)]
    pub rewards: u64,
}

/// Bandit state: family weights for the first draw, mutator weights for the second.
///
/// Arms are stored in the same order as the mutator list the table was built from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    pub families: Vec<FamilyWeight>,
    pub arms: Vec<StrategyWeight>,
    pub floor: f64,
    pub ceiling: f64,
    pub max_attempts: usize,
}

impl WeightTable {
    pub fn round(&self) -> Round<'_> {
        Round {
            table: self,
            excluded: vec![false; self.arms.len()],
            remaining: self.max_attempts,
        }
    }

    fn clamp(&self, weight: f64) -> f64 {
        weight.clamp(self.floor, self.ceiling)
    }
}

pub struct Feedback {
    pub kind: BugKind,
    pub score: f64,
    pub persisted: bool,
}

pub trait Reward: Send + Sync {
    fn adjust(&self, weight: f64, feedback: &Feedback) -> f64;
}

/// Adds `gain * (1 + ln(1 + score))` for persisted finds, otherwise decays by a fraction.
pub struct ScaledReward {
    pub gain: f64,
    pub decay: f64,
}

impl Reward for ScaledReward {
    fn adjust(&self, weight: f64, feedback: &Feedback) -> f64 {
        if feedback.persisted && feedback.kind != BugKind::Boring {
            weight + self.gain * (1.0 + feedback.score.max(0.0).ln_1p())
        } else {
            weight * (1.0 - self.decay)
        }
    }
}

pub struct StrategyPool {
    table: WeightTable,
    reward: Box<dyn Reward>,
}

impl StrategyPool {
    pub fn new(mutators: &[Box<dyn Mutator>], config: &StrategyConfig) -> Self {
        let family_weight = |family: Family| match family {
            Family::Structural => config.families.structural,
            Family::NonStructural => config.families.non_structural,
            Family::LanguageModel => config.families.llm,
        };

        let arms = mutators
            .iter()
            .map(|m| StrategyWeight {
                mutator: m.name().to_string(),
                family: m.family(),
                weight: config
                    .initial_weight(m.name())
                    .clamp(config.floor, config.ceiling),
                picks: 0,
                rewards: 0,
            })
            .collect_vec();

        let families = FAMILIES
            .into_iter()
            .filter(|family| arms.iter().any(|arm| arm.family == *family))
            .map(|family| FamilyWeight {
                family,
                weight: family_weight(family),
            })
            .collect();

        StrategyPool {
            table: WeightTable {
                families,
                arms,
                floor: config.floor,
                ceiling: config.ceiling,
                max_attempts: config.max_selection_attempts,
            },
            reward: Box::new(ScaledReward {
                gain: config.reward_gain,
                decay: config.decay,
            }),
        }
    }

    pub fn with_reward(mut self, reward: Box<dyn Reward>) -> Self {
        self.reward = reward;
        self
    }

    pub fn snapshot(&self) -> WeightTable {
        self.table.clone()
    }

    /// Takes weights and counters from a saved table, matching arms by mutator name.
    /// Returns how many arms were restored; arms unknown to the snapshot keep their
    /// configured weight.
    pub fn restore(&mut self, snapshot: &WeightTable) -> usize {
        let mut restored = 0;
        for arm in self.table.arms.iter_mut() {
            if let Some(saved) = snapshot.arms.iter().find(|s| s.mutator == arm.mutator) {
                arm.weight = saved.weight.clamp(self.table.floor, self.table.ceiling);
                arm.picks = saved.picks;
                arm.rewards = saved.rewards;
                restored += 1;
            }
        }
        restored
    }

    pub fn record_pick(&mut self, arm: usize) {
        if let Some(arm) = self.table.arms.get_mut(arm) {
            arm.picks += 1;
        }
    }

    /// Applies the reward to one arm as a single read-modify-write. Returns the new weight.
    pub fn feedback(&mut self, arm: usize, feedback: &Feedback) -> f64 {
        let adjusted = match self.table.arms.get(arm) {
            Some(current) => self.reward.adjust(current.weight, feedback),
            None => return 0.0,
        };
        let clamped = self.table.clamp(adjusted);

        let arm = &mut self.table.arms[arm];
        arm.weight = clamped;
        if feedback.persisted && feedback.kind != BugKind::Boring {
            arm.rewards += 1;
        }
        clamped
    }

    pub fn save(&self, path: &Path) -> Result<(), anyhow::Error> {
        let content = serde_json::to_string_pretty(&self.table)?;
        let tmp = path.with_extension("json.tmp");

        std::fs::write(&tmp, content).context("writing strategy snapshot")?;
        std::fs::rename(&tmp, path).context("replacing strategy snapshot")?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<WeightTable, anyhow::Error> {
        let content = std::fs::read_to_string(path).context("reading strategy snapshot")?;
        serde_json::from_str(&content).context("parsing strategy snapshot")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection {
    pub arm: usize,
    pub index: usize,
    pub count: usize,
}

/// One generation round. Arms with no mutation points on the current tree, or whose
/// application failed, are excluded until the round ends.
pub struct Round<'t> {
    table: &'t WeightTable,
    excluded: Vec<bool>,
    remaining: usize,
}

impl<'t> Round<'t> {
    pub fn next<R: Rng>(
        &mut self,
        mutators: &[Box<dyn Mutator>],
        tree: &SyntaxTree,
        rng: &mut R,
    ) -> Option<Selection> {
        while self.remaining > 0 {
            self.remaining -= 1;

            let arm = self.draw(rng)?;
            let count = mutators.get(arm).map_or(0, |m| m.count(tree));

            if count == 0 {
                self.excluded[arm] = true;
                continue;
            }

            return Some(Selection {
                arm,
                index: rng.gen_range(0..count),
                count,
            });
        }
        None
    }

    pub fn reject(&mut self, arm: usize) {
        if let Some(excluded) = self.excluded.get_mut(arm) {
            *excluded = true;
        }
    }

    fn live(&self, arm: usize) -> bool {
        !self.excluded[arm]
    }

    fn draw<R: Rng>(&self, rng: &mut R) -> Option<usize> {
        let arms = &self.table.arms;

        let family_weights = self
            .table
            .families
            .iter()
            .map(|f| {
                let has_live = (0..arms.len()).any(|i| arms[i].family == f.family && self.live(i));
                if has_live {
                    f.weight.max(0.0)
                } else {
                    0.0
                }
            })
            .collect_vec();

        let family = WeightedIndex::new(&family_weights).ok()?.sample(rng);
        let family = self.table.families[family].family;

        let arm_weights = (0..arms.len())
            .map(|i| {
                if arms[i].family == family && self.live(i) {
                    arms[i].weight
                } else {
                    0.0
                }
            })
            .collect_vec();

        Some(WeightedIndex::new(&arm_weights).ok()?.sample(rng))
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::mutation::{non_structural, structural};

    fn config() -> StrategyConfig {
        StrategyConfig {
            floor: 0.1,
            ceiling: 4.0,
            reward_gain: 1.0,
            decay: 0.1,
            ..StrategyConfig::default()
        }
    }

    fn mutators() -> Vec<Box<dyn Mutator>> {
        vec![
            Box::new(non_structural::BinOpFlip),
            Box::new(non_structural::BoolFlip),
            Box::new(structural::AddAssocType),
            Box::new(structural::AddTrait::new().unwrap()),
        ]
    }

    fn found(score: f64) -> Feedback {
        Feedback {
            kind: BugKind::Ice,
            score,
            persisted: true,
        }
    }

    #[test]
    fn persisted_finds_raise_weight() {
        let mut pool = StrategyPool::new(&mutators(), &config());
        let before = pool.snapshot().arms[0].weight;

        let after = pool.feedback(0, &found(3.0));

        assert!(after > before);
        assert_eq!(pool.snapshot().arms[0].rewards, 1);
    }

    #[test]
    fn weights_stay_within_bounds() {
        let mut pool = StrategyPool::new(&mutators(), &config());

        for _ in 0..50 {
            pool.feedback(0, &found(1e6));
        }
        assert_eq!(pool.snapshot().arms[0].weight, 4.0);

        let boring = Feedback {
            kind: BugKind::Boring,
            score: 0.0,
            persisted: false,
        };
        for _ in 0..500 {
            pool.feedback(1, &boring);
        }
        assert_eq!(pool.snapshot().arms[1].weight, 0.1);
    }

    struct Doubling;

    impl Reward for Doubling {
        fn adjust(&self, weight: f64, _: &Feedback) -> f64 {
            weight * 2.0
        }
    }

    #[test]
    fn custom_reward_is_still_clamped() {
        let mut pool = StrategyPool::new(&mutators(), &config()).with_reward(Box::new(Doubling));

        assert_eq!(pool.feedback(1, &found(0.0)), 2.0);
        assert_eq!(pool.feedback(1, &found(0.0)), 4.0);
        assert_eq!(pool.feedback(1, &found(0.0)), 4.0);
    }

    #[test]
    fn duplicate_finds_decay() {
        let mut pool = StrategyPool::new(&mutators(), &config());
        let duplicate = Feedback {
            kind: BugKind::Hang,
            score: 10.0,
            persisted: false,
        };

        assert!(pool.feedback(2, &duplicate) < 1.0);
    }

    #[test]
    fn empty_main_falls_through_to_applicable_mutator() {
        let mutators = mutators();
        let pool = StrategyPool::new(&mutators, &config());
        let tree = SyntaxTree::parse("fn main(){}").unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..50 {
            let selection = pool.snapshot().round().next(&mutators, &tree, &mut rng).unwrap();
            assert_eq!(mutators[selection.arm].name(), "add_trait");
            assert!(selection.index < selection.count);
        }
    }

    #[test]
    fn round_gives_up_when_nothing_applies() {
        let mutators: Vec<Box<dyn Mutator>> = vec![Box::new(non_structural::BinOpFlip)];
        let pool = StrategyPool::new(&mutators, &config());
        let tree = SyntaxTree::parse("fn main(){}").unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        assert!(pool.snapshot().round().next(&mutators, &tree, &mut rng).is_none());
    }

    #[test]
    fn rejected_arm_is_not_drawn_again() {
        let mutators = mutators();
        let pool = StrategyPool::new(&mutators, &config());
        let tree = SyntaxTree::parse("fn main(){}").unwrap();
        let mut rng = StdRng::seed_from_u64(1);

        let table = pool.snapshot();
        let mut round = table.round();
        let add_trait = mutators.iter().position(|m| m.name() == "add_trait").unwrap();
        round.reject(add_trait);

        assert!(round.next(&mutators, &tree, &mut rng).is_none());
    }

    #[test]
    fn snapshot_restores_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy.json");

        let mut pool = StrategyPool::new(&mutators(), &config());
        pool.feedback(3, &found(2.0));
        pool.record_pick(3);
        pool.save(&path).unwrap();

        let reordered: Vec<Box<dyn Mutator>> = vec![
            Box::new(structural::AddTrait::new().unwrap()),
            Box::new(non_structural::IdentSwap),
        ];
        let mut resumed = StrategyPool::new(&reordered, &config());
        let restored = resumed.restore(&StrategyPool::load(&path).unwrap());

        assert_eq!(restored, 1);
        assert_eq!(resumed.snapshot().arms[0].weight, pool.snapshot().arms[3].weight);
        assert_eq!(resumed.snapshot().arms[0].picks, 1);
        assert_eq!(resumed.snapshot().arms[1].weight, 1.0);
    }
}
