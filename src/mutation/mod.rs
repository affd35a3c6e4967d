mod choice;
pub mod language_model;
pub mod non_structural;
pub mod structural;

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};
use serde_derive::{Deserialize, Serialize};

pub use choice::{Feedback, Reward, Round, ScaledReward, Selection, StrategyPool, WeightTable};

use crate::{
    completion::HttpCompletion,
    configuration::FuzzConfig,
    syntax::SyntaxTree,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Structural,
    NonStructural,
    #[serde(rename = "llm")]
    LanguageModel,
}

impl Family {
    pub fn name(self) -> &'static str {
        match self {
            Family::Structural => "structural",
            Family::NonStructural => "non_structural",
            Family::LanguageModel => "llm",
        }
    }
}

/// A mutation strategy over syntax trees.
///
/// `count` reports how many mutation points the tree offers; `apply` transforms the
/// point with the given index. For an unmodified tree, index `i` names the same point
/// on every call, and applying it twice from the same starting tree yields the same text.
pub trait Mutator: Send + Sync {
    fn name(&self) -> &'static str;

    fn family(&self) -> Family;

    fn count(&self, tree: &SyntaxTree) -> usize;

    fn apply(&self, tree: &mut SyntaxTree, index: usize) -> bool;
}

/// Mutators that enumerate concrete sites and rewrite one of them.
///
/// Both `count` and `apply` go through the same `collect`, so enumeration order
/// cannot drift between the two passes.
pub trait SiteMutator: Send + Sync {
    type Site;

    const NAME: &'static str;
    const FAMILY: Family;

    fn collect(&self, tree: &SyntaxTree) -> Vec<Self::Site>;

    fn rewrite(&self, tree: &mut SyntaxTree, site: Self::Site) -> bool;
}

impl<M: SiteMutator> Mutator for M {
    fn name(&self) -> &'static str {
        M::NAME
    }

    fn family(&self) -> Family {
        M::FAMILY
    }

    fn count(&self, tree: &SyntaxTree) -> usize {
        self.collect(tree).len()
    }

    fn apply(&self, tree: &mut SyntaxTree, index: usize) -> bool {
        match self.collect(tree).into_iter().nth(index) {
            Some(site) => self.rewrite(tree, site),
            None => false,
        }
    }
}

/// Deterministic RNG for choices a mutator makes while rewriting a site.
pub fn site_rng(tree: &SyntaxTree, salt: &str, index: usize) -> StdRng {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    tree.fingerprint().hash(&mut hasher);
    salt.hash(&mut hasher);
    index.hash(&mut hasher);
    StdRng::seed_from_u64(hasher.finish())
}

/// Name not used by any identifier in the tree, built from `base`.
pub fn fresh_name(tree: &SyntaxTree, base: &str) -> String {
    let taken = tree.identifiers();
    if !taken.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

pub type Mutators = Arc<Vec<Box<dyn Mutator>>>;

pub fn build_mutators(config: &FuzzConfig) -> Result<Mutators, anyhow::Error> {
    let mut mutators: Vec<Box<dyn Mutator>> = vec![
        Box::new(structural::AddTrait::new()?),
        Box::new(structural::AddAssocType),
        Box::new(structural::AddImpl),
        Box::new(structural::BoundInjection),
        Box::new(structural::ProjectionRewrite),
        Box::new(structural::TypeSwap),
        Box::new(structural::LifetimeInjection),
        Box::new(structural::OutlivesInjection),
        Box::new(non_structural::BinOpFlip),
        Box::new(non_structural::IntLiteralChange),
        Box::new(non_structural::BoolFlip),
        Box::new(non_structural::IdentSwap),
        Box::new(non_structural::ReplaceByConstant),
        Box::new(non_structural::InjectStatement),
    ];

    if config.llm.enabled {
        let client = HttpCompletion::new(&config.llm);
        mutators.push(Box::new(language_model::TraitRewrite::new(
            Box::new(client),
            config.llm.granularity,
        )));
    }

    Ok(Arc::new(mutators))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Checks the count/apply contract for every index of `mutator` on `source`.
    pub fn assert_deterministic(mutator: &dyn Mutator, source: &str) -> usize {
        let tree = SyntaxTree::parse(source).unwrap();
        let count = mutator.count(&tree);

        assert_eq!(count, mutator.count(&tree), "count is not stable");

        for index in 0..count {
            let mut first = tree.clone();
            let mut second = tree.clone();
            let applied = mutator.apply(&mut first, index);

            assert_eq!(applied, mutator.apply(&mut second, index));
            assert_eq!(first.render(), second.render(), "index {index} diverged");
        }
        count
    }

    #[test]
    fn fresh_names_skip_taken_identifiers() {
        let tree = SyntaxTree::parse("trait NewTrait {} struct NewTrait1;").unwrap();
        assert_eq!(fresh_name(&tree, "NewTrait"), "NewTrait2");
        assert_eq!(fresh_name(&tree, "Other"), "Other");
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut tree = SyntaxTree::parse("fn main() { let a = 1 + 2; }").unwrap();
        let before = tree.render();

        assert!(!non_structural::BinOpFlip.apply(&mut tree, 10_000));
        assert_eq!(tree.render(), before);
    }
}
