use crate::{
    completion::Complete,
    configuration::Granularity,
    log::log,
    syntax::{self, query, SyntaxTree, ROOT},
};

use super::{Family, Mutator};

const INSTRUCTIONS: &str = "You are an expert Rust programmer specializing in trait-based design. \
Rewrite the given Rust code so that concrete behavior is abstracted into traits \
implemented for the existing types. Use trait bounds, associated types, default methods \
and generic constraints where they fit. Keep behavior equivalent. \
Output only Rust code, no explanations.";

/// Asks a completion service for a trait-oriented rewrite of the program or of
/// one top-level item.
pub struct TraitRewrite {
    client: Box<dyn Complete>,
    granularity: Granularity,
}

impl TraitRewrite {
    pub fn new(client: Box<dyn Complete>, granularity: Granularity) -> Self {
        TraitRewrite {
            client,
            granularity,
        }
    }

    fn prompt(code: &str) -> String {
        format!("{INSTRUCTIONS}\n\nRewrite the following Rust code to use more traits:\n\n```rust\n{code}\n```\n\nReturn strictly the code.\n")
    }

    fn ask(&self, code: &str) -> Option<String> {
        match self.client.complete(&Self::prompt(code)) {
            Ok(text) => {
                let code = strip_fences(&text);
                (!code.is_empty()).then(|| code.to_string())
            }
            Err(e) => {
                log!("language model rewrite failed: {e}");
                None
            }
        }
    }

    fn rewrite_program(&self, tree: &mut SyntaxTree) -> bool {
        let Some(code) = self.ask(&tree.render()) else {
            return false;
        };
        let parsed = syntax::check_program(&code).and_then(|_| SyntaxTree::parse(&code));
        match parsed {
            Ok(rewritten) if !rewritten.is_empty() => {
                *tree = rewritten;
                true
            }
            Ok(_) => false,
            Err(e) => {
                log!("discarding unparseable rewrite: {e}");
                false
            }
        }
    }

    fn rewrite_item(&self, tree: &mut SyntaxTree, index: usize) -> bool {
        let Some(item) = top_level_items(tree).into_iter().nth(index) else {
            return false;
        };
        let Some(code) = self.ask(&tree.render_nodes(item.nodes(tree))) else {
            return false;
        };
        match syntax::check_items(&code).and_then(|_| syntax::fragment(&code)) {
            Ok(trees) if !trees.is_empty() => {
                tree.splice(ROOT, item.span, trees);
                true
            }
            Ok(_) => false,
            Err(e) => {
                log!("discarding unparseable item rewrite: {e}");
                false
            }
        }
    }
}

fn top_level_items(tree: &SyntaxTree) -> Vec<query::Item> {
    query::items(tree, ROOT)
        .into_iter()
        .filter(|item| item.keyword_at.is_some())
        .collect()
}

/// Removes a surrounding markdown code fence, with or without a language tag.
pub fn strip_fences(text: &str) -> &str {
    let mut code = text.trim();
    if let Some(rest) = code.strip_prefix("```") {
        code = match rest.find('\n') {
            Some(newline) if !rest[..newline].contains('}') => &rest[newline + 1..],
            _ => rest,
        };
    }
    if let Some(rest) = code.trim_end().strip_suffix("```") {
        code = rest;
    }
    code.trim()
}

impl Mutator for TraitRewrite {
    fn name(&self) -> &'static str {
        "llm_trait_rewrite"
    }

    fn family(&self) -> Family {
        Family::LanguageModel
    }

    fn count(&self, tree: &SyntaxTree) -> usize {
        match self.granularity {
            Granularity::Program => usize::from(!tree.is_empty()),
            Granularity::Item => top_level_items(tree).len(),
        }
    }

    fn apply(&self, tree: &mut SyntaxTree, index: usize) -> bool {
        match self.granularity {
            Granularity::Program if index == 0 => self.rewrite_program(tree),
            Granularity::Program => false,
            Granularity::Item => self.rewrite_item(tree, index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::tests::ScriptedCompletion;

    fn rewriter(answers: Vec<Result<&str, &str>>, granularity: Granularity) -> TraitRewrite {
        TraitRewrite::new(Box::new(ScriptedCompletion::new(answers)), granularity)
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```rust\nfn main() {}\n```"), "fn main() {}");
        assert_eq!(strip_fences("```\nstruct S;\n```\n"), "struct S;");
        assert_eq!(strip_fences("  fn f() {}  "), "fn f() {}");
    }

    #[test]
    fn program_granularity_replaces_everything() {
        let mutator = rewriter(
            vec![Ok("```rust\ntrait Speak { fn speak(&self); }\nfn main() {}\n```")],
            Granularity::Program,
        );
        let mut tree = SyntaxTree::parse("fn main() { let x = 1; }").unwrap();

        assert_eq!(mutator.count(&tree), 1);
        assert!(mutator.apply(&mut tree, 0));
        assert!(tree.identifiers().contains("Speak"));
        assert!(!tree.identifiers().contains("x"));
    }

    #[test]
    fn unparseable_completion_leaves_tree_unchanged() {
        let mutator = rewriter(vec![Ok("fn main() { (]"), Err("offline"), Ok("")], Granularity::Program);
        let mut tree = SyntaxTree::parse("fn main() {}").unwrap();
        let before = tree.render();

        for _ in 0..3 {
            assert!(!mutator.apply(&mut tree, 0));
            assert_eq!(tree.render(), before);
        }
    }

    #[test]
    fn chatty_answers_are_not_code() {
        let prose = "Sure! Here is the rewritten code: fn main() {}";
        let mutator = rewriter(vec![Ok(prose)], Granularity::Program);
        let mut tree = SyntaxTree::parse("fn main() { let x = 1; }").unwrap();
        let before = tree.render();

        assert!(!mutator.apply(&mut tree, 0));
        assert_eq!(tree.render(), before);

        let mutator = rewriter(vec![Ok(prose)], Granularity::Item);
        assert!(!mutator.apply(&mut tree, 0));
        assert_eq!(tree.render(), before);
    }

    #[test]
    fn item_granularity_rewrites_one_item() {
        let mutator = rewriter(vec![Ok("struct Renamed;")], Granularity::Item);
        let mut tree = SyntaxTree::parse("struct A;\nstruct B;\nfn main() {}").unwrap();

        assert_eq!(mutator.count(&tree), 3);
        assert!(mutator.apply(&mut tree, 1));

        let ids = tree.identifiers();
        assert!(ids.contains("A"));
        assert!(ids.contains("Renamed"));
        assert!(!ids.contains("B"));
        assert!(ids.contains("main"));
    }
}
