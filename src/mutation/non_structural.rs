//! Mutators that edit function bodies: operators, literals, identifiers and
//! statements. Declarations are left alone.

use itertools::Itertools;

use super::{fresh_name, Family, SiteMutator};
use crate::syntax::{self, query, Delimiter, NodeId, SyntaxTree, TokenKind};

const OPERATOR_CLASSES: &[&[&str]] = &[
    &["+", "-", "*", "/", "%"],
    &["&", "^", "<<", ">>"],
    &["&&", "||"],
    &["==", "!=", "<=", ">="],
];

const NON_OPERAND_WORDS: &[&str] = &[
    "as", "break", "const", "continue", "crate", "dyn", "else", "enum", "fn", "for", "if",
    "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub", "ref", "return",
    "static", "struct", "trait", "type", "unsafe", "use", "where", "while", "yield",
];

const INTERESTING_INTS: &[u64] = &[0, 1, 2, 3, 8, 16, 255, 1024, 65535, 2147483647];

const INT_SUFFIXES: &[(&str, u64)] = &[
    ("usize", u64::MAX),
    ("isize", i64::MAX as u64),
    ("u128", u64::MAX),
    ("i128", u64::MAX),
    ("u64", u64::MAX),
    ("i64", i64::MAX as u64),
    ("u32", u32::MAX as u64),
    ("i32", i32::MAX as u64),
    ("u16", u16::MAX as u64),
    ("i16", i16::MAX as u64),
    ("u8", u8::MAX as u64),
    ("i8", i8::MAX as u64),
];

/// Tokens inside function bodies, in preorder.
fn body_tokens(tree: &SyntaxTree) -> Vec<NodeId> {
    query::fn_bodies(tree)
        .into_iter()
        .flat_map(|body| tree.descendants(body))
        .filter(|id| tree.token(*id).is_some())
        .collect()
}

fn sibling(tree: &SyntaxTree, id: NodeId, offset: isize) -> Option<NodeId> {
    let parent = tree.parent(id)?;
    let at = tree.position(id)? as isize + offset;
    if at < 0 {
        return None;
    }
    tree.children(parent).get(at as usize).copied()
}

fn ends_operand(tree: &SyntaxTree, id: NodeId) -> bool {
    match tree.token(id) {
        Some((TokenKind::Ident, word)) => !NON_OPERAND_WORDS.contains(&word),
        Some((kind, text)) => kind.is_literal() || text == "?",
        None => matches!(tree.delimiter(id), Some(Delimiter::Paren | Delimiter::Bracket)),
    }
}

fn starts_operand(tree: &SyntaxTree, id: NodeId) -> bool {
    match tree.token(id) {
        Some((TokenKind::Ident, word)) => !NON_OPERAND_WORDS.contains(&word) || word == "if" || word == "match",
        Some((TokenKind::Punct, text)) => matches!(text, "-" | "!" | "&" | "*"),
        Some((kind, _)) => kind.is_literal(),
        None => tree.is_group(id, Delimiter::Paren),
    }
}

fn is_binary_operator(tree: &SyntaxTree, token: NodeId) -> bool {
    let Some((TokenKind::Punct, text)) = tree.token(token) else {
        return false;
    };
    OPERATOR_CLASSES.iter().any(|class| class.contains(&text))
        && sibling(tree, token, -1).map_or(false, |prev| ends_operand(tree, prev))
        && sibling(tree, token, 1).map_or(false, |next| starts_operand(tree, next))
}

/// Replaces a binary operator with another of the same class.
pub struct BinOpFlip;

pub struct OperatorSite {
    token: NodeId,
    replacement: &'static str,
}

impl SiteMutator for BinOpFlip {
    type Site = OperatorSite;

    const NAME: &'static str = "bin_op_flip";
    const FAMILY: Family = Family::NonStructural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<OperatorSite> {
        let mut sites = vec![];
        for token in body_tokens(tree).into_iter().filter(|t| is_binary_operator(tree, *t)) {
            let Some((_, text)) = tree.token(token) else {
                continue;
            };
            let Some(class) = OPERATOR_CLASSES.iter().find(|class| class.contains(&text)) else {
                continue;
            };
            for replacement in class.iter().filter(|op| **op != text) {
                sites.push(OperatorSite {
                    token,
                    replacement: *replacement,
                });
            }
        }
        sites
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: OperatorSite) -> bool {
        tree.set_token_text(site.token, site.replacement)
    }
}

/// Replaces an integer literal with a boundary value, keeping its type suffix.
pub struct IntLiteralChange;

pub struct LiteralSite {
    token: NodeId,
    replacement: String,
}

fn split_suffix(literal: &str) -> (&str, Option<(&'static str, u64)>) {
    INT_SUFFIXES
        .iter()
        .find(|(suffix, _)| literal.len() > suffix.len() && literal.ends_with(suffix))
        .map(|(suffix, max)| (&literal[..literal.len() - suffix.len()], Some((*suffix, *max))))
        .unwrap_or((literal, None))
}

fn literal_value(digits: &str) -> Option<u64> {
    let cleaned = digits.replace('_', "");
    if let Some(hex) = cleaned.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(octal) = cleaned.strip_prefix("0o") {
        u64::from_str_radix(octal, 8).ok()
    } else if let Some(binary) = cleaned.strip_prefix("0b") {
        u64::from_str_radix(binary, 2).ok()
    } else {
        cleaned.parse().ok()
    }
}

impl SiteMutator for IntLiteralChange {
    type Site = LiteralSite;

    const NAME: &'static str = "int_literal_change";
    const FAMILY: Family = Family::NonStructural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<LiteralSite> {
        let mut sites = vec![];
        for token in body_tokens(tree) {
            let Some((TokenKind::Int, literal)) = tree.token(token) else {
                continue;
            };
            let tuple_index = sibling(tree, token, -1).map_or(false, |prev| tree.is_punct(prev, "."));
            if tuple_index {
                continue;
            }
            let (digits, suffix) = split_suffix(literal);
            let current = literal_value(digits);
            let max = suffix.map_or(u64::MAX, |(_, max)| max);

            for value in INTERESTING_INTS
                .iter()
                .filter(|v| Some(**v) != current && **v <= max)
            {
                sites.push(LiteralSite {
                    token,
                    replacement: format!("{value}{}", suffix.map_or("", |(s, _)| s)),
                });
            }
        }
        sites
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: LiteralSite) -> bool {
        tree.set_token_text(site.token, &site.replacement)
    }
}

/// Flips `true` and `false`.
pub struct BoolFlip;

impl SiteMutator for BoolFlip {
    type Site = NodeId;

    const NAME: &'static str = "bool_flip";
    const FAMILY: Family = Family::NonStructural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<NodeId> {
        body_tokens(tree)
            .into_iter()
            .filter(|id| tree.is_ident(*id, "true") || tree.is_ident(*id, "false"))
            .collect()
    }

    fn rewrite(&self, tree: &mut SyntaxTree, token: NodeId) -> bool {
        let flipped = if tree.is_ident(token, "true") {
            "false"
        } else {
            "true"
        };
        tree.set_token_text(token, flipped)
    }
}

/// Replaces a use of a local binding with another local of the same function.
pub struct IdentSwap;

pub struct IdentSite {
    token: NodeId,
    replacement: String,
}

fn is_binding(tree: &SyntaxTree, id: NodeId) -> bool {
    sibling(tree, id, -1).map_or(false, |prev| tree.is_ident(prev, "let") || tree.is_ident(prev, "mut"))
}

fn is_plain_use(tree: &SyntaxTree, id: NodeId) -> bool {
    let prev_ok = sibling(tree, id, -1)
        .map_or(true, |prev| !tree.is_punct(prev, ".") && !tree.is_punct(prev, "::"));
    let next_ok = sibling(tree, id, 1).map_or(true, |next| {
        !tree.is_punct(next, "::") && !tree.is_punct(next, "!") && !tree.is_group(next, Delimiter::Paren)
    });
    prev_ok && next_ok && !is_binding(tree, id)
}

impl SiteMutator for IdentSwap {
    type Site = IdentSite;

    const NAME: &'static str = "ident_swap";
    const FAMILY: Family = Family::NonStructural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<IdentSite> {
        let mut sites = vec![];

        for body in query::fn_bodies(tree) {
            let tokens = tree.descendants(body);
            let locals = tokens
                .iter()
                .filter(|id| is_binding(tree, **id))
                .filter_map(|id| tree.ident(*id))
                .filter(|name| *name != "_" && *name != "mut")
                .unique()
                .collect_vec();
            if locals.len() < 2 {
                continue;
            }

            for token in tokens {
                let Some(name) = tree.ident(token) else {
                    continue;
                };
                if !locals.contains(&name) || !is_plain_use(tree, token) {
                    continue;
                }
                for other in locals.iter().filter(|other| **other != name) {
                    sites.push(IdentSite {
                        token,
                        replacement: other.to_string(),
                    });
                }
            }
        }
        sites
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: IdentSite) -> bool {
        tree.set_token_text(site.token, &site.replacement)
    }
}

/// Replaces a whole binary expression with the constant `0`.
pub struct ReplaceByConstant;

pub struct ExpressionSite {
    parent: NodeId,
    span: std::ops::Range<usize>,
}

/// Tokens that can sit inside an operator chain without ending it.
fn chains(tree: &SyntaxTree, id: NodeId) -> bool {
    if ends_operand(tree, id) || is_binary_operator(tree, id) {
        return true;
    }
    match tree.token(id) {
        Some((TokenKind::Punct, text)) => matches!(text, "." | "::" | "-" | "!" | "*" | "&"),
        _ => false,
    }
}

impl SiteMutator for ReplaceByConstant {
    type Site = ExpressionSite;

    const NAME: &'static str = "replace_by_constant";
    const FAMILY: Family = Family::NonStructural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<ExpressionSite> {
        body_tokens(tree)
            .into_iter()
            .filter(|token| is_binary_operator(tree, *token))
            .filter_map(|token| {
                let parent = tree.parent(token)?;
                let at = tree.position(token)?;
                let children = tree.children(parent);
                let start = (0..at)
                    .rev()
                    .take_while(|i| chains(tree, children[*i]))
                    .last()
                    .unwrap_or(at);
                let end = (at + 1..children.len())
                    .take_while(|i| chains(tree, children[*i]))
                    .last()
                    .map_or(at + 1, |last| last + 1);
                Some(ExpressionSite {
                    parent,
                    span: start..end,
                })
            })
            .unique_by(|site| (site.parent, site.span.start))
            .collect()
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: ExpressionSite) -> bool {
        match syntax::fragment("0") {
            Ok(trees) => {
                tree.splice(site.parent, site.span, trees);
                true
            }
            Err(_) => false,
        }
    }
}

/// Opens a block with a fresh `let` statement.
pub struct InjectStatement;

const BLOCK_KEYWORDS: &[&str] = &["if", "while", "for", "loop", "else", "unsafe"];

/// Brace groups inside function bodies that are blocks rather than struct
/// literals or match bodies.
fn is_block(tree: &SyntaxTree, id: NodeId) -> bool {
    let (Some(parent), Some(at)) = (tree.parent(id), tree.position(id)) else {
        return false;
    };
    let children = tree.children(parent);
    if at == 0 {
        return true;
    }
    if tree.is_punct(children[at - 1], "=>") || tree.is_punct(children[at - 1], ";") {
        return true;
    }
    (0..at)
        .rev()
        .map(|i| children[i])
        .take_while(|c| !tree.is_punct(*c, ";") && !tree.is_group(*c, Delimiter::Brace))
        .any(|c| BLOCK_KEYWORDS.iter().any(|keyword| tree.is_ident(c, keyword)))
}

impl SiteMutator for InjectStatement {
    type Site = NodeId;

    const NAME: &'static str = "inject_statement";
    const FAMILY: Family = Family::NonStructural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<NodeId> {
        query::fn_bodies(tree)
            .into_iter()
            .flat_map(|body| {
                let inner = tree
                    .descendants(body)
                    .into_iter()
                    .filter(|id| tree.is_group(*id, Delimiter::Brace) && is_block(tree, *id));
                std::iter::once(body).chain(inner)
            })
            .collect()
    }

    fn rewrite(&self, tree: &mut SyntaxTree, block: NodeId) -> bool {
        let name = fresh_name(tree, "_injected");
        match syntax::fragment(&format!("let {name} = 0;")) {
            Ok(trees) => {
                tree.insert(block, 0, trees);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{tests::assert_deterministic, Mutator};

    fn applied(mutator: &dyn Mutator, source: &str, index: usize) -> String {
        let mut tree = SyntaxTree::parse(source).unwrap();
        assert!(mutator.apply(&mut tree, index));
        tree.render()
    }

    #[test]
    fn operators_flip_within_their_class() {
        let source = "fn f() -> i32 { let a = 1 + 2; a }";
        assert_eq!(assert_deterministic(&BinOpFlip, source), 4);
        assert!(applied(&BinOpFlip, source, 0).contains("let a = 1 - 2;"));
    }

    #[test]
    fn unary_and_generic_tokens_are_not_operators() {
        let source = "fn f(x: &i32) -> Vec<i32> { let y = -*x; let v: Vec<i32> = vec![y]; v }";
        assert_eq!(BinOpFlip.count(&SyntaxTree::parse(source).unwrap()), 0);
    }

    #[test]
    fn nothing_to_flip_in_empty_main() {
        let tree = SyntaxTree::parse("fn main(){}").unwrap();
        assert_eq!(BinOpFlip.count(&tree), 0);
        assert_eq!(IntLiteralChange.count(&tree), 0);
        assert_eq!(BoolFlip.count(&tree), 0);
        assert_eq!(IdentSwap.count(&tree), 0);
        assert_eq!(ReplaceByConstant.count(&tree), 0);
        assert_eq!(InjectStatement.count(&tree), 1);
    }

    #[test]
    fn int_literals_keep_suffix_and_range() {
        let source = "fn f() -> u8 { 7u8 }";
        assert_eq!(assert_deterministic(&IntLiteralChange, source), 7);
        assert!(applied(&IntLiteralChange, source, 0).contains("0u8"));
    }

    #[test]
    fn tuple_indices_are_not_literals() {
        let tree = SyntaxTree::parse("fn f(t: (u8, u8)) -> u8 { t.0 }").unwrap();
        assert_eq!(IntLiteralChange.count(&tree), 0);
    }

    #[test]
    fn bools_flip() {
        let source = "fn f() -> bool { true && false }";
        assert_eq!(assert_deterministic(&BoolFlip, source), 2);
        assert!(applied(&BoolFlip, source, 1).contains("true && true"));
    }

    #[test]
    fn binary_expressions_collapse_to_zero() {
        let source = "fn f(x: u8) -> u8 { let a = x * 2 + 1; g(a - 1, 3) }";
        assert_eq!(assert_deterministic(&ReplaceByConstant, source), 2);

        let text = applied(&ReplaceByConstant, source, 0);
        assert!(text.contains("let a = 0;"));
        let text = applied(&ReplaceByConstant, source, 1);
        assert!(text.contains("g(0, 3)"));
        syntax::check_program(&text).unwrap();
    }

    #[test]
    fn statements_go_into_blocks_only() {
        let source = "struct S { a: u8 } fn f(c: bool) -> S { if c { loop {} } else { }; match 1 { _ => { } }; S { a: 1 } }";
        // body, if, loop, else, match arm
        assert_eq!(assert_deterministic(&InjectStatement, source), 5);

        let text = applied(&InjectStatement, source, 0);
        assert!(text.contains("-> S {\n    let _injected = 0;"));
        syntax::check_program(&text).unwrap();
        for index in 1..5 {
            let text = applied(&InjectStatement, source, index);
            assert!(text.contains("let _injected = 0;"));
            assert!(!text.contains("S {\n        let _injected"));
            syntax::check_program(&text).unwrap();
        }
    }

    #[test]
    fn idents_swap_between_locals() {
        let source = "fn f() -> u8 { let a = 1; let mut b = 2; b = a; b }";
        assert_eq!(assert_deterministic(&IdentSwap, source), 3);
        assert!(applied(&IdentSwap, source, 0).contains("a = a;"));
    }
}
