//! Arena-backed token trees for candidate programs.
//!
//! A candidate is held as a flat vector of nodes with explicit parent/child links.
//! Groups (`()`, `[]`, `{}`) own their children, tokens are leaves. Walking the
//! arena in preorder is deterministic, which is what mutation site enumeration
//! relies on.

mod parse;
pub mod query;
mod render;

use std::ops::Range;

use sha2::{Digest, Sha256};

pub use parse::SyntaxError;

pub type NodeId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Delimiter {
    Paren,
    Bracket,
    Brace,
}

impl Delimiter {
    pub fn open(self) -> &'static str {
        match self {
            Delimiter::Paren => "(",
            Delimiter::Bracket => "[",
            Delimiter::Brace => "{",
        }
    }

    pub fn close(self) -> &'static str {
        match self {
            Delimiter::Paren => ")",
            Delimiter::Bracket => "]",
            Delimiter::Brace => "}",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Ident,
    Lifetime,
    Int,
    Float,
    Str,
    Char,
    Punct,
}

impl TokenKind {
    pub fn is_literal(self) -> bool {
        matches!(
            self,
            TokenKind::Int | TokenKind::Float | TokenKind::Str | TokenKind::Char
        )
    }
}

/// Owned token tree, used to build and splice fragments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenTree {
    Token(TokenKind, String),
    Group(Delimiter, Vec<TokenTree>),
}

impl TokenTree {
    pub fn ident(text: &str) -> Self {
        TokenTree::Token(TokenKind::Ident, text.to_string())
    }

    pub fn punct(text: &str) -> Self {
        TokenTree::Token(TokenKind::Punct, text.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Group(Delimiter),
    Token(TokenKind, String),
}

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

#[derive(Clone, Debug)]
pub struct SyntaxTree {
    nodes: Vec<Node>,
}

pub const ROOT: NodeId = 0;

impl SyntaxTree {
    pub fn parse(source: &str) -> Result<Self, SyntaxError> {
        let trees = parse::token_trees(source)?;
        Ok(Self::from_token_trees(trees))
    }

    pub fn from_token_trees(trees: Vec<TokenTree>) -> Self {
        let mut tree = SyntaxTree {
            nodes: vec![Node {
                kind: NodeKind::Root,
                parent: None,
                children: vec![],
            }],
        };

        let children = trees
            .into_iter()
            .map(|t| tree.alloc(t, ROOT))
            .collect();
        tree.nodes[ROOT].children = children;
        tree
    }

    fn alloc(&mut self, tree: TokenTree, parent: NodeId) -> NodeId {
        let id = self.nodes.len();
        match tree {
            TokenTree::Token(kind, text) => self.nodes.push(Node {
                kind: NodeKind::Token(kind, text),
                parent: Some(parent),
                children: vec![],
            }),
            TokenTree::Group(delimiter, inner) => {
                self.nodes.push(Node {
                    kind: NodeKind::Group(delimiter),
                    parent: Some(parent),
                    children: vec![],
                });
                let children = inner.into_iter().map(|t| self.alloc(t, id)).collect();
                self.nodes[id].children = children;
            }
        }
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].children.is_empty()
    }

    pub fn token(&self, id: NodeId) -> Option<(TokenKind, &str)> {
        match &self.nodes[id].kind {
            NodeKind::Token(kind, text) => Some((*kind, text.as_str())),
            _ => None,
        }
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        self.token(id).map(|(_, text)| text)
    }

    pub fn token_kind(&self, id: NodeId) -> Option<TokenKind> {
        self.token(id).map(|(kind, _)| kind)
    }

    pub fn is_punct(&self, id: NodeId, punct: &str) -> bool {
        matches!(self.token(id), Some((TokenKind::Punct, text)) if text == punct)
    }

    pub fn is_ident(&self, id: NodeId, ident: &str) -> bool {
        matches!(self.token(id), Some((TokenKind::Ident, text)) if text == ident)
    }

    pub fn ident(&self, id: NodeId) -> Option<&str> {
        match self.token(id) {
            Some((TokenKind::Ident, text)) => Some(text),
            _ => None,
        }
    }

    pub fn delimiter(&self, id: NodeId) -> Option<Delimiter> {
        match self.nodes[id].kind {
            NodeKind::Group(delimiter) => Some(delimiter),
            _ => None,
        }
    }

    pub fn is_group(&self, id: NodeId, delimiter: Delimiter) -> bool {
        self.delimiter(id) == Some(delimiter)
    }

    /// Index of `id` among its parent's children.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        let parent = self.nodes[id].parent?;
        self.nodes[parent].children.iter().position(|c| *c == id)
    }

    /// All nodes reachable from the root, parents before children, siblings in order.
    pub fn preorder(&self) -> Vec<NodeId> {
        self.preorder_from(ROOT)
    }

    pub fn preorder_from(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = vec![];
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id].children.iter().rev());
        }
        order
    }

    /// Every reachable node below `start` (excluding `start` itself).
    pub fn descendants(&self, start: NodeId) -> Vec<NodeId> {
        let mut order = self.preorder_from(start);
        order.remove(0);
        order
    }

    pub fn set_token_text(&mut self, id: NodeId, replacement: &str) -> bool {
        match &mut self.nodes[id].kind {
            NodeKind::Token(_, text) => {
                *text = replacement.to_string();
                true
            }
            _ => false,
        }
    }

    /// Splices `trees` into `parent` before child position `at`.
    pub fn insert(&mut self, parent: NodeId, at: usize, trees: Vec<TokenTree>) -> Vec<NodeId> {
        let ids: Vec<NodeId> = trees.into_iter().map(|t| self.alloc(t, parent)).collect();
        let at = at.min(self.nodes[parent].children.len());
        self.nodes[parent]
            .children
            .splice(at..at, ids.iter().copied());
        ids
    }

    pub fn append(&mut self, parent: NodeId, trees: Vec<TokenTree>) -> Vec<NodeId> {
        let at = self.nodes[parent].children.len();
        self.insert(parent, at, trees)
    }

    /// Replaces the children of `parent` in `range` with `trees`.
    /// Detached nodes stay in the arena but are no longer reachable.
    pub fn splice(
        &mut self,
        parent: NodeId,
        range: Range<usize>,
        trees: Vec<TokenTree>,
    ) -> Vec<NodeId> {
        let ids: Vec<NodeId> = trees.into_iter().map(|t| self.alloc(t, parent)).collect();
        for detached in self.nodes[parent].children[range.clone()].to_vec() {
            self.nodes[detached].parent = None;
        }
        self.nodes[parent].children.splice(range, ids.iter().copied());
        ids
    }

    /// Replaces a single node with `trees` in its parent.
    pub fn replace(&mut self, id: NodeId, trees: Vec<TokenTree>) -> Option<Vec<NodeId>> {
        let parent = self.parent(id)?;
        let at = self.position(id)?;
        Some(self.splice(parent, at..at + 1, trees))
    }

    pub fn to_token_tree(&self, id: NodeId) -> TokenTree {
        match &self.nodes[id].kind {
            NodeKind::Token(kind, text) => TokenTree::Token(*kind, text.clone()),
            NodeKind::Group(delimiter) => TokenTree::Group(
                *delimiter,
                self.children(id)
                    .iter()
                    .map(|c| self.to_token_tree(*c))
                    .collect(),
            ),
            NodeKind::Root => TokenTree::Group(
                Delimiter::Brace,
                self.children(id)
                    .iter()
                    .map(|c| self.to_token_tree(*c))
                    .collect(),
            ),
        }
    }

    pub fn render(&self) -> String {
        render::render_sequence(self, self.children(ROOT), true)
    }

    /// Renders a run of sibling nodes as a single line where possible.
    pub fn render_nodes(&self, ids: &[NodeId]) -> String {
        render::render_sequence(self, ids, false)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.render())
    }

    pub fn line_count(&self) -> usize {
        self.render().lines().count()
    }

    /// Every identifier text present in the program.
    pub fn identifiers(&self) -> std::collections::HashSet<String> {
        self.preorder()
            .into_iter()
            .filter_map(|id| self.ident(id).map(str::to_string))
            .collect()
    }
}

/// Parses a fragment of source into owned token trees, for splicing.
pub fn fragment(source: &str) -> Result<Vec<TokenTree>, SyntaxError> {
    parse::token_trees(source)
}

/// Checks `source` against the full Rust grammar. Token trees only guarantee
/// balanced delimiters.
pub fn check_program(source: &str) -> Result<(), SyntaxError> {
    syn::parse_file(source)
        .map(|_| ())
        .map_err(|e| SyntaxError::Grammar(e.to_string()))
}

/// Like [`check_program`], but the text must hold at least one item.
pub fn check_items(source: &str) -> Result<(), SyntaxError> {
    let file = syn::parse_file(source).map_err(|e| SyntaxError::Grammar(e.to_string()))?;
    if file.items.is_empty() {
        return Err(SyntaxError::Grammar("no items".to_string()));
    }
    Ok(())
}

/// Content hash of normalized program text.
pub fn fingerprint(normalized: &str) -> String {
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

/// Parses and re-renders source so that the text matches what the tree produces.
pub fn normalize(source: &str) -> Result<String, SyntaxError> {
    Ok(SyntaxTree::parse(source)?.render())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_into_groups_and_tokens() {
        let tree = SyntaxTree::parse("fn main() { let x = 1u8; }").unwrap();
        let top = tree.children(ROOT);

        assert_eq!(top.len(), 4);
        assert!(tree.is_ident(top[0], "fn"));
        assert!(tree.is_group(top[2], Delimiter::Paren));
        assert!(tree.is_group(top[3], Delimiter::Brace));
        assert_eq!(tree.children(top[3]).len(), 5);
    }

    #[test]
    fn empty_main_renders_on_one_line() {
        let tree = SyntaxTree::parse("fn main(){}").unwrap();

        assert_eq!(tree.render(), "fn main() { }");
        assert_eq!(tree.line_count(), 1);
    }

    #[test]
    fn rendering_is_a_fixed_point() {
        let source = r##"
            #![allow(unused)]
            // comment is dropped
            trait Foo<T>: Clone where T: Copy { type Out; fn get(&self) -> Self::Out; }
            impl Foo<u8> for S { type Out = Vec<Vec<u8>>; fn get(&self) -> Self::Out { vec![] } }
            fn f<'a>(x: &'a str) -> usize { if x.len() >> 2 != 0 { 1 } else { 'c'.len_utf8() } }
            static S: &str = r#"raw "string""#;
        "##;
        let once = normalize(source).unwrap();
        let twice = normalize(&once).unwrap();

        assert_eq!(once, twice);
        assert!(!once.contains("comment"));
    }

    #[test]
    fn rendered_programs_pass_the_grammar_check() {
        let source = "trait Tr<'a, T: Clone> where T: Copy { type Out: Iterator<Item = Vec<Vec<T>>>; }\n\
                      fn f<'a>(x: &'a str) -> std::vec::Vec<u8> { let r = 0..=2; x.bytes().collect() }";
        let rendered = SyntaxTree::parse(source).unwrap().render();

        check_program(&rendered).unwrap();
    }

    #[test]
    fn grammar_check_rejects_token_soup_and_prose() {
        assert!(SyntaxTree::parse("fn fn fn ; impl impl").is_ok());
        assert!(check_program("fn fn fn ; impl impl").is_err());
        assert!(check_items("Sure! Here is the rewritten code: fn main() {}").is_err());
        assert!(check_items("").is_err());
        check_items("struct Renamed;").unwrap();
    }

    #[test]
    fn fingerprint_ignores_whitespace_differences() {
        let a = SyntaxTree::parse("fn main(){let x=1;}").unwrap();
        let b = SyntaxTree::parse("fn   main ( )\n{\n let x = 1 ;\n}").unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn splice_and_replace_update_reachable_nodes() {
        let mut tree = SyntaxTree::parse("fn f() { a + b; }").unwrap();
        let body = tree.children(ROOT)[3];
        let plus = tree.children(body)[1];

        tree.replace(plus, vec![TokenTree::punct("*")]);
        assert_eq!(tree.render(), "fn f() {\n    a * b;\n}");

        tree.append(ROOT, fragment("struct S;").unwrap());
        assert!(tree.render().ends_with("struct S;"));
    }
}
