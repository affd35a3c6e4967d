//! Item-level views over a token tree.
//!
//! The tree only knows tokens and groups. These helpers recover just enough item
//! structure (item boundaries, names, generic lists, bodies) for mutators to find
//! their sites. Every function walks children left to right, so results come out
//! in a stable order.

use std::ops::Range;

use super::{Delimiter, NodeId, SyntaxTree, TokenKind, ROOT};

const ITEM_KEYWORDS: &[&str] = &[
    "fn",
    "trait",
    "impl",
    "struct",
    "enum",
    "union",
    "type",
    "mod",
    "use",
    "const",
    "static",
    "extern",
    "macro_rules",
];

/// A run of children of `container` forming one item or statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub container: NodeId,
    pub span: Range<usize>,
    /// Position of the defining keyword within the container.
    pub keyword_at: Option<usize>,
}

impl Item {
    pub fn keyword<'t>(&self, tree: &'t SyntaxTree) -> Option<&'t str> {
        self.keyword_at
            .and_then(|at| tree.ident(tree.children(self.container)[at]))
    }

    pub fn is(&self, tree: &SyntaxTree, keyword: &str) -> bool {
        self.keyword(tree) == Some(keyword)
    }

    pub fn nodes<'t>(&self, tree: &'t SyntaxTree) -> &'t [NodeId] {
        &tree.children(self.container)[self.span.clone()]
    }

    /// Position of the item's name, when the keyword is followed by one.
    pub fn name_at(&self, tree: &SyntaxTree) -> Option<usize> {
        let at = self.keyword_at? + 1;
        if at >= self.span.end {
            return None;
        }
        let id = tree.children(self.container)[at];
        match tree.token(id) {
            Some((TokenKind::Ident, _)) if !self.is(tree, "impl") => Some(at),
            _ => None,
        }
    }

    pub fn name<'t>(&self, tree: &'t SyntaxTree) -> Option<&'t str> {
        self.name_at(tree)
            .and_then(|at| tree.ident(tree.children(self.container)[at]))
    }

    /// Trailing brace group of the item, if it ends in one.
    pub fn body(&self, tree: &SyntaxTree) -> Option<NodeId> {
        let last = *self.nodes(tree).last()?;
        tree.is_group(last, Delimiter::Brace).then_some(last)
    }

    pub fn body_at(&self, tree: &SyntaxTree) -> Option<usize> {
        self.body(tree).map(|_| self.span.end - 1)
    }

    /// Generic parameter list: right after `impl`, or right after the name.
    pub fn generics(&self, tree: &SyntaxTree) -> Option<AngleList> {
        let at = if self.is(tree, "impl") {
            self.keyword_at? + 1
        } else {
            self.name_at(tree)? + 1
        };
        angle_list(tree, self.container, at, self.span.end)
    }

    /// First position after the name and generics.
    pub fn after_generics(&self, tree: &SyntaxTree) -> Option<usize> {
        match self.generics(tree) {
            Some(list) => Some(list.close + 1),
            None if self.is(tree, "impl") => self.keyword_at.map(|at| at + 1),
            None => self.name_at(tree).map(|at| at + 1),
        }
    }

    /// Position of a top-level `where`, if any.
    pub fn where_at(&self, tree: &SyntaxTree) -> Option<usize> {
        let end = self.body_at(tree).unwrap_or(self.span.end);
        let start = self.after_generics(tree)?;
        (start..end).find(|at| tree.is_ident(tree.children(self.container)[*at], "where"))
    }

    /// Rendered text of children in `range` of this item's container.
    pub fn text(&self, tree: &SyntaxTree, range: Range<usize>) -> String {
        tree.render_nodes(&tree.children(self.container)[range])
    }
}

/// Position range of `<...>` starting at `open` within `container`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AngleList {
    pub container: NodeId,
    pub open: usize,
    pub close: usize,
}

impl AngleList {
    /// Parameter ranges, split on commas at nesting depth one.
    pub fn params(&self, tree: &SyntaxTree) -> Vec<Range<usize>> {
        let children = tree.children(self.container);
        let mut params = vec![];
        let mut depth = 0i32;
        let mut start = self.open + 1;

        for at in self.open + 1..self.close {
            let id = children[at];
            depth += angle_delta(tree, id);
            if depth == 0 && tree.is_punct(id, ",") {
                if start < at {
                    params.push(start..at);
                }
                start = at + 1;
            }
        }
        if start < self.close {
            params.push(start..self.close);
        }
        params
    }
}

fn angle_delta(tree: &SyntaxTree, id: NodeId) -> i32 {
    match tree.token(id) {
        Some((TokenKind::Punct, "<")) => 1,
        Some((TokenKind::Punct, "<<")) => 2,
        Some((TokenKind::Punct, ">")) => -1,
        Some((TokenKind::Punct, ">>")) => -2,
        _ => 0,
    }
}

/// Finds a balanced angle list opening exactly at `open`.
pub fn angle_list(tree: &SyntaxTree, container: NodeId, open: usize, end: usize) -> Option<AngleList> {
    let children = tree.children(container);
    if open >= end || !tree.is_punct(children[open], "<") {
        return None;
    }

    let mut depth = 0i32;
    for at in open..end {
        depth += angle_delta(tree, children[at]);
        if depth <= 0 {
            return Some(AngleList {
                container,
                open,
                close: at,
            });
        }
    }
    None
}

/// Splits the children of `container` into items. An item ends at a `;` or at a
/// brace group that is not part of an initializer.
pub fn items(tree: &SyntaxTree, container: NodeId) -> Vec<Item> {
    let children = tree.children(container);
    let mut items = vec![];
    let mut start = 0;
    let mut seen_assign = false;
    let mut depth = 0i32;
    let mut at = 0;

    while at < children.len() {
        let id = children[at];

        if at == start && is_inner_attribute(tree, children, at) {
            items.push(make_item(tree, container, start..at + 3));
            at += 3;
            start = at;
            continue;
        }

        if !seen_assign {
            depth = (depth + angle_delta(tree, id)).max(0);
            if depth == 0 && tree.is_punct(id, "=") {
                seen_assign = true;
            }
        }

        let ends = tree.is_punct(id, ";")
            || (!seen_assign && tree.is_group(id, Delimiter::Brace) && !is_attribute_body(tree, children, at));

        if ends {
            items.push(make_item(tree, container, start..at + 1));
            start = at + 1;
            seen_assign = false;
            depth = 0;
        }
        at += 1;
    }

    if start < children.len() {
        items.push(make_item(tree, container, start..children.len()));
    }
    items
}

fn is_inner_attribute(tree: &SyntaxTree, children: &[NodeId], at: usize) -> bool {
    at + 2 < children.len()
        && tree.is_punct(children[at], "#")
        && tree.is_punct(children[at + 1], "!")
        && tree.is_group(children[at + 2], Delimiter::Bracket)
}

fn is_attribute_body(tree: &SyntaxTree, children: &[NodeId], at: usize) -> bool {
    at >= 1 && tree.is_punct(children[at - 1], "#")
}

fn make_item(tree: &SyntaxTree, container: NodeId, span: Range<usize>) -> Item {
    let keyword_at = find_keyword(tree, &tree.children(container)[..span.end], span.start);
    Item {
        container,
        span,
        keyword_at,
    }
}

fn find_keyword(tree: &SyntaxTree, children: &[NodeId], start: usize) -> Option<usize> {
    let mut at = start;
    while at < children.len() {
        let id = children[at];
        if tree.is_punct(id, "#") {
            at += if at + 1 < children.len() && tree.is_punct(children[at + 1], "!") {
                3
            } else {
                2
            };
            continue;
        }

        let here = at;
        let next_is = move |offset: usize, f: &dyn Fn(NodeId) -> bool| {
            children.get(here + offset).map_or(false, |id| f(*id))
        };

        match tree.ident(id)? {
            "pub" => {
                at += if next_is(1, &|id| tree.is_group(id, Delimiter::Paren)) {
                    2
                } else {
                    1
                };
            }
            "unsafe" | "async" | "default" | "auto" => at += 1,
            "const" if next_is(1, &|id| {
                tree.is_ident(id, "fn") || tree.is_ident(id, "unsafe") || tree.is_ident(id, "async")
            }) =>
            {
                at += 1
            }
            "extern" if next_is(1, &|id| tree.token_kind(id) == Some(TokenKind::Str)) => {
                if next_is(2, &|id| tree.is_group(id, Delimiter::Brace)) {
                    return Some(at);
                }
                at += 2
            }
            keyword if ITEM_KEYWORDS.contains(&keyword) => return Some(at),
            _ => return None,
        }
    }
    None
}

/// All items reachable through module, trait and impl bodies, outermost first.
pub fn nested_items(tree: &SyntaxTree) -> Vec<Item> {
    let mut found = vec![];
    let mut queue = std::collections::VecDeque::from([ROOT]);

    while let Some(container) = queue.pop_front() {
        for item in items(tree, container) {
            let nests = item.is(tree, "mod") || item.is(tree, "trait") || item.is(tree, "impl");
            if let (true, Some(body)) = (nests, item.body(tree)) {
                queue.push_back(body);
            }
            found.push(item);
        }
    }
    found
}

/// Bodies of every function item, including methods.
pub fn fn_bodies(tree: &SyntaxTree) -> Vec<NodeId> {
    nested_items(tree)
        .iter()
        .filter(|item| item.is(tree, "fn"))
        .filter_map(|item| item.body(tree))
        .collect()
}

/// Token nodes of a function signature: everything between the name and the body.
pub fn signature_tokens(tree: &SyntaxTree, item: &Item) -> Vec<NodeId> {
    let Some(name_at) = item.name_at(tree) else {
        return vec![];
    };
    let end = item.body_at(tree).unwrap_or(item.span.end);
    let children = tree.children(item.container);

    (name_at + 1..end)
        .flat_map(|at| tree.preorder_from(children[at]))
        .filter(|id| tree.token(*id).is_some())
        .collect()
}

/// Declared trait with its generic arity and associated type names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraitInfo {
    pub item: Item,
    pub name: String,
    /// Number of type parameters; `None` when a parameter is not a plain type.
    pub type_params: Option<usize>,
    pub required_types: Vec<String>,
}

pub fn traits(tree: &SyntaxTree) -> Vec<TraitInfo> {
    nested_items(tree)
        .into_iter()
        .filter(|item| item.is(tree, "trait"))
        .filter_map(|item| {
            let name = item.name(tree)?.to_string();
            let type_params = match item.generics(tree) {
                None => Some(0),
                Some(list) => {
                    let params = list.params(tree);
                    let children = tree.children(item.container);
                    params
                        .iter()
                        .all(|p| is_type_param(tree, children[p.start]))
                        .then_some(params.len())
                }
            };
            let required_types = item
                .body(tree)
                .map(|body| {
                    items(tree, body)
                        .into_iter()
                        .filter(|member| member.is(tree, "type"))
                        .filter(|member| !has_assignment(tree, member))
                        .filter_map(|member| member.name(tree).map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            Some(TraitInfo {
                item,
                name,
                type_params,
                required_types,
            })
        })
        .collect()
}

pub fn is_type_param(tree: &SyntaxTree, id: NodeId) -> bool {
    matches!(tree.token(id), Some((TokenKind::Ident, text)) if text != "const")
}

/// Whether the item has an `=` outside of any angle brackets.
pub fn has_assignment(tree: &SyntaxTree, item: &Item) -> bool {
    let mut depth = 0;
    for id in item.nodes(tree) {
        depth = (depth + angle_delta(tree, *id)).max(0);
        if depth == 0 && tree.is_punct(*id, "=") {
            return true;
        }
    }
    false
}

/// Declared nominal types (structs, enums, unions) with their type parameter count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: String,
    pub type_params: Vec<String>,
    pub lifetimes: bool,
}

pub fn nominal_types(tree: &SyntaxTree) -> Vec<TypeInfo> {
    items(tree, ROOT)
        .into_iter()
        .filter(|item| item.is(tree, "struct") || item.is(tree, "enum") || item.is(tree, "union"))
        .filter_map(|item| {
            let name = item.name(tree)?.to_string();
            let children = tree.children(item.container);
            let mut type_params = vec![];
            let mut lifetimes = false;
            if let Some(list) = item.generics(tree) {
                for param in list.params(tree) {
                    match tree.token(children[param.start]) {
                        Some((TokenKind::Lifetime, _)) => lifetimes = true,
                        Some((TokenKind::Ident, "const")) => return None,
                        Some((TokenKind::Ident, ident)) => type_params.push(ident.to_string()),
                        _ => return None,
                    }
                }
            }
            Some(TypeInfo {
                name,
                type_params,
                lifetimes,
            })
        })
        .collect()
}

/// Header of an `impl Trait for Type` block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImplInfo {
    pub item: Item,
    pub generic: bool,
    /// First identifier of the trait path.
    pub trait_name: String,
    pub trait_text: String,
    pub self_text: String,
    pub self_name: Option<String>,
}

pub fn trait_impls(tree: &SyntaxTree) -> Vec<ImplInfo> {
    nested_items(tree)
        .into_iter()
        .filter(|item| item.is(tree, "impl"))
        .filter_map(|item| {
            let children = tree.children(item.container);
            let start = item.after_generics(tree)?;
            let end = item
                .where_at(tree)
                .or_else(|| item.body_at(tree))
                .unwrap_or(item.span.end);
            let for_at = (start..end).find(|at| tree.is_ident(children[*at], "for"))?;
            let trait_name = (start..for_at)
                .filter_map(|at| tree.ident(children[at]))
                .find(|ident| *ident != "unsafe" && *ident != "dyn")?
                .to_string();
            let self_name = tree.ident(children[for_at + 1]).map(str::to_string);

            Some(ImplInfo {
                generic: item.generics(tree).is_some(),
                trait_name,
                trait_text: item.text(tree, start..for_at),
                self_text: item.text(tree, for_at + 1..end),
                self_name,
                item,
            })
        })
        .collect()
}
