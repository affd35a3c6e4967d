//! Mutators that reshape declarations: traits, impls, bounds, lifetimes and types.

use std::{collections::HashSet, ops::Range};

use itertools::Itertools;
use rand::Rng;

use super::{fresh_name, site_rng, Family, Mutator, SiteMutator};
use crate::syntax::{
    self,
    query::{self, Item},
    Delimiter, NodeId, SyntaxTree, TokenKind, ROOT,
};

const BUILTIN_BOUNDS: &[&str] = &[
    "Clone",
    "Copy",
    "Sized",
    "Send",
    "Sync",
    "Default",
    "std::fmt::Debug",
    "PartialEq",
];

const PRIMITIVE_TYPES: &[&str] = &[
    "i32", "u8", "u64", "usize", "bool", "char", "f64", "String",
];

fn splice_fragment(tree: &mut SyntaxTree, parent: NodeId, at: usize, text: &str) -> bool {
    match syntax::fragment(text) {
        Ok(trees) => {
            tree.insert(parent, at, trees);
            true
        }
        Err(_) => false,
    }
}

fn append_fragment(tree: &mut SyntaxTree, parent: NodeId, text: &str) -> bool {
    let at = tree.children(parent).len();
    splice_fragment(tree, parent, at, text)
}

/// Whether the token starts a path: not preceded by `::` or `.`, not followed by `::`.
fn is_path_start(tree: &SyntaxTree, id: NodeId) -> bool {
    let (Some(parent), Some(at)) = (tree.parent(id), tree.position(id)) else {
        return false;
    };
    let siblings = tree.children(parent);
    let prev_ok = at == 0 || !(tree.is_punct(siblings[at - 1], "::") || tree.is_punct(siblings[at - 1], "."));
    let next_ok = siblings
        .get(at + 1)
        .map_or(true, |next| !tree.is_punct(*next, "::") && !tree.is_punct(*next, ":"));
    prev_ok && next_ok
}

fn fn_items(tree: &SyntaxTree) -> Vec<Item> {
    query::nested_items(tree)
        .into_iter()
        .filter(|item| item.is(tree, "fn"))
        .collect()
}

/// Appends a fresh trait declaration to the program.
pub struct AddTrait {
    method_names: rand_regex::Regex,
}

const TRAIT_SHAPES: usize = 7;

impl AddTrait {
    pub fn new() -> Result<Self, anyhow::Error> {
        let mut parser = regex_syntax::ParserBuilder::new().unicode(false).build();
        let hir = parser.parse("m_[a-z]{2,6}")?;
        Ok(AddTrait {
            method_names: rand_regex::Regex::with_hir(hir, 8)?,
        })
    }
}

impl SiteMutator for AddTrait {
    type Site = usize;

    const NAME: &'static str = "add_trait";
    const FAMILY: Family = Family::Structural;

    fn collect(&self, _tree: &SyntaxTree) -> Vec<usize> {
        (0..TRAIT_SHAPES).collect()
    }

    fn rewrite(&self, tree: &mut SyntaxTree, shape: usize) -> bool {
        let name = fresh_name(tree, "NewTrait");
        let text = match shape {
            0 => format!("trait {name} {{ }}"),
            1 => format!("trait {name}<T> {{ }}"),
            2 => format!("trait {name} {{ type Out; }}"),
            3 => format!("trait {name} {{ type Item<'a>; }}"),
            4 => format!("trait {name}<const N: usize> {{ }}"),
            5 => format!("trait {name} {{ type Out; const C: Self::Out; fn get(&self) -> Self::Out; }}"),
            _ => {
                let mut rng = site_rng(tree, Self::NAME, shape);
                let method: String = rng.sample(&self.method_names);
                format!("trait {name} {{ fn {method}(&self); }}")
            }
        };
        append_fragment(tree, ROOT, &text)
    }
}

/// Adds a required associated type to a trait and binds it in every impl of it.
pub struct AddAssocType;

pub struct AssocSite {
    trait_name: String,
    body: NodeId,
}

impl SiteMutator for AddAssocType {
    type Site = AssocSite;

    const NAME: &'static str = "add_assoc_type";
    const FAMILY: Family = Family::Structural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<AssocSite> {
        query::traits(tree)
            .into_iter()
            .filter_map(|info| {
                Some(AssocSite {
                    body: info.item.body(tree)?,
                    trait_name: info.name,
                })
            })
            .collect()
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: AssocSite) -> bool {
        let name = fresh_name(tree, "Assoc");
        let impl_bodies = query::trait_impls(tree)
            .into_iter()
            .filter(|info| info.trait_name == site.trait_name)
            .filter_map(|info| info.item.body(tree))
            .collect_vec();

        if !append_fragment(tree, site.body, &format!("type {name};")) {
            return false;
        }
        for body in impl_bodies {
            append_fragment(tree, body, &format!("type {name} = ();"));
        }
        true
    }
}

/// Implements a declared trait for a declared type that lacks that impl.
pub struct AddImpl;

pub struct ImplSite {
    trait_name: String,
    trait_params: usize,
    trait_body: Option<NodeId>,
    type_name: String,
    type_params: Vec<String>,
}

impl SiteMutator for AddImpl {
    type Site = ImplSite;

    const NAME: &'static str = "add_impl";
    const FAMILY: Family = Family::Structural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<ImplSite> {
        let impls = query::trait_impls(tree);
        let types = query::nominal_types(tree);
        let mut sites = vec![];

        for info in query::traits(tree) {
            let Some(trait_params) = info.type_params else {
                continue;
            };
            for ty in types.iter().filter(|ty| !ty.lifetimes) {
                let exists = impls.iter().any(|i| {
                    i.trait_name == info.name && i.self_name.as_deref() == Some(ty.name.as_str())
                });
                if !exists {
                    sites.push(ImplSite {
                        trait_name: info.name.clone(),
                        trait_params,
                        trait_body: info.item.body(tree),
                        type_name: ty.name.clone(),
                        type_params: ty.type_params.clone(),
                    });
                }
            }
        }
        sites
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: ImplSite) -> bool {
        let generics = if site.type_params.is_empty() {
            String::new()
        } else {
            format!("<{}>", site.type_params.join(", "))
        };
        let self_ty = format!("{}{}", site.type_name, generics);
        let trait_args = if site.trait_params == 0 {
            String::new()
        } else {
            format!("<{}>", vec![self_ty.as_str(); site.trait_params].join(", "))
        };

        let mut members = vec![];
        if let Some(body) = site.trait_body {
            for member in query::items(tree, body) {
                if member.is(tree, "type") && !query::has_assignment(tree, &member) {
                    let Some(name) = member.name(tree) else {
                        continue;
                    };
                    let params = member
                        .generics(tree)
                        .map(|list| member.text(tree, list.open..list.close + 1))
                        .unwrap_or_default();
                    members.push(format!("type {name}{params} = {self_ty};"));
                } else if member.is(tree, "fn") && member.body(tree).is_none() {
                    let children = tree.children(member.container);
                    let end = member.span.end;
                    if end == 0 || !tree.is_punct(children[end - 1], ";") {
                        continue;
                    }
                    let signature = member.text(tree, member.span.start..end - 1);
                    members.push(format!("{signature} {{ unimplemented!() }}"));
                }
            }
        }

        let text = format!(
            "impl{generics} {}{trait_args} for {self_ty} {{ {} }}",
            site.trait_name,
            members.join(" ")
        );
        append_fragment(tree, ROOT, &text)
    }
}

/// Injects a trait bound on a generic parameter, a where predicate, or a trait's
/// supertrait list.
pub struct BoundInjection;

#[derive(Clone, Debug)]
enum Insertion {
    /// An existing `:` precedes `at`; the bound goes first in the list.
    Prepend,
    /// No bound list yet; a `: Bound` goes at `at`.
    Colon,
}

pub struct BoundSite {
    container: NodeId,
    at: usize,
    insertion: Insertion,
    bound: String,
}

fn bound_candidates(declared: &[query::TraitInfo], subject: &str, exclude: Option<&str>) -> Vec<String> {
    let mut bounds = BUILTIN_BOUNDS.iter().map(|b| b.to_string()).collect_vec();

    for info in declared {
        if Some(info.name.as_str()) == exclude {
            continue;
        }
        let Some(params) = info.type_params else {
            continue;
        };
        let args = vec![subject; params];
        let plain = if args.is_empty() {
            info.name.clone()
        } else {
            format!("{}<{}>", info.name, args.join(", "))
        };
        bounds.push(plain);

        if let Some(assoc) = info.required_types.first() {
            let mut bound_args = args.iter().map(|a| a.to_string()).collect_vec();
            bound_args.push(format!("{assoc} = {subject}"));
            bounds.push(format!("{}<{}>", info.name, bound_args.join(", ")));
        }
    }
    bounds
}

fn first_colon(tree: &SyntaxTree, children: &[NodeId], range: std::ops::Range<usize>) -> Option<usize> {
    let mut depth = 0i32;
    for at in range {
        match tree.token(children[at]) {
            Some((TokenKind::Punct, "<")) => depth += 1,
            Some((TokenKind::Punct, ">")) => depth -= 1,
            Some((TokenKind::Punct, ":")) if depth == 0 => return Some(at),
            _ => {}
        }
    }
    None
}

impl SiteMutator for BoundInjection {
    type Site = BoundSite;

    const NAME: &'static str = "constraint_injection";
    const FAMILY: Family = Family::Structural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<BoundSite> {
        let declared = query::traits(tree);
        let mut sites = vec![];
        let mut push = |container: NodeId, at: usize, insertion: Insertion, bounds: Vec<String>| {
            for bound in bounds {
                sites.push(BoundSite {
                    container,
                    at,
                    insertion: insertion.clone(),
                    bound,
                });
            }
        };

        for item in query::nested_items(tree) {
            let generic_item = ["fn", "trait", "struct", "enum", "union", "impl"]
                .iter()
                .any(|keyword| item.is(tree, keyword));
            if !generic_item {
                continue;
            }
            let children = tree.children(item.container);

            if let Some(list) = item.generics(tree) {
                for param in list.params(tree) {
                    let Some(subject) = tree.ident(children[param.start]) else {
                        continue;
                    };
                    if subject == "const" {
                        continue;
                    }
                    let bounds = bound_candidates(&declared, subject, None);
                    if param.len() > 1 && tree.is_punct(children[param.start + 1], ":") {
                        push(item.container, param.start + 2, Insertion::Prepend, bounds);
                    } else {
                        push(item.container, param.start + 1, Insertion::Colon, bounds);
                    }
                }
            }

            if let Some(where_at) = item.where_at(tree) {
                let mut end = item.body_at(tree).unwrap_or(item.span.end);
                if end > where_at + 1 && tree.is_punct(children[end - 1], ";") {
                    end -= 1;
                }
                let predicates = (where_at + 1..end)
                    .group_by(|at| tree.is_punct(children[*at], ","))
                    .into_iter()
                    .filter(|(comma, _)| !comma)
                    .map(|(_, group)| group.collect_vec())
                    .collect_vec();
                for predicate in predicates {
                    let (Some(first), Some(last)) = (predicate.first(), predicate.last()) else {
                        continue;
                    };
                    if tree.token_kind(children[*first]) == Some(TokenKind::Lifetime) {
                        continue;
                    }
                    let Some(colon) = first_colon(tree, children, *first..*last + 1) else {
                        continue;
                    };
                    let subject = item.text(tree, *first..colon);
                    let bounds = bound_candidates(&declared, &subject, None);
                    push(item.container, colon + 1, Insertion::Prepend, bounds);
                }
            }

            if item.is(tree, "trait") {
                let (Some(at), Some(name)) = (item.after_generics(tree), item.name(tree)) else {
                    continue;
                };
                let bounds = bound_candidates(&declared, "Self", Some(name));
                if at < item.span.end && tree.is_punct(children[at], ":") {
                    push(item.container, at + 1, Insertion::Prepend, bounds);
                } else {
                    push(item.container, at, Insertion::Colon, bounds);
                }
            }
        }
        sites
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: BoundSite) -> bool {
        let text = match site.insertion {
            Insertion::Prepend => format!("{} +", site.bound),
            Insertion::Colon => format!(": {}", site.bound),
        };
        splice_fragment(tree, site.container, site.at, &text)
    }
}

/// Replaces a concrete type in a signature with an equivalent `<T as Trait>::Assoc`
/// projection, using associated type bindings of non-generic impls.
pub struct ProjectionRewrite;

pub struct ProjectionSite {
    token: NodeId,
    projection: String,
}

struct Binding {
    target: String,
    projection: String,
}

fn bindings(tree: &SyntaxTree) -> Vec<Binding> {
    let mut found = vec![];
    for info in query::trait_impls(tree).into_iter().filter(|i| !i.generic) {
        let Some(body) = info.item.body(tree) else {
            continue;
        };
        for member in query::items(tree, body) {
            if !member.is(tree, "type") {
                continue;
            }
            let (Some(name_at), Some(name)) = (member.name_at(tree), member.name(tree)) else {
                continue;
            };
            let children = tree.children(member.container);
            let rhs = name_at + 2..member.span.end.saturating_sub(1);
            if name_at + 1 >= member.span.end
                || !tree.is_punct(children[name_at + 1], "=")
                || rhs.len() != 1
            {
                continue;
            }
            if let Some(target) = tree.ident(children[rhs.start]) {
                found.push(Binding {
                    target: target.to_string(),
                    projection: format!("<{} as {}>::{}", info.self_text, info.trait_text, name),
                });
            }
        }
    }
    found
}

impl SiteMutator for ProjectionRewrite {
    type Site = ProjectionSite;

    const NAME: &'static str = "projection_rewrite";
    const FAMILY: Family = Family::Structural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<ProjectionSite> {
        let bindings = bindings(tree);
        if bindings.is_empty() {
            return vec![];
        }

        let mut sites = vec![];
        for item in fn_items(tree) {
            for token in query::signature_tokens(tree, &item) {
                let Some(ident) = tree.ident(token) else {
                    continue;
                };
                if !is_path_start(tree, token) {
                    continue;
                }
                for binding in bindings.iter().filter(|b| b.target == ident) {
                    sites.push(ProjectionSite {
                        token,
                        projection: binding.projection.clone(),
                    });
                }
            }
        }
        sites
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: ProjectionSite) -> bool {
        match syntax::fragment(&site.projection) {
            Ok(trees) => tree.replace(site.token, trees).is_some(),
            Err(_) => false,
        }
    }
}

/// Swaps one type name in a function signature for another known type.
pub struct TypeSwap;

pub struct SwapSite {
    token: NodeId,
    replacement: String,
}

fn known_types(tree: &SyntaxTree) -> Vec<String> {
    let declared = query::nominal_types(tree)
        .into_iter()
        .filter(|ty| ty.type_params.is_empty() && !ty.lifetimes)
        .map(|ty| ty.name);
    let aliases = query::items(tree, ROOT)
        .into_iter()
        .filter(|item| item.is(tree, "type") && item.generics(tree).is_none())
        .filter_map(|item| item.name(tree).map(str::to_string));

    declared
        .chain(aliases)
        .chain(PRIMITIVE_TYPES.iter().map(|t| t.to_string()))
        .unique()
        .collect()
}

impl SiteMutator for TypeSwap {
    type Site = SwapSite;

    const NAME: &'static str = "type_swap";
    const FAMILY: Family = Family::Structural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<SwapSite> {
        let types = known_types(tree);
        let mut sites = vec![];

        for item in fn_items(tree) {
            for token in query::signature_tokens(tree, &item) {
                let Some(ident) = tree.ident(token) else {
                    continue;
                };
                if !types.iter().any(|t| t == ident) || !is_path_start(tree, token) {
                    continue;
                }
                for replacement in types.iter().filter(|t| *t != ident) {
                    sites.push(SwapSite {
                        token,
                        replacement: replacement.clone(),
                    });
                }
            }
        }
        sites
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: SwapSite) -> bool {
        tree.set_token_text(site.token, &site.replacement)
    }
}

/// Sum over all bound injection sites of the bounds selectable there.
pub fn constraint_choices(tree: &SyntaxTree) -> usize {
    BoundInjection.count(tree)
}

/// A function whose signature can change without breaking a trait contract.
#[derive(Clone)]
pub struct Signature {
    item: Item,
    args: NodeId,
}

impl Signature {
    fn arguments(&self, tree: &SyntaxTree) -> Vec<Range<usize>> {
        let children = tree.children(self.args);
        let mut ranges = vec![];
        let mut depth = 0i32;
        let mut start = 0;
        for (at, id) in children.iter().enumerate() {
            match tree.token(*id) {
                Some((TokenKind::Punct, "<")) => depth += 1,
                Some((TokenKind::Punct, "<<")) => depth += 2,
                Some((TokenKind::Punct, ">")) => depth -= 1,
                Some((TokenKind::Punct, ">>")) => depth -= 2,
                Some((TokenKind::Punct, ",")) if depth == 0 => {
                    if start < at {
                        ranges.push(start..at);
                    }
                    start = at + 1;
                }
                _ => {}
            }
        }
        if start < children.len() {
            ranges.push(start..children.len());
        }
        ranges
    }

    /// Lifetime parameters with their ranges in the item's container.
    fn lifetimes(&self, tree: &SyntaxTree) -> Vec<(Range<usize>, String)> {
        let Some(list) = self.item.generics(tree) else {
            return vec![];
        };
        let children = tree.children(self.item.container);
        list.params(tree)
            .into_iter()
            .filter_map(|param| match tree.token(children[param.start]) {
                Some((TokenKind::Lifetime, name)) => Some((param, name.to_string())),
                _ => None,
            })
            .collect()
    }
}

/// Free functions and inherent methods. Trait declarations and trait impl members
/// are left alone.
fn free_signatures(tree: &SyntaxTree) -> Vec<Signature> {
    let mut fixed = HashSet::new();
    fixed.extend(query::trait_impls(tree).into_iter().filter_map(|info| info.item.body(tree)));
    fixed.extend(query::traits(tree).into_iter().filter_map(|info| info.item.body(tree)));

    fn_items(tree)
        .into_iter()
        .filter(|item| !fixed.contains(&item.container))
        .filter_map(|item| {
            let at = item.after_generics(tree)?;
            let args = *tree.children(item.container).get(at)?;
            tree.is_group(args, Delimiter::Paren)
                .then_some(Signature { item, args })
        })
        .collect()
}

fn fresh_lifetime(tree: &SyntaxTree, base: &str) -> String {
    let taken: HashSet<&str> = tree
        .preorder()
        .into_iter()
        .filter_map(|id| match tree.token(id) {
            Some((TokenKind::Lifetime, text)) => Some(text),
            _ => None,
        })
        .collect();
    (0..)
        .map(|n| match n {
            0 => format!("'{base}"),
            n => format!("'{base}{n}"),
        })
        .find(|candidate| !taken.contains(candidate.as_str()))
        .unwrap_or_else(|| format!("'{base}"))
}

/// Argument text with `lifetime` on its outermost reference. By-value arguments
/// become shared references.
fn borrowed_argument(tree: &SyntaxTree, tokens: &[NodeId], lifetime: &str) -> Option<String> {
    let text = |range: Range<usize>| tree.render_nodes(&tokens[range]);
    let (head, ty) = match first_colon(tree, tokens, 0..tokens.len()) {
        Some(colon) => (format!("{}: ", text(0..colon)), colon + 1),
        None if tokens.last().map_or(false, |id| tree.is_ident(*id, "self")) => (String::new(), 0),
        None => return None,
    };
    if ty >= tokens.len() {
        return None;
    }

    let borrowed = if tree.is_punct(tokens[ty], "&") {
        let named = tokens
            .get(ty + 1)
            .map_or(false, |id| tree.token_kind(*id) == Some(TokenKind::Lifetime));
        let rest = if named { ty + 2 } else { ty + 1 };
        format!("& {lifetime} {}", text(rest..tokens.len()))
    } else if tokens[ty..].iter().any(|id| tree.is_punct(*id, "+")) {
        format!("& {lifetime} ({})", text(ty..tokens.len()))
    } else {
        format!("& {lifetime} {}", text(ty..tokens.len()))
    };
    Some(format!("{head}{borrowed}"))
}

fn borrow_argument(tree: &mut SyntaxTree, signature: &Signature, argument: usize, lifetime: &str) -> bool {
    let Some(range) = signature.arguments(tree).into_iter().nth(argument) else {
        return false;
    };
    let Some(text) = borrowed_argument(tree, &tree.children(signature.args)[range.clone()], lifetime) else {
        return false;
    };
    match syntax::fragment(&text) {
        Ok(trees) => {
            tree.splice(signature.args, range, trees);
            true
        }
        Err(_) => false,
    }
}

/// Adds `param` after the last lifetime parameter, or first when there is none.
fn declare_lifetime(tree: &mut SyntaxTree, signature: &Signature, param: &str) -> bool {
    let item = &signature.item;
    let Some(list) = item.generics(tree) else {
        return match item.name_at(tree) {
            Some(at) => splice_fragment(tree, item.container, at + 1, &format!("<{param}>")),
            None => false,
        };
    };
    match signature.lifetimes(tree).last() {
        Some((range, _)) => splice_fragment(tree, item.container, range.end, &format!(", {param}")),
        None if list.close == list.open + 1 => splice_fragment(tree, item.container, list.open + 1, param),
        None => splice_fragment(tree, item.container, list.open + 1, &format!("{param},")),
    }
}

/// Puts an explicit lifetime on one function argument, declaring a fresh one when
/// the function has none.
pub struct LifetimeInjection;

pub struct ArgumentSite {
    signature: Signature,
    argument: usize,
}

impl SiteMutator for LifetimeInjection {
    type Site = ArgumentSite;

    const NAME: &'static str = "lifetime_injection";
    const FAMILY: Family = Family::Structural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<ArgumentSite> {
        free_signatures(tree)
            .into_iter()
            .flat_map(|signature| {
                (0..signature.arguments(tree).len()).map(move |argument| ArgumentSite {
                    signature: signature.clone(),
                    argument,
                })
            })
            .collect()
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: ArgumentSite) -> bool {
        let existing = site.signature.lifetimes(tree).into_iter().next();
        let lifetime = match &existing {
            Some((_, name)) => name.clone(),
            None => fresh_lifetime(tree, "mut_lt"),
        };

        if !borrow_argument(tree, &site.signature, site.argument, &lifetime) {
            return false;
        }
        existing.is_some() || declare_lifetime(tree, &site.signature, &lifetime)
    }
}

/// Adds an outlives relation between lifetime parameters of a function, introducing
/// the lifetimes and borrowed arguments it needs.
pub struct OutlivesInjection;

impl SiteMutator for OutlivesInjection {
    type Site = Signature;

    const NAME: &'static str = "outlives_injection";
    const FAMILY: Family = Family::Structural;

    fn collect(&self, tree: &SyntaxTree) -> Vec<Signature> {
        free_signatures(tree)
    }

    fn rewrite(&self, tree: &mut SyntaxTree, site: Signature) -> bool {
        let lifetimes = site.lifetimes(tree);

        match lifetimes.len() {
            0 => {
                let shorter = fresh_lifetime(tree, "outlive_a");
                let longer = fresh_lifetime(tree, "outlive_b");
                let arguments = site.arguments(tree).len();
                for (argument, lifetime) in [(0, &shorter), (1, &longer)] {
                    if argument < arguments {
                        borrow_argument(tree, &site, argument, lifetime);
                    }
                }
                declare_lifetime(tree, &site, &format!("{shorter}, {longer}: {shorter}"))
            }
            1 => {
                let shorter = lifetimes[0].1.clone();
                let longer = fresh_lifetime(tree, "outlive_new");
                let children = tree.children(site.args);
                let by_value = site.arguments(tree).into_iter().position(|range| {
                    let tokens = &children[range];
                    first_colon(tree, tokens, 0..tokens.len())
                        .and_then(|colon| tokens.get(colon + 1))
                        .map_or(false, |id| !tree.is_punct(*id, "&") && !tree.is_punct(*id, "&&"))
                });
                if let Some(argument) = by_value {
                    borrow_argument(tree, &site, argument, &longer);
                }
                declare_lifetime(tree, &site, &format!("{longer}: {shorter}"))
            }
            n => {
                let mut rng = site_rng(tree, Self::NAME, site.args);
                let first = rng.gen_range(0..n);
                let second = (first + rng.gen_range(1..n)) % n;
                let shorter = &lifetimes[first].1;
                let (range, _) = &lifetimes[second];

                let children = tree.children(site.item.container);
                if children[range.clone()].iter().any(|id| tree.text(*id) == Some(shorter.as_str())) {
                    return false;
                }
                if range.len() > 1 && tree.is_punct(children[range.start + 1], ":") {
                    splice_fragment(tree, site.item.container, range.end, &format!("+ {shorter}"))
                } else {
                    splice_fragment(tree, site.item.container, range.start + 1, &format!(": {shorter}"))
                }
            }
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
        let text = tree.render();
        assert!(SyntaxTree::parse(&text).is_ok());
        text
    }

    #[test]
    fn add_trait_always_has_sites() {
        let mutator = AddTrait::new().unwrap();
        assert_eq!(assert_deterministic(&mutator, "fn main(){}"), TRAIT_SHAPES);

        let text = applied(&mutator, "fn main(){}", 0);
        assert_eq!(text, "fn main() { }\ntrait NewTrait { }");
        assert!(applied(&mutator, "fn main(){}", TRAIT_SHAPES - 1).contains("fn m_"));
        for shape in 0..TRAIT_SHAPES {
            syntax::check_program(&applied(&mutator, "fn main(){}", shape)).unwrap();
        }
        assert!(applied(&mutator, "fn main(){}", 3).contains("type Item < 'a >;"));
        assert!(applied(&mutator, "fn main(){}", 4).contains("trait NewTrait < const N: usize > { }"));
    }

    #[test]
    fn add_assoc_type_binds_it_in_impls() {
        let source = "trait Tr { } struct S; impl Tr for S { }";
        assert_eq!(assert_deterministic(&AddAssocType, source), 1);

        let text = applied(&AddAssocType, source, 0);
        assert!(text.contains("trait Tr {\n    type Assoc;\n}"));
        assert!(text.contains("type Assoc = ();"));
    }

    #[test]
    fn add_impl_fills_required_items() {
        let source = "trait Tr { type A; fn f(&self) -> Self::A; fn g() {} } struct S;";
        assert_eq!(assert_deterministic(&AddImpl, source), 1);

        let text = applied(&AddImpl, source, 0);
        assert!(text.contains("impl Tr for S {"));
        assert!(text.contains("type A = S;"));
        assert!(text.contains("unimplemented!()"));
        assert!(!text.contains("fn g() { } {"));

        let tree = SyntaxTree::parse(&text).unwrap();
        assert_eq!(AddImpl.count(&tree), 0);
    }

    #[test]
    fn bounds_go_on_params_predicates_and_supertraits() {
        let source = "trait Tr { } fn f<T, U: Copy>(x: T) where U: Clone { }";
        let count = assert_deterministic(&BoundInjection, source);
        // trait supertrait list, two params, one predicate; the supertrait site excludes itself
        let per_site = BUILTIN_BOUNDS.len() + 1;
        assert_eq!(count, (per_site - 1) + 3 * per_site);

        let tree = SyntaxTree::parse(source).unwrap();
        let texts: Vec<String> = (0..count)
            .map(|i| {
                let mut t = tree.clone();
                BoundInjection.apply(&mut t, i);
                t.render()
            })
            .collect();

        assert!(texts.iter().any(|t| t.contains("trait Tr: Clone { }")));
        assert!(texts.iter().any(|t| t.contains("T: Tr")));
        assert!(texts.iter().any(|t| t.contains("U: Send + Copy")));
        assert!(texts.iter().any(|t| t.contains("U: Tr + Clone")));
    }

    #[test]
    fn projection_rewrite_uses_impl_bindings() {
        let source = "trait Tr { type A; } struct S; impl Tr for S { type A = u8; } fn f(x: u8) -> u8 { x }";
        assert_eq!(assert_deterministic(&ProjectionRewrite, source), 2);

        let text = applied(&ProjectionRewrite, source, 1);
        assert!(text.contains("-> < S as Tr >::A"));
    }

    #[test]
    fn type_swap_touches_only_signatures() {
        let source = "struct S; fn f(x: u8) -> S { S }";
        let count = assert_deterministic(&TypeSwap, source);
        assert_eq!(count, 2 * PRIMITIVE_TYPES.len());

        let text = applied(&TypeSwap, source, 0);
        assert!(text.starts_with("struct S;\nfn f(x: S) -> S"));
        assert!(text.ends_with("S\n}"));
    }

    #[test]
    fn lifetimes_skip_trait_contracts() {
        let source = "struct S; impl S { fn m(self, n: u8) {} } trait Tr { fn t(&self); } \
                      impl Tr for S { fn t(&self) {} } fn f<T>(x: &T, y: u8) {}";
        assert_eq!(assert_deterministic(&LifetimeInjection, source), 4);

        let text = applied(&LifetimeInjection, source, 0);
        assert!(text.contains("fn f < 'mut_lt, T > (x: & 'mut_lt T, y: u8)"));
        syntax::check_program(&text).unwrap();

        let text = applied(&LifetimeInjection, source, 2);
        assert!(text.contains("fn m < 'mut_lt > (& 'mut_lt self, n: u8)"));
        assert!(text.contains("fn t(& self);"));
    }

    #[test]
    fn lifetimes_reuse_a_declared_one() {
        let text = applied(&LifetimeInjection, "fn g<'x>(a: u8, b: &mut u8) {}", 1);
        assert!(text.starts_with("fn g < 'x > (a: u8, b: & 'x mut u8)"));
        syntax::check_program(&text).unwrap();
    }

    #[test]
    fn outlives_introduce_missing_lifetimes() {
        let source = "struct S; impl S { fn m(&self) {} } trait Tr { fn t(&self); } fn f(a: u8, b: &mut u8) {}";
        assert_eq!(assert_deterministic(&OutlivesInjection, source), 2);

        let text = applied(&OutlivesInjection, source, 0);
        assert!(text.contains(
            "fn f < 'outlive_a, 'outlive_b: 'outlive_a > (a: & 'outlive_a u8, b: & 'outlive_b mut u8)"
        ));
        syntax::check_program(&text).unwrap();

        let text = applied(&OutlivesInjection, "fn g<'x, T>(t: T, r: &'x u8) {}", 0);
        assert!(text.starts_with("fn g < 'x, 'outlive_new: 'x, T > (t: & 'outlive_new T, r: & 'x u8)"));
        syntax::check_program(&text).unwrap();
    }

    #[test]
    fn outlives_relate_existing_lifetimes() {
        let source = "fn h<'p, 'q>(a: &'p u8, b: &'q u8) {}";
        let text = applied(&OutlivesInjection, source, 0);
        assert!(text.contains("'q: 'p") || text.contains("'p: 'q"));
        syntax::check_program(&text).unwrap();

        let related = "fn h<'p: 'q, 'q: 'p>(a: &'p u8, b: &'q u8) {}";
        let mut tree = SyntaxTree::parse(related).unwrap();
        assert!(!OutlivesInjection.apply(&mut tree, 0));
        assert_eq!(tree.render(), SyntaxTree::parse(related).unwrap().render());
    }

    #[test]
    fn constraint_choices_grow_with_declared_traits() {
        let plain = SyntaxTree::parse("fn f<T>(x: T) {}").unwrap();
        let richer = SyntaxTree::parse("trait A {} trait B {} fn f<T>(x: T) {}").unwrap();

        assert_eq!(constraint_choices(&plain), BUILTIN_BOUNDS.len());
        assert!(constraint_choices(&richer) > constraint_choices(&plain) + 2);
    }

    #[test]
    fn no_sites_without_material() {
        let tree = SyntaxTree::parse("fn main(){}").unwrap();

        assert_eq!(AddAssocType.count(&tree), 0);
        assert_eq!(AddImpl.count(&tree), 0);
        assert_eq!(ProjectionRewrite.count(&tree), 0);
    }
}
