use super::{Delimiter, NodeId, NodeKind, SyntaxTree, TokenKind};

const INDENT: &str = "    ";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Prev {
    Start,
    Open,
    Close,
    Word,
    Punct,
    /// `.` and `::`, which bind to the following word
    Glue,
    Hash,
    Bang,
    Angle,
}

struct Renderer {
    out: String,
    indent: usize,
    line_start: bool,
    prev: Prev,
}

impl Renderer {
    fn emit(&mut self, text: &str, space: bool) {
        if self.line_start {
            for _ in 0..self.indent {
                self.out.push_str(INDENT);
            }
            self.line_start = false;
        } else if space {
            self.out.push(' ');
        }
        self.out.push_str(text);
    }

    fn newline(&mut self) {
        if !self.line_start {
            self.out.push('\n');
            self.line_start = true;
        }
    }
}

/// Normalized text for a run of sibling nodes. Whitespace only ever separates
/// tokens that cannot merge, so reparsing the output yields the same tokens.
pub(super) fn render_sequence(tree: &SyntaxTree, ids: &[NodeId], statements: bool) -> String {
    let mut renderer = Renderer {
        out: String::new(),
        indent: 0,
        line_start: true,
        prev: Prev::Start,
    };

    sequence(tree, ids, statements, &mut renderer);

    let len = renderer.out.trim_end().len();
    renderer.out.truncate(len);
    renderer.out
}

fn sequence(tree: &SyntaxTree, ids: &[NodeId], statements: bool, r: &mut Renderer) {
    for (pos, &id) in ids.iter().enumerate() {
        match &tree.node(id).kind {
            NodeKind::Token(kind, text) => {
                let next_is_group = ids
                    .get(pos + 1)
                    .map_or(false, |next| tree.delimiter(*next).is_some());
                token(*kind, text, next_is_group, r);
                if statements && *kind == TokenKind::Punct && text == ";" {
                    r.newline();
                }
            }
            NodeKind::Group(delimiter) => {
                group(tree, id, *delimiter, r);
                if statements && ends_line(tree, ids, pos, *delimiter) {
                    r.newline();
                }
            }
            NodeKind::Root => sequence(tree, tree.children(id), true, r),
        }
    }
}

fn ends_line(tree: &SyntaxTree, ids: &[NodeId], pos: usize, delimiter: Delimiter) -> bool {
    match delimiter {
        Delimiter::Brace => match ids.get(pos + 1) {
            None => true,
            Some(&next) => !matches!(
                tree.token(next),
                Some((TokenKind::Punct, ";" | "," | "." | "?"))
                    | Some((TokenKind::Ident, "else" | "as"))
            ),
        },
        Delimiter::Bracket => {
            pos >= 1
                && (tree.is_punct(ids[pos - 1], "#")
                    || (pos >= 2
                        && tree.is_punct(ids[pos - 1], "!")
                        && tree.is_punct(ids[pos - 2], "#")))
        }
        Delimiter::Paren => false,
    }
}

fn token(kind: TokenKind, text: &str, next_is_group: bool, r: &mut Renderer) {
    let space = match (kind, text) {
        _ if matches!(r.prev, Prev::Start | Prev::Open | Prev::Hash) => false,
        (TokenKind::Punct, "," | ";") => false,
        (TokenKind::Punct, "." | "?") => !matches!(r.prev, Prev::Word | Prev::Close),
        (TokenKind::Punct, ":") => !matches!(r.prev, Prev::Word | Prev::Close | Prev::Angle),
        (TokenKind::Punct, "::") => !matches!(r.prev, Prev::Word | Prev::Close | Prev::Angle),
        (TokenKind::Punct, "!") if next_is_group && r.prev == Prev::Word => false,
        (TokenKind::Punct, "<") if r.prev == Prev::Glue => false,
        (TokenKind::Punct, _) => true,
        _ => r.prev != Prev::Glue,
    };

    r.emit(text, space);

    r.prev = match (kind, text) {
        (TokenKind::Punct, "." | "::") => Prev::Glue,
        (TokenKind::Punct, "#") => Prev::Hash,
        (TokenKind::Punct, "!") => Prev::Bang,
        (TokenKind::Punct, ">") => Prev::Angle,
        (TokenKind::Punct, _) => Prev::Punct,
        _ => Prev::Word,
    };
}

fn group(tree: &SyntaxTree, id: NodeId, delimiter: Delimiter, r: &mut Renderer) {
    let children = tree.children(id);

    match delimiter {
        Delimiter::Brace => {
            let space = !matches!(r.prev, Prev::Start | Prev::Open);
            r.emit("{", space);
            if children.is_empty() {
                r.emit("}", true);
                r.prev = Prev::Close;
                return;
            }

            r.indent += 1;
            r.newline();
            r.prev = Prev::Start;
            sequence(tree, children, true, r);
            r.indent -= 1;
            r.newline();
            r.emit("}", false);
        }
        Delimiter::Paren | Delimiter::Bracket => {
            let space = !matches!(
                r.prev,
                Prev::Start | Prev::Open | Prev::Word | Prev::Close | Prev::Glue | Prev::Hash | Prev::Bang
            );
            r.emit(delimiter.open(), space);
            r.prev = Prev::Open;
            sequence(tree, children, false, r);
            r.emit(delimiter.close(), false);
        }
    }

    r.prev = Prev::Close;
}
