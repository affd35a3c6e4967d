use super::{Delimiter, TokenKind, TokenTree};

#[derive(Debug, thiserror::Error)]
pub enum SyntaxError {
    #[error("malformed source at {line}:{column}, expected {expected}")]
    Malformed {
        line: usize,
        column: usize,
        expected: String,
    },
    #[error("not valid Rust: {0}")]
    Grammar(String),
}

pub(super) fn token_trees(source: &str) -> Result<Vec<TokenTree>, SyntaxError> {
    rust_tokens::file(source).map_err(|e| SyntaxError::Malformed {
        line: e.location.line,
        column: e.location.column,
        expected: e.expected.to_string(),
    })
}

fn leaf(kind: TokenKind, text: &str) -> TokenTree {
    TokenTree::Token(kind, text.to_string())
}

peg::parser! {

    grammar rust_tokens() for str {

        pub rule file() -> Vec<TokenTree> =
            shebang()? _ trees:tree()* {
                trees
            }

        rule tree() -> TokenTree =
            t:(group() / token()) _ { t }

        rule group() -> TokenTree =
            "(" _ inner:tree()* ")" {
                TokenTree::Group(Delimiter::Paren, inner)
            }/
            "[" _ inner:tree()* "]" {
                TokenTree::Group(Delimiter::Bracket, inner)
            }/
            "{" _ inner:tree()* "}" {
                TokenTree::Group(Delimiter::Brace, inner)
            }

        rule token() -> TokenTree =
            s:$(string()) { leaf(TokenKind::Str, s) }
            / s:$(character()) { leaf(TokenKind::Char, s) }
            / s:$(lifetime()) { leaf(TokenKind::Lifetime, s) }
            / s:$(float()) { leaf(TokenKind::Float, s) }
            / s:$(integer()) { leaf(TokenKind::Int, s) }
            / s:$(identifier()) { leaf(TokenKind::Ident, s) }
            / s:$(punct()) { leaf(TokenKind::Punct, s) }

        rule string() =
            ("b" / "c")? raw_string()
            / ("b" / "c")? "\"" ("\\" [_] / [^ '"' | '\\'])* "\""

        rule raw_string() =
            "r###\"" (!"\"###" [_])* "\"###"
            / "r##\"" (!"\"##" [_])* "\"##"
            / "r#\"" (!"\"#" [_])* "\"#"
            / "r\"" [^ '"']* "\""

        rule character() =
            "b"? "'" ("\\" escape() / [^ '\'' | '\\' | '\n']) "'"

        rule escape() =
            "u{" hex()+ "}"
            / "x" hex() hex()
            / [_]

        rule hex() = ['0'..='9' | 'a'..='f' | 'A'..='F']

        rule lifetime() =
            "'" ident_start() ident_continue()* !"'"

        rule float() =
            digits() "." !['.' | '_' | 'a'..='z' | 'A'..='Z'] digits()? exponent()? suffix()?
            / digits() exponent() suffix()?

        rule exponent() = ['e' | 'E'] ['+' | '-']? digits()

        rule integer() =
            ("0x" ['0'..='9' | 'a'..='f' | 'A'..='F' | '_']+
                / "0o" ['0'..='7' | '_']+
                / "0b" ['0' | '1' | '_']+
                / digits()) suffix()?

        rule digits() = ['0'..='9'] ['0'..='9' | '_']*

        rule suffix() = ident_start() ident_continue()*

        rule identifier() =
            "r#" ident_start() ident_continue()*
            / ident_start() ident_continue()*

        rule ident_start() =
            ['a'..='z' | 'A'..='Z' | '_']
            / c:[_] {? if c.is_alphabetic() { Ok(()) } else { Err("identifier") } }

        rule ident_continue() =
            ['a'..='z' | 'A'..='Z' | '0'..='9' | '_']
            / c:[_] {? if c.is_alphanumeric() { Ok(()) } else { Err("identifier") } }

        rule punct() =
            "<<=" / ">>=" / "..." / "..=" / "::" / "->" / "=>" / "==" / "!=" / "<=" / ">="
            / "&&" / "||" / "+=" / "-=" / "*=" / "/=" / "%=" / "^=" / "&=" / "|=" / "<<" / ">>" / ".."
            / ['+' | '-' | '*' | '/' | '%' | '^' | '!' | '&' | '|' | '=' | '<' | '>' | '@'
                | '.' | ',' | ';' | ':' | '#' | '$' | '?' | '~']

        rule shebang() = "#!" !"[" [^ '\n']*

        rule _() = quiet!{ (whitespace() / line_comment() / block_comment())* }

        rule whitespace() =
            [' ' | '\t' | '\r' | '\n']+
            / c:[_] {? if c.is_whitespace() { Ok(()) } else { Err("whitespace") } }

        rule line_comment() = "//" [^ '\n']*

        rule block_comment() = "/*" (block_comment() / !"*/" [_])* "*/"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<(TokenKind, String)> {
        token_trees(source)
            .unwrap()
            .into_iter()
            .filter_map(|t| match t {
                TokenTree::Token(kind, text) => Some((kind, text)),
                TokenTree::Group(..) => None,
            })
            .collect()
    }

    #[test]
    fn lexes_literals_and_lifetimes() {
        let tokens = kinds(r##"'a 'b' b'c' 1u8 0xFFi32 2.5f64 1e3 "s\"" r#"x"# x.0 1..2"##);
        let expected = [
            (TokenKind::Lifetime, "'a"),
            (TokenKind::Char, "'b'"),
            (TokenKind::Char, "b'c'"),
            (TokenKind::Int, "1u8"),
            (TokenKind::Int, "0xFFi32"),
            (TokenKind::Float, "2.5f64"),
            (TokenKind::Float, "1e3"),
            (TokenKind::Str, "\"s\\\"\""),
            (TokenKind::Str, "r#\"x\"#"),
            (TokenKind::Ident, "x"),
            (TokenKind::Punct, "."),
            (TokenKind::Int, "0"),
            (TokenKind::Int, "1"),
            (TokenKind::Punct, ".."),
            (TokenKind::Int, "2"),
        ];

        assert_eq!(tokens.len(), expected.len());
        for ((kind, text), (want_kind, want_text)) in tokens.iter().zip(expected) {
            assert_eq!((*kind, text.as_str()), (want_kind, want_text));
        }
    }

    #[test]
    fn method_call_on_integer_is_not_a_float() {
        let tokens = kinds("1.max");
        assert_eq!(tokens[0], (TokenKind::Int, "1".to_string()));
        assert_eq!(tokens[1], (TokenKind::Punct, ".".to_string()));
    }

    #[test]
    fn comments_are_skipped_and_may_nest() {
        let trees = token_trees("/* outer /* inner */ */ fn // trailing\n x").unwrap();
        assert_eq!(trees.len(), 2);
    }

    #[test]
    fn unbalanced_groups_are_rejected() {
        assert!(token_trees("fn main() {").is_err());
        assert!(token_trees("fn main() { ) }").is_err());
        assert!(token_trees("let s = \"open;").is_err());
    }
}
