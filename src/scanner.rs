use crate::token::{keyword_kind, Literal, Token, TokenKind};

pub struct Scanner {
    source: Vec<char>,
    start: usize,
    current: usize,
    line: usize,
}

impl Scanner {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            start: 0,
            current: 0,
            line: 1,
        }
    }

    pub fn scan_tokens(mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        while !self.is_at_end() {
            self.start = self.current;
            self.scan_token(&mut tokens);
        }
        tokens.push(Token {
            kind: TokenKind::EndOfFile,
            lexeme: String::new(),
            line: self.line,
            literal: Literal::None,
        });
        tokens
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> char {
        let c = self.source[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.source[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.source.len() {
            '\0'
        } else {
            self.source[self.current + 1]
        }
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.source[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn add_token(&self, tokens: &mut Vec<Token>, kind: TokenKind) {
        self.add_token_literal(tokens, kind, Literal::None);
    }

    fn add_token_literal(
        &self,
        tokens: &mut Vec<Token>,
        kind: TokenKind,
        literal: Literal,
    ) {
        let lexeme: String =
            self.source[self.start..self.current].iter().collect();
        tokens.push(Token {
            kind,
            lexeme,
            line: self.line,
            literal,
        });
    }

    fn scan_token(&mut self, tokens: &mut Vec<Token>) {
        let c = self.advance();
        match c {
            '(' => self.add_token(tokens, TokenKind::LeftParen),
            ')' => self.add_token(tokens, TokenKind::RightParen),
            '{' => self.add_token(tokens, TokenKind::LeftBrace),
            '}' => self.add_token(tokens, TokenKind::RightBrace),
            '[' => self.add_token(tokens, TokenKind::LeftBracket),
            ']' => self.add_token(tokens, TokenKind::RightBracket),
            ',' => self.add_token(tokens, TokenKind::Comma),
            '.' => self.add_token(tokens, TokenKind::Dot),
            ';' => self.add_token(tokens, TokenKind::Semicolon),
            ':' => self.add_token(tokens, TokenKind::Colon),
            '?' => self.add_token(tokens, TokenKind::Question),
            '-' => {
                if self.matches('-') {
                    self.add_token(tokens, TokenKind::MinusMinus);
                } else if self.matches('=') {
                    self.add_token(tokens, TokenKind::MinusEqual);
                } else {
                    self.add_token(tokens, TokenKind::Minus);
                }
            }
            '+' => {
                if self.matches('+') {
                    self.add_token(tokens, TokenKind::PlusPlus);
                } else if self.matches('=') {
                    self.add_token(tokens, TokenKind::PlusEqual);
                } else {
                    self.add_token(tokens, TokenKind::Plus);
                }
            }
            '*' => {
                if self.matches('=') {
                    self.add_token(tokens, TokenKind::StarEqual);
                } else {
                    self.add_token(tokens, TokenKind::Star);
                }
            }
            '%' => {
                if self.matches('=') {
                    self.add_token(tokens, TokenKind::PercentEqual);
                } else {
                    self.add_token(tokens, TokenKind::Percent);
                }
            }
            '!' => {
                if self.matches('=') {
                    if self.matches('=') {
                        self.add_token(tokens, TokenKind::BangEqualEqual);
                    } else {
                        self.add_token(tokens, TokenKind::BangEqual);
                    }
                } else {
                    self.add_token(tokens, TokenKind::Bang);
                }
            }
            '=' => {
                if self.matches('=') {
                    if self.matches('=') {
                        self.add_token(tokens, TokenKind::EqualEqualEqual);
                    } else {
                        self.add_token(tokens, TokenKind::EqualEqual);
                    }
                } else if self.matches('>') {
                    self.add_token(tokens, TokenKind::Arrow);
                } else {
                    self.add_token(tokens, TokenKind::Equal);
                }
            }
            '<' => {
                if self.matches('=') {
                    self.add_token(tokens, TokenKind::LessEqual);
                } else {
                    self.add_token(tokens, TokenKind::Less);
                }
            }
            '>' => {
                if self.matches('=') {
                    self.add_token(tokens, TokenKind::GreaterEqual);
                } else {
                    self.add_token(tokens, TokenKind::Greater);
                }
            }
            '&' if self.matches('&') => {
                self.add_token(tokens, TokenKind::AndAnd);
            }
            '|' if self.matches('|') => {
                self.add_token(tokens, TokenKind::OrOr);
            }
            '/' => {
                if self.matches('/') {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.advance();
                    }
                } else if self.matches('*') {
                    self.block_comment();
                } else if self.matches('=') {
                    self.add_token(tokens, TokenKind::SlashEqual);
                } else {
                    self.add_token(tokens, TokenKind::Slash);
                }
            }
            ' ' | '\r' | '\t' => {}
            '\n' => self.line += 1,
            '"' => self.string(tokens, '"'),
            '\'' => self.string(tokens, '\''),
            c if c.is_ascii_digit() => self.number(tokens),
            c if c.is_alphabetic() || c == '_' => self.identifier(tokens),
            // Unknown characters are skipped rather than reported.
            _ => {}
        }
    }

    fn block_comment(&mut self) {
        while !self.is_at_end() {
            if self.peek() == '*' && self.peek_next() == '/' {
                self.advance();
                self.advance();
                return;
            }
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }
        eprintln!(
            "[Line {}] Error: Unterminated multi-line comment.",
            self.line
        );
    }

    fn string(&mut self, tokens: &mut Vec<Token>, quote: char) {
        while self.peek() != quote && !self.is_at_end() {
            if self.peek() == '\n' {
                self.line += 1;
            }
            self.advance();
        }
        if self.is_at_end() {
            return;
        }
        self.advance();
        let contents: String = self.source[self.start + 1..self.current - 1]
            .iter()
            .collect();
        self.add_token_literal(tokens, TokenKind::String, Literal::Str(contents));
    }

    fn number(&mut self, tokens: &mut Vec<Token>) {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        let text: String = self.source[self.start..self.current].iter().collect();
        let value = text.parse::<f64>().unwrap_or(f64::NAN);
        self.add_token_literal(tokens, TokenKind::Number, Literal::Number(value));
    }

    fn identifier(&mut self, tokens: &mut Vec<Token>) {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        let text: String = self.source[self.start..self.current].iter().collect();
        let kind = keyword_kind(&text).unwrap_or(TokenKind::Identifier);
        self.add_token(tokens, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Scanner::new(source)
            .scan_tokens()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_scan_declaration() {
        let tokens = Scanner::new("var answer = 42;").scan_tokens();
        let expected = [
            TokenKind::Var,
            TokenKind::Identifier,
            TokenKind::Equal,
            TokenKind::Number,
            TokenKind::Semicolon,
            TokenKind::EndOfFile,
        ];
        for (token, kind) in tokens.iter().zip(expected) {
            assert_eq!(token.kind, kind);
        }
        assert_eq!(tokens[1].lexeme, "answer");
        assert_eq!(tokens[3].literal, Literal::Number(42.0));
    }

    #[test]
    fn test_scan_operators() {
        assert_eq!(
            kinds("a += 1; b === c; d !== e; f => g"),
            vec![
                TokenKind::Identifier,
                TokenKind::PlusEqual,
                TokenKind::Number,
                TokenKind::Semicolon,
                TokenKind::Identifier,
                TokenKind::EqualEqualEqual,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::Identifier,
                TokenKind::BangEqualEqual,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::Identifier,
                TokenKind::Arrow,
                TokenKind::Identifier,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn test_scan_increment_and_logic() {
        assert_eq!(
            kinds("i++ && --j || k"),
            vec![
                TokenKind::Identifier,
                TokenKind::PlusPlus,
                TokenKind::AndAnd,
                TokenKind::MinusMinus,
                TokenKind::Identifier,
                TokenKind::OrOr,
                TokenKind::Identifier,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn test_string_quotes_and_comments() {
        let tokens = Scanner::new(
            "// line comment\n'one' /* block\ncomment */ \"two\"",
        )
        .scan_tokens();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].literal, Literal::Str("one".to_string()));
        assert_eq!(tokens[0].line, 2);
        assert_eq!(tokens[1].literal, Literal::Str("two".to_string()));
        assert_eq!(tokens[1].line, 3);
    }

    #[test]
    fn test_number_with_fraction() {
        let tokens = Scanner::new("3.25 7").scan_tokens();
        assert_eq!(tokens[0].literal, Literal::Number(3.25));
        assert_eq!(tokens[1].literal, Literal::Number(7.0));
    }

    #[test]
    fn test_keywords_share_kinds() {
        assert_eq!(kinds("var x")[0], kinds("let x")[0]);
        assert_eq!(kinds("fun f")[0], kinds("function f")[0]);
    }

    #[test]
    fn test_unknown_characters_are_skipped() {
        assert_eq!(
            kinds("a @ # b"),
            vec![
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::EndOfFile
            ]
        );
    }
}
