use crate::ast::{Expr, FunctionDecl, LiteralValue, Stmt};
use crate::token::{Token, TokenKind};
use anyhow::{anyhow, bail, Result};

/// Recursive-descent parser over the scanner's token stream. Errors carry a
/// `[filename:line] Error:` prefix and abort the parse.
pub struct Parser<'a> {
    tokens: &'a [Token],
    current: usize,
    filename: String,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token], filename: &str) -> Self {
        Self {
            tokens,
            current: 0,
            filename: filename.to_string(),
        }
    }

    pub fn parse(&mut self) -> Result<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.is_at_end() {
            statements.push(self.declaration()?);
        }
        Ok(statements)
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            return true;
        }
        false
    }

    fn check(&self, kind: TokenKind) -> bool {
        !self.is_at_end() && self.peek().kind == kind
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::EndOfFile
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn peek_next(&self) -> &Token {
        if self.current + 1 >= self.tokens.len() {
            &self.tokens[self.current]
        } else {
            &self.tokens[self.current + 1]
        }
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn error_at(&self, line: usize, message: &str) -> anyhow::Error {
        anyhow!("[{}:{}] Error: {}", self.filename, line, message)
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<Token> {
        if self.check(kind) {
            return Ok(self.advance().clone());
        }
        let line = if self.current > 0 {
            self.previous().line
        } else {
            self.peek().line
        };
        Err(self.error_at(line, message))
    }

    fn declaration(&mut self) -> Result<Stmt> {
        if self.matches(TokenKind::Import) {
            return self.import_declaration();
        }
        if self.matches(TokenKind::Export) {
            return self.export_declaration();
        }
        if self.matches(TokenKind::Class) {
            return self.class_declaration();
        }
        if self.matches(TokenKind::Fun) {
            return Ok(Stmt::Function(self.function("function")?));
        }
        if self.matches(TokenKind::Var) {
            return self.var_declaration(false);
        }
        if self.matches(TokenKind::Const) {
            return self.var_declaration(true);
        }
        self.statement()
    }

    fn function(&mut self, kind: &str) -> Result<FunctionDecl> {
        let name =
            self.consume(TokenKind::Identifier, &format!("Expect {kind} name."))?;
        self.consume(TokenKind::LeftParen, "Expect '(' after name.")?;
        let params = self.parameters()?;
        self.consume(TokenKind::LeftBrace, "Expect '{' before body.")?;
        let body = self.block_statements()?;
        Ok(FunctionDecl {
            name: Some(name),
            params,
            body,
        })
    }

    fn parameters(&mut self) -> Result<Vec<Token>> {
        let mut params = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                params.push(
                    self.consume(TokenKind::Identifier, "Expect parameter name.")?,
                );
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.")?;
        Ok(params)
    }

    fn var_declaration(&mut self, is_const: bool) -> Result<Stmt> {
        let name = self.consume(TokenKind::Identifier, "Expect variable name.")?;
        let mut initializer = None;
        if self.matches(TokenKind::Equal) {
            initializer = Some(self.expression()?);
        }
        // The semicolon is optional after a function-valued initializer, so
        // `var f = (x) => x * 2` reads naturally.
        let optional_semicolon = initializer
            .as_ref()
            .map(|e| e.is_arrow_or_function())
            .unwrap_or(false);
        if optional_semicolon {
            self.matches(TokenKind::Semicolon);
        } else {
            self.consume(TokenKind::Semicolon, "Expect ';' after declaration.")?;
        }
        Ok(Stmt::Var {
            name,
            initializer,
            is_const,
        })
    }

    fn statement(&mut self) -> Result<Stmt> {
        if self.matches(TokenKind::If) {
            return self.if_statement();
        }
        if self.matches(TokenKind::While) {
            return self.while_statement();
        }
        if self.matches(TokenKind::For) {
            return self.for_statement();
        }
        if self.matches(TokenKind::Return) {
            return self.return_statement();
        }
        if self.matches(TokenKind::LeftBrace) {
            return Ok(Stmt::Block(self.block_statements()?));
        }
        self.expression_statement()
    }

    fn block_statements(&mut self) -> Result<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            statements.push(self.declaration()?);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.")?;
        Ok(statements)
    }

    fn expression_statement(&mut self) -> Result<Stmt> {
        let expr = self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.")?;
        Ok(Stmt::Expression(expr))
    }

    fn if_statement(&mut self) -> Result<Stmt> {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.")?;
        let condition = self.expression()?;
        self.consume(TokenKind::RightParen, "Expect ')' after condition.")?;
        let then_branch = Box::new(self.statement()?);
        let mut else_branch = None;
        if self.matches(TokenKind::Else) {
            else_branch = Some(Box::new(self.statement()?));
        }
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn while_statement(&mut self) -> Result<Stmt> {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.")?;
        let condition = self.expression()?;
        self.consume(TokenKind::RightParen, "Expect ')' after condition.")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While { condition, body })
    }

    /// `for (init; cond; inc) body` desugars into
    /// `{ init; while (cond) { body; inc; } }` with a missing condition
    /// reading as `true`.
    fn for_statement(&mut self) -> Result<Stmt> {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.")?;
        let initializer = if self.matches(TokenKind::Semicolon) {
            None
        } else if self.matches(TokenKind::Var) {
            Some(self.var_declaration(false)?)
        } else {
            Some(self.expression_statement()?)
        };
        let condition = if self.check(TokenKind::Semicolon) {
            Expr::Literal(LiteralValue::Bool(true))
        } else {
            self.expression()?
        };
        self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.")?;
        let increment = if self.check(TokenKind::RightParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(TokenKind::RightParen, "Expect ')' after for clauses.")?;

        let mut body = self.statement()?;
        if let Some(increment) = increment {
            body = Stmt::Block(vec![body, Stmt::Expression(increment)]);
        }
        body = Stmt::While {
            condition,
            body: Box::new(body),
        };
        if let Some(initializer) = initializer {
            body = Stmt::Block(vec![initializer, body]);
        }
        Ok(body)
    }

    fn return_statement(&mut self) -> Result<Stmt> {
        let keyword = self.previous().clone();
        let mut value = None;
        if !self.check(TokenKind::Semicolon) {
            value = Some(self.expression()?);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.")?;
        Ok(Stmt::Return { keyword, value })
    }

    fn class_declaration(&mut self) -> Result<Stmt> {
        let name = self.consume(TokenKind::Identifier, "Expect class name.")?;
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.")?;
        let mut methods = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.is_at_end() {
            methods.push(self.function("method")?);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.")?;
        Ok(Stmt::Class { name, methods })
    }

    fn import_declaration(&mut self) -> Result<Stmt> {
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'import'.")?;
        let specifiers = self.specifier_list("import")?;
        self.consume(TokenKind::From, "Expect 'from' after import list.")?;
        let path = self.consume(TokenKind::String, "Expect module path string.")?;
        self.consume(TokenKind::Semicolon, "Expect ';' after import statement.")?;
        Ok(Stmt::Import { specifiers, path })
    }

    fn export_declaration(&mut self) -> Result<Stmt> {
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'export'.")?;
        let specifiers = self.specifier_list("export")?;
        self.consume(TokenKind::Semicolon, "Expect ';' after export statement.")?;
        Ok(Stmt::Export { specifiers })
    }

    fn specifier_list(&mut self, kind: &str) -> Result<Vec<Token>> {
        let mut specifiers = Vec::new();
        if !self.check(TokenKind::RightBrace) {
            loop {
                specifiers.push(self.consume(
                    TokenKind::Identifier,
                    &format!("Expect identifier in {kind} list."),
                )?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(
            TokenKind::RightBrace,
            &format!("Expect '}}' after {kind} list."),
        )?;
        Ok(specifiers)
    }

    pub fn expression(&mut self) -> Result<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<Expr> {
        let expr = self.ternary()?;

        if self.matches(TokenKind::Equal) {
            let equals_line = self.previous().line;
            let value = self.assignment()?;
            return match expr {
                Expr::Get { object, name } => Ok(Expr::Set {
                    object,
                    name,
                    value: Box::new(value),
                }),
                Expr::Variable { name } => Ok(Expr::Assign {
                    name,
                    value: Box::new(value),
                }),
                Expr::GetSubscript { target, index } => Ok(Expr::SetSubscript {
                    target,
                    index,
                    value: Box::new(value),
                }),
                _ => Err(self.error_at(equals_line, "Invalid assignment target.")),
            };
        }

        for (compound, plain, lexeme) in [
            (TokenKind::PlusEqual, TokenKind::Plus, "+"),
            (TokenKind::MinusEqual, TokenKind::Minus, "-"),
            (TokenKind::StarEqual, TokenKind::Star, "*"),
            (TokenKind::SlashEqual, TokenKind::Slash, "/"),
            (TokenKind::PercentEqual, TokenKind::Percent, "%"),
        ] {
            if self.matches(compound) {
                let op_line = self.previous().line;
                let value = self.assignment()?;
                if let Expr::Variable { name } = expr {
                    let op = Token::synthetic(plain, lexeme, name.line);
                    let desugared = Expr::Binary {
                        left: Box::new(Expr::Variable { name: name.clone() }),
                        op,
                        right: Box::new(value),
                    };
                    return Ok(Expr::Assign {
                        name,
                        value: Box::new(desugared),
                    });
                }
                return Err(self.error_at(
                    op_line,
                    &format!("Invalid target for '{lexeme}='."),
                ));
            }
        }

        Ok(expr)
    }

    fn ternary(&mut self) -> Result<Expr> {
        let expr = self.logic_or()?;
        if self.matches(TokenKind::Question) {
            let then_expr = self.assignment()?;
            self.consume(
                TokenKind::Colon,
                "Expect ':' after then branch of conditional expression.",
            )?;
            let else_expr = self.assignment()?;
            return Ok(Expr::Ternary {
                condition: Box::new(expr),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            });
        }
        Ok(expr)
    }

    fn logic_or(&mut self) -> Result<Expr> {
        let mut expr = self.logic_and()?;
        while self.matches(TokenKind::OrOr) {
            let op = self.previous().clone();
            let right = self.logic_and()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn logic_and(&mut self) -> Result<Expr> {
        let mut expr = self.equality()?;
        while self.matches(TokenKind::AndAnd) {
            let op = self.previous().clone();
            let right = self.equality()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn equality(&mut self) -> Result<Expr> {
        let mut expr = self.comparison()?;
        while self.matches(TokenKind::BangEqual)
            || self.matches(TokenKind::EqualEqual)
            || self.matches(TokenKind::BangEqualEqual)
            || self.matches(TokenKind::EqualEqualEqual)
        {
            let op = self.previous().clone();
            let right = self.comparison()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr> {
        let mut expr = self.term()?;
        while self.matches(TokenKind::Greater)
            || self.matches(TokenKind::GreaterEqual)
            || self.matches(TokenKind::Less)
            || self.matches(TokenKind::LessEqual)
        {
            let op = self.previous().clone();
            let right = self.term()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut expr = self.factor()?;
        while self.matches(TokenKind::Minus) || self.matches(TokenKind::Plus) {
            let op = self.previous().clone();
            let right = self.factor()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn factor(&mut self) -> Result<Expr> {
        let mut expr = self.unary()?;
        while self.matches(TokenKind::Slash)
            || self.matches(TokenKind::Star)
            || self.matches(TokenKind::Percent)
        {
            let op = self.previous().clone();
            let right = self.unary()?;
            expr = Expr::Binary {
                left: Box::new(expr),
                op,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.matches(TokenKind::Bang) || self.matches(TokenKind::Minus) {
            let op = self.previous().clone();
            let right = self.unary()?;
            return Ok(Expr::Unary {
                op,
                right: Box::new(right),
            });
        }

        if self.matches(TokenKind::PlusPlus) || self.matches(TokenKind::MinusMinus)
        {
            let op = self.previous().clone();
            let target = self.primary()?;
            if let Expr::Variable { name } = target {
                return Ok(Expr::Update {
                    name,
                    is_increment: op.kind == TokenKind::PlusPlus,
                    is_postfix: false,
                });
            }
            return Err(
                self.error_at(op.line, "Invalid target for prefix update.")
            );
        }

        if self.matches(TokenKind::New) {
            let new_line = self.previous().line;
            let callee = self.primary()?;
            if self.matches(TokenKind::LeftParen) {
                let args = self.arguments()?;
                return Ok(Expr::New {
                    callee: Box::new(callee),
                    args,
                });
            }
            return Err(self.error_at(
                new_line,
                "Expect '(' after class name in 'new' expression.",
            ));
        }

        self.call()
    }

    fn arguments(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                args.push(self.expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.")?;
        Ok(args)
    }

    fn call(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.matches(TokenKind::LeftParen) {
                let args = self.arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                };
            } else if self.matches(TokenKind::Dot) {
                let name = self.consume(
                    TokenKind::Identifier,
                    "Expect property name after '.'.",
                )?;
                expr = Expr::Get {
                    object: Box::new(expr),
                    name,
                };
            } else if self.matches(TokenKind::LeftBracket) {
                let index = self.expression()?;
                self.consume(
                    TokenKind::RightBracket,
                    "Expect ']' after subscript.",
                )?;
                expr = Expr::GetSubscript {
                    target: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.matches(TokenKind::PlusPlus)
                || self.matches(TokenKind::MinusMinus)
            {
                let op = self.previous().clone();
                if let Expr::Variable { name } = expr {
                    expr = Expr::Update {
                        name,
                        is_increment: op.kind == TokenKind::PlusPlus,
                        is_postfix: true,
                    };
                } else {
                    return Err(self
                        .error_at(op.line, "Invalid target for postfix update."));
                }
            } else if self.matches(TokenKind::Arrow) {
                // Single unparenthesised parameter: `x => body`. The
                // parenthesised forms are handled in primary().
                let arrow_line = self.previous().line;
                if let Expr::Variable { name } = expr {
                    let body = self.arrow_body()?;
                    expr = Expr::Function(FunctionDecl {
                        name: None,
                        params: vec![name],
                        body,
                    });
                } else {
                    return Err(self
                        .error_at(arrow_line, "Invalid arrow function syntax."));
                }
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn arrow_body(&mut self) -> Result<Vec<Stmt>> {
        if self.matches(TokenKind::LeftBrace) {
            return self.block_statements();
        }
        // Expression body: wrap in an implicit return.
        let keyword =
            Token::synthetic(TokenKind::Return, "return", self.peek().line);
        let value = self.expression()?;
        Ok(vec![Stmt::Return {
            keyword,
            value: Some(value),
        }])
    }

    fn primary(&mut self) -> Result<Expr> {
        if self.matches(TokenKind::This) {
            return Ok(Expr::This {
                keyword: self.previous().clone(),
            });
        }
        if self.matches(TokenKind::False) {
            return Ok(Expr::Literal(LiteralValue::Bool(false)));
        }
        if self.matches(TokenKind::True) {
            return Ok(Expr::Literal(LiteralValue::Bool(true)));
        }
        if self.matches(TokenKind::Null) {
            return Ok(Expr::Literal(LiteralValue::Null));
        }
        if self.matches(TokenKind::Number) {
            return Ok(Expr::Literal(LiteralValue::Number(
                self.previous().number(),
            )));
        }
        if self.matches(TokenKind::String) {
            return Ok(Expr::Literal(LiteralValue::Str(
                self.previous().string().to_string(),
            )));
        }
        if self.matches(TokenKind::Identifier) {
            return Ok(Expr::Variable {
                name: self.previous().clone(),
            });
        }
        if self.matches(TokenKind::LeftParen) {
            return self.paren_or_arrow();
        }
        if self.matches(TokenKind::LeftBracket) {
            let mut elements = Vec::new();
            if !self.check(TokenKind::RightBracket) {
                loop {
                    elements.push(self.expression()?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after list.")?;
            return Ok(Expr::List(elements));
        }
        if self.matches(TokenKind::LeftBrace) {
            return self.object_literal();
        }
        if self.matches(TokenKind::Fun) {
            let mut name = None;
            if self.check(TokenKind::Identifier) {
                name = Some(self.advance().clone());
            }
            self.consume(TokenKind::LeftParen, "Expect '(' after 'fun'.")?;
            let params = self.parameters()?;
            self.consume(TokenKind::LeftBrace, "Expect '{' before body.")?;
            let body = self.block_statements()?;
            return Ok(Expr::Function(FunctionDecl { name, params, body }));
        }
        let line = if self.current > 0 {
            self.previous().line
        } else {
            self.peek().line
        };
        Err(self.error_at(line, "Expect expression."))
    }

    /// After a `(` in expression position: distinguish `() => ...`,
    /// `(a, b) => ...` and a plain parenthesised expression.
    fn paren_or_arrow(&mut self) -> Result<Expr> {
        if self.check(TokenKind::RightParen)
            && self.peek_next().kind == TokenKind::Arrow
        {
            self.advance();
            self.matches(TokenKind::Arrow);
            let body = self.arrow_body()?;
            return Ok(Expr::Function(FunctionDecl {
                name: None,
                params: Vec::new(),
                body,
            }));
        }

        if self.check(TokenKind::Identifier) {
            let next = self.peek_next().kind;
            if next == TokenKind::Comma || next == TokenKind::RightParen {
                // Potential parameter list; commit once the arrow appears.
                let saved = self.current;
                let params = self.parameters()?;
                if self.matches(TokenKind::Arrow) {
                    let body = self.arrow_body()?;
                    return Ok(Expr::Function(FunctionDecl {
                        name: None,
                        params,
                        body,
                    }));
                }
                self.current = saved;
            }
        }

        let expr = self.expression()?;
        self.consume(TokenKind::RightParen, "Expect ')' after expression.")?;
        Ok(expr)
    }

    fn object_literal(&mut self) -> Result<Expr> {
        let mut properties = Vec::new();
        if !self.check(TokenKind::RightBrace) {
            loop {
                let key = if self.matches(TokenKind::Identifier)
                    || self.matches(TokenKind::String)
                {
                    self.previous().clone()
                } else {
                    bail!(self
                        .error_at(self.peek().line, "Expect property name."));
                };
                self.consume(TokenKind::Colon, "Expect ':' after property name.")?;
                let value = self.expression()?;
                properties.push((key, value));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(
            TokenKind::RightBrace,
            "Expect '}' after object literal.",
        )?;
        Ok(Expr::Object(properties))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::Scanner;

    fn parse(source: &str) -> Result<Vec<Stmt>> {
        let tokens = Scanner::new(source).scan_tokens();
        Parser::new(&tokens, "test").parse()
    }

    fn parse_expr(source: &str) -> Expr {
        match parse(&format!("{source};")).unwrap().remove(0) {
            Stmt::Expression(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn test_var_and_const_declarations() -> Result<()> {
        let statements = parse("var a = 1; const b = 2; let c;")?;
        assert_eq!(statements.len(), 3);
        assert!(matches!(
            &statements[0],
            Stmt::Var { is_const: false, initializer: Some(_), .. }
        ));
        assert!(matches!(&statements[1], Stmt::Var { is_const: true, .. }));
        assert!(matches!(
            &statements[2],
            Stmt::Var { initializer: None, .. }
        ));
        Ok(())
    }

    #[test]
    fn test_ternary_binds_tighter_than_assignment() {
        let expr = parse_expr("x = a > 1 ? 2 : 3");
        match expr {
            Expr::Assign { value, .. } => {
                assert!(matches!(*value, Expr::Ternary { .. }));
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_compound_assignment_desugars() {
        let expr = parse_expr("x += 2");
        match expr {
            Expr::Assign { name, value } => {
                assert_eq!(name.lexeme, "x");
                assert_eq!(value.binary_op(), Some(TokenKind::Plus));
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[test]
    fn test_for_desugars_to_while() -> Result<()> {
        let statements = parse("for (var i = 0; i < 3; i++) { print(i); }")?;
        match &statements[0] {
            Stmt::Block(inner) => {
                assert!(matches!(inner[0], Stmt::Var { .. }));
                assert!(matches!(inner[1], Stmt::While { .. }));
            }
            other => panic!("expected block, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_arrow_functions() {
        let single = parse_expr("x => x + 1");
        match single {
            Expr::Function(decl) => {
                assert!(decl.name.is_none());
                assert_eq!(decl.params.len(), 1);
                assert!(matches!(decl.body[0], Stmt::Return { .. }));
            }
            other => panic!("expected function, got {other:?}"),
        }

        let multi = parse_expr("(a, b) => { return a + b; }");
        match multi {
            Expr::Function(decl) => assert_eq!(decl.params.len(), 2),
            other => panic!("expected function, got {other:?}"),
        }

        let none = parse_expr("() => 42");
        match none {
            Expr::Function(decl) => assert!(decl.params.is_empty()),
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[test]
    fn test_parenthesised_expression_still_parses() {
        let expr = parse_expr("(a + b) * c");
        assert_eq!(expr.binary_op(), Some(TokenKind::Star));
    }

    #[test]
    fn test_new_expression() {
        let expr = parse_expr("new Point(1, 2)");
        match expr {
            Expr::New { args, .. } => assert_eq!(args.len(), 2),
            other => panic!("expected new expression, got {other:?}"),
        }
    }

    #[test]
    fn test_object_literal_and_subscript() {
        // In statement position a leading `{` opens a block, so exercise the
        // literal from expression position.
        let expr = parse_expr("o = { name: 'ada', 'age': 36 }");
        match expr {
            Expr::Assign { value, .. } => match *value {
                Expr::Object(properties) => assert_eq!(properties.len(), 2),
                other => panic!("expected object literal, got {other:?}"),
            },
            other => panic!("expected assignment, got {other:?}"),
        }

        let expr = parse_expr("xs[0] = 5");
        assert!(matches!(expr, Expr::SetSubscript { .. }));
    }

    #[test]
    fn test_class_declaration() -> Result<()> {
        let statements = parse(
            "class P { constructor(x) { this.x = x; } get() { return this.x; } }",
        )?;
        match &statements[0] {
            Stmt::Class { name, methods } => {
                assert_eq!(name.lexeme, "P");
                assert_eq!(methods.len(), 2);
            }
            other => panic!("expected class, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_import_export() -> Result<()> {
        let statements =
            parse("import { add, PI } from \"util.js\"; export { add };")?;
        match &statements[0] {
            Stmt::Import { specifiers, path } => {
                assert_eq!(specifiers.len(), 2);
                assert_eq!(path.string(), "util.js");
            }
            other => panic!("expected import, got {other:?}"),
        }
        assert!(matches!(&statements[1], Stmt::Export { .. }));
        Ok(())
    }

    #[test]
    fn test_error_carries_filename_and_line() {
        let err = parse("var x = ;").unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("[test:1] Error:"), "{message}");
    }

    #[test]
    fn test_postfix_and_prefix_update() {
        assert!(matches!(
            parse_expr("i++"),
            Expr::Update { is_postfix: true, is_increment: true, .. }
        ));
        assert!(matches!(
            parse_expr("--j"),
            Expr::Update { is_postfix: false, is_increment: false, .. }
        ));
    }
}
