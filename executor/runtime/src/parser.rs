use std::sync::Arc;

use crate::ast::*;
use crate::error::{Error, Result};
use crate::lexer::{tokenize, Tok, Token};

/// Parse a Du source text into a program.
pub fn parse(source: &str) -> Result<Program> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].tok
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let idx = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[idx].tok
    }

    fn here(&self) -> (u32, u32) {
        let t = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        (t.line, t.column)
    }

    fn bump(&mut self) -> Token {
        let t = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<Token> {
        if self.at(tok) {
            Ok(self.bump())
        } else {
            let (line, column) = self.here();
            Err(Error::parse(
                format!("expected {what}, found {:?}", self.peek()),
                line,
                column,
            ))
        }
    }

    fn skip_newlines(&mut self) {
        while self.at(&Tok::Newline) {
            self.bump();
        }
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        let (line, column) = self.here();
        match self.bump().tok {
            Tok::Ident(name) => Ok(name),
            other => Err(Error::parse(
                format!("expected {what}, found {other:?}"),
                line,
                column,
            )),
        }
    }

    // --- Statements

    fn program(&mut self) -> Result<Program> {
        let body = self.block(&[])?;
        self.skip_newlines();
        if !self.at(&Tok::Eof) {
            let (line, column) = self.here();
            return Err(Error::parse(
                format!("unexpected {:?}", self.peek()),
                line,
                column,
            ));
        }
        Ok(Program { body })
    }

    /// Statements until one of `stops` (or end of input, which the caller
    /// turns into an error if a terminator was required).
    fn block(&mut self, stops: &[Tok]) -> Result<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.at(&Tok::Eof) || stops.iter().any(|s| self.at(s)) {
                return Ok(body);
            }
            body.push(self.stmt()?);
        }
    }

    fn stmt(&mut self) -> Result<Stmt> {
        let (line, column) = self.here();
        let kind = match self.peek() {
            Tok::If => self.if_stmt()?,
            Tok::While => self.while_stmt()?,
            Tok::For => self.for_stmt()?,
            Tok::Return => {
                self.bump();
                if self.at(&Tok::Newline) || self.at(&Tok::Eof) || self.at(&Tok::End) {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.expr()?))
                }
            }
            Tok::Break => {
                self.bump();
                StmtKind::Break
            }
            Tok::Continue => {
                self.bump();
                StmtKind::Continue
            }
            _ => {
                let expr = self.expr()?;
                if self.eat(&Tok::Assign) {
                    let target = as_target(expr)?;
                    let value = self.expr()?;
                    StmtKind::Assign { target, value }
                } else {
                    StmtKind::Expr(expr)
                }
            }
        };
        Ok(Stmt { kind, line, column })
    }

    fn if_stmt(&mut self) -> Result<StmtKind> {
        self.expect(&Tok::If, "'if'")?;
        let mut arms = Vec::new();
        let cond = self.expr()?;
        let body = self.block(&[Tok::Elseif, Tok::Else, Tok::End])?;
        arms.push((cond, body));
        let mut else_body = None;
        loop {
            if self.eat(&Tok::Elseif) {
                let cond = self.expr()?;
                let body = self.block(&[Tok::Elseif, Tok::Else, Tok::End])?;
                arms.push((cond, body));
            } else if self.eat(&Tok::Else) {
                else_body = Some(self.block(&[Tok::End])?);
                break;
            } else {
                break;
            }
        }
        self.expect(&Tok::End, "'end'")?;
        Ok(StmtKind::If { arms, else_body })
    }

    fn while_stmt(&mut self) -> Result<StmtKind> {
        self.expect(&Tok::While, "'while'")?;
        let cond = self.expr()?;
        let body = self.block(&[Tok::End])?;
        self.expect(&Tok::End, "'end'")?;
        Ok(StmtKind::While { cond, body })
    }

    fn for_stmt(&mut self) -> Result<StmtKind> {
        self.expect(&Tok::For, "'for'")?;
        let first = self.ident("loop variable")?;
        let (key, var) = if self.eat(&Tok::Comma) {
            let second = self.ident("loop variable")?;
            (Some(first), second)
        } else {
            (None, first)
        };
        self.expect(&Tok::In, "'in'")?;
        let iter = self.expr()?;
        let body = self.block(&[Tok::End])?;
        self.expect(&Tok::End, "'end'")?;
        Ok(StmtKind::For {
            key,
            var,
            iter,
            body,
        })
    }

    // --- Expressions

    fn expr(&mut self) -> Result<Expr> {
        let (line, column) = self.here();
        match self.peek() {
            Tok::Try => {
                self.bump();
                let body = self.block(&[Tok::Catch])?;
                self.expect(&Tok::Catch, "'catch'")?;
                let var = self.ident("catch variable")?;
                let handler = self.block(&[Tok::End])?;
                self.expect(&Tok::End, "'end'")?;
                Ok(Expr {
                    kind: ExprKind::Try { body, var, handler },
                    line,
                    column,
                })
            }
            Tok::Fn => {
                self.bump();
                self.expect(&Tok::LParen, "'('")?;
                let mut params = Vec::new();
                if !self.at(&Tok::RParen) {
                    loop {
                        params.push(self.ident("parameter name")?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RParen, "')'")?;
                let body = self.block(&[Tok::End])?;
                self.expect(&Tok::End, "'end'")?;
                Ok(Expr {
                    kind: ExprKind::Fn {
                        params,
                        body: Arc::new(body),
                    },
                    line,
                    column,
                })
            }
            _ => self.or_expr(),
        }
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.at(&Tok::Or) {
            let (line, column) = self.here();
            self.bump();
            let rhs = self.and_expr()?;
            lhs = Expr {
                kind: ExprKind::Or(Box::new(lhs), Box::new(rhs)),
                line,
                column,
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.cmp_expr()?;
        while self.at(&Tok::And) {
            let (line, column) = self.here();
            self.bump();
            let rhs = self.cmp_expr()?;
            lhs = Expr {
                kind: ExprKind::And(Box::new(lhs), Box::new(rhs)),
                line,
                column,
            };
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr> {
        let lhs = self.add_expr()?;
        let op = match self.peek() {
            Tok::Eq => BinOp::Eq,
            Tok::Ne => BinOp::Ne,
            Tok::Lt => BinOp::Lt,
            Tok::Le => BinOp::Le,
            Tok::Gt => BinOp::Gt,
            Tok::Ge => BinOp::Ge,
            _ => return Ok(lhs),
        };
        let (line, column) = self.here();
        self.bump();
        let rhs = self.add_expr()?;
        Ok(Expr {
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            line,
            column,
        })
    }

    fn add_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            let (line, column) = self.here();
            self.bump();
            let rhs = self.mul_expr()?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
                column,
            };
        }
    }

    fn mul_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Mod,
                _ => return Ok(lhs),
            };
            let (line, column) = self.here();
            self.bump();
            let rhs = self.unary_expr()?;
            lhs = Expr {
                kind: ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                line,
                column,
            };
        }
    }

    fn unary_expr(&mut self) -> Result<Expr> {
        let (line, column) = self.here();
        let op = match self.peek() {
            Tok::Minus => UnaryOp::Neg,
            Tok::Not | Tok::Bang => UnaryOp::Not,
            _ => return self.postfix_expr(),
        };
        self.bump();
        let expr = self.unary_expr()?;
        Ok(Expr {
            kind: ExprKind::Unary {
                op,
                expr: Box::new(expr),
            },
            line,
            column,
        })
    }

    fn postfix_expr(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            let (line, column) = self.here();
            match self.peek() {
                Tok::LParen => {
                    self.bump();
                    let mut args = Vec::new();
                    if !self.at(&Tok::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if !self.eat(&Tok::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&Tok::RParen, "')'")?;
                    expr = Expr {
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        line,
                        column,
                    };
                }
                Tok::Dot => {
                    self.bump();
                    let field = self.ident("member name")?;
                    expr = Expr {
                        kind: ExprKind::Member {
                            object: Box::new(expr),
                            field,
                        },
                        line,
                        column,
                    };
                }
                Tok::LBracket => {
                    self.bump();
                    let index = self.expr()?;
                    self.expect(&Tok::RBracket, "']'")?;
                    expr = Expr {
                        kind: ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        },
                        line,
                        column,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let (line, column) = self.here();
        let kind = match self.bump().tok {
            Tok::Nil => ExprKind::Nil,
            Tok::True => ExprKind::Bool(true),
            Tok::False => ExprKind::Bool(false),
            Tok::Num(n) => ExprKind::Num(n),
            Tok::Str(s) => ExprKind::Str(s),
            Tok::Ident(name) => ExprKind::Ident(name),
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(&Tok::RParen, "')'")?;
                return Ok(inner);
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                if !self.at(&Tok::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBracket, "']'")?;
                ExprKind::ArrayLit(items)
            }
            Tok::LBrace => {
                let mut entries = Vec::new();
                if !self.at(&Tok::RBrace) {
                    loop {
                        let key = match self.bump().tok {
                            Tok::Ident(name) => name,
                            Tok::Str(s) => s,
                            other => {
                                return Err(Error::parse(
                                    format!("expected object key, found {other:?}"),
                                    line,
                                    column,
                                ))
                            }
                        };
                        self.expect(&Tok::Colon, "':'")?;
                        entries.push((key, self.expr()?));
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBrace, "'}'")?;
                ExprKind::ObjectLit(entries)
            }
            other => {
                return Err(Error::parse(
                    format!("unexpected {other:?}"),
                    line,
                    column,
                ))
            }
        };
        Ok(Expr { kind, line, column })
    }
}

fn as_target(expr: Expr) -> Result<Target> {
    match expr.kind {
        ExprKind::Ident(name) => Ok(Target::Name(name)),
        ExprKind::Member { object, field } => Ok(Target::Member {
            object: *object,
            field,
        }),
        ExprKind::Index { object, index } => Ok(Target::Index {
            object: *object,
            index: *index,
        }),
        _ => Err(Error::parse(
            "invalid assignment target",
            expr.line,
            expr.column,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        parse(src).unwrap()
    }

    #[test]
    fn assignment_and_expression_statements() {
        let prog = parse_ok("x = 1\nx + 2");
        assert_eq!(prog.body.len(), 2);
        assert!(matches!(prog.body[0].kind, StmtKind::Assign { .. }));
        assert!(matches!(prog.body[1].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn member_and_index_targets() {
        let prog = parse_ok("a.b = 1\na[0] = 2");
        assert!(matches!(
            prog.body[0].kind,
            StmtKind::Assign {
                target: Target::Member { .. },
                ..
            }
        ));
        assert!(matches!(
            prog.body[1].kind,
            StmtKind::Assign {
                target: Target::Index { .. },
                ..
            }
        ));
    }

    #[test]
    fn method_call_chain() {
        let prog = parse_ok("datastore(\"t\").set(\"x\", 1)");
        let StmtKind::Expr(expr) = &prog.body[0].kind else {
            panic!("expected expression");
        };
        assert!(matches!(expr.kind, ExprKind::Call { .. }));
    }

    #[test]
    fn if_elseif_else() {
        let prog = parse_ok("if a\n1\nelseif b\n2\nelse\n3\nend");
        let StmtKind::If { arms, else_body } = &prog.body[0].kind else {
            panic!("expected if");
        };
        assert_eq!(arms.len(), 2);
        assert!(else_body.is_some());
    }

    #[test]
    fn function_literal_with_body() {
        let prog = parse_ok("f = fn(a, b) return a + b end");
        let StmtKind::Assign { value, .. } = &prog.body[0].kind else {
            panic!("expected assignment");
        };
        let ExprKind::Fn { params, body } = &value.kind else {
            panic!("expected fn literal");
        };
        assert_eq!(params, &vec!["a".to_string(), "b".to_string()]);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn try_catch_expression() {
        let prog = parse_ok("try throw(\"x\") catch e e.kind end");
        let StmtKind::Expr(expr) = &prog.body[0].kind else {
            panic!("expected expression");
        };
        let ExprKind::Try { var, .. } = &expr.kind else {
            panic!("expected try");
        };
        assert_eq!(var, "e");
    }

    #[test]
    fn for_two_variable_form() {
        let prog = parse_ok("for k, v in obj\nprint(k, v)\nend");
        assert!(matches!(
            prog.body[0].kind,
            StmtKind::For { key: Some(_), .. }
        ));
    }

    #[test]
    fn precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        let prog = parse_ok("1 + 2 * 3");
        let StmtKind::Expr(expr) = &prog.body[0].kind else {
            panic!()
        };
        let ExprKind::Binary { op, rhs, .. } = &expr.kind else {
            panic!()
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(
            rhs.kind,
            ExprKind::Binary { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn missing_end_is_a_parse_error() {
        let err = parse("if x\n1").unwrap_err();
        assert_eq!(err.kind_str(), "parse");
    }

    #[test]
    fn fn_literals_inside_array_literal() {
        let prog = parse_ok("parallel([fn() return 1 end, fn() throw(\"x\") end])");
        assert_eq!(prog.body.len(), 1);
    }
}
