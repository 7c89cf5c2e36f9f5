// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::rc::Rc;

use crate::{
    error::{CoreError, CoreResult, SandboxFault},
    sandbox::lexer::{Lexed, Tok, lex},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug)]
pub enum TableItem {
    Positional(Expr),
    Named(String, Expr),
    Keyed(Expr, Expr),
}

#[derive(Debug)]
pub enum Expr {
    Nil,
    True,
    False,
    Num(f64),
    Str(String),
    Var(String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Func(Rc<FuncBody>),
    Table(Vec<TableItem>),
    Un(UnOp, Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug)]
pub enum LValue {
    Name(String),
    Index(Expr, Expr),
}

/// Iterator form of a generic `for`; only the two builtin iterators exist.
#[derive(Debug)]
pub enum ForIter {
    Pairs(Expr),
    Ipairs(Expr),
}

#[derive(Debug)]
pub struct FuncBody {
    pub params: Vec<String>,
    pub body: Block,
}

#[derive(Debug, Default)]
pub struct Block(pub Vec<Stmt>);

#[derive(Debug)]
pub enum Stmt {
    Local(Vec<String>, Vec<Expr>),
    Assign(LValue, Expr),
    ExprStat(Expr),
    If(Vec<(Expr, Block)>, Option<Block>),
    While(Expr, Block),
    NumericFor {
        var: String,
        from: Expr,
        to: Expr,
        step: Option<Expr>,
        body: Block,
    },
    GenericFor {
        key: String,
        value: Option<String>,
        iter: ForIter,
        body: Block,
    },
    Return(Option<Expr>),
    Break,
    FunctionDecl(String, Rc<FuncBody>),
    LocalFunction(String, Rc<FuncBody>),
}

pub fn parse(source: &str) -> CoreResult<Block> {
    let toks = lex(source)?;
    let mut p = Parser { toks, pos: 0 };
    let block = p.block()?;
    p.expect(&Tok::Eof)?;
    Ok(block)
}

struct Parser {
    toks: Vec<Lexed>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.pos].tok
    }

    fn peek2(&self) -> &Tok {
        let i = (self.pos + 1).min(self.toks.len() - 1);
        &self.toks[i].tok
    }

    fn line(&self) -> u32 {
        self.toks[self.pos].line
    }

    fn bump(&mut self) -> Tok {
        let t = self.toks[self.pos].tok.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok) -> CoreResult<()> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.err(format!("expected {tok:?}, found {:?}", self.peek())))
        }
    }

    fn err(&self, msg: impl Into<String>) -> CoreError {
        CoreError::sandbox(
            SandboxFault::Syntax,
            format!("line {}: {}", self.line(), msg.into()),
        )
    }

    fn name(&mut self) -> CoreResult<String> {
        match self.bump() {
            Tok::Name(n) => Ok(n),
            other => Err(self.err(format!("expected name, found {other:?}"))),
        }
    }

    fn block_ends(&self) -> bool {
        matches!(
            self.peek(),
            Tok::End | Tok::Else | Tok::Elseif | Tok::Eof
        )
    }

    fn block(&mut self) -> CoreResult<Block> {
        let mut stmts = Vec::new();
        while !self.block_ends() {
            if self.eat(&Tok::Semi) {
                continue;
            }
            stmts.push(self.statement()?);
        }
        Ok(Block(stmts))
    }

    fn statement(&mut self) -> CoreResult<Stmt> {
        match self.peek() {
            Tok::Local => {
                self.bump();
                if self.eat(&Tok::Function) {
                    let name = self.name()?;
                    let body = self.func_body()?;
                    return Ok(Stmt::LocalFunction(name, Rc::new(body)));
                }
                let mut names = vec![self.name()?];
                while self.eat(&Tok::Comma) {
                    names.push(self.name()?);
                }
                let mut exprs = Vec::new();
                if self.eat(&Tok::Eq) {
                    exprs.push(self.expr()?);
                    while self.eat(&Tok::Comma) {
                        exprs.push(self.expr()?);
                    }
                }
                Ok(Stmt::Local(names, exprs))
            },
            Tok::Function => {
                self.bump();
                let name = self.name()?;
                let body = self.func_body()?;
                Ok(Stmt::FunctionDecl(name, Rc::new(body)))
            },
            Tok::If => {
                self.bump();
                let mut arms = Vec::new();
                let cond = self.expr()?;
                self.expect(&Tok::Then)?;
                arms.push((cond, self.block()?));
                let mut otherwise = None;
                loop {
                    match self.peek() {
                        Tok::Elseif => {
                            self.bump();
                            let cond = self.expr()?;
                            self.expect(&Tok::Then)?;
                            arms.push((cond, self.block()?));
                        },
                        Tok::Else => {
                            self.bump();
                            otherwise = Some(self.block()?);
                            self.expect(&Tok::End)?;
                            break;
                        },
                        Tok::End => {
                            self.bump();
                            break;
                        },
                        _ => return Err(self.err("expected elseif/else/end")),
                    }
                }
                Ok(Stmt::If(arms, otherwise))
            },
            Tok::While => {
                self.bump();
                let cond = self.expr()?;
                self.expect(&Tok::Do)?;
                let body = self.block()?;
                self.expect(&Tok::End)?;
                Ok(Stmt::While(cond, body))
            },
            Tok::For => {
                self.bump();
                let first = self.name()?;
                if self.eat(&Tok::Eq) {
                    let from = self.expr()?;
                    self.expect(&Tok::Comma)?;
                    let to = self.expr()?;
                    let step = if self.eat(&Tok::Comma) {
                        Some(self.expr()?)
                    } else {
                        None
                    };
                    self.expect(&Tok::Do)?;
                    let body = self.block()?;
                    self.expect(&Tok::End)?;
                    return Ok(Stmt::NumericFor {
                        var: first,
                        from,
                        to,
                        step,
                        body,
                    });
                }
                let value = if self.eat(&Tok::Comma) {
                    Some(self.name()?)
                } else {
                    None
                };
                self.expect(&Tok::In)?;
                let iter_name = self.name()?;
                self.expect(&Tok::LParen)?;
                let source = self.expr()?;
                self.expect(&Tok::RParen)?;
                let iter = match iter_name.as_str() {
                    "pairs" => ForIter::Pairs(source),
                    "ipairs" => ForIter::Ipairs(source),
                    other => {
                        return Err(
                            self.err(format!("unsupported iterator {other}"))
                        );
                    },
                };
                self.expect(&Tok::Do)?;
                let body = self.block()?;
                self.expect(&Tok::End)?;
                Ok(Stmt::GenericFor {
                    key: first,
                    value,
                    iter,
                    body,
                })
            },
            Tok::Return => {
                self.bump();
                let value = if self.block_ends() || self.peek() == &Tok::Semi {
                    None
                } else {
                    Some(self.expr()?)
                };
                Ok(Stmt::Return(value))
            },
            Tok::Break => {
                self.bump();
                Ok(Stmt::Break)
            },
            Tok::Do => {
                // `do ... end` scoping block, expressed as a while-once.
                self.bump();
                let body = self.block()?;
                self.expect(&Tok::End)?;
                Ok(Stmt::If(vec![(Expr::True, body)], None))
            },
            _ => {
                let expr = self.suffixed_expr()?;
                if self.eat(&Tok::Eq) {
                    let lvalue = match expr {
                        Expr::Var(name) => LValue::Name(name),
                        Expr::Index(base, key) => LValue::Index(*base, *key),
                        _ => return Err(self.err("cannot assign to this expression")),
                    };
                    let value = self.expr()?;
                    return Ok(Stmt::Assign(lvalue, value));
                }
                match expr {
                    Expr::Call(..) => Ok(Stmt::ExprStat(expr)),
                    _ => Err(self.err("expected statement")),
                }
            },
        }
    }

    fn func_body(&mut self) -> CoreResult<FuncBody> {
        self.expect(&Tok::LParen)?;
        let mut params = Vec::new();
        if self.peek() != &Tok::RParen {
            params.push(self.name()?);
            while self.eat(&Tok::Comma) {
                params.push(self.name()?);
            }
        }
        self.expect(&Tok::RParen)?;
        let body = self.block()?;
        self.expect(&Tok::End)?;
        Ok(FuncBody { params, body })
    }

    // ────────────────────────────────────────────────────────────────────
    // Expressions, lowest precedence first

    fn expr(&mut self) -> CoreResult<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> CoreResult<Expr> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Tok::Or) {
            let rhs = self.and_expr()?;
            lhs = Expr::Bin(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> CoreResult<Expr> {
        let mut lhs = self.cmp_expr()?;
        while self.eat(&Tok::And) {
            let rhs = self.cmp_expr()?;
            lhs = Expr::Bin(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> CoreResult<Expr> {
        let mut lhs = self.concat_expr()?;
        loop {
            let op = match self.peek() {
                Tok::EqEq => BinOp::Eq,
                Tok::NotEq => BinOp::Ne,
                Tok::Lt => BinOp::Lt,
                Tok::Le => BinOp::Le,
                Tok::Gt => BinOp::Gt,
                Tok::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.concat_expr()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn concat_expr(&mut self) -> CoreResult<Expr> {
        let lhs = self.add_expr()?;
        if self.eat(&Tok::DotDot) {
            // Right associative.
            let rhs = self.concat_expr()?;
            return Ok(Expr::Bin(BinOp::Concat, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn add_expr(&mut self) -> CoreResult<Expr> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.mul_expr()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn mul_expr(&mut self) -> CoreResult<Expr> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.unary_expr()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary_expr(&mut self) -> CoreResult<Expr> {
        let op = match self.peek() {
            Tok::Minus => Some(UnOp::Neg),
            Tok::Not => Some(UnOp::Not),
            Tok::Hash => Some(UnOp::Len),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let operand = self.unary_expr()?;
            return Ok(Expr::Un(op, Box::new(operand)));
        }
        self.suffixed_expr()
    }

    fn suffixed_expr(&mut self) -> CoreResult<Expr> {
        let mut expr = self.primary_expr()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.bump();
                    let field = self.name()?;
                    expr =
                        Expr::Index(Box::new(expr), Box::new(Expr::Str(field)));
                },
                Tok::LBracket => {
                    self.bump();
                    let key = self.expr()?;
                    self.expect(&Tok::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(key));
                },
                Tok::LParen => {
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek() != &Tok::RParen {
                        args.push(self.expr()?);
                        while self.eat(&Tok::Comma) {
                            args.push(self.expr()?);
                        }
                    }
                    self.expect(&Tok::RParen)?;
                    expr = Expr::Call(Box::new(expr), args);
                },
                _ => return Ok(expr),
            }
        }
    }

    fn primary_expr(&mut self) -> CoreResult<Expr> {
        match self.bump() {
            Tok::Nil => Ok(Expr::Nil),
            Tok::True => Ok(Expr::True),
            Tok::False => Ok(Expr::False),
            Tok::Num(n) => Ok(Expr::Num(n)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::Name(n) => Ok(Expr::Var(n)),
            Tok::LParen => {
                let inner = self.expr()?;
                self.expect(&Tok::RParen)?;
                Ok(inner)
            },
            Tok::Function => Ok(Expr::Func(Rc::new(self.func_body()?))),
            Tok::LBrace => self.table_expr(),
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }

    fn table_expr(&mut self) -> CoreResult<Expr> {
        let mut items = Vec::new();
        loop {
            if self.eat(&Tok::RBrace) {
                return Ok(Expr::Table(items));
            }
            match (self.peek().clone(), self.peek2().clone()) {
                (Tok::Name(name), Tok::Eq) => {
                    self.bump();
                    self.bump();
                    items.push(TableItem::Named(name, self.expr()?));
                },
                (Tok::LBracket, _) => {
                    self.bump();
                    let key = self.expr()?;
                    self.expect(&Tok::RBracket)?;
                    self.expect(&Tok::Eq)?;
                    items.push(TableItem::Keyed(key, self.expr()?));
                },
                _ => items.push(TableItem::Positional(self.expr()?)),
            }
            if !self.eat(&Tok::Comma) && !self.eat(&Tok::Semi) {
                self.expect(&Tok::RBrace)?;
                return Ok(Expr::Table(items));
            }
        }
    }
}
