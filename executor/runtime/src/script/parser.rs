use super::lexer::{Spanned, Token};
use super::{BinOp, Expr, FnDef, Program, ScriptError, Stmt, Target, UnOp};

pub fn parse(tokens: &[Spanned]) -> Result<Program, ScriptError> {
    let mut parser = Parser { tokens, pos: 0 };
    let mut functions: Vec<FnDef> = Vec::new();
    while parser.peek().is_some() {
        let def = parser.fn_def()?;
        if functions.iter().any(|f| f.name == def.name) {
            return Err(ScriptError::parse(
                parser.line(),
                format!("duplicate function '{}'", def.name),
            ));
        }
        functions.push(def);
    }
    Ok(Program { functions })
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos).map(|s| &s.token);
        self.pos += 1;
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ScriptError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(&token.describe()))
        }
    }

    fn unexpected(&self, wanted: &str) -> ScriptError {
        let got = match self.peek() {
            Some(t) => t.describe(),
            None => "end of input".to_string(),
        };
        ScriptError::parse(self.line(), format!("expected {wanted}, found {got}"))
    }

    fn ident(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected("an identifier")),
        }
    }

    // --- declarations

    fn fn_def(&mut self) -> Result<FnDef, ScriptError> {
        self.expect(Token::Fn)?;
        let name = self.ident()?;
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                params.push(self.ident()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma)?;
            }
        }
        let body = self.block()?;
        Ok(FnDef { name, params, body })
    }

    // --- statements

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(Token::LBrace)?;
        let mut stmts = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.peek().is_none() {
                return Err(self.unexpected("'}'"));
            }
            stmts.push(self.stmt()?);
        }
        Ok(stmts)
    }

    fn stmt(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek() {
            Some(Token::Let) => {
                self.pos += 1;
                let name = self.ident()?;
                self.expect(Token::Assign)?;
                let value = self.expr()?;
                self.expect(Token::Semi)?;
                Ok(Stmt::Let(name, value))
            }
            Some(Token::Return) => {
                self.pos += 1;
                if self.eat(&Token::Semi) {
                    return Ok(Stmt::Return(None));
                }
                let value = self.expr()?;
                self.expect(Token::Semi)?;
                Ok(Stmt::Return(Some(value)))
            }
            Some(Token::If) => self.if_stmt(),
            Some(Token::While) => {
                self.pos += 1;
                let cond = self.expr()?;
                let body = self.block()?;
                Ok(Stmt::While { cond, body })
            }
            _ => {
                let expr = self.expr()?;
                if self.eat(&Token::Assign) {
                    let target = self.target(expr)?;
                    let value = self.expr()?;
                    self.expect(Token::Semi)?;
                    Ok(Stmt::Assign(target, value))
                } else {
                    self.expect(Token::Semi)?;
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    fn if_stmt(&mut self) -> Result<Stmt, ScriptError> {
        self.expect(Token::If)?;
        let cond = self.expr()?;
        let then = self.block()?;
        let otherwise = if self.eat(&Token::Else) {
            if self.peek() == Some(&Token::If) {
                vec![self.if_stmt()?]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            cond,
            then,
            otherwise,
        })
    }

    fn target(&mut self, expr: Expr) -> Result<Target, ScriptError> {
        match expr {
            Expr::Var(name) => Ok(Target::Var(name)),
            Expr::Index(base, key) => Ok(Target::Index(base, key)),
            _ => Err(ScriptError::parse(
                self.line(),
                "invalid assignment target",
            )),
        }
    }

    // --- expressions, by precedence

    fn expr(&mut self) -> Result<Expr, ScriptError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::OrOr) {
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.equality()?;
        while self.eat(&Token::AndAnd) {
            let rhs = self.equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Token::Minus) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnOp::Neg, Box::new(inner)));
        }
        if self.eat(&Token::Bang) {
            let inner = self.unary()?;
            return Ok(Expr::Unary(UnOp::Not, Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::LParen) {
                let args = self.call_args()?;
                expr = Expr::Call(Box::new(expr), args);
            } else if self.eat(&Token::LBracket) {
                let key = self.expr()?;
                self.expect(Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(key));
            } else if self.eat(&Token::Dot) {
                let name = self.ident()?;
                self.expect(Token::LParen)?;
                let args = self.call_args()?;
                expr = Expr::Method(Box::new(expr), name, args);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    /// Arguments after a consumed '(' up to and including the ')'.
    fn call_args(&mut self) -> Result<Vec<Expr>, ScriptError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&Token::RParen) {
                break;
            }
            self.expect(Token::Comma)?;
        }
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        match self.peek() {
            Some(Token::Null) => {
                self.pos += 1;
                Ok(Expr::Null)
            }
            Some(Token::True) => {
                self.pos += 1;
                Ok(Expr::Bool(true))
            }
            Some(Token::False) => {
                self.pos += 1;
                Ok(Expr::Bool(false))
            }
            Some(Token::Int(i)) => {
                let i = *i;
                self.pos += 1;
                Ok(Expr::Int(i))
            }
            Some(Token::Float(f)) => {
                let f = *f;
                self.pos += 1;
                Ok(Expr::Float(f))
            }
            Some(Token::Str(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(Expr::Str(s))
            }
            Some(Token::Ident(_)) => Ok(Expr::Var(self.ident()?)),
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.pos += 1;
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Token::LBrace) => {
                self.pos += 1;
                let mut entries = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        let key = match self.peek() {
                            Some(Token::Str(s)) => {
                                let s = s.clone();
                                self.pos += 1;
                                s
                            }
                            _ => return Err(self.unexpected("a string key")),
                        };
                        self.expect(Token::Colon)?;
                        let value = self.expr()?;
                        entries.push((key, value));
                        if self.eat(&Token::RBrace) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::Map(entries))
            }
            _ => Err(self.unexpected("an expression")),
        }
    }
}
