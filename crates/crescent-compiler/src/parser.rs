//! Recursive-descent parser producing the AST of a chunk.
//!
//! Statements are parsed by straightforward descent; expressions use
//! precedence climbing over the `BinOp::priority` table. Structural
//! checks that need no register knowledge happen here: `break` outside a
//! loop, duplicate labels, unresolved gotos, `...` outside a vararg
//! function.

use crate::ast::*;
use crate::lexer::{LexError, Lexer};
use crate::token::Token;
use crescent_core::string::{StringId, StringInterner};
use std::fmt;

/// Parser error with the line it happened on.
#[derive(Clone, Debug, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        ParseError {
            message: e.message,
            line: e.line,
        }
    }
}

/// Per-function parsing context for vararg and loop-depth checks.
struct FuncCtx {
    is_vararg: bool,
    loop_depth: usize,
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    func_stack: Vec<FuncCtx>,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a [u8], strings: StringInterner) -> Self {
        Parser {
            lexer: Lexer::with_strings(source, strings),
            func_stack: Vec::new(),
        }
    }

    pub fn into_strings(self) -> StringInterner {
        self.lexer.strings
    }

    /// Parse a whole chunk. The main chunk is implicitly vararg.
    pub fn parse_chunk(&mut self) -> Result<Block, ParseError> {
        self.func_stack.push(FuncCtx {
            is_vararg: true,
            loop_depth: 0,
        });
        let block = self.parse_block()?;
        self.expect(&Token::Eof)?;
        self.check_labels(&block)?;
        self.func_stack.pop();
        Ok(block)
    }

    // ---- Token plumbing ----

    fn line(&self) -> u32 {
        self.lexer
            .current()
            .map(|st| st.line)
            .unwrap_or_else(|e| e.line)
    }

    fn error(&self, msg: impl Into<String>) -> ParseError {
        ParseError {
            message: msg.into(),
            line: self.line(),
        }
    }

    fn current(&self) -> Result<&Token, ParseError> {
        self.lexer
            .current()
            .map(|st| &st.token)
            .map_err(|e| ParseError {
                message: e.message.clone(),
                line: e.line,
            })
    }

    fn advance(&mut self) -> Result<Token, ParseError> {
        Ok(self.lexer.advance()?.token)
    }

    fn check(&self, expected: &Token) -> bool {
        self.current().map(|t| t == expected).unwrap_or(false)
    }

    fn test_next(&mut self, expected: &Token) -> Result<bool, ParseError> {
        if self.check(expected) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ParseError> {
        if self.check(expected) {
            self.advance()?;
            Ok(())
        } else {
            let found = self
                .current()
                .map(|t| format!("{t}"))
                .unwrap_or_else(|e| e.message);
            Err(self.error(format!("'{expected}' expected, got '{found}'")))
        }
    }

    fn expect_name(&mut self) -> Result<StringId, ParseError> {
        match self.current()?.clone() {
            Token::Name(id) => {
                self.advance()?;
                Ok(id)
            }
            other => Err(self.error(format!("<name> expected, got '{other}'"))),
        }
    }

    // ---- Blocks & statements ----

    fn block_follows(&self) -> bool {
        matches!(
            self.current(),
            Ok(Token::End)
                | Ok(Token::Else)
                | Ok(Token::ElseIf)
                | Ok(Token::Until)
                | Ok(Token::Eof)
        )
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        let line = self.line();
        let mut stmts = Vec::new();
        let mut ret = None;
        loop {
            if self.block_follows() {
                break;
            }
            if self.check(&Token::Return) {
                ret = Some(self.parse_return()?);
                break;
            }
            if let Some(stmt) = self.parse_statement()? {
                stmts.push(stmt);
            }
        }
        Ok(Block { stmts, ret, line })
    }

    fn parse_return(&mut self) -> Result<ReturnStmt, ParseError> {
        let line = self.line();
        self.expect(&Token::Return)?;
        let mut values = Vec::new();
        if !self.block_follows() && !self.check(&Token::Semi) {
            values = self.parse_exprlist()?;
        }
        self.test_next(&Token::Semi)?;
        Ok(ReturnStmt { values, line })
    }

    /// Parse one statement; None for a bare `;`.
    fn parse_statement(&mut self) -> Result<Option<Stmt>, ParseError> {
        let line = self.line();
        match self.current()?.clone() {
            Token::Semi => {
                self.advance()?;
                Ok(None)
            }
            Token::If => self.parse_if().map(Some),
            Token::While => self.parse_while().map(Some),
            Token::Do => {
                self.advance()?;
                let body = self.parse_block()?;
                self.expect(&Token::End)?;
                Ok(Some(Stmt::Do(body)))
            }
            Token::For => self.parse_for().map(Some),
            Token::Repeat => self.parse_repeat().map(Some),
            Token::Function => self.parse_function_stmt().map(Some),
            Token::Local => self.parse_local().map(Some),
            Token::Return => unreachable!("return handled by parse_block"),
            Token::Break => {
                self.advance()?;
                if self.func_stack.last().map_or(0, |f| f.loop_depth) == 0 {
                    return Err(ParseError {
                        message: "break outside a loop".to_string(),
                        line,
                    });
                }
                Ok(Some(Stmt::Break(line)))
            }
            Token::Goto => {
                self.advance()?;
                let label = self.expect_name()?;
                Ok(Some(Stmt::Goto { label, line }))
            }
            Token::DoubleColon => {
                self.advance()?;
                let name = self.expect_name()?;
                self.expect(&Token::DoubleColon)?;
                Ok(Some(Stmt::Label { name, line }))
            }
            _ => self.parse_expr_statement().map(Some),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect(&Token::If)?;
        let cond = self.parse_expression()?;
        self.expect(&Token::Then)?;
        let then_block = self.parse_block()?;
        let mut elseifs = Vec::new();
        let mut else_block = None;
        loop {
            match self.current()?.clone() {
                Token::ElseIf => {
                    self.advance()?;
                    let c = self.parse_expression()?;
                    self.expect(&Token::Then)?;
                    let b = self.parse_block()?;
                    elseifs.push((c, b));
                }
                Token::Else => {
                    self.advance()?;
                    else_block = Some(self.parse_block()?);
                    self.expect(&Token::End)?;
                    break;
                }
                Token::End => {
                    self.advance()?;
                    break;
                }
                other => return Err(self.error(format!("'end' expected, got '{other}'"))),
            }
        }
        Ok(Stmt::If {
            cond,
            then_block,
            elseifs,
            else_block,
            line,
        })
    }

    fn enter_loop(&mut self) {
        self.func_stack.last_mut().unwrap().loop_depth += 1;
    }

    fn leave_loop(&mut self) {
        self.func_stack.last_mut().unwrap().loop_depth -= 1;
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect(&Token::While)?;
        let cond = self.parse_expression()?;
        self.expect(&Token::Do)?;
        self.enter_loop();
        let body = self.parse_block()?;
        self.leave_loop();
        self.expect(&Token::End)?;
        Ok(Stmt::While { cond, body, line })
    }

    fn parse_repeat(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect(&Token::Repeat)?;
        self.enter_loop();
        let body = self.parse_block()?;
        self.expect(&Token::Until)?;
        // The until condition is inside the loop scope.
        let cond = self.parse_expression()?;
        self.leave_loop();
        Ok(Stmt::Repeat { body, cond, line })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect(&Token::For)?;
        let first = self.expect_name()?;
        if self.test_next(&Token::Assign)? {
            let start = self.parse_expression()?;
            self.expect(&Token::Comma)?;
            let limit = self.parse_expression()?;
            let step = if self.test_next(&Token::Comma)? {
                Some(self.parse_expression()?)
            } else {
                None
            };
            self.expect(&Token::Do)?;
            self.enter_loop();
            let body = self.parse_block()?;
            self.leave_loop();
            self.expect(&Token::End)?;
            Ok(Stmt::NumericFor {
                var: first,
                start,
                limit,
                step,
                body,
                line,
            })
        } else {
            let mut vars = vec![first];
            while self.test_next(&Token::Comma)? {
                vars.push(self.expect_name()?);
            }
            self.expect(&Token::In)?;
            let exprs = self.parse_exprlist()?;
            self.expect(&Token::Do)?;
            self.enter_loop();
            let body = self.parse_block()?;
            self.leave_loop();
            self.expect(&Token::End)?;
            Ok(Stmt::GenericFor {
                vars,
                exprs,
                body,
                line,
            })
        }
    }

    fn parse_function_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect(&Token::Function)?;
        let mut parts = vec![self.expect_name()?];
        let mut method = None;
        loop {
            if self.test_next(&Token::Dot)? {
                parts.push(self.expect_name()?);
            } else if self.test_next(&Token::Colon)? {
                method = Some(self.expect_name()?);
                break;
            } else {
                break;
            }
        }
        let body = self.parse_func_body(method.is_some())?;
        Ok(Stmt::FunctionDecl {
            name: FuncName { parts, method },
            body,
            line,
        })
    }

    fn parse_local(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        self.expect(&Token::Local)?;
        if self.test_next(&Token::Function)? {
            let name = self.expect_name()?;
            let body = self.parse_func_body(false)?;
            return Ok(Stmt::LocalFunction { name, body, line });
        }
        let mut names = vec![self.expect_name()?];
        while self.test_next(&Token::Comma)? {
            names.push(self.expect_name()?);
        }
        let values = if self.test_next(&Token::Assign)? {
            self.parse_exprlist()?
        } else {
            Vec::new()
        };
        Ok(Stmt::Local {
            names,
            values,
            line,
        })
    }

    /// Expression statement: either a call or an assignment.
    fn parse_expr_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.line();
        let first = self.parse_suffixed_expression()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.test_next(&Token::Comma)? {
                targets.push(self.parse_suffixed_expression()?);
            }
            for t in &targets {
                if !matches!(t, Expr::Name(..) | Expr::Index { .. }) {
                    return Err(ParseError {
                        message: "cannot assign to this expression".to_string(),
                        line: t.line(),
                    });
                }
            }
            self.expect(&Token::Assign)?;
            let values = self.parse_exprlist()?;
            return Ok(Stmt::Assign {
                targets,
                values,
                line,
            });
        }
        match first {
            Expr::Call { .. } | Expr::MethodCall { .. } => Ok(Stmt::Call(first)),
            _ => Err(ParseError {
                message: "syntax error near unexpected expression (calls and assignments only)"
                    .to_string(),
                line,
            }),
        }
    }

    // ---- Expressions ----

    fn parse_exprlist(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut exprs = vec![self.parse_expression()?];
        while self.test_next(&Token::Comma)? {
            exprs.push(self.parse_expression()?);
        }
        Ok(exprs)
    }

    pub(crate) fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_sub_expression(0)
    }

    /// Precedence climbing.
    fn parse_sub_expression(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let line = self.line();
        let mut lhs = if let Some(unop) = self.check_unary_op() {
            self.advance()?;
            let operand = self.parse_sub_expression(UNARY_PRIORITY)?;
            Expr::UnOp {
                op: unop,
                operand: Box::new(operand),
                line,
            }
        } else {
            self.parse_simple_expression()?
        };

        while let Some(binop) = self.check_binary_op() {
            let (left_prec, right_prec) = binop.priority();
            if left_prec <= min_prec {
                break;
            }
            let op_line = self.line();
            self.advance()?;
            let rhs = self.parse_sub_expression(right_prec)?;
            lhs = Expr::BinOp {
                op: binop,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line: op_line,
            };
        }
        Ok(lhs)
    }

    fn check_unary_op(&self) -> Option<UnOp> {
        match self.current() {
            Ok(Token::Minus) => Some(UnOp::Neg),
            Ok(Token::Not) => Some(UnOp::Not),
            Ok(Token::Hash) => Some(UnOp::Len),
            Ok(Token::Tilde) => Some(UnOp::BNot),
            _ => None,
        }
    }

    fn check_binary_op(&self) -> Option<BinOp> {
        match self.current() {
            Ok(Token::Plus) => Some(BinOp::Add),
            Ok(Token::Minus) => Some(BinOp::Sub),
            Ok(Token::Star) => Some(BinOp::Mul),
            Ok(Token::Slash) => Some(BinOp::Div),
            Ok(Token::FloorDiv) => Some(BinOp::IDiv),
            Ok(Token::Percent) => Some(BinOp::Mod),
            Ok(Token::Caret) => Some(BinOp::Pow),
            Ok(Token::DotDot) => Some(BinOp::Concat),
            Ok(Token::Ampersand) => Some(BinOp::BAnd),
            Ok(Token::Pipe) => Some(BinOp::BOr),
            Ok(Token::Tilde) => Some(BinOp::BXor),
            Ok(Token::ShiftLeft) => Some(BinOp::Shl),
            Ok(Token::ShiftRight) => Some(BinOp::Shr),
            Ok(Token::Equal) => Some(BinOp::Eq),
            Ok(Token::NotEqual) => Some(BinOp::NotEq),
            Ok(Token::Less) => Some(BinOp::Lt),
            Ok(Token::LessEq) => Some(BinOp::LtEq),
            Ok(Token::Greater) => Some(BinOp::Gt),
            Ok(Token::GreaterEq) => Some(BinOp::GtEq),
            Ok(Token::And) => Some(BinOp::And),
            Ok(Token::Or) => Some(BinOp::Or),
            _ => None,
        }
    }

    fn parse_simple_expression(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        match self.current()?.clone() {
            Token::Nil => {
                self.advance()?;
                Ok(Expr::Nil(line))
            }
            Token::True => {
                self.advance()?;
                Ok(Expr::True(line))
            }
            Token::False => {
                self.advance()?;
                Ok(Expr::False(line))
            }
            Token::Integer(i) => {
                self.advance()?;
                Ok(Expr::Integer(i, line))
            }
            Token::Float(f) => {
                self.advance()?;
                Ok(Expr::Float(f, line))
            }
            Token::Str(id) => {
                self.advance()?;
                Ok(Expr::Str(id, line))
            }
            Token::DotDotDot => {
                self.advance()?;
                if !self.func_stack.last().map_or(false, |f| f.is_vararg) {
                    return Err(ParseError {
                        message: "cannot use '...' outside a vararg function".to_string(),
                        line,
                    });
                }
                Ok(Expr::Vararg(line))
            }
            Token::Function => {
                self.advance()?;
                let body = self.parse_func_body(false)?;
                Ok(Expr::Function(body))
            }
            Token::LBrace => self.parse_table_constructor(),
            _ => self.parse_suffixed_expression(),
        }
    }

    /// primary expression (name or parenthesized) plus any number of
    /// `.name`, `[k]`, `:m(args)`, and call suffixes.
    fn parse_suffixed_expression(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        let mut expr = match self.current()?.clone() {
            Token::Name(id) => {
                self.advance()?;
                Expr::Name(id, line)
            }
            Token::LParen => {
                self.advance()?;
                let inner = self.parse_expression()?;
                self.expect(&Token::RParen)?;
                Expr::Paren(Box::new(inner))
            }
            other => return Err(self.error(format!("unexpected symbol near '{other}'"))),
        };

        loop {
            let line = self.line();
            match self.current()? {
                Token::Dot => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(Expr::Str(name, line)),
                        line,
                    };
                }
                Token::LBracket => {
                    self.advance()?;
                    let key = self.parse_expression()?;
                    self.expect(&Token::RBracket)?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        key: Box::new(key),
                        line,
                    };
                }
                Token::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let args = self.parse_call_args()?;
                    expr = Expr::MethodCall {
                        obj: Box::new(expr),
                        method,
                        args,
                        line,
                    };
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    let args = self.parse_call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let line = self.line();
        match self.current()?.clone() {
            Token::LParen => {
                self.advance()?;
                let args = if self.check(&Token::RParen) {
                    Vec::new()
                } else {
                    self.parse_exprlist()?
                };
                self.expect(&Token::RParen)?;
                Ok(args)
            }
            Token::Str(id) => {
                self.advance()?;
                Ok(vec![Expr::Str(id, line)])
            }
            Token::LBrace => Ok(vec![self.parse_table_constructor()?]),
            other => Err(self.error(format!("function arguments expected, got '{other}'"))),
        }
    }

    fn parse_table_constructor(&mut self) -> Result<Expr, ParseError> {
        let line = self.line();
        self.expect(&Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            match self.current()?.clone() {
                Token::LBracket => {
                    self.advance()?;
                    let key = self.parse_expression()?;
                    self.expect(&Token::RBracket)?;
                    self.expect(&Token::Assign)?;
                    let value = self.parse_expression()?;
                    fields.push(Field::Keyed(key, value));
                }
                Token::Name(id) if self.peek_is_assign() => {
                    self.advance()?;
                    self.advance()?; // '='
                    let value = self.parse_expression()?;
                    fields.push(Field::Named(id, value));
                }
                _ => {
                    fields.push(Field::Positional(self.parse_expression()?));
                }
            }
            if !self.test_next(&Token::Comma)? && !self.test_next(&Token::Semi)? {
                break;
            }
        }
        self.expect(&Token::RBrace)?;
        Ok(Expr::Table { fields, line })
    }

    /// Is the token after the current one `=`? Used to disambiguate
    /// `{ name = v }` from `{ name }`. The lexer has one token of
    /// lookahead, so this clones it and peeks through a scratch parse.
    fn peek_is_assign(&self) -> bool {
        // The current token is a Name; look at the raw source after it.
        // A table key `name = v` must be followed by '=' but not '=='.
        self.lexer.peek_after_current_is_assign()
    }

    fn parse_func_body(&mut self, is_method: bool) -> Result<FuncBody, ParseError> {
        let line = self.line();
        self.expect(&Token::LParen)?;
        let mut params = Vec::new();
        if is_method {
            params.push(self.lexer.strings.intern(b"self"));
        }
        let mut is_vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                match self.current()?.clone() {
                    Token::Name(id) => {
                        self.advance()?;
                        params.push(id);
                    }
                    Token::DotDotDot => {
                        self.advance()?;
                        is_vararg = true;
                        break;
                    }
                    other => {
                        return Err(self.error(format!("<name> or '...' expected, got '{other}'")))
                    }
                }
                if !self.test_next(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(&Token::RParen)?;

        self.func_stack.push(FuncCtx {
            is_vararg,
            loop_depth: 0,
        });
        let body = self.parse_block()?;
        let end_line = self.line();
        self.expect(&Token::End)?;
        let block = Block {
            stmts: body.stmts,
            ret: body.ret,
            line: body.line,
        };
        self.check_labels(&block)?;
        self.func_stack.pop();

        Ok(FuncBody {
            params,
            is_vararg,
            body: block,
            line,
            end_line,
        })
    }

    // ---- Label/goto structural checks ----

    /// Verify, per function: no duplicate labels in the same block, and
    /// every goto names a label visible in its block or an enclosing one.
    /// (Scope-entry checks need register knowledge and live in codegen.)
    fn check_labels(&self, block: &Block) -> Result<(), ParseError> {
        self.check_labels_in(block, &mut Vec::new())
    }

    fn check_labels_in(
        &self,
        block: &Block,
        visible: &mut Vec<Vec<StringId>>,
    ) -> Result<(), ParseError> {
        let mut own: Vec<StringId> = Vec::new();
        for stmt in &block.stmts {
            if let Stmt::Label { name, line } = stmt {
                if own.contains(name) {
                    return Err(ParseError {
                        message: "label already defined in this block".to_string(),
                        line: *line,
                    });
                }
                own.push(*name);
            }
        }
        visible.push(own);
        for stmt in &block.stmts {
            match stmt {
                Stmt::Goto { label, line } => {
                    if !visible.iter().any(|scope| scope.contains(label)) {
                        return Err(ParseError {
                            message: "no visible label for goto".to_string(),
                            line: *line,
                        });
                    }
                }
                Stmt::Do(b) => self.check_labels_in(b, visible)?,
                Stmt::While { body, .. }
                | Stmt::Repeat { body, .. }
                | Stmt::NumericFor { body, .. }
                | Stmt::GenericFor { body, .. } => self.check_labels_in(body, visible)?,
                Stmt::If {
                    then_block,
                    elseifs,
                    else_block,
                    ..
                } => {
                    self.check_labels_in(then_block, visible)?;
                    for (_, b) in elseifs {
                        self.check_labels_in(b, visible)?;
                    }
                    if let Some(b) = else_block {
                        self.check_labels_in(b, visible)?;
                    }
                }
                // Nested function bodies are checked when they are parsed.
                _ => {}
            }
        }
        visible.pop();
        Ok(())
    }
}
