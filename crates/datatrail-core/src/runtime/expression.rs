// crates/datatrail-core/src/runtime/expression.rs
// ============================================================================
// Module: Datatrail Gate Expressions
// Description: Safe pre-compiled evaluator for gate condition expressions.
// Purpose: Evaluate whitelisted row predicates without host eval facilities.
// Dependencies: serde_json, thiserror
// ============================================================================

//! ## Overview
//! Gate conditions are written in a small Python-like expression language
//! restricted to literals, `row["field"]` / `row.get("field"[, default])`
//! access, comparisons, boolean logic, arithmetic, membership, and the
//! ternary form. Everything else is rejected at compile time: unknown
//! identifiers, attribute access, function calls, comprehensions, lambdas,
//! assignment expressions, f-strings, and spread syntax. Evaluation is pure
//! and never touches host I/O.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde_json::Map;
use serde_json::Number;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Compile-time expression rejections.
#[derive(Debug, Error)]
pub enum ExpressionError {
    /// The expression is not well-formed.
    #[error("expression syntax error: {0}")]
    Syntax(String),
    /// The expression uses a forbidden construct.
    #[error("expression security error: {0}")]
    Security(String),
}

/// Runtime evaluation failures.
#[derive(Debug, Error)]
pub enum EvalError {
    /// `row["field"]` referenced a field that is not present.
    #[error("row has no field '{0}'")]
    MissingField(String),
    /// Operand types do not support the requested operation.
    #[error("type error: {0}")]
    Type(String),
    /// Division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,
}

// ============================================================================
// SECTION: Tokens
// ============================================================================

/// Lexical token.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Identifier or keyword.
    Ident(String),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal.
    Str(String),
    /// Punctuation or operator.
    Op(&'static str),
}

/// Splits an expression into tokens, rejecting forbidden lexemes.
fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut index = 0;
    while index < chars.len() {
        let character = chars[index];
        if character.is_whitespace() {
            index += 1;
            continue;
        }
        if character.is_ascii_alphabetic() || character == '_' {
            let start = index;
            while index < chars.len() && (chars[index].is_ascii_alphanumeric() || chars[index] == '_')
            {
                index += 1;
            }
            let word: String = chars[start..index].iter().collect();
            // A string prefix such as f"..." or rb'...' is an f-string or
            // bytes literal, both forbidden.
            if index < chars.len() && (chars[index] == '"' || chars[index] == '\'') {
                return Err(ExpressionError::Security(format!(
                    "string prefix '{word}' is not allowed"
                )));
            }
            tokens.push(Token::Ident(word));
            continue;
        }
        if character.is_ascii_digit()
            || (character == '.' && chars.get(index + 1).is_some_and(char::is_ascii_digit))
        {
            let start = index;
            let mut is_float = false;
            while index < chars.len() && chars[index].is_ascii_digit() {
                index += 1;
            }
            if index < chars.len() && chars[index] == '.' {
                is_float = true;
                index += 1;
                while index < chars.len() && chars[index].is_ascii_digit() {
                    index += 1;
                }
            }
            if index < chars.len() && (chars[index] == 'e' || chars[index] == 'E') {
                is_float = true;
                index += 1;
                if index < chars.len() && (chars[index] == '+' || chars[index] == '-') {
                    index += 1;
                }
                while index < chars.len() && chars[index].is_ascii_digit() {
                    index += 1;
                }
            }
            let text: String = chars[start..index].iter().collect();
            if is_float {
                let value = text
                    .parse::<f64>()
                    .map_err(|err| ExpressionError::Syntax(format!("bad float '{text}': {err}")))?;
                tokens.push(Token::Float(value));
            } else {
                let value = text
                    .parse::<i64>()
                    .map_err(|err| ExpressionError::Syntax(format!("bad int '{text}': {err}")))?;
                tokens.push(Token::Int(value));
            }
            continue;
        }
        if character == '"' || character == '\'' {
            let quote = character;
            index += 1;
            let mut literal = String::new();
            let mut closed = false;
            while index < chars.len() {
                let inner = chars[index];
                if inner == '\\' {
                    index += 1;
                    match chars.get(index) {
                        Some('n') => literal.push('\n'),
                        Some('t') => literal.push('\t'),
                        Some('\\') => literal.push('\\'),
                        Some('\'') => literal.push('\''),
                        Some('"') => literal.push('"'),
                        Some(other) => {
                            literal.push('\\');
                            literal.push(*other);
                        }
                        None => {
                            return Err(ExpressionError::Syntax(
                                "unterminated escape in string literal".to_string(),
                            ));
                        }
                    }
                    index += 1;
                    continue;
                }
                if inner == quote {
                    closed = true;
                    index += 1;
                    break;
                }
                literal.push(inner);
                index += 1;
            }
            if !closed {
                return Err(ExpressionError::Syntax("unterminated string literal".to_string()));
            }
            tokens.push(Token::Str(literal));
            continue;
        }
        let two: String = chars[index..chars.len().min(index + 2)].iter().collect();
        let matched_two = match two.as_str() {
            "==" | "!=" | "<=" | ">=" | "//" => {
                index += 2;
                Some(match two.as_str() {
                    "==" => "==",
                    "!=" => "!=",
                    "<=" => "<=",
                    ">=" => ">=",
                    _ => "//",
                })
            }
            ":=" => {
                return Err(ExpressionError::Security(
                    "assignment expressions are not allowed".to_string(),
                ));
            }
            "**" => {
                return Err(ExpressionError::Security(
                    "double-star syntax is not allowed".to_string(),
                ));
            }
            _ => None,
        };
        if let Some(op) = matched_two {
            tokens.push(Token::Op(op));
            continue;
        }
        let single = match character {
            '(' => "(",
            ')' => ")",
            '[' => "[",
            ']' => "]",
            '{' => "{",
            '}' => "}",
            ',' => ",",
            ':' => ":",
            '.' => ".",
            '+' => "+",
            '-' => "-",
            '*' => "*",
            '/' => "/",
            '%' => "%",
            '<' => "<",
            '>' => ">",
            '=' => {
                return Err(ExpressionError::Syntax(
                    "single '=' is not a valid operator".to_string(),
                ));
            }
            '@' | '&' | '|' | '^' | '~' | ';' | '#' | '\\' | '`' | '!' | '$' | '?' => {
                return Err(ExpressionError::Security(format!(
                    "character '{character}' is not allowed"
                )));
            }
            other => {
                return Err(ExpressionError::Syntax(format!("unexpected character '{other}'")));
            }
        };
        tokens.push(Token::Op(single));
        index += 1;
    }
    Ok(tokens)
}

// ============================================================================
// SECTION: Abstract Syntax
// ============================================================================

/// Comparison operators, including membership and identity-with-None.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    /// Equality.
    Eq,
    /// Inequality.
    NotEq,
    /// Less than.
    Lt,
    /// Less than or equal.
    LtE,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    GtE,
    /// Membership.
    In,
    /// Negated membership.
    NotIn,
    /// Identity (None checks only).
    Is,
    /// Negated identity (None checks only).
    IsNot,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    /// Addition or concatenation.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// True division.
    Div,
    /// Floor division.
    FloorDiv,
    /// Modulo.
    Mod,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    /// Literal value.
    Literal(Value),
    /// `row["key"]` strict field access.
    RowIndex(Box<Expr>),
    /// `row.get("key"[, default])` lenient field access.
    RowGet {
        /// Key expression.
        key: Box<Expr>,
        /// Default when the key is absent.
        default: Option<Box<Expr>>,
    },
    /// Unary minus.
    Neg(Box<Expr>),
    /// Boolean negation.
    Not(Box<Expr>),
    /// Short-circuit conjunction.
    And(Vec<Expr>),
    /// Short-circuit disjunction.
    Or(Vec<Expr>),
    /// Chained comparison.
    Compare {
        /// Leftmost operand.
        first: Box<Expr>,
        /// Operator/operand pairs applied left to right.
        rest: Vec<(CmpOp, Expr)>,
    },
    /// Arithmetic operation.
    Binary {
        /// Operator.
        op: BinOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// `a if cond else b`.
    Ternary {
        /// Condition.
        condition: Box<Expr>,
        /// Value when the condition is truthy.
        then: Box<Expr>,
        /// Value when the condition is falsy.
        otherwise: Box<Expr>,
    },
    /// List, tuple, or set literal (uniformly an array).
    Sequence(Vec<Expr>),
    /// Dict literal.
    Dict(Vec<(Expr, Expr)>),
}

// ============================================================================
// SECTION: Parser
// ============================================================================

/// Recursive-descent parser over the token stream.
struct Parser {
    /// Token stream.
    tokens: Vec<Token>,
    /// Cursor into the stream.
    position: usize,
}

impl Parser {
    /// Returns the current token without consuming it.
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    /// Consumes and returns the current token.
    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    /// Consumes the expected operator or fails.
    fn expect_op(&mut self, op: &'static str) -> Result<(), ExpressionError> {
        match self.advance() {
            Some(Token::Op(found)) if found == op => Ok(()),
            other => Err(ExpressionError::Syntax(format!("expected '{op}', found {other:?}"))),
        }
    }

    /// Returns true and consumes when the current token is the operator.
    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(found)) if *found == op) {
            self.position += 1;
            return true;
        }
        false
    }

    /// Returns true and consumes when the current token is the keyword.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(word)) if word == keyword) {
            self.position += 1;
            return true;
        }
        false
    }

    /// Entry point: ternary expression.
    fn parse_expression(&mut self) -> Result<Expr, ExpressionError> {
        let value = self.parse_or()?;
        if self.eat_keyword("if") {
            let condition = self.parse_or()?;
            if !self.eat_keyword("else") {
                return Err(ExpressionError::Syntax(
                    "ternary expression is missing 'else'".to_string(),
                ));
            }
            let otherwise = self.parse_expression()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(value)
    }

    /// Parses `or` chains.
    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let first = self.parse_and()?;
        if !matches!(self.peek(), Some(Token::Ident(word)) if word == "or") {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat_keyword("or") {
            operands.push(self.parse_and()?);
        }
        Ok(Expr::Or(operands))
    }

    /// Parses `and` chains.
    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let first = self.parse_not()?;
        if !matches!(self.peek(), Some(Token::Ident(word)) if word == "and") {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat_keyword("and") {
            operands.push(self.parse_not()?);
        }
        Ok(Expr::And(operands))
    }

    /// Parses `not` prefixes.
    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat_keyword("not") {
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    /// Parses comparison chains, including membership and None identity.
    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let first = self.parse_arith()?;
        let mut rest = Vec::new();
        loop {
            let op = if self.eat_op("==") {
                CmpOp::Eq
            } else if self.eat_op("!=") {
                CmpOp::NotEq
            } else if self.eat_op("<=") {
                CmpOp::LtE
            } else if self.eat_op(">=") {
                CmpOp::GtE
            } else if self.eat_op("<") {
                CmpOp::Lt
            } else if self.eat_op(">") {
                CmpOp::Gt
            } else if matches!(self.peek(), Some(Token::Ident(word)) if word == "in") {
                self.position += 1;
                CmpOp::In
            } else if matches!(self.peek(), Some(Token::Ident(word)) if word == "not") {
                // "not in" is the only postfix use of "not".
                let Some(Token::Ident(next)) = self.tokens.get(self.position + 1) else {
                    break;
                };
                if next != "in" {
                    break;
                }
                self.position += 2;
                CmpOp::NotIn
            } else if matches!(self.peek(), Some(Token::Ident(word)) if word == "is") {
                self.position += 1;
                if self.eat_keyword("not") { CmpOp::IsNot } else { CmpOp::Is }
            } else {
                break;
            };
            let operand = self.parse_arith()?;
            if matches!(op, CmpOp::Is | CmpOp::IsNot)
                && !matches!(operand, Expr::Literal(Value::Null))
            {
                return Err(ExpressionError::Security(
                    "'is' comparisons are only allowed against None".to_string(),
                ));
            }
            rest.push((op, operand));
        }
        if rest.is_empty() {
            return Ok(first);
        }
        Ok(Expr::Compare { first: Box::new(first), rest })
    }

    /// Parses additive arithmetic.
    fn parse_arith(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_term()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.parse_term()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    /// Parses multiplicative arithmetic.
    fn parse_term(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("//") {
                BinOp::FloorDiv
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.parse_factor()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    /// Parses unary sign prefixes.
    fn parse_factor(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat_op("-") {
            let operand = self.parse_factor()?;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        if self.eat_op("+") {
            return self.parse_factor();
        }
        self.parse_primary()
    }

    /// Parses primaries: literals, row access, grouping, containers.
    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self
            .advance()
            .ok_or_else(|| ExpressionError::Syntax("unexpected end of expression".to_string()))?;
        match token {
            Token::Int(value) => Ok(Expr::Literal(Value::Number(Number::from(value)))),
            Token::Float(value) => Number::from_f64(value).map_or_else(
                || Err(ExpressionError::Syntax(format!("non-finite float literal {value}"))),
                |number| Ok(Expr::Literal(Value::Number(number))),
            ),
            Token::Str(value) => Ok(Expr::Literal(Value::String(value))),
            Token::Ident(word) => self.parse_ident(&word),
            Token::Op("(") => {
                let first = self.parse_expression()?;
                if self.eat_op(",") {
                    // Tuple literal.
                    let mut items = vec![first];
                    while !matches!(self.peek(), Some(Token::Op(")"))) {
                        items.push(self.parse_expression()?);
                        if !self.eat_op(",") {
                            break;
                        }
                    }
                    self.expect_op(")")?;
                    return Ok(Expr::Sequence(items));
                }
                self.expect_op(")")?;
                Ok(first)
            }
            Token::Op("[") => {
                let mut items = Vec::new();
                while !matches!(self.peek(), Some(Token::Op("]"))) {
                    items.push(self.parse_expression()?);
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                Ok(Expr::Sequence(items))
            }
            Token::Op("{") => self.parse_braced(),
            other => Err(ExpressionError::Syntax(format!("unexpected token {other:?}"))),
        }
    }

    /// Parses an identifier: keywords, literals, or `row` access.
    fn parse_ident(&mut self, word: &str) -> Result<Expr, ExpressionError> {
        match word {
            "None" => Ok(Expr::Literal(Value::Null)),
            "True" => Ok(Expr::Literal(Value::Bool(true))),
            "False" => Ok(Expr::Literal(Value::Bool(false))),
            "lambda" => {
                Err(ExpressionError::Security("lambda expressions are not allowed".to_string()))
            }
            "for" => Err(ExpressionError::Security("comprehensions are not allowed".to_string())),
            "import" => Err(ExpressionError::Security("imports are not allowed".to_string())),
            "row" => self.parse_row_access(),
            other => Err(ExpressionError::Security(format!(
                "identifier '{other}' is not allowed; only 'row' may be referenced"
            ))),
        }
    }

    /// Parses `row["key"]`, `row.get(...)`, or bare `row`.
    fn parse_row_access(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat_op("[") {
            let key = self.parse_expression()?;
            self.expect_op("]")?;
            return Ok(Expr::RowIndex(Box::new(key)));
        }
        if self.eat_op(".") {
            let Some(Token::Ident(method)) = self.advance() else {
                return Err(ExpressionError::Syntax("expected attribute name after '.'".to_string()));
            };
            if method != "get" {
                return Err(ExpressionError::Security(format!(
                    "attribute access 'row.{method}' is not allowed; only 'row.get' is permitted"
                )));
            }
            self.expect_op("(")?;
            let key = self.parse_expression()?;
            let default = if self.eat_op(",") {
                if matches!(self.peek(), Some(Token::Op(")"))) {
                    return Err(ExpressionError::Syntax(
                        "row.get requires 1 or 2 positional arguments".to_string(),
                    ));
                }
                Some(Box::new(self.parse_expression()?))
            } else {
                None
            };
            if self.eat_op(",") {
                return Err(ExpressionError::Security(
                    "row.get accepts at most 2 positional arguments".to_string(),
                ));
            }
            self.expect_op(")")?;
            return Ok(Expr::RowGet { key: Box::new(key), default });
        }
        Err(ExpressionError::Security(
            "bare 'row' is not allowed; index it or call row.get".to_string(),
        ))
    }

    /// Parses `{...}` as a set or dict literal.
    fn parse_braced(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let first = self.parse_expression()?;
        if self.eat_op(":") {
            let mut pairs = vec![(first, self.parse_expression()?)];
            while self.eat_op(",") {
                if matches!(self.peek(), Some(Token::Op("}"))) {
                    break;
                }
                let key = self.parse_expression()?;
                self.expect_op(":")?;
                pairs.push((key, self.parse_expression()?));
            }
            self.expect_op("}")?;
            return Ok(Expr::Dict(pairs));
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if matches!(self.peek(), Some(Token::Op("}"))) {
                break;
            }
            items.push(self.parse_expression()?);
        }
        self.expect_op("}")?;
        Ok(Expr::Sequence(items))
    }
}

// ============================================================================
// SECTION: Compiled Expression
// ============================================================================

/// A compiled gate condition ready for repeated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    /// Original source text.
    source: String,
    /// Parsed expression tree.
    ast: Expr,
}

impl CompiledExpression {
    /// Compiles an expression, rejecting forbidden constructs.
    ///
    /// # Errors
    ///
    /// Returns [`ExpressionError::Syntax`] for malformed input and
    /// [`ExpressionError::Security`] for forbidden constructs.
    pub fn compile(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Syntax("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, position: 0 };
        let ast = parser.parse_expression()?;
        if parser.position != parser.tokens.len() {
            return Err(ExpressionError::Syntax(format!(
                "unexpected trailing tokens at position {}",
                parser.position
            )));
        }
        Ok(Self { source: source.to_string(), ast })
    }

    /// Returns the original source text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression against a row.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError`] when a strict field access misses or operand
    /// types do not support the operation.
    pub fn evaluate(&self, row: &Map<String, Value>) -> Result<Value, EvalError> {
        eval(&self.ast, row)
    }

    /// Evaluates the expression and coerces the result to a boolean using
    /// Python truthiness.
    ///
    /// # Errors
    ///
    /// Returns [`EvalError`] when evaluation fails.
    pub fn evaluate_bool(&self, row: &Map<String, Value>) -> Result<bool, EvalError> {
        Ok(truthy(&self.evaluate(row)?))
    }
}

// ============================================================================
// SECTION: Evaluation
// ============================================================================

/// Evaluates an expression node against a row.
fn eval(expr: &Expr, row: &Map<String, Value>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::RowIndex(key) => {
            let key = eval_key(key, row)?;
            row.get(&key).cloned().ok_or(EvalError::MissingField(key))
        }
        Expr::RowGet { key, default } => {
            let key = eval_key(key, row)?;
            match row.get(&key) {
                Some(value) => Ok(value.clone()),
                None => match default {
                    Some(default) => eval(default, row),
                    None => Ok(Value::Null),
                },
            }
        }
        Expr::Neg(operand) => {
            let value = eval(operand, row)?;
            match &value {
                Value::Number(number) => {
                    if let Some(int) = number.as_i64() {
                        Ok(Value::Number(Number::from(-int)))
                    } else {
                        let float = number.as_f64().ok_or_else(|| {
                            EvalError::Type("cannot negate this number".to_string())
                        })?;
                        Number::from_f64(-float).map(Value::Number).ok_or_else(|| {
                            EvalError::Type("negation produced a non-finite float".to_string())
                        })
                    }
                }
                _ => Err(EvalError::Type("unary minus requires a number".to_string())),
            }
        }
        Expr::Not(operand) => Ok(Value::Bool(!truthy(&eval(operand, row)?))),
        Expr::And(operands) => {
            let mut last = Value::Bool(true);
            for operand in operands {
                last = eval(operand, row)?;
                if !truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        Expr::Or(operands) => {
            let mut last = Value::Bool(false);
            for operand in operands {
                last = eval(operand, row)?;
                if truthy(&last) {
                    return Ok(last);
                }
            }
            Ok(last)
        }
        Expr::Compare { first, rest } => {
            let mut left = eval(first, row)?;
            for (op, operand) in rest {
                let right = eval(operand, row)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Expr::Binary { op, left, right } => {
            let left = eval(left, row)?;
            let right = eval(right, row)?;
            arithmetic(*op, &left, &right)
        }
        Expr::Ternary { condition, then, otherwise } => {
            if truthy(&eval(condition, row)?) { eval(then, row) } else { eval(otherwise, row) }
        }
        Expr::Sequence(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(item, row)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Dict(pairs) => {
            let mut object = Map::with_capacity(pairs.len());
            for (key, value) in pairs {
                let key = eval_key(key, row)?;
                object.insert(key, eval(value, row)?);
            }
            Ok(Value::Object(object))
        }
    }
}

/// Evaluates an expression that must produce a string key.
fn eval_key(expr: &Expr, row: &Map<String, Value>) -> Result<String, EvalError> {
    match eval(expr, row)? {
        Value::String(key) => Ok(key),
        other => Err(EvalError::Type(format!("field keys must be strings, got {other}"))),
    }
}

/// Python truthiness for JSON values.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(boolean) => *boolean,
        Value::Number(number) => number.as_f64().is_some_and(|float| float != 0.0),
        Value::String(string) => !string.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(object) => !object.is_empty(),
    }
}

/// Numeric view of a value when it is a number.
fn as_float(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Cross-type equality: numbers compare numerically, everything else
/// compares structurally.
fn values_equal(left: &Value, right: &Value) -> bool {
    if left.is_number()
        && right.is_number()
        && let (Some(left_num), Some(right_num)) = (as_float(left), as_float(right))
    {
        #[expect(clippy::float_cmp, reason = "Equality semantics mirror the source language.")]
        return left_num == right_num;
    }
    left == right
}

/// Applies a comparison operator.
fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::NotEq => Ok(!values_equal(left, right)),
        CmpOp::Lt | CmpOp::LtE | CmpOp::Gt | CmpOp::GtE => {
            let ordering = order(left, right)?;
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::LtE => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => Ok(!contains(right, left)?),
        // The parser restricts 'is' comparisons to a None right-hand side.
        CmpOp::Is => Ok(left.is_null()),
        CmpOp::IsNot => Ok(!left.is_null()),
    }
}

/// Total order for comparable values (numbers and strings).
fn order(left: &Value, right: &Value) -> Result<std::cmp::Ordering, EvalError> {
    if left.is_number() && right.is_number() {
        let left_num = as_float(left)
            .ok_or_else(|| EvalError::Type("number is not comparable".to_string()))?;
        let right_num = as_float(right)
            .ok_or_else(|| EvalError::Type("number is not comparable".to_string()))?;
        return left_num.partial_cmp(&right_num).ok_or_else(|| {
            EvalError::Type("numbers are not comparable".to_string())
        });
    }
    if let (Value::String(left_str), Value::String(right_str)) = (left, right) {
        return Ok(left_str.cmp(right_str));
    }
    Err(EvalError::Type(format!("'{left}' and '{right}' are not orderable")))
}

/// Membership test: `needle in haystack`.
fn contains(haystack: &Value, needle: &Value) -> Result<bool, EvalError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(object) => match needle {
            Value::String(key) => Ok(object.contains_key(key)),
            _ => Ok(false),
        },
        Value::String(string) => match needle {
            Value::String(sub) => Ok(string.contains(sub.as_str())),
            _ => Err(EvalError::Type("'in' on a string requires a string operand".to_string())),
        },
        _ => Err(EvalError::Type(format!("'{haystack}' does not support membership tests"))),
    }
}

/// Applies an arithmetic operator with Python-like semantics.
fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    if op == BinOp::Add {
        if let (Value::String(left_str), Value::String(right_str)) = (left, right) {
            return Ok(Value::String(format!("{left_str}{right_str}")));
        }
        if let (Value::Array(left_items), Value::Array(right_items)) = (left, right) {
            let mut items = left_items.clone();
            items.extend(right_items.iter().cloned());
            return Ok(Value::Array(items));
        }
    }
    let both_int = matches!(left, Value::Number(number) if number.is_i64())
        && matches!(right, Value::Number(number) if number.is_i64());
    let left_num = as_float(left)
        .ok_or_else(|| EvalError::Type(format!("arithmetic requires numbers, got '{left}'")))?;
    let right_num = as_float(right)
        .ok_or_else(|| EvalError::Type(format!("arithmetic requires numbers, got '{right}'")))?;
    if matches!(op, BinOp::Div | BinOp::FloorDiv | BinOp::Mod) && right_num == 0.0 {
        return Err(EvalError::DivisionByZero);
    }
    let result = match op {
        BinOp::Add => left_num + right_num,
        BinOp::Sub => left_num - right_num,
        BinOp::Mul => left_num * right_num,
        BinOp::Div => left_num / right_num,
        BinOp::FloorDiv => (left_num / right_num).floor(),
        // Floor modulo: the result takes the divisor's sign, matching the
        // source expression language rather than Rust's remainder.
        BinOp::Mod => left_num - (left_num / right_num).floor() * right_num,
    };
    if both_int && op != BinOp::Div {
        #[expect(clippy::cast_possible_truncation, reason = "Result of integer-only arithmetic.")]
        return Ok(Value::Number(Number::from(result as i64)));
    }
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Type("arithmetic produced a non-finite float".to_string()))
}
