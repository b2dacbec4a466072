use std::fmt;
use std::fmt::{Display, Formatter};

use crate::data::events::EventSet;
use crate::error::{Result, SliceError};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Ln,
    Log10,
    Sqrt,
    Abs,
}

impl Function {
    fn lookup(name: &str) -> Option<Function> {
        let f = match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "ln" | "log" => Function::Ln,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            _ => return None,
        };
        Some(f)
    }

    fn apply(&self, x: f64) -> f64 {
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Asin => x.asin(),
            Function::Acos => x.acos(),
            Function::Atan => x.atan(),
            Function::Sinh => x.sinh(),
            Function::Cosh => x.cosh(),
            Function::Tanh => x.tanh(),
            Function::Exp => x.exp(),
            Function::Ln => x.ln(),
            Function::Log10 => x.log10(),
            Function::Sqrt => x.sqrt(),
            Function::Abs => x.abs(),
        }
    }
}

/// Arithmetic expression over a declared, fixed list of variables.
///
/// Only numbers, the declared variables, `pi`, `e`, the four arithmetic
/// operators, powers (`^` or `**`) and a fixed set of functions are
/// understood; there is no way to reach anything else.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(usize),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr {
    /// Parses `text`; identifiers resolve to positions in `variables`.
    ///
    /// # Examples
    ///
    /// ```
    /// use dgscore::algorithm::expression::Expr;
    ///
    /// let vars = vec!["T".to_string()];
    /// let expr = Expr::parse("10 + 0.5*T^2", &vars).unwrap();
    /// assert_eq!(expr.eval(&[2.0]), 12.0);
    /// ```
    pub fn parse(text: &str, variables: &[String]) -> Result<Expr> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens: &tokens, pos: 0, variables, text };
        let expr = parser.expression()?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(expr)
    }

    pub fn eval(&self, values: &[f64]) -> f64 {
        match self {
            Expr::Number(v) => *v,
            Expr::Variable(i) => values[*i],
            Expr::Neg(e) => -e.eval(values),
            Expr::Binary(op, a, b) => {
                let (a, b) = (a.eval(values), b.eval(values));
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Pow => a.powf(b),
                }
            }
            Expr::Call(f, e) => f.apply(e.eval(values)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // exponent only when digits follow
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal: String = chars[start..i].iter().collect();
            let value = literal
                .parse::<f64>()
                .map_err(|_| SliceError::config(format!("invalid number '{}' in expression '{}'", literal, text)))?;
            tokens.push(Token::Number(value));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let token = match c {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' if chars.get(i + 1) == Some(&'*') => {
                i += 1;
                Token::Caret
            }
            '*' => Token::Star,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '(' => Token::LParen,
            ')' => Token::RParen,
            _ => {
                return Err(SliceError::config(format!(
                    "unexpected character '{}' in expression '{}'",
                    c, text
                )))
            }
        };
        tokens.push(token);
        i += 1;
    }
    if tokens.is_empty() {
        return Err(SliceError::config("empty expression"));
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    variables: &'a [String],
    text: &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, what: &str) -> SliceError {
        SliceError::config(format!("{} at token {} of expression '{}'", what, self.pos, self.text))
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.primary()?;
        if self.peek() == Some(&Token::Caret) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next().cloned() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("missing ')'")),
                }
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    let f = Function::lookup(&name).ok_or_else(|| self.error(&format!("unknown function '{}'", name)))?;
                    self.pos += 1;
                    let arg = self.expression()?;
                    return match self.next() {
                        Some(Token::RParen) => Ok(Expr::Call(f, Box::new(arg))),
                        _ => Err(self.error("missing ')'")),
                    };
                }
                if let Some(i) = self.variables.iter().position(|v| *v == name) {
                    return Ok(Expr::Variable(i));
                }
                match name.as_str() {
                    "pi" => Ok(Expr::Number(std::f64::consts::PI)),
                    "e" => Ok(Expr::Number(std::f64::consts::E)),
                    _ => Err(self.error(&format!("unknown variable '{}'", name))),
                }
            }
            _ => Err(self.error("expected a number, variable, function or '('")),
        }
    }
}

/// Flipping ratio of a polarized measurement: a constant, or a formula over
/// sample-log variables evaluated per event.
#[derive(Clone, Debug, PartialEq)]
pub enum FlippingRatio {
    Constant(f64),
    Formula { text: String, expression: Expr, variables: Vec<String> },
}

impl FlippingRatio {
    /// Resolves `"<number>"` or `"<formula>,<var>,<var>..."`.
    pub fn parse(text: Option<&str>) -> Result<Self> {
        let text = match text.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(SliceError::config("Flipping ratio is not defined")),
        };
        if let Ok(value) = text.parse::<f64>() {
            return Ok(FlippingRatio::Constant(value));
        }

        let (formula, names) = match text.split_once(',') {
            Some((formula, names)) => (formula.trim(), names),
            None => (text, ""),
        };
        let variables: Vec<String> = names
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        let expression = Expr::parse(formula, &variables)?;
        Ok(FlippingRatio::Formula { text: formula.to_string(), expression, variables })
    }

    /// Ratio for every event of `events`.
    pub fn evaluate(&self, events: &EventSet) -> Result<Vec<f64>> {
        match self {
            FlippingRatio::Constant(v) => Ok(vec![*v; events.n_events()]),
            FlippingRatio::Formula { expression, variables, .. } => {
                if let Some(missing) = variables.iter().find(|v| !events.has_variable(v)) {
                    return Err(SliceError::config(format!(
                        "flipping ratio variable '{}' is not defined in '{}'",
                        missing, events.name
                    )));
                }
                let mut values = vec![0.0; variables.len()];
                let ratios = (0..events.n_events())
                    .map(|i| {
                        for (slot, name) in values.iter_mut().zip(variables) {
                            *slot = events.variable(i, name).unwrap_or(f64::NAN);
                        }
                        expression.eval(&values)
                    })
                    .collect();
                Ok(ratios)
            }
        }
    }
}

impl Display for FlippingRatio {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FlippingRatio::Constant(v) => write!(f, "{}", v),
            FlippingRatio::Formula { text, variables, .. } => write!(f, "{} ({})", text, variables.join(", ")),
        }
    }
}
