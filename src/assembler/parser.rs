//! Expression parsing and evaluation.
//!
//! An `ExpressionParser` turns the text of one subfield into an `Expression`,
//! a flat list of operands and operators. Evaluation runs the list through an
//! operator stack against the current `Context`, so labels, built-in
//! functions and literal generation all see the state of the assembly at the
//! line being processed.
use super::context::Context;
use super::diagnostic::{Diagnostic, Locale};
use super::dictionary::compile_once;
use super::functions;
use super::reference::{SpecialKind, SpecialTarget, UndefinedReference};
use super::value::{
    CharacterMode, Form, IntegerValue, Justification, NodeKey, Precision, Signed, Value, ValueError, ValueKind,
};
use crate::word36::{DoubleWord36, FieldDescriptor};
use regex::Regex;
use std::cmp::Ordering;
use std::sync::OnceLock;

const FLOAT_PATTERN: &str = r"^\d+\.\d+";

/// Returned once a diagnostic describing the failure has been posted; the
/// caller only has to abandon whatever it was evaluating.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExpressionError;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operator {
    Identity,
    NonIdentity,
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Or,
    Xor,
    And,
    Shift,
    Add,
    Subtract,
    Multiply,
    Divide,
    CoveredQuotient,
    Remainder,
    Concatenate,
    Flag,
    Positive,
    Negative,
    Not,
    LeftJustify,
    RightJustify,
    DoublePrecision,
    SinglePrecision,
}

impl Operator {
    pub fn precedence(&self) -> u8 {
        use self::Operator::*;
        match self {
            Identity | NonIdentity | Equal | NotEqual | Less | LessOrEqual | Greater | GreaterOrEqual => 1,
            Or | Xor => 2,
            And => 3,
            Shift => 4,
            Add | Subtract => 5,
            Multiply | Divide | CoveredQuotient | Remainder => 6,
            Concatenate => 7,
            Flag | Positive | Negative | Not => 9,
            LeftJustify | RightJustify | DoublePrecision | SinglePrecision => 10,
        }
    }

    pub fn is_prefix(&self) -> bool {
        self.precedence() == 9
    }

    pub fn is_postfix(&self) -> bool {
        self.precedence() == 10
    }

    pub fn is_infix(&self) -> bool {
        self.precedence() < 9
    }
}

// Longer tokens come before their prefixes.
const INFIX_TOKENS: [(&str, Operator); 19] = [
    ("==", Operator::Identity),
    ("=/=", Operator::NonIdentity),
    ("<=", Operator::LessOrEqual),
    (">=", Operator::GreaterOrEqual),
    ("<>", Operator::NotEqual),
    ("=", Operator::Equal),
    ("<", Operator::Less),
    (">", Operator::Greater),
    ("++", Operator::Or),
    ("--", Operator::Xor),
    ("**", Operator::And),
    ("*/", Operator::Shift),
    ("+", Operator::Add),
    ("-", Operator::Subtract),
    ("*", Operator::Multiply),
    ("///", Operator::Remainder),
    ("//", Operator::CoveredQuotient),
    ("/", Operator::Divide),
    (":", Operator::Concatenate),
];

const PREFIX_TOKENS: [(char, Operator); 4] = [
    ('*', Operator::Flag),
    ('+', Operator::Positive),
    ('-', Operator::Negative),
    ('\\', Operator::Not),
];

const POSTFIX_TOKENS: [(char, Operator); 4] = [
    ('L', Operator::LeftJustify),
    ('R', Operator::RightJustify),
    ('D', Operator::DoublePrecision),
    ('S', Operator::SinglePrecision),
];

#[derive(Clone, PartialEq, Debug)]
pub enum Operand {
    Value(Value),
    /// `$`, the current generation location.
    Location,
    /// A parenthesized list of expressions.
    Group(Vec<Expression>),
    /// A label, optionally followed by an argument group.
    Reference { label: String, arguments: Option<Vec<Expression>> },
}

#[derive(Clone, PartialEq, Debug)]
pub enum ExpressionItem {
    Operand(Operand, Locale),
    Operator(Operator, Locale),
}

#[derive(Clone, PartialEq, Debug)]
pub struct Expression {
    pub items: Vec<ExpressionItem>,
    pub locale: Locale,
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

pub struct ExpressionParser {
    chars: Vec<char>,
    index: usize,
    locale: Locale,
}

impl ExpressionParser {
    pub fn new(text: &str, locale: Locale) -> Self {
        ExpressionParser { chars: text.chars().collect(), index: 0, locale }
    }

    fn at_end(&self) -> bool {
        self.index >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn here(&self) -> Locale {
        self.locale.offset(self.index)
    }

    fn rest(&self) -> String {
        self.chars[self.index.min(self.chars.len())..].iter().collect()
    }

    fn skip_whitespace(&mut self) {
        while self.peek() == Some(' ') {
            self.index += 1;
        }
    }

    fn skip_token(&mut self, token: &str) -> bool {
        let len = token.chars().count();
        if self.index + len > self.chars.len() {
            return false;
        }
        if self.chars[self.index..self.index + len].iter().copied().eq(token.chars()) {
            self.index += len;
            true
        } else {
            false
        }
    }

    fn fail(&self, ctx: &mut Context, diagnostic: Diagnostic) -> ExpressionError {
        ctx.post(diagnostic);
        ExpressionError
    }

    /// Parses the whole text as one expression. Empty text is `None`; text
    /// left over after the expression is a syntax error.
    pub fn parse(&mut self, ctx: &mut Context) -> Result<Option<Expression>, ExpressionError> {
        self.index = 0;
        let expression = self.parse_expression(ctx)?;
        self.skip_whitespace();
        if !self.at_end() {
            return Err(self.fail(ctx, Diagnostic::error(self.here(), "Syntax error")));
        }
        Ok(expression)
    }

    fn parse_expression(&mut self, ctx: &mut Context) -> Result<Option<Expression>, ExpressionError> {
        let locale = self.here();
        let mut items = Vec::new();
        let mut allow_infix = false;
        let mut allow_postfix = false;
        let mut allow_prefix = true;
        let mut allow_operand = true;

        self.skip_whitespace();
        while !self.at_end() {
            if allow_infix {
                let at = self.here();
                if let Some(op) = self.parse_infix() {
                    items.push(ExpressionItem::Operator(op, at));
                    allow_infix = false;
                    allow_postfix = false;
                    allow_prefix = true;
                    allow_operand = true;
                    self.skip_whitespace();
                    continue;
                }
            }

            if allow_operand {
                let at = self.here();
                if let Some(operand) = self.parse_operand(ctx)? {
                    items.push(ExpressionItem::Operand(operand, at));
                    allow_infix = true;
                    allow_postfix = true;
                    allow_prefix = false;
                    allow_operand = false;
                    self.skip_whitespace();
                    continue;
                }
            }

            if allow_prefix {
                let at = self.here();
                if let Some(op) = self.parse_prefix() {
                    items.push(ExpressionItem::Operator(op, at));
                    self.skip_whitespace();
                    continue;
                }
            }

            if allow_postfix {
                let at = self.here();
                if let Some(op) = self.parse_postfix() {
                    items.push(ExpressionItem::Operator(op, at));
                    self.skip_whitespace();
                    continue;
                }
            }

            break;
        }

        if items.is_empty() {
            return Ok(None);
        }
        if allow_operand {
            return Err(self.fail(ctx, Diagnostic::error(self.here(), "Incomplete expression")));
        }
        Ok(Some(Expression { items, locale }))
    }

    fn parse_infix(&mut self) -> Option<Operator> {
        for (token, op) in INFIX_TOKENS.iter() {
            if self.skip_token(token) {
                return Some(*op);
            }
        }
        None
    }

    fn parse_prefix(&mut self) -> Option<Operator> {
        let c = self.peek()?;
        let op = PREFIX_TOKENS.iter().find(|(t, _)| *t == c).map(|(_, op)| *op)?;
        self.index += 1;
        Some(op)
    }

    fn parse_postfix(&mut self) -> Option<Operator> {
        let c = self.peek()?.to_ascii_uppercase();
        let op = POSTFIX_TOKENS.iter().find(|(t, _)| *t == c).map(|(_, op)| *op)?;
        if self.peek_at(1).map(is_label_char).unwrap_or(false) {
            return None;
        }
        self.index += 1;
        Some(op)
    }

    /// `(` expression [`,` expression]* `)`, or `None` if there is no group here.
    fn parse_group(&mut self, ctx: &mut Context) -> Result<Option<Vec<Expression>>, ExpressionError> {
        if self.peek() != Some('(') {
            return Ok(None);
        }
        self.index += 1;

        let mut expressions = Vec::new();
        self.skip_whitespace();
        if self.skip_token(")") {
            return Ok(Some(expressions));
        }
        loop {
            self.skip_whitespace();
            match self.parse_expression(ctx)? {
                Some(e) => expressions.push(e),
                None => return Err(self.fail(ctx, Diagnostic::error(self.here(), "Syntax error"))),
            }
            self.skip_whitespace();
            if self.skip_token(",") {
                continue;
            }
            if self.skip_token(")") {
                break;
            }
            if self.at_end() {
                return Err(self.fail(ctx, Diagnostic::error(self.here(), "Unterminated expression group")));
            }
            return Err(self.fail(ctx, Diagnostic::error(self.here(), "Syntax error")));
        }
        Ok(Some(expressions))
    }

    fn parse_operand(&mut self, ctx: &mut Context) -> Result<Option<Operand>, ExpressionError> {
        if let Some(group) = self.parse_group(ctx)? {
            return Ok(Some(Operand::Group(group)));
        }
        if let Some(value) = self.parse_string_literal(ctx)? {
            return Ok(Some(Operand::Value(value)));
        }
        if let Some(value) = self.parse_float_literal() {
            return Ok(Some(Operand::Value(value)));
        }
        if let Some(value) = self.parse_integer_literal(ctx)? {
            return Ok(Some(Operand::Value(value)));
        }
        if self.parse_location_token() {
            return Ok(Some(Operand::Location));
        }
        self.parse_reference(ctx)
    }

    fn parse_string_literal(&mut self, ctx: &mut Context) -> Result<Option<Value>, ExpressionError> {
        if self.peek() != Some('\'') {
            return Ok(None);
        }
        self.index += 1;

        let mut text = String::new();
        while let Some(c) = self.peek() {
            self.index += 1;
            if c == '\'' {
                if self.peek() == Some('\'') {
                    text.push('\'');
                    self.index += 1;
                } else {
                    return Ok(Some(Value::string(text, CharacterMode::Default)));
                }
            } else {
                text.push(c);
            }
        }
        Err(self.fail(ctx, Diagnostic::quote(self.here(), "Unterminated string literal")))
    }

    fn parse_float_literal(&mut self) -> Option<Value> {
        let rest = self.rest();
        static FLOAT: OnceLock<Option<Regex>> = OnceLock::new();
        let m = compile_once(&FLOAT, FLOAT_PATTERN)?.find(&rest)?;
        let value: f64 = m.as_str().parse().ok()?;
        self.index += m.as_str().chars().count();
        Some(Value::float(value))
    }

    fn parse_integer_literal(&mut self, ctx: &mut Context) -> Result<Option<Value>, ExpressionError> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() => {}
            _ => return Ok(None),
        }

        let start = self.here();
        let mut value: i128 = 0;
        let mut radix: i128 = 10;
        let mut digits = 0;
        while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
            self.index += 1;
            if radix == 8 && (c == '8' || c == '9') {
                return Err(self.fail(ctx, Diagnostic::error(self.here(), "Invalid digit in octal literal")));
            }
            if c == '0' && digits == 0 {
                radix = 8;
            }
            value = match value.checked_mul(radix).and_then(|v| v.checked_add(c as i128 - '0' as i128)) {
                Some(v) => v,
                None => return Err(self.fail(ctx, Diagnostic::truncation(start, "Integer literal too large"))),
            };
            digits += 1;
        }

        let result = DoubleWord36::from_i128(value);
        if result.overflow {
            ctx.post(Diagnostic::truncation(start, "Integer literal too large"));
        }
        Ok(Some(Value::from_integer(IntegerValue::new(result.value))))
    }

    fn parse_location_token(&mut self) -> bool {
        if self.peek() != Some('$') {
            return false;
        }
        if self.peek_at(1).map(is_label_char).unwrap_or(false) {
            return false;
        }
        self.index += 1;
        true
    }

    fn parse_label(&mut self, ctx: &mut Context) -> Result<Option<String>, ExpressionError> {
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
            _ => return Ok(None),
        }
        let start = self.here();
        let mut label = String::new();
        while let Some(c) = self.peek().filter(|c| is_label_char(*c)) {
            label.push(c);
            self.index += 1;
        }
        if label.len() > 12 {
            return Err(self.fail(ctx, Diagnostic::error(start, "Label or reference too long")));
        }
        Ok(Some(label))
    }

    fn parse_reference(&mut self, ctx: &mut Context) -> Result<Option<Operand>, ExpressionError> {
        let label = match self.parse_label(ctx)? {
            Some(label) => label,
            None => return Ok(None),
        };
        let arguments = self.parse_group(ctx)?;
        Ok(Some(Operand::Reference { label, arguments }))
    }
}

/// Parses and evaluates the text of one subfield. Empty text is `None`.
pub fn evaluate(ctx: &mut Context, text: &str, locale: Locale) -> Result<Option<Value>, ExpressionError> {
    let mut parser = ExpressionParser::new(text, locale);
    match parser.parse(ctx)? {
        Some(expression) => expression.evaluate(ctx).map(Some),
        None => Ok(None),
    }
}

fn value_error(ctx: &mut Context, locale: Locale, err: ValueError) -> ExpressionError {
    let diagnostic = match err {
        ValueError::TypeMismatch => Diagnostic::value(locale, err.to_string()),
        ValueError::RelocationMismatch => Diagnostic::relocation(locale),
        ValueError::FormMismatch => Diagnostic::form(locale),
        ValueError::DivisionByZero => Diagnostic::error(locale, err.to_string()),
    };
    ctx.post(diagnostic);
    ExpressionError
}

fn boolean(b: bool) -> Value {
    Value::integer(if b { 1 } else { 0 })
}

impl Expression {
    /// A group operand stands for a literal only when it is not combined with
    /// anything by a binary operator.
    fn has_infix(&self) -> bool {
        self.items.iter().any(|item| matches!(item, ExpressionItem::Operator(op, _) if op.is_infix()))
    }

    pub fn evaluate(&self, ctx: &mut Context) -> Result<Value, ExpressionError> {
        let literal_groups = !self.has_infix();
        let mut values: Vec<Value> = Vec::new();
        let mut operators: Vec<(Operator, Locale)> = Vec::new();

        for item in self.items.iter() {
            match item {
                ExpressionItem::Operand(operand, locale) => {
                    values.push(evaluate_operand(ctx, operand, *locale, literal_groups)?);
                }
                ExpressionItem::Operator(op, locale) if op.is_postfix() => {
                    apply(ctx, *op, *locale, &mut values)?;
                }
                ExpressionItem::Operator(op, locale) if op.is_prefix() => {
                    operators.push((*op, *locale));
                }
                ExpressionItem::Operator(op, locale) => {
                    while let Some((top, top_locale)) = operators.last().copied() {
                        if top.precedence() < op.precedence() {
                            break;
                        }
                        operators.pop();
                        apply(ctx, top, top_locale, &mut values)?;
                    }
                    operators.push((*op, *locale));
                }
            }
        }
        while let Some((op, locale)) = operators.pop() {
            apply(ctx, op, locale, &mut values)?;
        }

        match (values.pop(), values.is_empty()) {
            (Some(value), true) => Ok(value),
            _ => {
                ctx.post(Diagnostic::error(self.locale, "Syntax error"));
                Err(ExpressionError)
            }
        }
    }
}

fn pop_operand(ctx: &mut Context, locale: Locale, values: &mut Vec<Value>) -> Result<Value, ExpressionError> {
    match values.pop() {
        Some(value) => Ok(value),
        None => {
            ctx.post(Diagnostic::error(locale, "Syntax error"));
            Err(ExpressionError)
        }
    }
}

fn apply(ctx: &mut Context, op: Operator, locale: Locale, values: &mut Vec<Value>) -> Result<(), ExpressionError> {
    let result = if op.is_infix() {
        let right = pop_operand(ctx, locale, values)?;
        let left = pop_operand(ctx, locale, values)?;
        apply_infix(ctx, op, locale, &left, &right)
    } else {
        let operand = pop_operand(ctx, locale, values)?;
        apply_unary(ctx, op, locale, &operand)
    };
    match result {
        Ok(value) => {
            values.push(value);
            Ok(())
        }
        Err(err) => Err(value_error(ctx, locale, err)),
    }
}

fn apply_infix(ctx: &mut Context, op: Operator, locale: Locale, left: &Value, right: &Value) -> Result<Value, ValueError> {
    let mode = ctx.character_mode;
    let diags = &mut ctx.diagnostics;
    match op {
        Operator::Add => left.add(right, mode, locale, diags),
        Operator::Subtract => left.subtract(right, mode, locale, diags),
        Operator::Multiply => left.multiply(right, mode, locale, diags),
        Operator::Divide => left.divide(right, mode, locale, diags).map(|(q, _, _)| q),
        Operator::Remainder => left.divide(right, mode, locale, diags).map(|(_, r, _)| r),
        Operator::CoveredQuotient => left.divide(right, mode, locale, diags).map(|(_, _, c)| c),
        Operator::And => left.and(right, mode, locale, diags),
        Operator::Or => left.or(right, mode, locale, diags),
        Operator::Xor => left.xor(right, mode, locale, diags),
        Operator::Shift => left.shift(right, mode, locale, diags),
        Operator::Concatenate => left.concatenate(right),
        Operator::Identity | Operator::NonIdentity => {
            let same = match (&left.kind, &right.kind) {
                (ValueKind::Node(_), _) | (_, ValueKind::Node(_)) => left == right,
                _ => left.compare(right, mode, locale, diags)? == Ordering::Equal,
            };
            Ok(boolean(same == (op == Operator::Identity)))
        }
        _ => {
            let ordering = left.compare(right, mode, locale, diags)?;
            let result = match op {
                Operator::Equal => ordering == Ordering::Equal,
                Operator::NotEqual => ordering != Ordering::Equal,
                Operator::Less => ordering == Ordering::Less,
                Operator::LessOrEqual => ordering != Ordering::Greater,
                Operator::Greater => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(boolean(result))
        }
    }
}

fn apply_unary(ctx: &mut Context, op: Operator, locale: Locale, operand: &Value) -> Result<Value, ValueError> {
    let mode = ctx.character_mode;
    let diags = &mut ctx.diagnostics;
    let arithmetic = matches!(operand.kind, ValueKind::Integer(_) | ValueKind::FloatingPoint(_) | ValueKind::String(_));
    match op {
        Operator::Flag => Ok(operand.with_flagged(true)),
        Operator::Positive if arithmetic => Ok(operand.with_signed(Signed::Positive)),
        Operator::Positive => Err(ValueError::TypeMismatch),
        Operator::Negative => operand.negate(mode, locale, diags),
        Operator::Not => operand.not(mode, locale, diags),
        Operator::LeftJustify => operand.with_justification(Justification::Left),
        Operator::RightJustify => operand.with_justification(Justification::Right),
        Operator::DoublePrecision if arithmetic => Ok(operand.with_precision(Precision::Double)),
        Operator::SinglePrecision if arithmetic => Ok(operand.with_precision(Precision::Single)),
        _ => Err(ValueError::TypeMismatch),
    }
}

fn evaluate_operand(ctx: &mut Context, operand: &Operand, locale: Locale, literal_groups: bool) -> Result<Value, ExpressionError> {
    match operand {
        Operand::Value(value) => match &value.kind {
            ValueKind::String(sv) if sv.mode == CharacterMode::Default => value
                .with_character_mode(ctx.character_mode)
                .map_err(|err| value_error(ctx, locale, err)),
            _ => Ok(value.clone()),
        },
        Operand::Location => Ok(ctx.current_location()),
        Operand::Group(expressions) if literal_groups => evaluate_literal(ctx, expressions, locale),
        Operand::Group(expressions) => {
            if expressions.len() != 1 {
                ctx.post(Diagnostic::error(locale, "Expected one expression inside the grouping symbols"));
                return Err(ExpressionError);
            }
            expressions[0].evaluate(ctx)
        }
        Operand::Reference { label, arguments } => resolve_reference(ctx, label, arguments.as_deref(), locale),
    }
}

/// Generates a literal into the literal pool and yields its location.
fn evaluate_literal(ctx: &mut Context, expressions: &[Expression], locale: Locale) -> Result<Value, ExpressionError> {
    if expressions.is_empty() || expressions.len() > 36 {
        ctx.post(Diagnostic::error(locale, "Expected one to thirty-six expressions in a literal"));
        return Err(ExpressionError);
    }

    let mut values = Vec::with_capacity(expressions.len());
    if expressions.len() == 1 {
        let value = expressions[0].evaluate(ctx)?;
        let mode = ctx.character_mode;
        let iv = value
            .to_integer(mode, locale, &mut ctx.diagnostics)
            .map_err(|err| value_error(ctx, locale, err))?;
        values.push(iv);
    } else {
        for expression in expressions.iter() {
            match expression.evaluate(ctx)?.kind {
                ValueKind::Integer(iv) => values.push(iv),
                _ => {
                    ctx.post(Diagnostic::value(locale, "Literal bit-field values must be integers"));
                    return Err(ExpressionError);
                }
            }
        }
    }

    let form = match Form::even(values.len()) {
        Ok(form) => form,
        Err(message) => {
            ctx.post(Diagnostic::error(locale, message));
            return Err(ExpressionError);
        }
    };
    Ok(ctx.generate_literal(&form, &values, locale))
}

fn evaluate_arguments(ctx: &mut Context, arguments: &[Expression]) -> Result<Vec<Value>, ExpressionError> {
    arguments.iter().map(|e| e.evaluate(ctx)).collect()
}

fn resolve_reference(
    ctx: &mut Context,
    label: &str,
    arguments: Option<&[Expression]>,
    locale: Locale,
) -> Result<Value, ExpressionError> {
    if let Some(kind) = SpecialKind::from_label(label) {
        return resolve_special(ctx, kind, arguments, locale);
    }

    let value = match ctx.dictionary.get_value(label) {
        Ok(value) => value.clone(),
        Err(_) => {
            if arguments.is_some() {
                ctx.post(Diagnostic::error(locale, format!("Undefined function or node {}", label)));
                return Err(ExpressionError);
            }
            let iv = IntegerValue::with_references(DoubleWord36::POSITIVE_ZERO, vec![UndefinedReference::to_label(label)]);
            return Ok(Value::from_integer(iv));
        }
    };

    match (&value.kind, arguments) {
        (ValueKind::BuiltInFunction(name), args) => {
            let args = evaluate_arguments(ctx, args.unwrap_or(&[]))?;
            match functions::lookup(name) {
                Some(function) => function(ctx, locale, &args),
                None => {
                    ctx.post(Diagnostic::fatal(locale, format!("No handler for built-in function {}", name)));
                    Err(ExpressionError)
                }
            }
        }
        (ValueKind::Node(_), Some(args)) => {
            let args = evaluate_arguments(ctx, args)?;
            index_node(ctx, &value, &args, locale)
        }
        (_, None) => Ok(value),
        (_, Some(_)) => {
            ctx.post(Diagnostic::value(locale, format!("Label {} does not accept arguments", label)));
            Err(ExpressionError)
        }
    }
}

/// Walks nested node entries with one key per argument. A missing entry
/// yields zero, which is how omitted procedure operands read.
fn index_node(ctx: &mut Context, node: &Value, args: &[Value], locale: Locale) -> Result<Value, ExpressionError> {
    let mut current = node.clone();
    for arg in args.iter() {
        let key = match &arg.kind {
            ValueKind::Integer(iv) if !iv.has_references() => match iv.to_i64() {
                Some(i) => NodeKey::Integer(i),
                None => {
                    ctx.post(Diagnostic::value(locale, "Node index out of range"));
                    return Err(ExpressionError);
                }
            },
            ValueKind::String(sv) => NodeKey::String(sv.value.clone()),
            _ => {
                ctx.post(Diagnostic::value(locale, "Node index must be an integer or string"));
                return Err(ExpressionError);
            }
        };
        current = match &current.kind {
            ValueKind::Node(node) => match node.get(&key) {
                Some(value) => value.clone(),
                None => return Ok(Value::integer(0)),
            },
            _ => return Ok(Value::integer(0)),
        };
    }
    Ok(current)
}

/// The BDI family: a zero Integer carrying a special reference. The kinds
/// which name a target take a single label or location as their argument.
fn resolve_special(
    ctx: &mut Context,
    kind: SpecialKind,
    arguments: Option<&[Expression]>,
    locale: Locale,
) -> Result<Value, ExpressionError> {
    let target = if kind.takes_target() {
        let args = arguments.unwrap_or(&[]);
        if args.len() != 1 {
            ctx.post(Diagnostic::error(locale, format!("{} requires exactly one argument", kind.label())));
            return Err(ExpressionError);
        }
        let value = args[0].evaluate(ctx)?;
        let target = match value.as_integer().map(|iv| iv.references.as_slice()) {
            Some([UndefinedReference::ToLabel { label, .. }]) => Some(SpecialTarget::Label(label.clone())),
            Some([UndefinedReference::ToLocationCounter { lc_index, .. }]) => Some(SpecialTarget::LocationCounter(*lc_index)),
            _ => None,
        };
        if target.is_none() {
            ctx.post(Diagnostic::value(locale, format!("{} argument must be a label or location", kind.label())));
            return Err(ExpressionError);
        }
        target
    } else {
        if arguments.map(|a| !a.is_empty()).unwrap_or(false) {
            ctx.post(Diagnostic::error(locale, format!("{} does not accept arguments", kind.label())));
            return Err(ExpressionError);
        }
        None
    };

    let reference = UndefinedReference::Special { kind, target, field: FieldDescriptor::W };
    Ok(Value::from_integer(IntegerValue::with_references(DoubleWord36::POSITIVE_ZERO, vec![reference])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::diagnostic::Level;
    use crate::assembler::instruction::StandardMnemonicTable;

    fn eval(ctx: &mut Context, text: &str) -> Result<Option<Value>, ExpressionError> {
        evaluate(ctx, text, Locale::new(1, 1))
    }

    fn eval_i64(text: &str) -> i64 {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        eval(&mut ctx, text).unwrap().unwrap().as_integer().unwrap().to_i64().unwrap()
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval_i64("2+3*4"), 14);
        assert_eq!(eval_i64("(2+3)*4"), 20);
        assert_eq!(eval_i64("-2+5"), 3);
        assert_eq!(eval_i64("10-4-3"), 3);
        assert_eq!(eval_i64("1+2<4"), 1);
        assert_eq!(eval_i64("5 =/= 5"), 0);
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval_i64("010"), 8);
        assert_eq!(eval_i64("0"), 0);
        assert_eq!(eval_i64("123"), 123);

        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        assert!(eval(&mut ctx, "09").is_err());
        assert_eq!(ctx.diagnostics.iter().next().unwrap().message, "Invalid digit in octal literal");

        let value = eval(&mut ctx, "1.5").unwrap().unwrap();
        assert_eq!(value.to_float(), Ok(1.5));

        let value = eval(&mut ctx, "'IT''S'").unwrap().unwrap();
        let sv = value.to_string_value().unwrap();
        assert_eq!(sv.value, "IT'S");
        assert_eq!(sv.mode, CharacterMode::Ascii);
    }

    #[test]
    fn test_division_operators() {
        assert_eq!(eval_i64("7/2"), 3);
        assert_eq!(eval_i64("7//2"), 4);
        assert_eq!(eval_i64("7///2"), 1);
        assert_eq!(eval_i64("1*/3"), 8);
        assert_eq!(eval_i64("014**06"), 4);
        assert_eq!(eval_i64("014++03"), 15);
    }

    #[test]
    fn test_errors() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        assert!(eval(&mut ctx, "5+").is_err());
        assert_eq!(ctx.diagnostics.iter().last().unwrap().message, "Incomplete expression");

        assert!(eval(&mut ctx, "5 #").is_err());
        assert_eq!(ctx.diagnostics.iter().last().unwrap().message, "Syntax error");

        assert!(eval(&mut ctx, "'ABC").is_err());
        assert_eq!(ctx.diagnostics.iter().last().unwrap().level, Level::Quote);

        assert!(eval(&mut ctx, "ABCDEFGHIJKLM").is_err());
        assert!(eval(&mut ctx, "1/0").is_err());
        assert_eq!(eval(&mut ctx, "").unwrap(), None);
    }

    #[test]
    fn test_undefined_label_is_a_reference() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        let value = eval(&mut ctx, "FOO+2").unwrap().unwrap();
        let iv = value.as_integer().unwrap();
        assert_eq!(iv.to_i64(), Some(2));
        assert_eq!(iv.references, vec![UndefinedReference::to_label("FOO")]);
        assert!(ctx.diagnostics.is_empty());
    }

    #[test]
    fn test_dictionary_lookup() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        ctx.dictionary.add_value(0, "TEN", Value::integer(10));
        assert_eq!(eval(&mut ctx, "ten*a1").unwrap().unwrap().as_integer().unwrap().to_i64(), Some(130));
        assert!(eval(&mut ctx, "TEN(1)").is_err());
    }

    #[test]
    fn test_location_token() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        ctx.advance(1, 3);
        let value = eval(&mut ctx, "$+1").unwrap().unwrap();
        let iv = value.as_integer().unwrap();
        assert_eq!(iv.to_i64(), Some(4));
        assert_eq!(iv.references, vec![UndefinedReference::to_location_counter(1)]);
    }

    #[test]
    fn test_literal_generation() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        let value = eval(&mut ctx, "(1,2)").unwrap().unwrap();
        assert_eq!(value.as_integer().unwrap().references, vec![UndefinedReference::to_location_counter(0)]);
        assert_eq!(ctx.pools[&0].words[&0].value.word(), 0o000001_000002);

        // A group combined with an operator is only a sub-expression.
        let value = eval(&mut ctx, "(1)+2").unwrap().unwrap();
        assert_eq!(value.as_integer().unwrap().to_i64(), Some(3));
        assert_eq!(ctx.pools[&0].next_offset, 1);
    }

    #[test]
    fn test_postfix_and_prefix() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        let value = eval(&mut ctx, "*'AB'R").unwrap().unwrap();
        assert!(value.flagged);
        assert_eq!(value.to_string_value().unwrap().justification, Justification::Right);

        let value = eval(&mut ctx, "5D").unwrap().unwrap();
        assert_eq!(value.precision, Precision::Double);

        assert_eq!(eval(&mut ctx, "\\0").unwrap().unwrap().as_integer().unwrap().word(), 0o777777777777);
    }

    #[test]
    fn test_special_reference() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        let value = eval(&mut ctx, "BDIREF$(TARGET)").unwrap().unwrap();
        assert_eq!(
            value.as_integer().unwrap().references,
            vec![UndefinedReference::Special {
                kind: SpecialKind::BdiRef,
                target: Some(SpecialTarget::Label("TARGET".to_string())),
                field: FieldDescriptor::W,
            }]
        );

        let value = eval(&mut ctx, "LBDI$").unwrap().unwrap();
        assert!(matches!(
            value.as_integer().unwrap().references[0],
            UndefinedReference::Special { kind: SpecialKind::Lbdi, target: None, .. }
        ));

        assert!(eval(&mut ctx, "BDICALL$").is_err());
    }
}
