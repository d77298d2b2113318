//! The values an expression can produce and a symbol table can hold.
//!
//! Values are immutable. Every `with_*` method hands back a modified copy,
//! and arithmetic always builds a fresh result. Integer payloads are plain
//! `DoubleWord36` copies, so no two values ever share storage.
use super::diagnostic::{Diagnostic, Diagnostics, Locale};
use super::lexer::SourceLine;
use super::reference::{coalesce, UndefinedReference};
use crate::word36::{self, DoubleWord36, FieldDescriptor};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Signed {
    None,
    Positive,
    Negative,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Precision {
    None,
    Single,
    Double,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Justification {
    None,
    Left,
    Right,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum CharacterMode {
    Default,
    Ascii,
    Fieldata,
}

impl CharacterMode {
    pub fn chars_per_word(&self) -> usize {
        match self {
            CharacterMode::Fieldata => 6,
            _ => 4,
        }
    }
}

/// Marks a value as relative to the start of a location counter pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RelocationInfo {
    pub lc_index: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueError {
    TypeMismatch,
    RelocationMismatch,
    FormMismatch,
    DivisionByZero,
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValueError::TypeMismatch => write!(f, "Wrong value type for this operation"),
            ValueError::RelocationMismatch => write!(f, "Values have incompatible relocation"),
            ValueError::FormMismatch => write!(f, "Values have incompatible forms"),
            ValueError::DivisionByZero => write!(f, "Division by zero"),
        }
    }
}

/// An ordered list of bit-field widths.
///
/// Fields are laid out right-justified: the last field always ends at bit 35.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Form {
    field_sizes: Vec<u32>,
}

impl Form {
    pub fn new(field_sizes: Vec<u32>) -> Result<Form, String> {
        if field_sizes.is_empty() {
            return Err("A form requires at least one field".to_string());
        }
        if field_sizes.iter().any(|&s| s == 0 || s > 36) {
            return Err("Form field sizes must be from 1 to 36 bits".to_string());
        }
        if field_sizes.iter().sum::<u32>() > 36 {
            return Err("Form fields total more than 36 bits".to_string());
        }
        Ok(Form { field_sizes })
    }

    /// Splits 36 bits as evenly as possible among `count` fields.
    pub fn even(count: usize) -> Result<Form, String> {
        if count == 0 || count > 36 {
            return Err("Improper number of fields".to_string());
        }
        Form::new(vec![36 / count as u32; count])
    }

    pub fn field_sizes(&self) -> &[u32] {
        &self.field_sizes
    }

    pub fn field_count(&self) -> usize {
        self.field_sizes.len()
    }

    pub fn field_descriptors(&self) -> Vec<FieldDescriptor> {
        let total: u32 = self.field_sizes.iter().sum();
        let mut bit = 36 - total;
        self.field_sizes
            .iter()
            .map(|&size| {
                let fd = FieldDescriptor::new(bit, size);
                bit += size;
                fd
            })
            .collect()
    }
}

impl fmt::Display for Form {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sizes: Vec<String> = self.field_sizes.iter().map(|s| s.to_string()).collect();
        write!(f, "[{}]", sizes.join(","))
    }
}

/// The integer payload: a 72-bit value plus any references still to be
/// added into it.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct IntegerValue {
    pub value: DoubleWord36,
    pub references: Vec<UndefinedReference>,
}

impl IntegerValue {
    pub fn new(value: DoubleWord36) -> Self {
        IntegerValue { value, references: Vec::new() }
    }

    pub fn from_i64(value: i64) -> Self {
        IntegerValue::new(DoubleWord36::from_i64(value))
    }

    pub fn with_references(value: DoubleWord36, references: Vec<UndefinedReference>) -> Self {
        IntegerValue { value, references }
    }

    pub fn has_references(&self) -> bool {
        !self.references.is_empty()
    }

    /// The value reduced to a single 36-bit word.
    pub fn word(&self) -> u64 {
        self.value.to_word()
    }

    pub fn to_i64(&self) -> Option<i64> {
        self.value.to_i64()
    }

    pub fn negate(&self) -> IntegerValue {
        IntegerValue {
            value: self.value.negate(),
            references: self.references.iter().map(|r| r.negated()).collect(),
        }
    }

    /// Two words are produced for Double precision, one for Single, and for
    /// no precision two only when the high-order word is not zero. A
    /// negative value whose high word is just the sign extension of its low
    /// word also takes one.
    pub fn generate_double_precision(&self, precision: Precision) -> bool {
        match precision {
            Precision::Double => true,
            Precision::Single => false,
            Precision::None => {
                let high = self.value.high();
                let sign_extension = high == word36::BIT_MASK && self.value.low() & word36::NEGATIVE_BIT != 0;
                high != 0 && !sign_extension
            }
        }
    }
}

impl fmt::Display for IntegerValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.value)?;
        for reference in self.references.iter() {
            write!(f, "{}", reference)?;
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StringValue {
    pub value: String,
    pub mode: CharacterMode,
    pub justification: Justification,
}

impl StringValue {
    pub fn new<S: Into<String>>(value: S, mode: CharacterMode) -> Self {
        StringValue { value: value.into(), mode, justification: Justification::None }
    }

    pub fn effective_mode(&self, context_mode: CharacterMode) -> CharacterMode {
        match self.mode {
            CharacterMode::Default => match context_mode {
                CharacterMode::Default => CharacterMode::Ascii,
                other => other,
            },
            explicit => explicit,
        }
    }

    /// Packs the string into words.
    ///
    /// Single precision is one word and Double is two; otherwise the string
    /// is rounded up to whole words. Right-justified text is padded on the
    /// left with zero characters, anything else is blank-filled on the right.
    /// The flag is set when characters had to be dropped.
    pub fn words(&self, precision: Precision, context_mode: CharacterMode) -> (Vec<u64>, bool) {
        let mode = self.effective_mode(context_mode);
        let per_word = mode.chars_per_word();
        let mut chars: Vec<char> = self.value.chars().collect();
        let expected = match precision {
            Precision::Single => per_word,
            Precision::Double => 2 * per_word,
            Precision::None => {
                let rounded = (chars.len() + per_word - 1) / per_word * per_word;
                rounded.max(per_word)
            }
        };

        let truncated = chars.len() > expected;
        chars.truncate(expected);
        if chars.len() < expected && self.justification == Justification::Right {
            let pad = if mode == CharacterMode::Fieldata { '@' } else { '\0' };
            let mut padded = vec![pad; expected - chars.len()];
            padded.extend(chars);
            chars = padded;
        }

        let text: String = chars.into_iter().collect();
        let mut words = if mode == CharacterMode::Fieldata {
            word36::pack_fieldata(&text)
        } else {
            word36::pack_ascii(&text)
        };
        let blank = if mode == CharacterMode::Fieldata {
            word36::pack_fieldata(" ")[0]
        } else {
            word36::pack_ascii(" ")[0]
        };
        while words.len() < expected / per_word {
            words.push(blank);
        }
        (words, truncated)
    }

    /// The string taken as a one or two word integer.
    pub fn to_integer(&self, precision: Precision, context_mode: CharacterMode) -> (DoubleWord36, bool) {
        let per_word = self.effective_mode(context_mode).chars_per_word();
        let double = match precision {
            Precision::Double => true,
            Precision::Single => false,
            Precision::None => self.value.chars().count() > per_word,
        };
        let effective = if double { Precision::Double } else { Precision::Single };
        let (words, truncated) = self.words(effective, context_mode);
        if double {
            (DoubleWord36::new(words[0], words[1]), truncated)
        } else {
            (DoubleWord36::new(0, words[0]), truncated)
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum NodeKey {
    Integer(i64),
    String(String),
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeKey::Integer(i) => write!(f, "{}", i),
            NodeKey::String(s) => write!(f, "'{}'", s),
        }
    }
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct NodeValue {
    pub entries: BTreeMap<NodeKey, Value>,
}

impl NodeValue {
    pub fn new() -> Self {
        NodeValue { entries: BTreeMap::new() }
    }

    pub fn get(&self, key: &NodeKey) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: NodeKey, value: Value) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProcedureValue {
    pub name: String,
    pub lines: Vec<SourceLine>,
}

#[derive(Clone, PartialEq, Debug)]
pub enum ValueKind {
    Integer(IntegerValue),
    FloatingPoint(f64),
    String(StringValue),
    Node(NodeValue),
    Procedure(ProcedureValue),
    Form(Form),
    Directive(String),
    BuiltInFunction(String),
}

#[derive(Clone, PartialEq, Debug)]
pub struct Value {
    pub flagged: bool,
    pub signed: Signed,
    pub precision: Precision,
    pub form: Option<Form>,
    pub relocation: Option<RelocationInfo>,
    pub kind: ValueKind,
}

impl Value {
    fn of(kind: ValueKind) -> Self {
        Value {
            flagged: false,
            signed: Signed::None,
            precision: Precision::None,
            form: None,
            relocation: None,
            kind,
        }
    }

    pub fn integer(value: i64) -> Self {
        Value::of(ValueKind::Integer(IntegerValue::from_i64(value)))
    }

    pub fn from_integer(value: IntegerValue) -> Self {
        Value::of(ValueKind::Integer(value))
    }

    pub fn float(value: f64) -> Self {
        Value::of(ValueKind::FloatingPoint(value))
    }

    pub fn string<S: Into<String>>(value: S, mode: CharacterMode) -> Self {
        Value::of(ValueKind::String(StringValue::new(value, mode)))
    }

    pub fn node(node: NodeValue) -> Self {
        Value::of(ValueKind::Node(node))
    }

    pub fn procedure(name: &str, lines: Vec<SourceLine>) -> Self {
        Value::of(ValueKind::Procedure(ProcedureValue { name: name.to_uppercase(), lines }))
    }

    pub fn form_value(form: Form) -> Self {
        Value::of(ValueKind::Form(form))
    }

    pub fn directive(name: &str) -> Self {
        Value::of(ValueKind::Directive(name.to_string()))
    }

    pub fn built_in_function(name: &str) -> Self {
        Value::of(ValueKind::BuiltInFunction(name.to_string()))
    }

    pub fn with_flagged(&self, flagged: bool) -> Self {
        Value { flagged, ..self.clone() }
    }

    pub fn with_signed(&self, signed: Signed) -> Self {
        Value { signed, ..self.clone() }
    }

    pub fn with_precision(&self, precision: Precision) -> Self {
        Value { precision, ..self.clone() }
    }

    pub fn with_form(&self, form: Option<Form>) -> Self {
        Value { form, ..self.clone() }
    }

    pub fn with_relocation(&self, relocation: Option<RelocationInfo>) -> Self {
        Value { relocation, ..self.clone() }
    }

    /// Strings take the justification; integers only remember it as
    /// left-justified text would be meaningless for them.
    pub fn with_justification(&self, justification: Justification) -> Result<Self, ValueError> {
        match &self.kind {
            ValueKind::String(sv) => {
                let mut copy = self.clone();
                copy.kind = ValueKind::String(StringValue { justification, ..sv.clone() });
                Ok(copy)
            }
            _ => Err(ValueError::TypeMismatch),
        }
    }

    pub fn with_character_mode(&self, mode: CharacterMode) -> Result<Self, ValueError> {
        match &self.kind {
            ValueKind::String(sv) => {
                let mut copy = self.clone();
                copy.kind = ValueKind::String(StringValue { mode, ..sv.clone() });
                Ok(copy)
            }
            _ => Err(ValueError::TypeMismatch),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ValueKind::Integer(_) => "Integer",
            ValueKind::FloatingPoint(_) => "FloatingPoint",
            ValueKind::String(_) => "String",
            ValueKind::Node(_) => "Node",
            ValueKind::Procedure(_) => "Procedure",
            ValueKind::Form(_) => "Form",
            ValueKind::Directive(_) => "Directive",
            ValueKind::BuiltInFunction(_) => "BuiltInFunction",
        }
    }

    pub fn type_code(&self) -> i64 {
        match self.kind {
            ValueKind::Integer(_) => 1,
            ValueKind::FloatingPoint(_) => 2,
            ValueKind::String(_) => 3,
            ValueKind::Node(_) => 4,
            ValueKind::Procedure(_) => 5,
            ValueKind::Form(_) => 6,
            ValueKind::Directive(_) => 7,
            ValueKind::BuiltInFunction(_) => 8,
        }
    }

    pub fn as_integer(&self) -> Option<&IntegerValue> {
        match &self.kind {
            ValueKind::Integer(iv) => Some(iv),
            _ => None,
        }
    }

    /// Converts to an integer where that is meaningful. Strings are packed
    /// in their character mode; floats are truncated toward zero.
    pub fn to_integer(&self, context_mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<IntegerValue, ValueError> {
        match &self.kind {
            ValueKind::Integer(iv) => Ok(iv.clone()),
            ValueKind::String(sv) => {
                let (value, truncated) = sv.to_integer(self.precision, context_mode);
                if truncated {
                    diags.append(Diagnostic::truncation(locale, "Value larger than precision"));
                }
                Ok(IntegerValue::new(value))
            }
            ValueKind::FloatingPoint(f) => {
                let result = DoubleWord36::from_i128(f.trunc() as i128);
                if result.overflow {
                    diags.append(Diagnostic::truncation(locale, "Floating point value too large for integer"));
                }
                Ok(IntegerValue::new(result.value))
            }
            _ => Err(ValueError::TypeMismatch),
        }
    }

    pub fn to_float(&self) -> Result<f64, ValueError> {
        match &self.kind {
            ValueKind::FloatingPoint(f) => Ok(*f),
            ValueKind::Integer(iv) => {
                if iv.has_references() {
                    Err(ValueError::RelocationMismatch)
                } else {
                    Ok(iv.value.to_i128() as f64)
                }
            }
            _ => Err(ValueError::TypeMismatch),
        }
    }

    pub fn to_string_value(&self) -> Result<&StringValue, ValueError> {
        match &self.kind {
            ValueKind::String(sv) => Ok(sv),
            _ => Err(ValueError::TypeMismatch),
        }
    }

    fn is_float(&self) -> bool {
        matches!(self.kind, ValueKind::FloatingPoint(_))
    }

    fn is_arithmetic(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::FloatingPoint(_) | ValueKind::String(_))
    }

    fn merged_relocation(&self, other: &Value, locale: Locale, diags: &mut Diagnostics) -> Option<RelocationInfo> {
        match (self.relocation, other.relocation) {
            (Some(a), Some(b)) if a != b => {
                diags.append(Diagnostic::relocation(locale));
                None
            }
            (Some(a), _) => Some(a),
            (None, b) => b,
        }
    }

    pub fn add(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Value, ValueError> {
        if !self.is_arithmetic() || !other.is_arithmetic() {
            return Err(ValueError::TypeMismatch);
        }
        if self.is_float() || other.is_float() {
            return Ok(Value::float(self.to_float()? + other.to_float()?));
        }

        let left = self.to_integer(mode, locale, diags)?;
        let right = other.to_integer(mode, locale, diags)?;
        let relocation = self.merged_relocation(other, locale, diags);
        let (sum, form) = add_integers(&left, self.form.as_ref(), &right, other.form.as_ref(), locale, diags);
        Ok(Value::from_integer(sum).with_form(form).with_relocation(relocation))
    }

    pub fn subtract(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Value, ValueError> {
        let negated = other.negate(mode, locale, diags)?;
        self.add(&negated, mode, locale, diags)
    }

    pub fn negate(&self, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Value, ValueError> {
        match &self.kind {
            ValueKind::FloatingPoint(f) => Ok(Value::float(-f).with_flagged(self.flagged)),
            ValueKind::Integer(_) | ValueKind::String(_) => {
                let iv = self.to_integer(mode, locale, diags)?;
                Ok(Value::from_integer(iv.negate())
                    .with_flagged(self.flagged)
                    .with_form(self.form.clone())
                    .with_signed(Signed::Negative))
            }
            _ => Err(ValueError::TypeMismatch),
        }
    }

    pub fn multiply(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Value, ValueError> {
        if !self.is_arithmetic() || !other.is_arithmetic() {
            return Err(ValueError::TypeMismatch);
        }
        if self.is_float() || other.is_float() {
            return Ok(Value::float(self.to_float()? * other.to_float()?));
        }

        let (left, right) = self.integer_operands(other, mode, locale, diags)?;
        let product = left.value.multiply(&right.value);
        if product.overflow {
            diags.append(Diagnostic::truncation(locale, "Result of multiplication too large"));
        }
        Ok(Value::from_integer(IntegerValue::new(product.value)))
    }

    /// Returns (quotient, remainder, covered quotient).
    pub fn divide(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<(Value, Value, Value), ValueError> {
        if !self.is_arithmetic() || !other.is_arithmetic() {
            return Err(ValueError::TypeMismatch);
        }
        if self.is_float() || other.is_float() {
            let divisor = other.to_float()?;
            if divisor == 0.0 {
                return Err(ValueError::DivisionByZero);
            }
            let quotient = Value::float(self.to_float()? / divisor);
            return Ok((quotient.clone(), Value::float(0.0), quotient));
        }

        let (left, right) = self.integer_operands(other, mode, locale, diags)?;
        let (quotient, remainder) = match left.value.divide(&right.value) {
            Some(result) => result,
            None => return Err(ValueError::DivisionByZero),
        };
        let covered = if remainder.is_zero() {
            quotient
        } else if left.value.is_negative() == right.value.is_negative() {
            quotient.add(&DoubleWord36::from_i64(1)).value
        } else {
            quotient.add(&DoubleWord36::from_i64(-1)).value
        };
        Ok((
            Value::from_integer(IntegerValue::new(quotient)),
            Value::from_integer(IntegerValue::new(remainder)),
            Value::from_integer(IntegerValue::new(covered)),
        ))
    }

    pub fn and(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Value, ValueError> {
        self.logical(other, mode, locale, diags, |a, b| a.and(b))
    }

    pub fn or(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Value, ValueError> {
        self.logical(other, mode, locale, diags, |a, b| a.or(b))
    }

    pub fn xor(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Value, ValueError> {
        self.logical(other, mode, locale, diags, |a, b| a.xor(b))
    }

    pub fn not(&self, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Value, ValueError> {
        if self.is_float() || !self.is_arithmetic() {
            return Err(ValueError::TypeMismatch);
        }
        let iv = self.to_integer(mode, locale, diags)?;
        if iv.has_references() {
            diags.append(Diagnostic::relocation(locale));
        }
        Ok(Value::from_integer(IntegerValue::new(iv.value.not())))
    }

    /// Logical shift of the left operand; a negative count shifts right.
    pub fn shift(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Value, ValueError> {
        if self.is_float() || other.is_float() || !self.is_arithmetic() || !other.is_arithmetic() {
            return Err(ValueError::TypeMismatch);
        }
        let (left, right) = self.integer_operands(other, mode, locale, diags)?;
        let count = right.value.to_i64().unwrap_or(72);
        Ok(Value::from_integer(IntegerValue::new(left.value.shift(count))))
    }

    /// String concatenation. The result takes the left operand's mode.
    pub fn concatenate(&self, other: &Value) -> Result<Value, ValueError> {
        let left = self.to_string_value()?;
        let right = other.to_string_value()?;
        let mut text = left.value.clone();
        text.push_str(&right.value);
        Ok(Value::string(text, left.mode))
    }

    /// Ordering for the relational operators.
    pub fn compare(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<Ordering, ValueError> {
        match (&self.kind, &other.kind) {
            (ValueKind::String(a), ValueKind::String(b)) => Ok(a.value.cmp(&b.value)),
            (ValueKind::FloatingPoint(_), _) | (_, ValueKind::FloatingPoint(_)) => {
                let a = self.to_float()?;
                let b = other.to_float()?;
                a.partial_cmp(&b).ok_or(ValueError::TypeMismatch)
            }
            _ if self.is_arithmetic() && other.is_arithmetic() => {
                if self.form != other.form {
                    return Err(ValueError::FormMismatch);
                }
                if self.relocation != other.relocation {
                    return Err(ValueError::RelocationMismatch);
                }
                let a = self.to_integer(mode, locale, diags)?;
                let b = other.to_integer(mode, locale, diags)?;
                if a.references != b.references {
                    return Err(ValueError::RelocationMismatch);
                }
                Ok(a.value.to_i128().cmp(&b.value.to_i128()))
            }
            _ => Err(ValueError::TypeMismatch),
        }
    }

    fn integer_operands(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics) -> Result<(IntegerValue, IntegerValue), ValueError> {
        if self.form.is_some() || other.form.is_some() {
            diags.append(Diagnostic::form(locale));
        }
        let left = self.to_integer(mode, locale, diags)?;
        let right = other.to_integer(mode, locale, diags)?;
        if left.has_references() || right.has_references() {
            diags.append(Diagnostic::relocation(locale));
        }
        Ok((left, right))
    }

    fn logical<F>(&self, other: &Value, mode: CharacterMode, locale: Locale, diags: &mut Diagnostics, op: F) -> Result<Value, ValueError>
    where
        F: Fn(&DoubleWord36, &DoubleWord36) -> DoubleWord36,
    {
        if self.is_float() || other.is_float() || !self.is_arithmetic() || !other.is_arithmetic() {
            return Err(ValueError::TypeMismatch);
        }
        let form = if self.form == other.form {
            self.form.clone()
        } else {
            diags.append(Diagnostic::form(locale));
            None
        };
        let left = self.to_integer(mode, locale, diags)?;
        let right = other.to_integer(mode, locale, diags)?;
        let mut references = Vec::new();
        if left.has_references() || right.has_references() {
            diags.append(Diagnostic::relocation(locale));
            references.extend(left.references.iter().cloned());
            references.extend(right.references.iter().cloned());
        }
        let result = IntegerValue::with_references(op(&left.value, &right.value), references);
        Ok(Value::from_integer(result).with_form(form))
    }
}

/// Integer addition. With matching forms the sum is taken field by field,
/// each field a signed one's-complement quantity of its own width.
fn add_integers(
    left: &IntegerValue,
    left_form: Option<&Form>,
    right: &IntegerValue,
    right_form: Option<&Form>,
    locale: Locale,
    diags: &mut Diagnostics,
) -> (IntegerValue, Option<Form>) {
    let mut result_form = left_form.cloned();
    let mut ignore_reference_fields = false;
    if left_form != right_form && left_form.is_some() && right_form.is_some() {
        diags.append(Diagnostic::form(locale));
        if left.has_references() || right.has_references() {
            diags.append(Diagnostic::relocation(locale));
            ignore_reference_fields = true;
        }
        result_form = None;
    } else if result_form.is_none() {
        result_form = right_form.cloned();
    }

    let value = match (&result_form, left_form == right_form) {
        (Some(form), true) => {
            let left_word = left.value.to_word();
            let right_word = right.value.to_word();
            let mut word = 0u64;
            for fd in form.field_descriptors() {
                let sum = word36::add(fd.sign_extend(fd.extract(left_word)), fd.sign_extend(fd.extract(right_word)));
                let low = sum.value & fd.mask();
                if sum.overflow || fd.sign_extend(low) != sum.value {
                    diags.append(Diagnostic::truncation(locale, format!("Result of addition is truncated in field {}", fd)));
                }
                word |= low << fd.shift();
            }
            DoubleWord36::from_word(word)
        }
        _ => {
            let sum = left.value.add(&right.value);
            if sum.overflow {
                diags.append(Diagnostic::truncation(locale, "Result of addition is truncated"));
            }
            sum.value
        }
    };

    let mut references: Vec<UndefinedReference> = Vec::new();
    for reference in left.references.iter().chain(right.references.iter()) {
        if ignore_reference_fields {
            references.push(reference.with_field(FieldDescriptor::W));
        } else {
            references.push(reference.clone());
        }
    }
    (IntegerValue::with_references(value, coalesce(references)), result_form)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.flagged {
            write!(f, "*")?;
        }
        if let Some(form) = &self.form {
            write!(f, "{}", form)?;
        }
        match &self.kind {
            ValueKind::Integer(iv) => write!(f, "{}", iv),
            ValueKind::FloatingPoint(v) => write!(f, "{}", v),
            ValueKind::String(sv) => write!(f, "'{}'", sv.value),
            ValueKind::Node(node) => {
                let entries: Vec<String> = node.entries.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "[{}]", entries.join(","))
            }
            ValueKind::Procedure(proc) => write!(f, "<proc {}>", proc.name),
            ValueKind::Form(form) => write!(f, "<form {}>", form),
            ValueKind::Directive(name) => write!(f, "<directive {}>", name),
            ValueKind::BuiltInFunction(name) => write!(f, "<function {}>", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Locale {
        Locale::new(1, 1)
    }

    #[test]
    fn test_integer_add_and_subtract() {
        let mut diags = Diagnostics::new();
        let a = Value::integer(10);
        let b = Value::integer(-3);
        let sum = a.add(&b, CharacterMode::Ascii, loc(), &mut diags).unwrap();
        assert_eq!(sum.as_integer().unwrap().to_i64(), Some(7));
        let diff = a.subtract(&b, CharacterMode::Ascii, loc(), &mut diags).unwrap();
        assert_eq!(diff.as_integer().unwrap().to_i64(), Some(13));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_references_cancel_on_subtract() {
        let mut diags = Diagnostics::new();
        let a = Value::from_integer(IntegerValue::with_references(
            DoubleWord36::from_i64(5),
            vec![UndefinedReference::to_label("FOO")],
        ));
        let b = Value::from_integer(IntegerValue::with_references(
            DoubleWord36::from_i64(2),
            vec![UndefinedReference::to_label("FOO")],
        ));
        let diff = a.subtract(&b, CharacterMode::Ascii, loc(), &mut diags).unwrap();
        let iv = diff.as_integer().unwrap();
        assert_eq!(iv.to_i64(), Some(3));
        assert!(iv.references.is_empty());
    }

    #[test]
    fn test_add_with_form() {
        let mut diags = Diagnostics::new();
        let form = Form::new(vec![18, 18]).unwrap();
        let a = Value::from_integer(IntegerValue::new(DoubleWord36::from_word(0o000001_000002))).with_form(Some(form.clone()));
        let b = Value::from_integer(IntegerValue::new(DoubleWord36::from_word(0o000003_777776))).with_form(Some(form.clone()));
        let sum = a.add(&b, CharacterMode::Ascii, loc(), &mut diags).unwrap();
        // 2 + (-1) in the low half does not carry into the high half.
        assert_eq!(sum.as_integer().unwrap().word(), 0o000004_000001);
        assert_eq!(sum.form, Some(form));
        assert!(diags.is_empty());
    }

    #[test]
    fn test_mismatched_types() {
        let mut diags = Diagnostics::new();
        let a = Value::integer(1);
        let p = Value::directive("$EQU");
        assert_eq!(a.add(&p, CharacterMode::Ascii, loc(), &mut diags), Err(ValueError::TypeMismatch));
        assert_eq!(
            Value::string("A", CharacterMode::Ascii).concatenate(&a),
            Err(ValueError::TypeMismatch)
        );
    }

    #[test]
    fn test_compare_relocation() {
        let mut diags = Diagnostics::new();
        let a = Value::from_integer(IntegerValue::with_references(
            DoubleWord36::from_i64(5),
            vec![UndefinedReference::to_location_counter(1)],
        ));
        let b = Value::integer(5);
        assert_eq!(
            a.compare(&b, CharacterMode::Ascii, loc(), &mut diags),
            Err(ValueError::RelocationMismatch)
        );
        assert_eq!(
            Value::integer(4).compare(&b, CharacterMode::Ascii, loc(), &mut diags),
            Ok(Ordering::Less)
        );
    }

    #[test]
    fn test_divide() {
        let mut diags = Diagnostics::new();
        let (q, r, c) = Value::integer(17)
            .divide(&Value::integer(5), CharacterMode::Ascii, loc(), &mut diags)
            .unwrap();
        assert_eq!(q.as_integer().unwrap().to_i64(), Some(3));
        assert_eq!(r.as_integer().unwrap().to_i64(), Some(2));
        assert_eq!(c.as_integer().unwrap().to_i64(), Some(4));
        assert_eq!(
            Value::integer(1).divide(&Value::integer(0), CharacterMode::Ascii, loc(), &mut diags),
            Err(ValueError::DivisionByZero)
        );
    }

    #[test]
    fn test_string_words() {
        let a = StringValue::new("A", CharacterMode::Ascii);
        assert_eq!(a.words(Precision::None, CharacterMode::Ascii), (vec![0o101_040_040_040], false));
        let right = StringValue { justification: Justification::Right, ..a.clone() };
        assert_eq!(right.words(Precision::None, CharacterMode::Ascii).0, vec![0o000_000_000_101]);
        assert_eq!(
            a.words(Precision::Double, CharacterMode::Ascii).0,
            vec![0o101_040_040_040, 0o040_040_040_040]
        );
        assert_eq!(right.words(Precision::Double, CharacterMode::Ascii).0, vec![0, 0o101]);

        let fd = StringValue::new("A", CharacterMode::Fieldata);
        assert_eq!(fd.words(Precision::None, CharacterMode::Ascii).0, vec![0o06_05_05_05_05_05]);
        let fd_right = StringValue { justification: Justification::Right, ..fd };
        assert_eq!(fd_right.words(Precision::None, CharacterMode::Ascii).0, vec![0o06]);

        let long = StringValue::new("ABCDEFGHI", CharacterMode::Ascii);
        let (words, truncated) = long.words(Precision::Single, CharacterMode::Ascii);
        assert_eq!(words, vec![0o101_102_103_104]);
        assert!(truncated);
    }

    #[test]
    fn test_generate_double_precision() {
        let small = IntegerValue::from_i64(-5);
        assert!(!small.generate_double_precision(Precision::None));
        assert!(small.generate_double_precision(Precision::Double));
        let big = IntegerValue::new(DoubleWord36::from_i128(1i128 << 40).value);
        assert!(big.generate_double_precision(Precision::None));
        assert!(!big.generate_double_precision(Precision::Single));
    }

    #[test]
    fn test_form_layout() {
        let form = Form::new(vec![6, 6]).unwrap();
        assert_eq!(
            form.field_descriptors(),
            vec![FieldDescriptor::new(24, 6), FieldDescriptor::new(30, 6)]
        );
        assert!(Form::new(vec![30, 7]).is_err());
        assert!(Form::new(vec![0]).is_err());
        assert_eq!(Form::even(5).unwrap().field_sizes(), &[7, 7, 7, 7, 7]);
    }
}
