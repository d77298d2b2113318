//! The Assembler module is in charge of taking lines of
//! source and producing a `RelocatableModule`.
//!
//! Each line is split into fields, its label interpreted, and the operation
//! dispatched to a procedure, form, directive, instruction mnemonic or data
//! generation. Once the source is consumed, references to labels defined
//! later in the module are resolved and the module is assembled from the
//! generated pools and the module-global labels.

pub mod context;
pub mod diagnostic;
pub mod dictionary;
pub mod directives;
pub mod functions;
pub mod instruction;
pub mod lexer;
pub mod module;
pub mod parser;
pub mod reference;
pub mod value;

use context::Context;
use diagnostic::{Diagnostic, Diagnostics, Level, Locale};
use dictionary::{compile_once, is_valid_user_label, Dictionary};
use instruction::{base_register_allowed, j_field_for, CodeMode, InstructionInfo, MnemonicTable, StandardMnemonicTable, WordLayout};
use lexer::{source_lines, split_line, SourceLine, TextField, TextLine, TextSubfield};
use module::{ModeFlags, RelocatableModule};
use parser::evaluate;
use reference::{coalesce, SpecialTarget, UndefinedReference};
use value::{Form, IntegerValue, NodeKey, NodeValue, Precision, ProcedureValue, Value, ValueKind};

use crate::word36::{self, DoubleWord36, FieldDescriptor};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use term_grid::{Cell, Direction, Filling, Grid, GridOptions};

/// Listings the assembler writes to the log once a module is produced.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AssemblerOption {
    EmitDictionary,
    EmitGeneratedCode,
    EmitModuleSummary,
    EmitSource,
}

/// What the label field of a line asked for.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LabelFieldComponents {
    pub lc_index: Option<u32>,
    pub label: Option<String>,
    /// Count of trailing asterisks: the scope level to bind the label at.
    pub level: usize,
    pub locale: Locale,
}

impl LabelFieldComponents {
    pub fn empty(locale: Locale) -> Self {
        LabelFieldComponents { lc_index: None, label: None, level: 0, locale }
    }
}

/// A cursor over the lines being assembled, shared with directives which
/// consume lines of their own.
pub struct LineSource<'s> {
    lines: &'s [SourceLine],
    next: usize,
    end_found: bool,
}

impl<'s> LineSource<'s> {
    pub fn new(lines: &'s [SourceLine]) -> Self {
        LineSource { lines, next: 0, end_found: false }
    }

    pub fn next_line(&mut self) -> Option<SourceLine> {
        let line = self.lines.get(self.next)?.clone();
        self.next += 1;
        Some(line)
    }

    pub fn mark_end(&mut self) {
        self.end_found = true;
    }

    pub fn end_found(&self) -> bool {
        self.end_found
    }
}

// Field indexes within a split line.
const LABEL: usize = 0;
const OPERATION: usize = 1;
const OPERAND: usize = 2;

const MAX_LC_INDEX: u32 = 63;
const MAX_PROCEDURE_DEPTH: usize = 64;
// Bound on chains of label references followed during fixup.
const MAX_REFERENCE_DEPTH: usize = 16;

/// Binds a label in the dictionary, refusing a second binding at the same
/// level.
pub(crate) fn establish_label(ctx: &mut Context, locale: Locale, label: &str, level: usize, value: Value) {
    if ctx.dictionary.has_value_at(level, label) {
        ctx.post(Diagnostic::duplicate(locale, label));
        return;
    }
    debug!("label {} (level {}) = {}", label.to_uppercase(), level, value);
    ctx.dictionary.add_value(level, label, value);
}

fn establish_at_current_location(ctx: &mut Context, labels: &LabelFieldComponents) {
    if let Some(label) = labels.label.as_deref() {
        let here = ctx.current_location();
        establish_label(ctx, labels.locale, label, labels.level, here);
    }
}

fn location_counter_selector() -> Option<&'static Regex> {
    static SELECTOR: OnceLock<Option<Regex>> = OnceLock::new();
    compile_once(&SELECTOR, r"^\$\((\d{1,3})\)")
}

/// Splits the label field into an optional `$(n)` location counter
/// selector and an optional label with its trailing `:` and level
/// asterisks removed. The selector may be written directly before the
/// label or as a subfield of its own, as in `$(1),START$*`.
fn interpret_label_field(ctx: &mut Context, line: &TextLine) -> LabelFieldComponents {
    let field = match line.field(LABEL) {
        Some(field) => field,
        None => return LabelFieldComponents::empty(Locale::new(line.number, 1)),
    };
    let mut components = LabelFieldComponents::empty(field.locale);

    let mut next = 1;
    let mut text = field.subfields.get(0).map(|sf| sf.text.as_str()).unwrap_or("");
    let mut label_locale = field.subfields.get(0).map(|sf| sf.locale).unwrap_or(field.locale);
    let selector = location_counter_selector().and_then(|re| re.captures(text));
    if let Some(captures) = selector {
        let whole = captures.get(0).map(|m| m.as_str()).unwrap_or("");
        match captures.get(1).and_then(|m| m.as_str().parse::<u32>().ok()) {
            Some(lc_index) if lc_index <= MAX_LC_INDEX => components.lc_index = Some(lc_index),
            _ => ctx.post(Diagnostic::error(label_locale, "Illegal location counter index")),
        }
        text = &text[whole.len()..];
        label_locale = label_locale.offset(whole.len());
        if text.is_empty() {
            if let Some(sf) = field.subfields.get(1) {
                text = sf.text.as_str();
                label_locale = sf.locale;
                next = 2;
            }
        }
    }
    if let Some(extra) = field.subfields.get(next) {
        ctx.post(Diagnostic::error(extra.locale, "Extraneous subfields in label field ignored"));
    }

    let text = text.strip_suffix(':').unwrap_or(text);
    let label = text.trim_end_matches('*');
    if label.is_empty() {
        if !text.is_empty() {
            ctx.post(Diagnostic::error(label_locale, "Invalid label"));
        }
        return components;
    }
    if !is_valid_user_label(label) {
        ctx.post(Diagnostic::error(label_locale, format!("Invalid label {}", label)));
        return components;
    }
    components.label = Some(label.to_uppercase());
    components.level = text.len() - label.len();
    components.locale = label_locale;
    components
}

/// Assembles lines from `source` until it runs out, `$END` is seen, or a
/// fatal diagnostic is posted. Top level lines also set the line number
/// generated words are attributed to.
fn assemble_lines(ctx: &mut Context, source: &mut LineSource, top_level: bool) {
    while let Some(line) = source.next_line() {
        if top_level {
            ctx.line_number = line.number;
        }
        if source.end_found() {
            if !split_line(&line).fields.is_empty() {
                ctx.post(Diagnostic::error(Locale::new(line.number, 1), "Label and/or code follows $END directive"));
            }
            continue;
        }
        assemble_line(ctx, source, &line);
        if ctx.diagnostics.has_fatal() {
            break;
        }
    }
}

fn assemble_line(ctx: &mut Context, source: &mut LineSource, line: &SourceLine) {
    let text = split_line(line);
    for diagnostic in text.diagnostics.iter() {
        ctx.post(diagnostic.clone());
    }
    if text.fields.is_empty() {
        return;
    }

    let labels = interpret_label_field(ctx, &text);
    let operation = match text.field(OPERATION) {
        Some(operation) if operation.subfield(0).is_some() => operation,
        _ => {
            if let Some(lc_index) = labels.lc_index {
                ctx.current_lc = lc_index;
            }
            establish_at_current_location(ctx, &labels);
            return;
        }
    };
    let name = operation.subfields[0].text.to_uppercase();

    let entry = ctx.dictionary.get_value(&name).ok().cloned();
    let selects_literal_pool = matches!(&entry, Some(Value { kind: ValueKind::Directive(d), .. }) if d == "$LIT");
    if let Some(lc_index) = labels.lc_index {
        if !selects_literal_pool {
            ctx.current_lc = lc_index;
        }
    }

    if let Some(entry) = entry {
        match &entry.kind {
            ValueKind::Procedure(procedure) => invoke_procedure(ctx, &labels, &text, procedure),
            ValueKind::Form(form) => process_form(ctx, &labels, &text, form),
            ValueKind::Directive(directive) => match directives::lookup(directive) {
                Some(handler) => handler(ctx, source, &labels, &text),
                None => ctx.post(Diagnostic::fatal(operation.locale, format!("No handler for directive {}", directive))),
            },
            _ => ctx.post(Diagnostic::error(
                operation.locale,
                format!("Dictionary value '{}' used incorrectly", name),
            )),
        }
        return;
    }

    if process_mnemonic(ctx, &labels, &text) {
        if let Some(extra) = text.fields.get(3) {
            ctx.post(Diagnostic::error(extra.locale, "Extraneous fields ignored"));
        }
        return;
    }

    if process_data_generation(ctx, &labels, operation) {
        if let Some(extra) = text.fields.get(OPERAND) {
            ctx.post(Diagnostic::error(extra.locale, "Extraneous fields ignored"));
        }
        return;
    }

    ctx.post(Diagnostic::error(Locale::new(text.number, 1), "Unrecognizable source code"));
}

/// Runs a procedure body in a child scope. The scope holds a Node named
/// after the procedure: entry `(0,0)` is the procedure name as written,
/// `(0,n)` the remaining operation subfields, and `(f,s)` subfield `s` of
/// operand field `f`, evaluated in the invoking scope.
fn invoke_procedure(ctx: &mut Context, labels: &LabelFieldComponents, line: &TextLine, procedure: &ProcedureValue) {
    establish_at_current_location(ctx, labels);
    if ctx.dictionary.depth() > MAX_PROCEDURE_DEPTH {
        ctx.post(Diagnostic::fatal(labels.locale, "Procedure nesting too deep"));
        return;
    }

    let mut arguments = NodeValue::new();
    for (fx, field) in line.fields.iter().enumerate().skip(OPERATION) {
        let mut entries = NodeValue::new();
        for (sfx, subfield) in field.subfields.iter().enumerate() {
            let key = NodeKey::Integer(sfx as i64);
            if fx == OPERATION && sfx == 0 {
                entries.insert(key, Value::string(subfield.text.clone(), ctx.character_mode));
                continue;
            }
            match evaluate(ctx, &subfield.text, subfield.locale) {
                Ok(Some(value)) => entries.insert(key, value),
                Ok(None) => {}
                Err(_) => entries.insert(key, Value::integer(0)),
            }
        }
        arguments.insert(NodeKey::Integer((fx - OPERATION) as i64), Value::node(entries));
    }

    debug!("invoking procedure {}", procedure.name);
    ctx.dictionary.push_scope();
    ctx.dictionary.add_value(0, &procedure.name, Value::node(arguments));
    let mut body = LineSource::new(&procedure.lines);
    assemble_lines(ctx, &mut body, false);
    ctx.dictionary.pop_scope();
}

/// Packs one Integer operand per field of a form into a word.
fn process_form(ctx: &mut Context, labels: &LabelFieldComponents, line: &TextLine, form: &Form) {
    let operand = line.field(OPERAND).cloned();
    let subfields = operand.as_ref().map(|f| f.subfields.clone()).unwrap_or_default();
    let locale = operand.as_ref().map(|f| f.locale).unwrap_or(labels.locale);

    let mut values = Vec::with_capacity(subfields.len());
    let mut failed = false;
    for subfield in subfields.iter() {
        match evaluate(ctx, &subfield.text, subfield.locale) {
            Ok(Some(value)) => match value.kind {
                ValueKind::Integer(iv) => {
                    if value.form.is_some() {
                        ctx.post(Diagnostic::new(Level::Form, subfield.locale, "Form not allowed"));
                    }
                    values.push(iv);
                }
                _ => {
                    ctx.post(Diagnostic::value(subfield.locale, "Wrong value type"));
                    failed = true;
                }
            },
            Ok(None) => {
                ctx.post(Diagnostic::error(subfield.locale, "Syntax error"));
                failed = true;
            }
            Err(_) => failed = true,
        }
    }
    if form.field_count() != subfields.len() {
        ctx.post(Diagnostic::new(Level::Form, locale, "Wrong number of operands for form"));
        failed = true;
    }
    if failed {
        return;
    }

    establish_at_current_location(ctx, labels);
    let lc_index = ctx.current_lc;
    ctx.generate(lc_index, form, &values, locale);
}

/// Evaluates an instruction operand which must be an Integer. `None` means
/// the subfield was absent or a diagnostic has been posted.
fn integer_operand(ctx: &mut Context, subfield: Option<&TextSubfield>) -> Option<Value> {
    let subfield = subfield?;
    match evaluate(ctx, &subfield.text, subfield.locale) {
        Ok(Some(value)) => match value.kind {
            ValueKind::Integer(_) => Some(value),
            _ => {
                ctx.post(Diagnostic::value(subfield.locale, "Wrong value type"));
                None
            }
        },
        Ok(None) => {
            ctx.post(Diagnostic::error(subfield.locale, "Syntax error"));
            None
        }
        Err(_) => None,
    }
}

fn integer_of(value: &Option<Value>) -> IntegerValue {
    value.as_ref().and_then(|v| v.as_integer()).cloned().unwrap_or_default()
}

fn flag_of(value: &Option<Value>) -> IntegerValue {
    IntegerValue::from_i64(if value.as_ref().map(|v| v.flagged).unwrap_or(false) { 1 } else { 0 })
}

fn mnemonic_info(ctx: &mut Context, subfield: &TextSubfield) -> Option<InstructionInfo> {
    let table = ctx.mnemonics();
    let mode = ctx.code_mode;
    if let Some(info) = table.lookup(&subfield.text, mode) {
        return Some(*info);
    }
    let other = match mode {
        CodeMode::Basic => CodeMode::Extended,
        CodeMode::Extended => CodeMode::Basic,
    };
    let info = *table.lookup(&subfield.text, other)?;
    ctx.post(Diagnostic::error(subfield.locale, "Opcode not valid for the current code mode"));
    Some(info)
}

fn j_field(ctx: &mut Context, info: &InstructionInfo, operation: &TextField) -> u64 {
    if info.j_flag {
        if let Some(extra) = operation.subfields.get(1) {
            ctx.post(Diagnostic::error(extra.locale, "Extraneous subfields in operation field"));
        }
        return info.j_field;
    }
    let subfield = match operation.subfield(1) {
        Some(subfield) => subfield,
        None => return 0,
    };
    if let Some(extra) = operation.subfields.get(2) {
        ctx.post(Diagnostic::error(extra.locale, "Extraneous subfields in operation field"));
    }
    if let Some(j) = j_field_for(&subfield.text) {
        return j;
    }
    let value = integer_operand(ctx, Some(subfield));
    match integer_of(&value).to_i64() {
        Some(j) if (0..=0o17).contains(&j) => j as u64,
        _ => {
            if value.is_some() {
                ctx.post(Diagnostic::value(subfield.locale, "Invalid j-field value"));
            }
            0
        }
    }
}

/// Generates one instruction word if the operation names a mnemonic.
fn process_mnemonic(ctx: &mut Context, labels: &LabelFieldComponents, line: &TextLine) -> bool {
    let operation = match line.field(OPERATION) {
        Some(operation) => operation,
        None => return false,
    };
    let info = match mnemonic_info(ctx, &operation.subfields[0]) {
        Some(info) => info,
        None => return false,
    };
    let operand = match line.field(OPERAND) {
        Some(operand) => operand,
        None => {
            ctx.post(Diagnostic::error(operation.locale, "Instruction mnemonic requires an operand field"));
            return true;
        }
    };
    establish_at_current_location(ctx, labels);

    let mode = ctx.code_mode;
    let j = j_field(ctx, &info, operation);
    let base_allowed = base_register_allowed(&info, j, mode);

    // Register, value, index and base subfields, in that order. The
    // register is absent when the a-field is fixed.
    let mut slots: [Option<&TextSubfield>; 4] = [None; 4];
    let mut next = 0;
    for (slot, present) in [!info.a_flag, true, true, base_allowed].iter().enumerate() {
        if *present && next < operand.subfield_count() {
            slots[slot] = operand.subfield(next);
            next += 1;
        }
    }
    let [register_sf, value_sf, index_sf, base_sf] = slots;
    if let Some(extra) = operand.subfields.get(next) {
        ctx.post(Diagnostic::error(extra.locale, "Extraneous subfields in operand field ignored"));
    }

    let a = if info.a_flag {
        IntegerValue::from_i64(info.a_field as i64)
    } else {
        if register_sf.is_none() {
            ctx.post(Diagnostic::error(operand.locale, "Missing register specification"));
        }
        let offset = DoubleWord36::from_i64(info.a_semantics.a_field(0));
        match integer_operand(ctx, register_sf).as_ref().and_then(|v| v.as_integer()) {
            Some(register) => IntegerValue::with_references(register.value.add(&offset).value, register.references.clone()),
            None => IntegerValue::default(),
        }
    };

    if value_sf.is_none() {
        ctx.post(Diagnostic::error(operand.locale, "Missing operand value (U, u, or d subfield)"));
    }
    let u_value = integer_operand(ctx, value_sf);
    let x_value = integer_operand(ctx, index_sf);
    let b_value = integer_operand(ctx, base_sf);

    let layout = WordLayout::select(&info, j, mode);
    let form = match layout.form() {
        Ok(form) => form,
        Err(message) => {
            ctx.post(Diagnostic::fatal(operation.locale, message));
            return true;
        }
    };

    // An operand bound by $EQUF carries the word's own layout; its fields
    // merge into the instruction instead of filling the u-field.
    let merged = match u_value.as_ref().and_then(|v| v.form.as_ref()) {
        Some(u_form) if *u_form == form => u_value.as_ref().and_then(|v| v.as_integer()).cloned(),
        Some(_) => {
            let locale = value_sf.map(|sf| sf.locale).unwrap_or(operand.locale);
            ctx.post(Diagnostic::form(locale));
            None
        }
        None => None,
    };
    let u = if merged.is_some() { IntegerValue::default() } else { integer_of(&u_value) };

    let f = IntegerValue::from_i64(info.f_field as i64);
    let jv = IntegerValue::from_i64(j as i64);
    let x = integer_of(&x_value);
    let mut values = match layout {
        WordLayout::Fjaxu => vec![f, jv, a, x, u],
        WordLayout::Fjaxhiu => vec![f, jv, a, x, flag_of(&x_value), flag_of(&u_value), u],
        WordLayout::Fjaxhibd => {
            let b = integer_of(&b_value);
            let (i, b) = match b.to_i64() {
                Some(n) if n > 0o17 => (IntegerValue::from_i64(1), IntegerValue::from_i64(n & 0o17)),
                _ => (flag_of(&u_value), b),
            };
            vec![f, jv, a, x, flag_of(&x_value), i, b, u]
        }
    };

    if let Some(merged) = merged {
        let word = merged.word();
        for (index, fd) in form.field_descriptors().into_iter().enumerate() {
            // f and a come from the instruction alone.
            if index == 0 || index == 2 {
                continue;
            }
            let bits = DoubleWord36::from_i64(fd.extract(word) as i64);
            values[index].value = values[index].value.or(&bits);
        }
        let last = values.len() - 1;
        values[last].references.extend(merged.references);
    }

    trace!("{} j={:02o} layout {:?}", info, j, layout);
    let lc_index = ctx.current_lc;
    ctx.generate(lc_index, &form, &values, operation.locale);
    true
}

/// Treats the operation field as data: a string, a floating point value,
/// or up to 36 integers sharing one word.
fn process_data_generation(ctx: &mut Context, labels: &LabelFieldComponents, operation: &TextField) -> bool {
    let first_sf = &operation.subfields[0];
    let first = match evaluate(ctx, &first_sf.text, first_sf.locale) {
        Ok(Some(value)) => value,
        Ok(None) => return false,
        Err(_) => return true,
    };
    establish_at_current_location(ctx, labels);
    let lc_index = ctx.current_lc;
    let count = operation.subfield_count();

    match &first.kind {
        ValueKind::FloatingPoint(f) => {
            if count > 1 {
                ctx.post(Diagnostic::error(operation.subfields[1].locale, "Too many subfields for data generation"));
            }
            let words = if first.precision == Precision::Double {
                word36::float_to_double_word(*f).map(|dw| vec![dw.high(), dw.low()])
            } else {
                word36::float_to_word(*f).map(|w| vec![w])
            };
            match words {
                Ok(words) => {
                    for word in words {
                        ctx.generate_word(lc_index, IntegerValue::new(DoubleWord36::from_word(word)));
                    }
                }
                Err(err) => ctx.post(Diagnostic::value(first_sf.locale, err.to_string())),
            }
        }
        ValueKind::String(sv) => {
            if count > 1 {
                ctx.post(Diagnostic::error(operation.subfields[1].locale, "Too many subfields for data generation"));
            }
            let (words, truncated) = sv.words(first.precision, ctx.character_mode);
            if truncated {
                ctx.post(Diagnostic::truncation(first_sf.locale, "String truncated"));
            }
            for word in words {
                ctx.generate_word(lc_index, IntegerValue::new(DoubleWord36::from_word(word)));
            }
        }
        ValueKind::Integer(iv) if count == 1 => {
            if iv.generate_double_precision(first.precision) {
                ctx.generate_word(lc_index, IntegerValue::new(DoubleWord36::from_word(iv.value.high())));
                ctx.generate_word(
                    lc_index,
                    IntegerValue::with_references(DoubleWord36::from_word(iv.value.low()), iv.references.clone()),
                );
            } else {
                match Form::even(1) {
                    Ok(form) => {
                        ctx.generate(lc_index, &form, &[iv.clone()], first_sf.locale);
                    }
                    Err(message) => ctx.post(Diagnostic::fatal(first_sf.locale, message)),
                }
            }
        }
        ValueKind::Integer(iv) => {
            if count > 36 {
                ctx.post(Diagnostic::error(operation.locale, "Improper number of data fields"));
                return true;
            }
            let mut values = vec![iv.clone()];
            for subfield in operation.subfields.iter().skip(1) {
                match evaluate(ctx, &subfield.text, subfield.locale) {
                    Ok(Some(value)) => match value.kind {
                        ValueKind::Integer(iv) => values.push(iv),
                        _ => {
                            ctx.post(Diagnostic::value(subfield.locale, "Expected integer value"));
                            return true;
                        }
                    },
                    Ok(None) => values.push(IntegerValue::default()),
                    Err(_) => return true,
                }
            }
            match Form::even(count) {
                Ok(form) => {
                    ctx.generate(lc_index, &form, &values, operation.locale);
                }
                Err(message) => ctx.post(Diagnostic::error(operation.locale, message)),
            }
        }
        _ => ctx.post(Diagnostic::value(first_sf.locale, "Wrong value type for data generation")),
    }
    true
}

/// Folds references to labels defined in this module into `value`. Label
/// references that cannot be found, and every location counter reference,
/// are left for the linker.
fn resolve_value(dictionary: &Dictionary, value: &IntegerValue, locale: Locale, diagnostics: &mut Diagnostics) -> IntegerValue {
    let mut word = value.word();
    let mut kept = Vec::new();
    let mut pending: Vec<(UndefinedReference, usize)> = value.references.iter().map(|r| (r.clone(), 0)).collect();

    while let Some((reference, depth)) = pending.pop() {
        match &reference {
            UndefinedReference::ToLabel { label, is_negative, field } if depth < MAX_REFERENCE_DEPTH => {
                let found = match dictionary.get_value(label) {
                    Ok(found) => found,
                    Err(_) => {
                        kept.push(reference.clone());
                        continue;
                    }
                };
                let iv = match found.as_integer() {
                    Some(iv) => iv,
                    None => {
                        diagnostics.append(Diagnostic::value(locale, format!("Reference to non-integer label {}", label)));
                        continue;
                    }
                };
                let addend = match iv.to_i64() {
                    Some(n) if *is_negative => -n,
                    Some(n) => n,
                    None => {
                        diagnostics.append(Diagnostic::truncation(locale, format!("Value of {} too large for a word", label)));
                        iv.word() as i64
                    }
                };
                let integration = word36::integrate(word, *field, addend);
                if integration.truncated {
                    diagnostics.append(Diagnostic::truncation(locale, format!("Value of {} truncated in field {}", label, field)));
                }
                word = integration.value;
                for inner in iv.references.iter() {
                    let anchored = if inner.field() == FieldDescriptor::W { inner.with_field(*field) } else { inner.clone() };
                    let signed = if *is_negative { anchored.negated() } else { anchored };
                    pending.push((signed, depth + 1));
                }
            }
            UndefinedReference::Special { kind, target: Some(SpecialTarget::Label(label)), field } => {
                let lc_index = dictionary.get_value(label).ok().and_then(|v| v.as_integer()).and_then(|iv| {
                    match iv.references.as_slice() {
                        [UndefinedReference::ToLocationCounter { lc_index, .. }] => Some(*lc_index),
                        _ => None,
                    }
                });
                match lc_index {
                    Some(lc_index) => kept.push(UndefinedReference::Special {
                        kind: *kind,
                        target: Some(SpecialTarget::LocationCounter(lc_index)),
                        field: *field,
                    }),
                    None => kept.push(reference.clone()),
                }
            }
            _ => kept.push(reference.clone()),
        }
    }

    kept.reverse();
    IntegerValue::with_references(DoubleWord36::from_word(word), coalesce(kept))
}

/// The fixup pass over every generated word.
fn resolve_references(ctx: &mut Context) {
    let mut diagnostics = Diagnostics::new();
    for pool in ctx.pools.values_mut() {
        for word in pool.words.values_mut() {
            if !word.value.has_references() {
                continue;
            }
            let locale = Locale::new(word.line, 1);
            word.value = resolve_value(&ctx.dictionary, &word.value, locale, &mut diagnostics);
        }
    }
    for diagnostic in diagnostics.iter() {
        ctx.post(diagnostic.clone());
    }
}

/// Integer labels bound at the module-global level, with local references
/// folded in.
fn collect_exports(ctx: &mut Context) -> BTreeMap<String, IntegerValue> {
    let mut diagnostics = Diagnostics::new();
    let mut exports = BTreeMap::new();
    for (label, value) in ctx.dictionary.global_scope().iter() {
        if let Some(iv) = value.as_integer() {
            let resolved = if iv.has_references() {
                resolve_value(&ctx.dictionary, iv, Locale::new(0, 1), &mut diagnostics)
            } else {
                iv.clone()
            };
            exports.insert(label.clone(), resolved);
        }
    }
    for diagnostic in diagnostics.iter() {
        ctx.post(diagnostic.clone());
    }
    exports
}

fn dictionary_listing(dictionary: &Dictionary) -> String {
    let mut grid = Grid::new(GridOptions {
        filling: Filling::Spaces(2),
        direction: Direction::LeftToRight,
    });
    for (level, scope) in [(1, dictionary.global_scope()), (0, dictionary.scope(0))].iter() {
        for (label, value) in scope.iter() {
            grid.add(Cell::from(format!("{}{}", label, "*".repeat(*level))));
            grid.add(Cell::from(value.type_name().to_string()));
            grid.add(Cell::from(value.to_string()));
        }
    }
    grid.fit_into_columns(3).to_string()
}

fn source_listing(lines: &[SourceLine], diagnostics: &Diagnostics) -> String {
    let mut grid = Grid::new(GridOptions {
        filling: Filling::Spaces(1),
        direction: Direction::LeftToRight,
    });
    for line in lines.iter() {
        grid.add(Cell::from(format!("{:>5}:", line.number)));
        grid.add(Cell::from(line.text.clone()));
        for diagnostic in diagnostics.for_line(line.number) {
            grid.add(Cell::from(String::new()));
            grid.add(Cell::from(format!("  {}", diagnostic)));
        }
    }
    grid.fit_into_columns(2).to_string()
}

pub struct Assembler {
    mnemonics: Box<dyn MnemonicTable>,
    options: HashSet<AssemblerOption>,
    diagnostics: Diagnostics,
}

impl Default for Assembler {
    fn default() -> Self {
        Assembler::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Assembler::with_mnemonic_table(Box::new(StandardMnemonicTable::new()))
    }

    pub fn with_mnemonic_table(mnemonics: Box<dyn MnemonicTable>) -> Self {
        Assembler {
            mnemonics,
            options: HashSet::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn with_options(mut self, options: &[AssemblerOption]) -> Self {
        self.options.extend(options.iter().copied());
        self
    }

    /// Diagnostics from the most recent assembly, produced or not.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn assemble<S: AsRef<str>>(&mut self, module_name: &str, lines: &[S]) -> Option<RelocatableModule> {
        self.assemble_source(module_name, &source_lines(lines))
    }

    /// Assembles a whole module. `None` means a fatal diagnostic stopped
    /// the assembly; other diagnostics leave a module that callers should
    /// treat as suspect.
    pub fn assemble_source(&mut self, module_name: &str, lines: &[SourceLine]) -> Option<RelocatableModule> {
        info!("assembling module {} ({} lines)", module_name, lines.len());
        let mut ctx = Context::new(self.mnemonics.as_ref());
        let mut source = LineSource::new(lines);
        assemble_lines(&mut ctx, &mut source, true);

        if !ctx.diagnostics.has_fatal() {
            resolve_references(&mut ctx);
        }
        let module = if ctx.diagnostics.has_fatal() {
            None
        } else {
            let exports = collect_exports(&mut ctx);
            let pools = ctx.pools.iter().map(|(lc, pool)| (*lc, pool.to_location_counter_pool())).collect();
            let modes: ModeFlags = ctx.modes;
            match RelocatableModule::new(module_name, pools, exports, modes) {
                Ok(module) => Some(module),
                Err(message) => {
                    ctx.post(Diagnostic::fatal(Locale::new(0, 1), message));
                    None
                }
            }
        };

        if self.options.contains(&AssemblerOption::EmitSource) {
            info!("source listing:\n{}", source_listing(lines, &ctx.diagnostics));
        }
        if self.options.contains(&AssemblerOption::EmitDictionary) {
            info!("dictionary:\n{}", dictionary_listing(&ctx.dictionary));
        }
        if let Some(module) = module.as_ref() {
            if self.options.contains(&AssemblerOption::EmitGeneratedCode) {
                info!("generated code:\n{}", module.code_listing());
            }
            if self.options.contains(&AssemblerOption::EmitModuleSummary) {
                info!("{}", module.summary());
                info!("exports:\n{}", module.export_listing());
            }
        }

        for diagnostic in ctx.diagnostics.iter() {
            match diagnostic.level {
                Level::Fatal | Level::Error => warn!("{}", diagnostic),
                _ => info!("{}", diagnostic),
            }
        }
        match module.as_ref() {
            Some(_) => info!("module {} assembled with {} diagnostic(s)", module_name, ctx.diagnostics.len()),
            None => error!("assembly of module {} aborted", module_name),
        }

        self.diagnostics = ctx.diagnostics;
        module
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::reference::SpecialKind;

    fn assemble(lines: &[&str]) -> (Option<RelocatableModule>, Diagnostics) {
        let mut asm = Assembler::new();
        let module = asm.assemble("TEST", lines);
        (module, asm.diagnostics().clone())
    }

    fn word_at(module: &RelocatableModule, lc_index: u32, offset: usize) -> IntegerValue {
        module.pool(lc_index).unwrap().words[offset].as_ref().unwrap().value.clone()
    }

    #[test]
    fn test_single_data_line() {
        let mut asm = Assembler::new();
        let module = asm.assemble("TEST", &["$(0)X1: + 5"]).unwrap();
        assert!(asm.diagnostics().is_empty());
        assert_eq!(module.pool_size(0), 1);
        let word = word_at(&module, 0, 0);
        assert_eq!(word.word(), 5);
        assert!(!word.has_references());
        assert!(module.export("X1").is_none());

        let module = asm.assemble("TEST", &["$(0)X1*: + 5"]).unwrap();
        let x1 = module.export("X1").unwrap();
        assert_eq!(x1.word(), 0);
        assert_eq!(x1.references, vec![UndefinedReference::to_location_counter(0)]);
    }

    #[test]
    fn test_label_field() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        let line = split_line(&SourceLine::new(1, "$(3)TAG** + 1"));
        let labels = interpret_label_field(&mut ctx, &line);
        assert_eq!(labels.lc_index, Some(3));
        assert_eq!(labels.label.as_deref(), Some("TAG"));
        assert_eq!(labels.level, 2);

        let line = split_line(&SourceLine::new(2, "$(64) + 1"));
        assert_eq!(interpret_label_field(&mut ctx, &line).lc_index, None);
        let line = split_line(&SourceLine::new(3, "9BAD + 1"));
        assert_eq!(interpret_label_field(&mut ctx, &line).label, None);
        assert_eq!(ctx.diagnostics.count(Level::Error), 2);
    }

    #[test]
    fn test_label_field_selector_subfield() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        let line = split_line(&SourceLine::new(1, "$(1),START$* + 0"));
        let labels = interpret_label_field(&mut ctx, &line);
        assert_eq!(labels.lc_index, Some(1));
        assert_eq!(labels.label.as_deref(), Some("START$"));
        assert_eq!(labels.level, 1);
        assert!(ctx.diagnostics.is_empty());

        let line = split_line(&SourceLine::new(2, "$(1),TAG,MORE + 0"));
        assert_eq!(interpret_label_field(&mut ctx, &line).label.as_deref(), Some("TAG"));
        let line = split_line(&SourceLine::new(3, "TAG,MORE + 0"));
        assert_eq!(interpret_label_field(&mut ctx, &line).label.as_deref(), Some("TAG"));
        assert_eq!(ctx.diagnostics.count(Level::Error), 2);

        let (module, diags) = assemble(&["$(1),START$*  + 0"]);
        assert!(diags.is_empty(), "{:?}", diags);
        assert!(module.unwrap().export("START$").is_some());
    }

    #[test]
    fn test_forward_reference_fills_field() {
        let (module, diags) = assemble(&["  + 1,LATER", "LATER $EQU 0400000"]);
        assert!(diags.is_empty(), "{:?}", diags);
        assert_eq!(word_at(&module.unwrap(), 1, 0).word(), 0o000001_400000);
    }

    #[test]
    fn test_forward_reference_fixup() {
        let (module, diags) = assemble(&["  + LATER", "  + 1,LATER", "LATER $EQU 0100"]);
        assert!(diags.is_empty());
        let module = module.unwrap();
        assert_eq!(word_at(&module, 1, 0).word(), 0o100);
        assert!(!word_at(&module, 1, 0).has_references());
        assert_eq!(word_at(&module, 1, 1).word(), 0o000001_000100);
    }

    #[test]
    fn test_undefined_reference_survives() {
        let (module, _) = assemble(&["  + EXTERN+2"]);
        let word = word_at(&module.unwrap(), 1, 0);
        assert_eq!(word.word(), 2);
        assert_eq!(word.references, vec![UndefinedReference::to_label("EXTERN")]);
    }

    #[test]
    fn test_location_references() {
        let (module, diags) = assemble(&["HERE + 0", "  + HERE", "  + $"]);
        assert!(diags.is_empty());
        let module = module.unwrap();
        let second = word_at(&module, 1, 1);
        assert_eq!(second.word(), 0);
        assert_eq!(second.references, vec![UndefinedReference::to_location_counter(1)]);
        assert_eq!(word_at(&module, 1, 2).word(), 2);
    }

    #[test]
    fn test_duplicate_label() {
        let (module, diags) = assemble(&["A + 1", "A + 2"]);
        assert!(module.is_some());
        assert_eq!(diags.count(Level::Duplicate), 1);
    }

    #[test]
    fn test_unrecognizable_and_misused() {
        let (_, diags) = assemble(&["  X3"]);
        assert_eq!(diags.count(Level::Error), 1);
        let (_, diags) = assemble(&["  'ABC' 'DEF'"]);
        assert_eq!(diags.count(Level::Error), 1);
    }

    #[test]
    fn test_fatal_aborts() {
        let (module, diags) = assemble(&["  + 1", "P $PROC", "  P", "  $END", "  P"]);
        assert!(module.is_none());
        assert!(diags.has_fatal());
    }

    #[test]
    fn test_string_and_float_data() {
        let (module, diags) = assemble(&["  'ABCDE'", "  $FDATA", "  'AB'", "  1.5"]);
        assert!(diags.is_empty());
        let module = module.unwrap();
        assert_eq!(module.pool_size(1), 4);
        assert_eq!(word_at(&module, 1, 0).word(), 0o101_102_103_104);
        assert_eq!(word_at(&module, 1, 1).word(), 0o105_040_040_040);
        assert_eq!(word_at(&module, 1, 2).word(), 0o06_07_05_05_05_05);
        assert_eq!(word_at(&module, 1, 3).word(), word36::float_to_word(1.5).unwrap());
    }

    #[test]
    fn test_double_precision_integer() {
        let (module, diags) = assemble(&["  + 0400000000000", "  + -5"]);
        assert!(diags.is_empty(), "{:?}", diags);
        let module = module.unwrap();
        assert_eq!(module.pool_size(1), 2);
        assert_eq!(word_at(&module, 1, 0).word(), 0o400000000000);
        assert_eq!(word_at(&module, 1, 1).word(), 0o777777777772);

        let (module, _) = assemble(&["  + 01000000000000"]);
        let module = module.unwrap();
        assert_eq!(module.pool_size(1), 2);
        assert_eq!(word_at(&module, 1, 0).word(), 1);
        assert_eq!(word_at(&module, 1, 1).word(), 0);
    }

    #[test]
    fn test_literal_pool() {
        let (module, diags) = assemble(&["  + (5)", "$(2) $LIT", "$(1) + (7)"]);
        assert!(diags.is_empty());
        let module = module.unwrap();
        assert_eq!(word_at(&module, 0, 0).word(), 5);
        assert_eq!(word_at(&module, 2, 0).word(), 7);
        let second = word_at(&module, 1, 1);
        assert_eq!(second.references, vec![UndefinedReference::to_location_counter(2)]);
    }

    #[test]
    fn test_basic_mode_instruction() {
        let (module, diags) = assemble(&["  LA A3,*0100,*X5"]);
        assert!(diags.is_empty(), "{:?}", diags);
        let word = word_at(&module.unwrap(), 1, 0).word();
        let info = *StandardMnemonicTable::new().lookup("LA", CodeMode::Basic).unwrap();
        assert_eq!(word >> 30, info.f_field);
        assert_eq!((word >> 22) & 0o17, 3);
        assert_eq!((word >> 18) & 0o17, 5);
        assert_eq!(word & 0o777777, 0o600100);
    }

    #[test]
    fn test_immediate_and_j_field() {
        let (module, diags) = assemble(&["  LA,U A1,0777", "  LA,H1 A2,0100"]);
        assert!(diags.is_empty(), "{:?}", diags);
        let module = module.unwrap();
        let immediate = word_at(&module, 1, 0).word();
        assert_eq!((immediate >> 26) & 0o17, 0o16);
        assert_eq!(immediate & 0o777777, 0o777);
        assert_eq!((word_at(&module, 1, 1).word() >> 26) & 0o17, 2);
    }

    #[test]
    fn test_extended_mode_base_register() {
        let (module, diags) = assemble(&["  $EXTEND", "  LA A1,0100,X2,B3"]);
        assert!(diags.is_empty(), "{:?}", diags);
        let word = word_at(&module.unwrap(), 1, 0).word();
        assert_eq!((word >> 12) & 0o17, 3);
        assert_eq!(word & 0o7777, 0o100);
        assert_eq!((word >> 18) & 0o17, 2);
    }

    #[test]
    fn test_missing_operand() {
        let (_, diags) = assemble(&["  LA"]);
        assert_eq!(diags.count(Level::Error), 1);
        let (_, diags) = assemble(&["  LA A1"]);
        assert_eq!(diags.count(Level::Error), 1);
    }

    #[test]
    fn test_equf_operand_merges() {
        let (module, diags) = assemble(&["TAG $EQUF 0100,X3,H1", "  LA A1,TAG"]);
        assert!(diags.is_empty(), "{:?}", diags);
        let word = word_at(&module.unwrap(), 1, 0).word();
        assert_eq!((word >> 26) & 0o17, 2);
        assert_eq!((word >> 18) & 0o17, 3);
        assert_eq!(word & 0o177777, 0o100);
        assert_eq!((word >> 22) & 0o17, 1);
    }

    #[test]
    fn test_procedure_arguments() {
        let lines = [
            "P $PROC",
            "  + P(1,0)+P(1,1)",
            "  + P(2,0)",
            "  $END",
            "LOC P 2,3 5",
        ];
        let (module, diags) = assemble(&lines);
        assert!(diags.is_empty(), "{:?}", diags);
        let module = module.unwrap();
        assert_eq!(word_at(&module, 1, 0).word(), 5);
        assert_eq!(word_at(&module, 1, 1).word(), 5);
    }

    #[test]
    fn test_procedure_scope() {
        let lines = ["P $PROC", "INNER + 1", "OUTER* + 2", "  $END", "  P", "  + OUTER", "  + INNER"];
        let (module, _) = assemble(&lines);
        let module = module.unwrap();
        assert_eq!(word_at(&module, 1, 2).word(), 1);
        assert_eq!(word_at(&module, 1, 2).references, vec![UndefinedReference::to_location_counter(1)]);
        assert_eq!(word_at(&module, 1, 3).references, vec![UndefinedReference::to_label("INNER")]);
    }

    #[test]
    fn test_code_after_end() {
        let (_, diags) = assemble(&["  + 1", "  $END", "  + 2"]);
        assert_eq!(diags.count(Level::Error), 1);
    }

    #[test]
    fn test_special_reference_localized() {
        let (module, diags) = assemble(&["$(1) + BDIREF$(ENTRY)", "$(4)ENTRY + 0"]);
        assert!(diags.is_empty(), "{:?}", diags);
        let word = word_at(&module.unwrap(), 1, 0);
        assert_eq!(
            word.references,
            vec![UndefinedReference::Special {
                kind: SpecialKind::BdiRef,
                target: Some(SpecialTarget::LocationCounter(4)),
                field: FieldDescriptor::W,
            }]
        );
    }
}
