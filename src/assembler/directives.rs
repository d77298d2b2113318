//! Assembler directives, dispatched through a static name registry.
use super::context::Context;
use super::diagnostic::{Diagnostic, Level, Locale};
use super::instruction::{j_field_for, CodeMode};
use super::lexer::{split_line, TextField, TextLine, TextSubfield};
use super::parser::evaluate;
use super::value::{CharacterMode, Form, IntegerValue, Value, ValueKind};
use super::{establish_label, LabelFieldComponents, LineSource};
use crate::word36::{DoubleWord36, FieldDescriptor};

pub type DirectiveHandler = fn(&mut Context, &mut LineSource, &LabelFieldComponents, &TextLine);

const REGISTRY: [(&str, DirectiveHandler); 13] = [
    ("$ASCII", ascii),
    ("$BASIC", basic),
    ("$END", end),
    ("$EQU", equ),
    ("$EQUF", equf),
    ("$EXTEND", extend),
    ("$FDATA", fieldata),
    ("$FORM", form),
    ("$GFORM", gform),
    ("$INFO", info),
    ("$LIT", lit),
    ("$PROC", proc),
    ("$RES", res),
];

pub fn names() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

pub fn lookup(name: &str) -> Option<DirectiveHandler> {
    let upper = name.to_uppercase();
    REGISTRY.iter().find(|(n, _)| *n == upper).map(|(_, h)| *h)
}

// Field indexes within a split line.
const OPERATION: usize = 1;
const OPERAND: usize = 2;
const ADDITIONAL: usize = 3;

/// Reports a label where none is accepted, and any fields past `max_fields`.
fn check_fields(ctx: &mut Context, line: &TextLine, labels: &LabelFieldComponents, label_allowed: bool, max_fields: usize) {
    if !label_allowed && labels.label.is_some() {
        ctx.post(Diagnostic::error(labels.locale, "Label ignored for this directive"));
    }
    if let Some(extra) = line.fields.get(max_fields) {
        ctx.post(Diagnostic::error(extra.locale, "Extraneous fields ignored"));
    }
}

fn require_label<'l>(ctx: &mut Context, labels: &'l LabelFieldComponents, name: &str) -> Option<&'l str> {
    match labels.label.as_deref() {
        Some(label) => Some(label),
        None => {
            ctx.post(Diagnostic::error(labels.locale, format!("Label required for {} directive", name)));
            None
        }
    }
}

fn operation_locale(line: &TextLine) -> Locale {
    line.field(OPERATION).map(|f| f.locale).unwrap_or_else(|| Locale::new(line.number, 1))
}

/// Evaluates one subfield which must hold an Integer. A syntax or type
/// problem has already been reported when this returns `None`.
fn integer_subfield(ctx: &mut Context, subfield: &TextSubfield, what: &str) -> Option<(IntegerValue, bool)> {
    let value = match evaluate(ctx, &subfield.text, subfield.locale) {
        Ok(Some(value)) => value,
        Ok(None) => {
            ctx.post(Diagnostic::error(subfield.locale, format!("Expected an expression for {}", what)));
            return None;
        }
        Err(_) => return None,
    };
    match value.kind {
        ValueKind::Integer(iv) => Some((iv, value.flagged)),
        _ => {
            ctx.post(Diagnostic::value(subfield.locale, format!("Wrong value type for {}", what)));
            None
        }
    }
}

/// A discrete (reference-free) integer in `low..=high`.
fn bounded_subfield(ctx: &mut Context, subfield: &TextSubfield, what: &str, low: i64, high: i64) -> Option<i64> {
    let (iv, _) = integer_subfield(ctx, subfield, what)?;
    if iv.has_references() {
        ctx.post(Diagnostic::relocation(subfield.locale));
        return None;
    }
    match iv.to_i64() {
        Some(n) if n >= low && n <= high => Some(n),
        _ => {
            ctx.post(Diagnostic::value(subfield.locale, format!("Invalid value for {}", what)));
            None
        }
    }
}

fn ascii(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, false, 2);
    ctx.character_mode = CharacterMode::Ascii;
}

fn fieldata(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, false, 2);
    ctx.character_mode = CharacterMode::Fieldata;
}

fn basic(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, false, 2);
    ctx.code_mode = CodeMode::Basic;
}

fn extend(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, false, 2);
    ctx.code_mode = CodeMode::Extended;
}

/// Outside a procedure definition `$END` closes the source. Anything
/// after it is reported and skipped.
fn end(ctx: &mut Context, source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, false, 3);
    if let Some(operand) = line.field(OPERAND) {
        ctx.post(Diagnostic::error(operand.locale, "Operand ignored for $END directive"));
    }
    source.mark_end();
}

fn equ(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, true, 3);
    let label = match require_label(ctx, labels, "$EQU") {
        Some(label) => label,
        None => return,
    };
    let operand = match line.field(OPERAND) {
        Some(operand) => operand,
        None => {
            ctx.post(Diagnostic::error(operation_locale(line), "Missing operand for $EQU directive"));
            return;
        }
    };
    if operand.subfield_count() > 1 {
        ctx.post(Diagnostic::error(operand.subfields[1].locale, "Extraneous subfields ignored"));
    }
    let subfield = &operand.subfields[0];
    match evaluate(ctx, &subfield.text, subfield.locale) {
        Ok(Some(value)) => establish_label(ctx, labels.locale, label, labels.level, value),
        Ok(None) => ctx.post(Diagnostic::error(subfield.locale, "Syntax error")),
        Err(_) => {}
    }
}

/// `LABEL $EQUF u,x,j[,b]` binds an Integer shaped like an instruction's
/// operand fields. It carries the `I$` form in basic mode and `EI$` in
/// extended mode so that an instruction can merge it as its u operand.
fn equf(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, true, 3);
    let label = match require_label(ctx, labels, "$EQUF") {
        Some(label) => label,
        None => return,
    };
    let operand = match line.field(OPERAND) {
        Some(operand) => operand.clone(),
        None => {
            ctx.post(Diagnostic::error(operation_locale(line), "Missing operand for $EQUF directive"));
            return;
        }
    };

    let extended = ctx.code_mode == CodeMode::Extended;
    let max_subfields = if extended { 4 } else { 3 };
    if operand.subfield_count() > max_subfields {
        ctx.post(Diagnostic::error(operand.subfields[max_subfields].locale, "Extraneous subfields ignored"));
    }

    let u_field = if extended { FieldDescriptor::new(24, 12) } else { FieldDescriptor::new(20, 16) };
    let mut word = 0u64;
    let mut references = Vec::new();
    let mut pack = |ctx: &mut Context, word: &mut u64, iv: &IntegerValue, fd: FieldDescriptor, locale: Locale| {
        *word = ctx.pack_field(*word, fd, &iv.value, locale);
        for reference in iv.references.iter() {
            references.push(reference.with_field(fd));
        }
    };

    if let Some(sf) = operand.subfield(0) {
        if let Some((iv, flagged)) = integer_subfield(ctx, sf, "u field") {
            pack(ctx, &mut word, &iv, u_field, sf.locale);
            if flagged {
                word |= 0o200000;
            }
        }
    }
    if let Some(sf) = operand.subfield(1) {
        if let Some((iv, flagged)) = integer_subfield(ctx, sf, "x field") {
            pack(ctx, &mut word, &iv, FieldDescriptor::new(14, 4), sf.locale);
            if flagged {
                word |= 0o400000;
            }
        }
    }
    if let Some(sf) = operand.subfield(2) {
        let j = match j_field_for(&sf.text) {
            Some(j) => Some(IntegerValue::from_i64(j as i64)),
            None => integer_subfield(ctx, sf, "j field").map(|(iv, _)| iv),
        };
        if let Some(iv) = j {
            pack(ctx, &mut word, &iv, FieldDescriptor::new(6, 4), sf.locale);
        }
    }
    if extended {
        if let Some(sf) = operand.subfield(3) {
            if let Some((iv, _)) = integer_subfield(ctx, sf, "b field") {
                pack(ctx, &mut word, &iv, FieldDescriptor::new(20, 4), sf.locale);
            }
        }
    }

    let sizes = if extended { vec![6, 4, 4, 4, 1, 1, 4, 12] } else { vec![6, 4, 4, 4, 1, 1, 16] };
    let form = match Form::new(sizes) {
        Ok(form) => form,
        Err(message) => {
            ctx.post(Diagnostic::fatal(operand.locale, message));
            return;
        }
    };
    let iv = IntegerValue::with_references(DoubleWord36::from_word(word), references);
    let value = Value::from_integer(iv).with_form(Some(form));
    establish_label(ctx, labels.locale, label, labels.level, value);
}

fn form(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, true, 3);
    let label = match require_label(ctx, labels, "$FORM") {
        Some(label) => label,
        None => return,
    };
    let operand = match line.field(OPERAND) {
        Some(operand) => operand.clone(),
        None => {
            ctx.post(Diagnostic::error(operation_locale(line), "Missing operand for $FORM directive"));
            return;
        }
    };

    let mut sizes = Vec::with_capacity(operand.subfield_count());
    let mut failed = false;
    for sf in operand.subfields.iter() {
        match bounded_subfield(ctx, sf, "field size", 1, 36) {
            Some(size) => sizes.push(size as u32),
            None => failed = true,
        }
    }
    if failed {
        return;
    }
    if sizes.iter().sum::<u32>() > 36 {
        ctx.post(Diagnostic::new(
            Level::Form,
            operand.locale,
            "Cumulative form size > 36 bits",
        ));
        return;
    }
    match Form::new(sizes) {
        Ok(form) => establish_label(ctx, labels.locale, label, labels.level, Value::form_value(form)),
        Err(message) => ctx.post(Diagnostic::error(operand.locale, message)),
    }
}

/// `$GFORM size,value,size,value...` generates one word in the current
/// pool from the inline field layout.
fn gform(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, true, 3);
    let operand = match line.field(OPERAND) {
        Some(operand) => operand.clone(),
        None => {
            ctx.post(Diagnostic::error(operation_locale(line), "Missing operand for $GFORM directive"));
            return;
        }
    };
    if operand.subfield_count() % 2 != 0 {
        ctx.post(Diagnostic::error(operation_locale(line), "Even number of operands required for $GFORM directive"));
        return;
    }

    let mut sizes = Vec::new();
    let mut values = Vec::new();
    let mut failed = false;
    for pair in operand.subfields.chunks(2) {
        match bounded_subfield(ctx, &pair[0], "field size", 1, 36) {
            Some(size) => sizes.push(size as u32),
            None => failed = true,
        }
        match integer_subfield(ctx, &pair[1], "field value") {
            Some((iv, _)) => values.push(iv),
            None => failed = true,
        }
    }
    if failed {
        return;
    }

    let form = match Form::new(sizes) {
        Ok(form) => form,
        Err(message) => {
            ctx.post(Diagnostic::new(Level::Form, operand.locale, message));
            return;
        }
    };
    if let Some(label) = labels.label.as_deref() {
        let here = ctx.current_location();
        establish_label(ctx, labels.locale, label, labels.level, here);
    }
    let lc_index = ctx.current_lc;
    ctx.generate(lc_index, &form, &values, operand.locale);
}

/// `$INFO 1 modes` sets processor mode requirements; `$INFO 10 lc,lc...`
/// marks location counters as extended mode.
fn info(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, true, 4);
    let operand = match line.field(OPERAND) {
        Some(operand) => operand.clone(),
        None => {
            ctx.post(Diagnostic::error(operation_locale(line), "Missing group for $INFO directive"));
            return;
        }
    };
    if operand.subfield_count() > 1 {
        ctx.post(Diagnostic::error(operand.subfields[1].locale, "Extraneous subfields ignored"));
    }
    let group_subfield = &operand.subfields[0];
    let group = match bounded_subfield(ctx, group_subfield, "$INFO group", 0, i64::MAX) {
        Some(group) => group,
        None => return,
    };
    let additional = line.field(ADDITIONAL).cloned();
    match group {
        1 => processor_modes(ctx, &operand, additional.as_ref()),
        10 => extended_mode_pools(ctx, &operand, additional.as_ref()),
        _ => ctx.post(Diagnostic::error(group_subfield.locale, "Unknown or unimplemented $INFO group")),
    }
}

fn processor_modes(ctx: &mut Context, operand: &TextField, additional: Option<&TextField>) {
    let field = match additional {
        Some(field) if field.subfield(0).is_some() => field,
        _ => {
            ctx.post(Diagnostic::error(operand.locale, "No value specified for $INFO group 1"));
            return;
        }
    };
    if field.subfield_count() > 1 {
        ctx.post(Diagnostic::error(field.subfields[1].locale, "Extraneous subfields ignored"));
    }
    let sf = &field.subfields[0];
    let bits = match bounded_subfield(ctx, sf, "$INFO group 1", 0, i64::MAX) {
        Some(bits) => bits,
        None => return,
    };
    if bits & 0o7 == 0o7 || bits & 0o70 == 0o70 {
        ctx.post(Diagnostic::error(sf.locale, "Illegal value"));
        return;
    }

    if bits & 0o3 == 0o3 {
        if ctx.modes.third_word {
            ctx.post(Diagnostic::error(sf.locale, "Conflicting third/quarter word modes"));
        } else {
            ctx.modes.quarter_word = true;
        }
    }
    if bits & 0o5 == 0o5 {
        if ctx.modes.quarter_word {
            ctx.post(Diagnostic::error(sf.locale, "Conflicting third/quarter word modes"));
        } else {
            ctx.modes.third_word = true;
        }
    }
    if bits & 0o30 == 0o30 {
        if ctx.modes.af_non_interrupt {
            ctx.post(Diagnostic::error(sf.locale, "Conflicting arithmetic fault modes"));
        } else {
            ctx.modes.af_compatibility = true;
        }
    }
    if bits & 0o50 == 0o50 {
        if ctx.modes.af_compatibility {
            ctx.post(Diagnostic::error(sf.locale, "Conflicting arithmetic fault modes"));
        } else {
            ctx.modes.af_non_interrupt = true;
        }
    }
}

fn extended_mode_pools(ctx: &mut Context, operand: &TextField, additional: Option<&TextField>) {
    let field = match additional {
        Some(field) if !field.subfields.is_empty() => field,
        _ => {
            ctx.post(Diagnostic::error(operand.locale, "No location counters specified for $INFO group 10"));
            return;
        }
    };
    for sf in field.subfields.iter() {
        if let Some(lc_index) = bounded_subfield(ctx, sf, "location counter index", 0, 0o77) {
            ctx.set_extended_mode(lc_index as u32);
        }
    }
}

/// `$(n) $LIT` makes pool n the target for literals.
fn lit(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, false, 2);
    match labels.lc_index {
        Some(lc_index) => ctx.literal_lc = lc_index,
        None => ctx.post(Diagnostic::error(labels.locale, "Location counter required for $LIT directive")),
    }
}

// +1 for a line opening a procedure, -1 for one closing it.
fn nesting_change(text: &TextLine) -> i32 {
    match text.field(OPERATION).and_then(|f| f.subfield(0)).map(|sf| sf.text.to_uppercase()) {
        Some(ref op) if op == "$PROC" => 1,
        Some(ref op) if op == "$END" => -1,
        _ => 0,
    }
}

/// Collects lines up to the matching `$END` and binds them as a procedure.
fn proc(ctx: &mut Context, source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, true, 3);
    let mut body = Vec::new();
    let mut nesting = 1;
    while nesting > 0 {
        let next = match source.next_line() {
            Some(next) => next,
            None => break,
        };
        nesting += nesting_change(&split_line(&next));
        if nesting > 0 {
            body.push(next);
        }
    }
    if nesting > 0 {
        ctx.post(Diagnostic::error(operation_locale(line), "Reached end of file before end of proc"));
    }

    let label = match require_label(ctx, labels, "$PROC") {
        Some(label) => label,
        None => return,
    };
    debug!("procedure {} holds {} line(s)", label.to_uppercase(), body.len());
    establish_label(ctx, labels.locale, label, labels.level, Value::procedure(label, body));
}

/// `$RES n` reserves n words of the current pool without generating them.
fn res(ctx: &mut Context, _source: &mut LineSource, labels: &LabelFieldComponents, line: &TextLine) {
    check_fields(ctx, line, labels, true, 3);
    if let Some(label) = labels.label.as_deref() {
        let here = ctx.current_location();
        establish_label(ctx, labels.locale, label, labels.level, here);
    }
    let operand = match line.field(OPERAND).and_then(|f| f.subfield(0)) {
        Some(sf) => sf.clone(),
        None => {
            ctx.post(Diagnostic::error(operation_locale(line), "Missing operand for $RES directive"));
            return;
        }
    };
    if let Some(count) = bounded_subfield(ctx, &operand, "reservation size", 0, 0o777777) {
        let lc_index = ctx.current_lc;
        ctx.advance(lc_index, count as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::instruction::StandardMnemonicTable;
    use crate::assembler::lexer::SourceLine;
    use crate::assembler::Assembler;

    #[test]
    fn test_registry() {
        assert!(lookup("$equ").is_some());
        assert!(lookup("$NOPE").is_none());
        assert_eq!(names().count(), 13);
    }

    #[test]
    fn test_mode_switches() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        let lines = ["$FDATA", "$EXTEND"];
        let source_lines = crate::assembler::lexer::source_lines(&lines);
        let mut source = LineSource::new(&source_lines);
        while let Some(next) = source.next_line() {
            let text = split_line(&next);
            let labels = LabelFieldComponents::empty(Locale::new(next.number, 1));
            let name = text.field(OPERATION).unwrap().subfields[0].text.clone();
            lookup(&name).unwrap()(&mut ctx, &mut source, &labels, &text);
        }
        assert_eq!(ctx.character_mode, CharacterMode::Fieldata);
        assert_eq!(ctx.code_mode, CodeMode::Extended);
        assert!(ctx.diagnostics.is_empty());
    }

    #[test]
    fn test_equ_and_form() {
        let mut asm = Assembler::new();
        let module = asm
            .assemble(
                "T",
                &["TEN $EQU 10", "F3 $FORM 12,12,12", " F3 1,2,TEN", "BAD $FORM 20,20"],
            )
            .unwrap();
        assert_eq!(module.pool(1).unwrap().words[0].as_ref().unwrap().value.word(), 0o0001_0002_0012);
        assert_eq!(asm.diagnostics().count(Level::Form), 1);
    }

    #[test]
    fn test_gform_and_res() {
        let mut asm = Assembler::new();
        let module = asm.assemble("T", &["W1 $GFORM 6,077,30,1", "  $RES 2", "W2 + 5"]).unwrap();
        let pool = module.pool(1).unwrap();
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.words[0].as_ref().unwrap().value.word(), 0o77_0000_000001);
        assert!(pool.words[1].is_none() && pool.words[2].is_none());
        assert!(asm.diagnostics().is_empty());

        let mut asm = Assembler::new();
        asm.assemble("T", &["  $GFORM 6,1,30"]);
        assert_eq!(asm.diagnostics().count(Level::Error), 1);
    }

    #[test]
    fn test_info() {
        let mut asm = Assembler::new();
        let module = asm.assemble("T", &["  $INFO 1 03", "  $INFO 1 050", "  $INFO 10 2,3", "$(2) + 1"]).unwrap();
        assert!(module.modes.quarter_word && module.modes.af_non_interrupt);
        assert!(module.pool(2).unwrap().extended_mode);
        assert!(asm.diagnostics().is_empty());

        let mut asm = Assembler::new();
        let module = asm.assemble("T", &["  $INFO 1 03", "  $INFO 1 05", "  $INFO 7"]).unwrap();
        assert!(!module.modes.third_word);
        assert_eq!(asm.diagnostics().count(Level::Error), 2);
    }

    #[test]
    fn test_equf() {
        let mut asm = Assembler::new();
        let module = asm.assemble("T", &["TAG $EQUF *0100,*X3,H1", "TAG* $EQU TAG"]).unwrap();
        let tag = module.export("TAG").unwrap();
        assert_eq!(tag.word(), 0o001003_600100);
    }

    #[test]
    fn test_proc_collection() {
        let mut asm = Assembler::new();
        asm.assemble("T", &["P $PROC", "  + 1", "Q $PROC", "  + 2", "  $END", "  $END", "  P"]);
        assert!(asm.diagnostics().is_empty());

        let mut asm = Assembler::new();
        asm.assemble("T", &["P $PROC", "  + 1"]);
        assert_eq!(asm.diagnostics().count(Level::Error), 1);

        let mut asm = Assembler::new();
        asm.assemble("T", &["  $PROC", "  $END"]);
        assert_eq!(asm.diagnostics().count(Level::Error), 1);
    }

    #[test]
    fn test_nesting_change() {
        let nesting = |text: &str| nesting_change(&split_line(&SourceLine::new(1, text)));
        assert_eq!(nesting("P $PROC"), 1);
        assert_eq!(nesting("  $end"), -1);
        assert_eq!(nesting("F $FUNC"), 0);
        assert_eq!(nesting("  + 1"), 0);
    }
}
