//! Per-assembly state: the symbol table, the generated pools and the modes in
//! force.
use super::diagnostic::{Diagnostic, Diagnostics, Locale};
use super::dictionary::{system_dictionary, Dictionary};
use super::instruction::{CodeMode, MnemonicTable};
use super::module::{GeneratedWord, LocationCounterPool, ModeFlags};
use super::reference::UndefinedReference;
use super::value::{CharacterMode, Form, IntegerValue, RelocationInfo, Value};
use crate::word36::{DoubleWord36, FieldDescriptor, BIT_MASK};
use std::collections::BTreeMap;

/// Words generated so far for one location counter.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct GeneratedPool {
    pub words: BTreeMap<u32, GeneratedWord>,
    pub next_offset: u32,
    pub extended_mode: bool,
}

impl GeneratedPool {
    /// Lays the words out densely, leaving `None` in reserved slots.
    pub fn to_location_counter_pool(&self) -> LocationCounterPool {
        let mut words = vec![None; self.next_offset as usize];
        for (offset, word) in self.words.iter() {
            words[*offset as usize] = Some(word.clone());
        }
        LocationCounterPool { words, extended_mode: self.extended_mode }
    }
}

pub struct Context<'a> {
    pub dictionary: Dictionary,
    pub pools: BTreeMap<u32, GeneratedPool>,
    pub current_lc: u32,
    pub literal_lc: u32,
    pub code_mode: CodeMode,
    pub character_mode: CharacterMode,
    pub modes: ModeFlags,
    pub diagnostics: Diagnostics,
    /// The top-level source line being assembled. Words generated from
    /// procedure bodies are attributed to the invoking line.
    pub line_number: usize,
    mnemonics: &'a dyn MnemonicTable,
}

impl<'a> Context<'a> {
    /// A fresh context. The outermost dictionary scope holds the module's
    /// global labels; the main-line scope sits just inside it.
    pub fn new(mnemonics: &'a dyn MnemonicTable) -> Self {
        let mut dictionary = Dictionary::new(system_dictionary());
        dictionary.push_scope();
        Context {
            dictionary,
            pools: BTreeMap::new(),
            current_lc: 1,
            literal_lc: 0,
            code_mode: CodeMode::Basic,
            character_mode: CharacterMode::Ascii,
            modes: ModeFlags::default(),
            diagnostics: Diagnostics::new(),
            line_number: 0,
            mnemonics,
        }
    }

    pub fn mnemonics(&self) -> &'a dyn MnemonicTable {
        self.mnemonics
    }

    pub fn post(&mut self, diagnostic: Diagnostic) {
        debug!("{}", diagnostic);
        self.diagnostics.append(diagnostic);
    }

    pub fn pool_mut(&mut self, lc_index: u32) -> &mut GeneratedPool {
        self.pools.entry(lc_index).or_insert_with(GeneratedPool::default)
    }

    /// Next free offset in a pool.
    pub fn current_offset(&self, lc_index: u32) -> u32 {
        self.pools.get(&lc_index).map(|p| p.next_offset).unwrap_or(0)
    }

    /// An Integer naming `offset` words into the given pool.
    pub fn location_value(&self, lc_index: u32, offset: u32) -> Value {
        let iv = IntegerValue::with_references(
            DoubleWord36::from_i64(offset as i64),
            vec![UndefinedReference::to_location_counter(lc_index)],
        );
        Value::from_integer(iv).with_relocation(Some(RelocationInfo { lc_index }))
    }

    /// The current location of the current generation pool, as `$` reads.
    pub fn current_location(&self) -> Value {
        self.location_value(self.current_lc, self.current_offset(self.current_lc))
    }

    /// Reserves `count` words without generating anything into them.
    pub fn advance(&mut self, lc_index: u32, count: u32) {
        let pool = self.pool_mut(lc_index);
        pool.next_offset += count;
    }

    /// Appends a complete word to a pool and returns its location.
    pub fn generate_word(&mut self, lc_index: u32, value: IntegerValue) -> Value {
        let line = self.line_number;
        let pool = self.pool_mut(lc_index);
        let offset = pool.next_offset;
        pool.words.insert(offset, GeneratedWord { line, lc_index, offset, value });
        pool.next_offset += 1;
        trace!("generated $({}) {:06o}", lc_index, offset);
        self.location_value(lc_index, offset)
    }

    /// Packs one value per field of `form` into a word and appends it.
    /// References carried by a value are re-anchored to its field.
    pub fn generate(&mut self, lc_index: u32, form: &Form, values: &[IntegerValue], locale: Locale) -> Value {
        let mut word = 0u64;
        let mut references = Vec::new();
        for (fd, iv) in form.field_descriptors().into_iter().zip(values.iter()) {
            word = self.pack_field(word, fd, &iv.value, locale);
            for reference in iv.references.iter() {
                if reference.field() == FieldDescriptor::W {
                    references.push(reference.with_field(fd));
                } else {
                    references.push(reference.clone());
                }
            }
        }
        self.generate_word(lc_index, IntegerValue::with_references(DoubleWord36::from_word(word), references))
    }

    /// Generates into the current literal pool.
    pub fn generate_literal(&mut self, form: &Form, values: &[IntegerValue], locale: Locale) -> Value {
        let lc_index = self.literal_lc;
        self.generate(lc_index, form, values, locale)
    }

    /// Places `value` into field `fd` of `word`. A value too large for the
    /// field raises a truncation diagnostic and keeps its low-order bits.
    pub fn pack_field(&mut self, word: u64, fd: FieldDescriptor, value: &DoubleWord36, locale: Locale) -> u64 {
        let mask = fd.mask();
        let n = value.to_i128();
        let fits = if fd.field_size >= 36 {
            value.fits_in_word() || value.high() == 0
        } else {
            let limit = mask as i128;
            n <= limit && n >= -(limit >> 1)
        };
        if !fits {
            self.post(Diagnostic::truncation(locale, format!("Value truncated in field {}", fd)));
        }
        let bits = value.low() & mask;
        (word & !(mask << fd.shift()) & BIT_MASK) | (bits << fd.shift())
    }

    /// Marks a pool as needing extended mode at link time.
    pub fn set_extended_mode(&mut self, lc_index: u32) {
        self.pool_mut(lc_index).extended_mode = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::instruction::StandardMnemonicTable;

    #[test]
    fn test_generate_with_form() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        let form = Form::new(vec![18, 18]).unwrap();
        let values = vec![
            IntegerValue::from_i64(3),
            IntegerValue::with_references(DoubleWord36::from_i64(1), vec![UndefinedReference::to_label("FOO")]),
        ];
        let location = ctx.generate(1, &form, &values, Locale::new(1, 1));
        assert_eq!(location.as_integer().unwrap().to_i64(), Some(0));

        let word = &ctx.pools[&1].words[&0];
        assert_eq!(word.value.word(), 0o000003_000001);
        assert_eq!(word.value.references[0].field(), FieldDescriptor::new(18, 18));
        assert!(ctx.diagnostics.is_empty());
    }

    #[test]
    fn test_pack_negative_and_truncated() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        let fd = FieldDescriptor::new(30, 6);
        assert_eq!(ctx.pack_field(0, fd, &DoubleWord36::from_i64(-1), Locale::new(1, 1)), 0o76);
        assert!(ctx.diagnostics.is_empty());
        assert_eq!(ctx.pack_field(0, fd, &DoubleWord36::from_i64(0o177), Locale::new(1, 1)), 0o77);
        assert_eq!(ctx.diagnostics.len(), 1);
    }

    #[test]
    fn test_reserve_leaves_holes() {
        let table = StandardMnemonicTable::new();
        let mut ctx = Context::new(&table);
        ctx.generate_word(2, IntegerValue::from_i64(1));
        ctx.advance(2, 2);
        ctx.generate_word(2, IntegerValue::from_i64(4));
        let pool = ctx.pools[&2].to_location_counter_pool();
        assert_eq!(pool.len(), 4);
        assert!(pool.words[1].is_none() && pool.words[2].is_none());
        assert_eq!(pool.words[3].as_ref().unwrap().offset, 3);
        assert_eq!(ctx.current_offset(2), 4);
    }
}
