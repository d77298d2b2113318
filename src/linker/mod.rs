//! The Linker takes relocatable modules and a list of bank declarations and
//! produces an `AbsoluteModule`.
//!
//! Pools are given addresses first, then every exported label is pinned to
//! an address, then each bank is loaded word by word with the remaining
//! references resolved. Problems are counted rather than collected; any
//! error means no module is produced.

pub mod bank;

use crate::assembler::module::{ModeFlags, RelocatableModule};
use crate::assembler::reference::{SpecialKind, SpecialTarget, UndefinedReference};
use crate::assembler::value::IntegerValue;
use crate::word36::{self, DoubleWord36, FieldDescriptor};
use bank::{AbsoluteModule, AccessPermissions, BankDeclaration, EntryPoint, LoadableBank, PoolSpecification};

use std::collections::{BTreeMap, HashSet};
use term_grid::{Cell, Direction, Filling, Grid, GridOptions};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum LinkOption {
    NoEntryPoint,
    QuarterWordMode,
    ThirdWordMode,
    AfCompatibilityMode,
    AfNonInterruptMode,
    EmitSummary,
    EmitDictionary,
    EmitGeneratedCode,
}

impl LinkOption {
    pub const NAMES: [&'static str; 8] = [
        "no-entry-point",
        "quarter-word",
        "third-word",
        "af-compatibility",
        "af-non-interrupt",
        "summary",
        "dictionary",
        "code",
    ];

    pub fn from_name(name: &str) -> Option<LinkOption> {
        match name {
            "no-entry-point" => Some(LinkOption::NoEntryPoint),
            "quarter-word" => Some(LinkOption::QuarterWordMode),
            "third-word" => Some(LinkOption::ThirdWordMode),
            "af-compatibility" => Some(LinkOption::AfCompatibilityMode),
            "af-non-interrupt" => Some(LinkOption::AfNonInterruptMode),
            "summary" => Some(LinkOption::EmitSummary),
            "dictionary" => Some(LinkOption::EmitDictionary),
            "code" => Some(LinkOption::EmitGeneratedCode),
            _ => None,
        }
    }
}

const ENTRY_POINT_LABEL: &str = "START$";
const RCS_BANK_NAME: &str = "RCSTACK";
const RCS_FRAME_SIZE: usize = 8;
const RCS_BASE_REGISTER: u32 = 25;
// Bound on chains of exported labels defined in terms of other exports.
const MAX_REFERENCE_DEPTH: usize = 16;

/// An exported label once its location counter references are resolved.
/// The module and pool it came from are kept for the BDI specials.
#[derive(Clone, Debug)]
struct LinkedSymbol {
    value: IntegerValue,
    module: String,
    lc_index: Option<u32>,
}

/// The pool a reference was found in.
#[derive(Clone, Copy)]
struct Site<'s> {
    module: &'s str,
    lc_index: Option<u32>,
}

type PoolKey = (String, u32);

fn pool_key(module: &str, lc_index: u32) -> PoolKey {
    (module.to_string(), lc_index)
}

pub struct Linker {
    options: HashSet<LinkOption>,
    errors: usize,
}

impl Default for Linker {
    fn default() -> Self {
        Linker::new()
    }
}

impl Linker {
    pub fn new() -> Self {
        Linker { options: HashSet::new(), errors: 0 }
    }

    pub fn with_options(mut self, options: &[LinkOption]) -> Self {
        self.options.extend(options.iter().copied());
        self
    }

    /// Errors counted by the last `link`.
    pub fn errors(&self) -> usize {
        self.errors
    }

    /// Links the pools named by `declarations` into one absolute module. A
    /// return control stack bank of `stack_depth` frames is added when the
    /// depth is not zero.
    pub fn link(
        &mut self,
        name: &str,
        modules: &[RelocatableModule],
        declarations: &[BankDeclaration],
        stack_depth: usize,
    ) -> Option<AbsoluteModule> {
        info!("linking module {} ({} bank declaration(s))", name, declarations.len());
        let mut linkage = Linkage::new(modules, declarations);
        linkage.check_declarations();
        linkage.map_pools();
        linkage.extract_symbols();

        let mut banks: Vec<LoadableBank> = declarations.iter().map(|d| linkage.load_bank(d)).collect();
        if stack_depth > 0 {
            if let Some(bank) = rcs_bank(declarations, stack_depth) {
                banks.push(bank);
            }
        }

        let (entry_point, entry_module) = linkage.find_entry_point();
        if entry_point.is_none() && !self.options.contains(&LinkOption::NoEntryPoint) {
            linkage.raise(format!("No {} label found", ENTRY_POINT_LABEL));
        }
        let modes = self.determine_modes(&linkage.contributing_modes(), entry_module.as_ref().map(|m| m.modes));

        let mut result = None;
        if linkage.errors == 0 {
            let allow_no_entry = self.options.contains(&LinkOption::NoEntryPoint);
            match AbsoluteModule::new(name, banks, entry_point, modes, allow_no_entry) {
                Ok(module) => result = Some(module),
                Err(message) => linkage.raise(message),
            }
        }

        self.errors = linkage.errors;
        if let Some(module) = result.as_ref() {
            self.emit(module, &linkage);
        }
        if self.errors == 0 {
            info!("linking {} complete", name);
        } else {
            error!("linking {} failed with {} error(s)", name, self.errors);
        }
        result
    }

    /// Options win. Otherwise the modules' requirements are combined, and
    /// where they conflict the entry point module decides.
    fn determine_modes(&self, combined: &ModeFlags, entry: Option<ModeFlags>) -> ModeFlags {
        let mut modes = ModeFlags::default();

        let quarter = self.options.contains(&LinkOption::QuarterWordMode);
        let third = self.options.contains(&LinkOption::ThirdWordMode);
        if quarter || third {
            modes.quarter_word = quarter;
            modes.third_word = third;
        } else if combined.quarter_word && combined.third_word {
            if let Some(entry) = entry {
                modes.quarter_word = entry.quarter_word;
                modes.third_word = entry.third_word;
            }
        } else {
            modes.quarter_word = combined.quarter_word;
            modes.third_word = combined.third_word;
        }

        let compatibility = self.options.contains(&LinkOption::AfCompatibilityMode);
        let non_interrupt = self.options.contains(&LinkOption::AfNonInterruptMode);
        if compatibility || non_interrupt {
            modes.af_compatibility = compatibility;
            modes.af_non_interrupt = non_interrupt;
        } else if combined.af_compatibility && combined.af_non_interrupt {
            if let Some(entry) = entry {
                modes.af_compatibility = entry.af_compatibility;
                modes.af_non_interrupt = entry.af_non_interrupt;
            }
        } else {
            modes.af_compatibility = combined.af_compatibility;
            modes.af_non_interrupt = combined.af_non_interrupt;
        }
        modes
    }

    fn emit(&self, module: &AbsoluteModule, linkage: &Linkage) {
        let summary = self.options.contains(&LinkOption::EmitSummary);
        let dictionary = self.options.contains(&LinkOption::EmitDictionary);
        let code = self.options.contains(&LinkOption::EmitGeneratedCode);
        if summary || dictionary || code {
            info!("{}", module.summary());
        }
        if code {
            info!("Generated code:\n{}", module.code_listing());
        }
        if dictionary {
            info!("Dictionary:\n{}", linkage.symbol_listing());
        }
    }
}

fn rcs_bank(declarations: &[BankDeclaration], stack_depth: usize) -> Option<LoadableBank> {
    let first = declarations.first()?;
    let last = declarations.last()?;
    let permissions = AccessPermissions::new(false, true, true);
    debug!("return control stack: {} words at BDI {:06o}", RCS_FRAME_SIZE * stack_depth, last.bdi + 1);
    Some(LoadableBank {
        name: RCS_BANK_NAME.to_string(),
        bdi: last.bdi + 1,
        level: last.level,
        access_info: first.access_info,
        general_permissions: permissions,
        special_permissions: permissions,
        starting_address: 0,
        initial_base_register: Some(RCS_BASE_REGISTER),
        extended_mode: true,
        content: vec![0; RCS_FRAME_SIZE * stack_depth],
    })
}

/// State for one link.
struct Linkage<'a> {
    modules: BTreeMap<String, &'a RelocatableModule>,
    declarations: &'a [BankDeclaration],
    pool_addresses: BTreeMap<PoolKey, u32>,
    // Index into `declarations` of the bank holding each pool.
    pool_banks: BTreeMap<PoolKey, usize>,
    symbols: BTreeMap<String, LinkedSymbol>,
    errors: usize,
}

impl<'a> Linkage<'a> {
    fn new(modules: &'a [RelocatableModule], declarations: &'a [BankDeclaration]) -> Self {
        let mut linkage = Linkage {
            modules: BTreeMap::new(),
            declarations,
            pool_addresses: BTreeMap::new(),
            pool_banks: BTreeMap::new(),
            symbols: BTreeMap::new(),
            errors: 0,
        };
        for module in modules {
            if linkage.modules.insert(module.name.to_uppercase(), module).is_some() {
                linkage.raise(format!("Module {} supplied more than once", module.name));
            }
        }
        linkage
    }

    fn raise<S: Into<String>>(&mut self, message: S) {
        let message = message.into();
        error!("{}", message);
        self.errors += 1;
    }

    fn module(&self, name: &str) -> Option<&'a RelocatableModule> {
        self.modules.get(&name.to_uppercase()).copied()
    }

    fn pool_size(&self, spec: &PoolSpecification) -> usize {
        self.module(&spec.module).map(|m| m.pool_size(spec.lc_index)).unwrap_or(0)
    }

    fn check_declarations(&mut self) {
        if self.declarations.is_empty() {
            self.raise("No bank declarations");
        }
        let mut bdis = HashSet::new();
        let mut pools = HashSet::new();
        for decl in self.declarations {
            if let Err(message) = decl.validate() {
                self.raise(message);
            }
            if !bdis.insert(decl.bdi) {
                self.raise(format!("BDI {:06o} declared more than once", decl.bdi));
            }
            for spec in decl.pools.iter() {
                match self.module(&spec.module) {
                    None => self.raise(format!("Bank {} names unknown module {}", decl.name, spec.module)),
                    Some(module) if module.pool(spec.lc_index).is_none() => {
                        warn!("Module {} has no location counter {}", module.name, spec.lc_index);
                    }
                    Some(_) => {}
                }
                if !pools.insert(pool_key(&spec.module.to_uppercase(), spec.lc_index)) {
                    self.raise(format!("Pool {} is placed more than once", spec));
                }
            }
        }
    }

    /// Gives each pool the address of the running cursor of its bank.
    fn map_pools(&mut self) {
        for (index, decl) in self.declarations.iter().enumerate() {
            let mut address = decl.starting_address as usize;
            for spec in decl.pools.iter() {
                let key = pool_key(&spec.module.to_uppercase(), spec.lc_index);
                debug!("pool {} at {:08o} in bank {}", spec, address, decl.name);
                self.pool_addresses.entry(key.clone()).or_insert(address as u32);
                self.pool_banks.entry(key).or_insert(index);
                address += self.pool_size(spec);
            }
        }
    }

    fn pool_address(&self, module: &str, lc_index: u32) -> Option<u32> {
        self.pool_addresses.get(&pool_key(&module.to_uppercase(), lc_index)).copied()
    }

    fn bank_of(&self, module: &str, lc_index: u32) -> Option<&'a BankDeclaration> {
        let index = *self.pool_banks.get(&pool_key(&module.to_uppercase(), lc_index))?;
        self.declarations.get(index)
    }

    /// Builds the link-global symbol table. Location counter references are
    /// resolved here, while the exporting module is still known; references
    /// to other labels are left until the banks are loaded.
    fn extract_symbols(&mut self) {
        let modules: Vec<&'a RelocatableModule> = self.modules.values().copied().collect();
        for module in modules {
            for (label, value) in module.exports.iter() {
                let mut word = value.word();
                let mut references = Vec::new();
                let mut lc_index = None;
                for reference in value.references.iter() {
                    match reference {
                        UndefinedReference::ToLocationCounter { lc_index: lc, is_negative, field } => {
                            let address = match self.pool_address(&module.name, *lc) {
                                Some(address) => address as i64,
                                None => {
                                    self.raise(format!("Label {} of module {} is in unplaced location counter {}", label, module.name, lc));
                                    0
                                }
                            };
                            let addend = if *is_negative { -address } else { address };
                            word = self.integrate(word, *field, addend, &module.name, *lc);
                            lc_index.get_or_insert(*lc);
                        }
                        other => references.push(other.clone()),
                    }
                }

                if self.symbols.contains_key(label) {
                    if label != ENTRY_POINT_LABEL {
                        self.raise(format!("Label {} is exported by more than one module", label));
                    }
                    continue;
                }
                debug!("symbol {} = {:012o} from {}", label, word, module.name);
                self.symbols.insert(
                    label.clone(),
                    LinkedSymbol {
                        value: IntegerValue::with_references(DoubleWord36::from_word(word), references),
                        module: module.name.clone(),
                        lc_index,
                    },
                );
            }
        }
    }

    fn integrate(&mut self, word: u64, field: FieldDescriptor, addend: i64, module: &str, lc_index: u32) -> u64 {
        let integration = word36::integrate(word, field, addend);
        if integration.truncated {
            warn!("Truncation resolving value in {} for module {} LC {}", field, module, lc_index);
        }
        integration.value
    }

    /// Applies `references` to `word`, on behalf of a word found at `site`.
    fn resolve_word(&mut self, word: u64, references: &[UndefinedReference], site: Site, depth: usize) -> u64 {
        let mut word = word;
        let lc_for_messages = site.lc_index.unwrap_or(0);
        for reference in references {
            let addend = match reference {
                UndefinedReference::ToLabel { label, is_negative, .. } => {
                    let value = self.label_value(label, depth);
                    if *is_negative {
                        -value
                    } else {
                        value
                    }
                }
                UndefinedReference::ToLocationCounter { lc_index, is_negative, .. } => {
                    match self.pool_address(site.module, *lc_index) {
                        Some(address) if *is_negative => -(address as i64),
                        Some(address) => address as i64,
                        None => {
                            self.raise(format!("Location counter {} of module {} is not placed in any bank", lc_index, site.module));
                            0
                        }
                    }
                }
                UndefinedReference::Special { kind, target, .. } => self.special_value(*kind, target.as_ref(), site),
            };
            word = self.integrate(word, reference.field(), addend, site.module, lc_for_messages);
        }
        word
    }

    fn label_value(&mut self, label: &str, depth: usize) -> i64 {
        if depth >= MAX_REFERENCE_DEPTH {
            self.raise(format!("Reference chain too deep resolving {}", label));
            return 0;
        }
        let symbol = match self.symbols.get(label) {
            Some(symbol) => symbol.clone(),
            None => {
                self.raise(format!("Undefined reference:{}", label));
                return 0;
            }
        };
        let site = Site { module: &symbol.module, lc_index: symbol.lc_index };
        let word = self.resolve_word(symbol.value.word(), &symbol.value.references, site, depth + 1);
        word36::to_i64(word)
    }

    /// BDI (or level and BDI) of the bank holding the target. Call forms
    /// yield zero when the target shares the bank of the reference.
    fn special_value(&mut self, kind: SpecialKind, target: Option<&SpecialTarget>, site: Site) -> i64 {
        let home = site.lc_index.and_then(|lc| self.bank_of(site.module, lc));
        let bank = match target {
            None => home,
            Some(SpecialTarget::LocationCounter(lc_index)) => self.bank_of(site.module, *lc_index),
            Some(SpecialTarget::Label(label)) => match self.symbols.get(label) {
                Some(LinkedSymbol { module, lc_index: Some(lc_index), .. }) => self.bank_of(module, *lc_index),
                Some(_) => {
                    self.raise(format!("Incorrect parameter for {}: {} is not relocatable", kind.label(), label));
                    return 0;
                }
                None => {
                    self.raise(format!("Undefined reference for {}:{}", kind.label(), label));
                    return 0;
                }
            },
        };
        let bank = match bank {
            Some(bank) => bank,
            None => {
                self.raise(format!("Cannot find the bank for {} in module {}", kind.label(), site.module));
                return 0;
            }
        };

        if kind.is_call() && home.map(|h| h.bdi) == Some(bank.bdi) {
            return 0;
        }
        if kind.includes_level() {
            ((bank.level << 15) | bank.bdi) as i64
        } else {
            (bank.bdi & 0o77777) as i64
        }
    }

    fn load_bank(&mut self, decl: &BankDeclaration) -> LoadableBank {
        let size: usize = decl.pools.iter().map(|spec| self.pool_size(spec)).sum();
        let mut content = vec![0u64; size];
        let mut extended_mode = decl.needs_extended_mode;

        // Pools are laid down at this bank's own cursor. A pool placed in more
        // than one bank has already been counted as an error.
        let mut cursor = 0usize;
        for spec in decl.pools.iter() {
            let pool_base = cursor;
            cursor += self.pool_size(spec);
            let module = match self.module(&spec.module) {
                Some(module) => module,
                None => continue,
            };
            let pool = match module.pool(spec.lc_index) {
                Some(pool) => pool,
                None => continue,
            };
            extended_mode |= pool.extended_mode;
            let site = Site { module: &module.name, lc_index: Some(spec.lc_index) };
            for (offset, word) in pool.words.iter().enumerate() {
                // Holes left by $RES stay zero.
                if let Some(word) = word {
                    let value = self.resolve_word(word.value.word(), &word.value.references, site, 0);
                    if let Some(slot) = content.get_mut(pool_base + offset) {
                        *slot = value;
                    }
                }
            }
        }

        info!(
            "bank {} BDI {:06o} level {} at {:08o}, {} words{}",
            decl.name,
            decl.bdi,
            decl.level,
            decl.starting_address,
            size,
            if extended_mode { ", extended mode" } else { "" }
        );
        LoadableBank {
            name: decl.name.clone(),
            bdi: decl.bdi,
            level: decl.level,
            access_info: decl.access_info,
            general_permissions: decl.general_permissions,
            special_permissions: decl.special_permissions,
            starting_address: decl.starting_address,
            initial_base_register: decl.initial_base_register,
            extended_mode,
            content,
        }
    }

    /// Looks for `START$` in every module. It must carry exactly one
    /// location counter reference.
    fn find_entry_point(&mut self) -> (Option<EntryPoint>, Option<&'a RelocatableModule>) {
        let mut found: Option<(EntryPoint, &'a RelocatableModule)> = None;
        let modules: Vec<&'a RelocatableModule> = self.modules.values().copied().collect();
        for module in modules {
            let value = match module.export(ENTRY_POINT_LABEL) {
                Some(value) => value,
                None => continue,
            };
            let (lc_index, is_negative, field) = match value.references.as_slice() {
                [UndefinedReference::ToLocationCounter { lc_index, is_negative, field }] => (*lc_index, *is_negative, *field),
                [_] => {
                    self.raise(format!("Improper {} label in module {} - wrong undefined reference", ENTRY_POINT_LABEL, module.name));
                    continue;
                }
                _ => {
                    self.raise(format!(
                        "Improper {} label in module {} - wrong number of undefined references",
                        ENTRY_POINT_LABEL, module.name
                    ));
                    continue;
                }
            };
            if found.is_some() {
                self.raise(format!("Duplicate {} label in module {}", ENTRY_POINT_LABEL, module.name));
                continue;
            }

            let (address, bank) = match (self.pool_address(&module.name, lc_index), self.bank_of(&module.name, lc_index)) {
                (Some(address), Some(bank)) => (address as i64, bank),
                _ => {
                    self.raise(format!("{} in module {} is in unplaced location counter {}", ENTRY_POINT_LABEL, module.name, lc_index));
                    continue;
                }
            };
            let addend = if is_negative { -address } else { address };
            let word = self.integrate(value.word(), field, addend, &module.name, lc_index);
            let entry = EntryPoint { bdi: bank.bdi, address: word as u32 };
            debug!("entry point bank {:06o} address {:08o}", entry.bdi, entry.address);
            found = Some((entry, module));
        }
        match found {
            Some((entry, module)) => (Some(entry), Some(module)),
            None => (None, None),
        }
    }

    /// Every mode any placed module asks for.
    fn contributing_modes(&self) -> ModeFlags {
        let mut modes = ModeFlags::default();
        let mut seen = HashSet::new();
        for decl in self.declarations {
            for spec in decl.pools.iter() {
                let module = match self.module(&spec.module) {
                    Some(module) => module,
                    None => continue,
                };
                if !seen.insert(module.name.to_uppercase()) {
                    continue;
                }
                modes.quarter_word |= module.modes.quarter_word;
                modes.third_word |= module.modes.third_word;
                modes.af_compatibility |= module.modes.af_compatibility;
                modes.af_non_interrupt |= module.modes.af_non_interrupt;
            }
        }
        modes
    }

    fn symbol_listing(&self) -> String {
        let mut grid = Grid::new(GridOptions {
            filling: Filling::Spaces(2),
            direction: Direction::LeftToRight,
        });
        for (label, symbol) in self.symbols.iter() {
            grid.add(Cell::from(label.clone()));
            grid.add(Cell::from(symbol.value.to_string()));
            grid.add(Cell::from(match symbol.lc_index {
                Some(lc_index) => format!("{}$({})", symbol.module, lc_index),
                None => symbol.module.clone(),
            }));
        }
        grid.fit_into_columns(3).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Assembler;

    fn assemble(name: &str, lines: &[&str]) -> RelocatableModule {
        let mut asm = Assembler::new();
        let module = asm.assemble(name, lines);
        assert!(asm.diagnostics().is_empty(), "{:?}", asm.diagnostics());
        module.unwrap()
    }

    fn single_bank(module: &str, lc_index: u32, start: u32) -> BankDeclaration {
        BankDeclaration::builder("MAIN")
            .bdi(0o4)
            .starting_address(start)
            .pool(module, lc_index)
            .build()
            .unwrap()
    }

    #[test]
    fn test_option_names() {
        for name in LinkOption::NAMES.iter() {
            assert!(LinkOption::from_name(name).is_some());
        }
        assert_eq!(LinkOption::from_name("summary"), Some(LinkOption::EmitSummary));
        assert_eq!(LinkOption::from_name("bogus"), None);
    }

    #[test]
    fn test_export_resolved_to_address() {
        let module = assemble("M", &["$(0) + 7", "$(0) + 8", "$(0)A* + A"]);
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        let absolute = linker.link("P", &[module], &[single_bank("M", 0, 0o1000)], 0).unwrap();
        assert_eq!(linker.errors(), 0);
        let bank = absolute.bank(0o4).unwrap();
        assert_eq!(bank.content, vec![7, 8, 0o1002]);
        assert_eq!(bank.word_at(0o1002), Some(0o1002));
        assert!(absolute.entry_point.is_none());
    }

    #[test]
    fn test_banks_do_not_overlap() {
        let module = assemble("M", &["$(1) + 1", "$(1) + 2", "$(1) + 3", "$(2) + 4", "$(2) + 5"]);
        let declarations = vec![
            BankDeclaration::builder("ONE").bdi(0o4).starting_address(0o1000).pool("M", 1).build().unwrap(),
            BankDeclaration::builder("TWO").bdi(0o5).starting_address(0o2000).pool("M", 2).build().unwrap(),
        ];
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        let absolute = linker.link("P", &[module], &declarations, 0).unwrap();
        let one = absolute.bank(0o4).unwrap();
        let two = absolute.bank(0o5).unwrap();
        assert_eq!((one.starting_address, one.limit()), (0o1000, 0o1002));
        assert_eq!((two.starting_address, two.limit()), (0o2000, 0o2001));
        assert_eq!(one.content, vec![1, 2, 3]);
        assert_eq!(two.content, vec![4, 5]);
    }

    #[test]
    fn test_pools_share_a_bank() {
        let m1 = assemble("M1", &["$(1) + 1", "$(1) + 2"]);
        let m2 = assemble("M2", &["$(1)HERE* + HERE"]);
        let decl = BankDeclaration::builder("CODE")
            .bdi(0o4)
            .starting_address(0o1000)
            .pool("M1", 1)
            .pool("M2", 1)
            .build()
            .unwrap();
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        let absolute = linker.link("P", &[m1, m2], &[decl], 0).unwrap();
        assert_eq!(absolute.bank(0o4).unwrap().content, vec![1, 2, 0o1002]);
    }

    #[test]
    fn test_cross_module_reference() {
        let caller = assemble("CALLER", &["$(1) + TARGET", "$(1) - TARGET"]);
        let callee = assemble("CALLEE", &["$(1) + 0", "$(1)TARGET* + 0"]);
        let declarations = vec![
            BankDeclaration::builder("CALLER").bdi(0o4).starting_address(0o1000).pool("CALLER", 1).build().unwrap(),
            BankDeclaration::builder("CALLEE").bdi(0o5).starting_address(0o2000).pool("CALLEE", 1).build().unwrap(),
        ];
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        let absolute = linker.link("P", &[caller, callee], &declarations, 0).unwrap();
        let content = &absolute.bank(0o4).unwrap().content;
        assert_eq!(content[0], 0o2001);
        assert_eq!(content[1], word36::negate(0o2001));
    }

    #[test]
    fn test_undefined_reference() {
        let module = assemble("M", &["$(1) + NOWHERE"]);
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        assert!(linker.link("P", &[module], &[single_bank("M", 1, 0o1000)], 0).is_none());
        assert_eq!(linker.errors(), 1);
    }

    #[test]
    fn test_entry_point() {
        let module = assemble("M", &["$(1) + 0", "$(1)START$* + 0"]);
        let mut linker = Linker::new();
        let absolute = linker.link("P", &[module], &[single_bank("M", 1, 0o1000)], 0).unwrap();
        assert_eq!(absolute.entry_point, Some(EntryPoint { bdi: 0o4, address: 0o1001 }));

        let module = assemble("M", &["$(1) + 0", "$(1),START$* + 0"]);
        let absolute = linker.link("P", &[module], &[single_bank("M", 1, 0o1000)], 0).unwrap();
        assert_eq!(absolute.entry_point, Some(EntryPoint { bdi: 0o4, address: 0o1001 }));
    }

    #[test]
    fn test_missing_entry_point() {
        let module = assemble("M", &["$(1) + 0"]);
        let mut linker = Linker::new();
        assert!(linker.link("P", &[module.clone()], &[single_bank("M", 1, 0)], 0).is_none());
        assert_eq!(linker.errors(), 1);

        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        assert!(linker.link("P", &[module], &[single_bank("M", 1, 0)], 0).is_some());
    }

    #[test]
    fn test_duplicate_entry_point() {
        let m1 = assemble("M1", &["$(1)START$* + 0"]);
        let m2 = assemble("M2", &["$(1)START$* + 0"]);
        let decl = BankDeclaration::builder("CODE").bdi(0o4).pool("M1", 1).pool("M2", 1).build().unwrap();
        let mut linker = Linker::new();
        assert!(linker.link("P", &[m1, m2], &[decl], 0).is_none());
        assert_eq!(linker.errors(), 1);
    }

    #[test]
    fn test_improper_entry_point() {
        let module = assemble("M", &["START$* $EQU 5", "$(1) + 0"]);
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        assert!(linker.link("P", &[module], &[single_bank("M", 1, 0)], 0).is_none());
        assert!(linker.errors() >= 1);
    }

    #[test]
    fn test_reserved_words_load_as_zero() {
        let module = assemble("M", &["$(1) + 1", "$(1) $RES 2", "$(1) + 2"]);
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        let absolute = linker.link("P", &[module], &[single_bank("M", 1, 0o1000)], 0).unwrap();
        assert_eq!(absolute.bank(0o4).unwrap().content, vec![1, 0, 0, 2]);
    }

    #[test]
    fn test_return_control_stack() {
        let module = assemble("M", &["$(1) + 1"]);
        let access = bank::AccessInfo { ring: 2, domain: 0o100 };
        let decl = BankDeclaration::builder("MAIN")
            .bdi(0o4)
            .level(6)
            .access_info(access)
            .pool("M", 1)
            .build()
            .unwrap();
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        let absolute = linker.link("P", &[module], &[decl], 4).unwrap();
        let rcs = absolute.bank_named(RCS_BANK_NAME).unwrap();
        assert_eq!(rcs.bdi, 0o5);
        assert_eq!(rcs.level, 6);
        assert_eq!(rcs.content.len(), 32);
        assert!(rcs.extended_mode);
        assert_eq!(rcs.starting_address, 0);
        assert_eq!(rcs.initial_base_register, Some(25));
        assert_eq!(rcs.access_info, access);
    }

    #[test]
    fn test_bdi_specials() {
        let caller = assemble(
            "CALLER",
            &["$(1) + BDIREF$(FAR)", "$(1) + BDICALL$(FAR)", "$(1) + BDICALL$(NEAR)", "$(1) + LBDIREF$(FAR)", "$(1)NEAR* + 0"],
        );
        let callee = assemble("CALLEE", &["$(1)FAR* + 0"]);
        let declarations = vec![
            BankDeclaration::builder("CALLER").bdi(0o4).pool("CALLER", 1).build().unwrap(),
            BankDeclaration::builder("CALLEE").bdi(0o7).level(2).pool("CALLEE", 1).build().unwrap(),
        ];
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        let absolute = linker.link("P", &[caller, callee], &declarations, 0).unwrap();
        let content = &absolute.bank(0o4).unwrap().content;
        assert_eq!(content[0], 0o7);
        assert_eq!(content[1], 0o7);
        assert_eq!(content[2], 0);
        assert_eq!(content[3], (2 << 15) | 0o7);
    }

    #[test]
    fn test_extended_mode_from_pool() {
        let module = assemble("M", &["  $INFO 10 1", "$(1) + 1", "$(2) + 2"]);
        let declarations = vec![
            BankDeclaration::builder("ONE").bdi(0o4).pool("M", 1).build().unwrap(),
            BankDeclaration::builder("TWO").bdi(0o5).pool("M", 2).build().unwrap(),
            BankDeclaration::builder("THREE").bdi(0o6).pool("M", 2).needs_extended_mode(true).build().unwrap(),
        ];
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        // pool $(2) placed twice
        assert!(linker.link("P", &[module.clone()], &declarations, 0).is_none());

        let absolute = linker.link("P", &[module], &declarations[..2], 0).unwrap();
        assert!(absolute.bank(0o4).unwrap().extended_mode);
        assert!(!absolute.bank(0o5).unwrap().extended_mode);
    }

    #[test]
    fn test_pool_placed_at_two_addresses() {
        let module = assemble("M", &["$(1) + 1", "$(1) + 2"]);
        let declarations = vec![
            BankDeclaration::builder("ONE").bdi(0o4).starting_address(0o2000).pool("M", 1).build().unwrap(),
            BankDeclaration::builder("TWO").bdi(0o5).starting_address(0o3000).pool("M", 1).build().unwrap(),
        ];
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        assert!(linker.link("P", &[module.clone()], &declarations, 0).is_none());
        assert!(linker.errors() >= 1);

        let reversed: Vec<BankDeclaration> = declarations.into_iter().rev().collect();
        assert!(linker.link("P", &[module], &reversed, 0).is_none());
        assert!(linker.errors() >= 1);
    }

    #[test]
    fn test_determine_modes() {
        let quarter = ModeFlags { quarter_word: true, ..Default::default() };
        let both = ModeFlags { quarter_word: true, third_word: true, ..Default::default() };
        let third = ModeFlags { third_word: true, ..Default::default() };

        let linker = Linker::new();
        assert_eq!(linker.determine_modes(&quarter, None), quarter);
        assert_eq!(linker.determine_modes(&both, Some(third)), third);
        assert_eq!(linker.determine_modes(&both, None), ModeFlags::default());

        let linker = Linker::new().with_options(&[LinkOption::ThirdWordMode, LinkOption::AfNonInterruptMode]);
        let modes = linker.determine_modes(&quarter, None);
        assert!(modes.third_word && !modes.quarter_word);
        assert!(modes.af_non_interrupt && !modes.af_compatibility);
    }

    #[test]
    fn test_unknown_module() {
        let module = assemble("M", &["$(1) + 1"]);
        let mut linker = Linker::new().with_options(&[LinkOption::NoEntryPoint]);
        assert!(linker.link("P", &[module], &[single_bank("OTHER", 1, 0)], 0).is_none());
        assert!(linker.errors() >= 1);
    }
}
