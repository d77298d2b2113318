//! Instruction mnemonics and the instruction word layouts.
//!
//! The assembler consults a `MnemonicTable` for the fixed fields of an
//! instruction. `StandardMnemonicTable` carries the common instruction set;
//! callers may supply their own table instead.
use super::value::Form;
use std::fmt;

/// The code generation mode selected by `$BASIC` / `$EXTEND`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CodeMode {
    Basic,
    Extended,
}

/// The modes in which an instruction exists.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InstructionMode {
    Basic,
    Extended,
    Either,
}

impl InstructionMode {
    pub fn allows(&self, mode: CodeMode) -> bool {
        match self {
            InstructionMode::Either => true,
            InstructionMode::Basic => mode == CodeMode::Basic,
            InstructionMode::Extended => mode == CodeMode::Extended,
        }
    }
}

/// How the register operand maps onto the a-field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ASemantics {
    None,
    /// An A register; A0 is GRS address 12.
    A,
    /// A base register.
    B,
    /// An exec base register, B16 through B31.
    BExec,
    /// An R register; R0 is GRS address 64.
    R,
    /// An index register.
    X,
}

impl ASemantics {
    /// Converts a register's GRS address to its a-field value.
    pub fn a_field(&self, register: i64) -> i64 {
        match self {
            ASemantics::A => register - 12,
            ASemantics::R => register - 64,
            ASemantics::BExec => register - 16,
            _ => register,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InstructionInfo {
    pub mode: InstructionMode,
    pub f_field: u64,
    pub j_field: u64,
    pub a_field: u64,
    /// The j-field is fixed and may not be given in the source.
    pub j_flag: bool,
    /// The a-field is fixed and no register operand is given.
    pub a_flag: bool,
    pub grs_flag: bool,
    pub immediate_flag: bool,
    pub a_semantics: ASemantics,
    pub mnemonic: &'static str,
    /// Uses the basic-mode word layout even in extended mode.
    pub use_bm_semantics: bool,
}

impl fmt::Display for InstructionInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} f={:02o} j={:02o} a={:02o}", self.mnemonic, self.f_field, self.j_field, self.a_field)
    }
}

/// Looks up an instruction by mnemonic for the given code mode.
pub trait MnemonicTable {
    fn lookup(&self, mnemonic: &str, mode: CodeMode) -> Option<&InstructionInfo>;
}

#[derive(Clone, Debug)]
pub struct StandardMnemonicTable {
    entries: Vec<InstructionInfo>,
}

impl StandardMnemonicTable {
    pub fn new() -> Self {
        StandardMnemonicTable { entries: STANDARD_INSTRUCTIONS.to_vec() }
    }

    pub fn with_entries(entries: Vec<InstructionInfo>) -> Self {
        StandardMnemonicTable { entries }
    }
}

impl Default for StandardMnemonicTable {
    fn default() -> Self {
        StandardMnemonicTable::new()
    }
}

impl MnemonicTable for StandardMnemonicTable {
    fn lookup(&self, mnemonic: &str, mode: CodeMode) -> Option<&InstructionInfo> {
        let upper = mnemonic.to_uppercase();
        self.entries.iter().find(|info| info.mnemonic == upper && info.mode.allows(mode))
    }
}

/// J-field designators for partial-word and immediate operands.
pub const J_FIELD_NAMES: [(&str, u64); 20] = [
    ("W", 0o00),
    ("H2", 0o01),
    ("H1", 0o02),
    ("XH2", 0o03),
    ("XH1", 0o04),
    ("Q2", 0o04),
    ("T3", 0o05),
    ("Q4", 0o05),
    ("T2", 0o06),
    ("Q3", 0o06),
    ("T1", 0o07),
    ("Q1", 0o07),
    ("S6", 0o10),
    ("S5", 0o11),
    ("S4", 0o12),
    ("S3", 0o13),
    ("S2", 0o14),
    ("S1", 0o15),
    ("U", 0o16),
    ("XU", 0o17),
];

pub fn j_field_for(name: &str) -> Option<u64> {
    let upper = name.to_uppercase();
    J_FIELD_NAMES.iter().find(|(n, _)| *n == upper).map(|(_, j)| *j)
}

/// The j-field values at and above which the operand is immediate.
pub const J_IMMEDIATE: u64 = 0o16;

/// Selects one of the three instruction word layouts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WordLayout {
    /// f(6) j(4) a(4) x(4) u(18)
    Fjaxu,
    /// f(6) j(4) a(4) x(4) h(1) i(1) u(16)
    Fjaxhiu,
    /// f(6) j(4) a(4) x(4) h(1) i(1) b(4) d(12)
    Fjaxhibd,
}

impl WordLayout {
    pub fn select(info: &InstructionInfo, j_field: u64, mode: CodeMode) -> WordLayout {
        if !info.j_flag && j_field >= J_IMMEDIATE {
            WordLayout::Fjaxu
        } else if mode == CodeMode::Basic || info.use_bm_semantics {
            WordLayout::Fjaxhiu
        } else {
            WordLayout::Fjaxhibd
        }
    }

    pub fn field_sizes(&self) -> Vec<u32> {
        match self {
            WordLayout::Fjaxu => vec![6, 4, 4, 4, 18],
            WordLayout::Fjaxhiu => vec![6, 4, 4, 4, 1, 1, 16],
            WordLayout::Fjaxhibd => vec![6, 4, 4, 4, 1, 1, 4, 12],
        }
    }

    pub fn form(&self) -> Result<Form, String> {
        Form::new(self.field_sizes())
    }
}

/// A base register may be given only for extended-mode layouts which carry a
/// b-field.
pub fn base_register_allowed(info: &InstructionInfo, j_field: u64, mode: CodeMode) -> bool {
    mode == CodeMode::Extended && !info.use_bm_semantics && (info.j_flag || j_field < J_IMMEDIATE)
}

#[allow(clippy::too_many_arguments)]
const fn info(
    mode: InstructionMode,
    f_field: u64,
    j_field: u64,
    a_field: u64,
    j_flag: bool,
    a_flag: bool,
    grs_flag: bool,
    immediate_flag: bool,
    a_semantics: ASemantics,
    mnemonic: &'static str,
    use_bm_semantics: bool,
) -> InstructionInfo {
    InstructionInfo {
        mode,
        f_field,
        j_field,
        a_field,
        j_flag,
        a_flag,
        grs_flag,
        immediate_flag,
        a_semantics,
        mnemonic,
        use_bm_semantics,
    }
}

use self::ASemantics as S;
use self::InstructionMode::{Basic as B, Either as E, Extended as X};

const STANDARD_INSTRUCTIONS: &[InstructionInfo] = &[
    info(E, 0o01, 0o00, 0o00, false, false, true, false, S::A, "SA", false),
    info(E, 0o02, 0o00, 0o00, false, false, true, false, S::A, "SNA", false),
    info(E, 0o03, 0o00, 0o00, false, false, true, false, S::A, "SMA", false),
    info(E, 0o04, 0o00, 0o00, false, false, true, false, S::R, "SR", false),
    info(E, 0o05, 0o00, 0o00, false, true, true, false, S::None, "SZ", false),
    info(E, 0o05, 0o00, 0o01, false, true, true, false, S::None, "SNZ", false),
    info(E, 0o05, 0o00, 0o02, false, true, true, false, S::None, "SP1", false),
    info(E, 0o05, 0o00, 0o03, false, true, true, false, S::None, "SN1", false),
    info(E, 0o05, 0o00, 0o04, false, true, true, false, S::None, "SFS", false),
    info(E, 0o05, 0o00, 0o05, false, true, true, false, S::None, "SFZ", false),
    info(E, 0o05, 0o00, 0o06, false, true, true, false, S::None, "SAS", false),
    info(E, 0o05, 0o00, 0o07, false, true, true, false, S::None, "SAZ", false),
    info(E, 0o05, 0o00, 0o10, false, true, true, false, S::None, "INC", false),
    info(E, 0o05, 0o00, 0o11, false, true, true, false, S::None, "DEC", false),
    info(E, 0o05, 0o00, 0o12, false, true, true, false, S::None, "INC2", false),
    info(E, 0o05, 0o00, 0o13, false, true, true, false, S::None, "DEC2", false),
    info(E, 0o05, 0o00, 0o14, false, true, true, false, S::None, "ENZ", false),
    info(E, 0o05, 0o00, 0o15, false, true, true, false, S::None, "ADD1", false),
    info(E, 0o05, 0o00, 0o16, false, true, true, false, S::None, "SUB1", false),
    info(E, 0o06, 0o00, 0o00, false, false, true, false, S::X, "SX", false),
    info(B, 0o07, 0o12, 0o00, true, false, false, false, S::X, "LDJ", false),
    info(B, 0o07, 0o13, 0o00, true, false, false, false, S::X, "LIJ", false),
    info(X, 0o07, 0o16, 0o13, true, true, false, false, S::None, "CALL", false),
    info(B, 0o07, 0o17, 0o00, true, false, false, false, S::X, "LBJ", false),
    info(X, 0o07, 0o17, 0o00, true, true, false, false, S::None, "GOTO", false),
    info(E, 0o10, 0o00, 0o00, false, false, true, true, S::A, "LA", false),
    info(E, 0o11, 0o00, 0o00, false, false, true, true, S::A, "LNA", false),
    info(E, 0o12, 0o00, 0o00, false, false, true, true, S::A, "LMA", false),
    info(E, 0o13, 0o00, 0o00, false, false, true, true, S::A, "LNMA", false),
    info(E, 0o14, 0o00, 0o00, false, false, true, true, S::A, "AA", false),
    info(E, 0o15, 0o00, 0o00, false, false, true, true, S::A, "ANA", false),
    info(E, 0o16, 0o00, 0o00, false, false, true, true, S::A, "AMA", false),
    info(E, 0o17, 0o00, 0o00, false, false, true, true, S::A, "ANMA", false),
    info(E, 0o20, 0o00, 0o00, false, false, true, true, S::A, "AU", false),
    info(E, 0o21, 0o00, 0o00, false, false, true, true, S::A, "ANU", false),
    info(E, 0o23, 0o00, 0o00, false, false, true, true, S::R, "LR", false),
    info(E, 0o24, 0o00, 0o00, false, false, true, true, S::X, "AX", false),
    info(E, 0o25, 0o00, 0o00, false, false, true, true, S::X, "ANX", false),
    info(E, 0o26, 0o00, 0o00, false, false, true, true, S::X, "LXM", false),
    info(E, 0o27, 0o00, 0o00, false, false, true, true, S::X, "LX", false),
    info(E, 0o30, 0o00, 0o00, false, false, true, true, S::A, "MI", false),
    info(E, 0o31, 0o00, 0o00, false, false, true, true, S::A, "MSI", false),
    info(E, 0o32, 0o00, 0o00, false, false, true, true, S::A, "MF", false),
    info(E, 0o34, 0o00, 0o00, false, false, true, true, S::A, "DI", false),
    info(E, 0o35, 0o00, 0o00, false, false, true, true, S::A, "DSF", false),
    info(E, 0o36, 0o00, 0o00, false, false, true, true, S::A, "DF", false),
    info(E, 0o40, 0o00, 0o00, false, false, true, true, S::A, "OR", false),
    info(E, 0o41, 0o00, 0o00, false, false, true, true, S::A, "XOR", false),
    info(E, 0o42, 0o00, 0o00, false, false, true, true, S::A, "AND", false),
    info(E, 0o43, 0o00, 0o00, false, false, true, true, S::A, "MLU", false),
    info(E, 0o44, 0o00, 0o00, false, false, true, true, S::A, "TEP", false),
    info(E, 0o45, 0o00, 0o00, false, false, true, true, S::A, "TOP", false),
    info(E, 0o46, 0o00, 0o00, false, false, true, true, S::X, "LXI", false),
    info(E, 0o47, 0o00, 0o00, false, false, true, true, S::A, "TLEM", false),
    info(B, 0o50, 0o00, 0o00, false, false, true, true, S::None, "TZ", false),
    info(X, 0o50, 0o00, 0o00, false, true, true, true, S::None, "TNOP", false),
    info(X, 0o50, 0o00, 0o01, false, true, true, true, S::None, "TGZ", false),
    info(X, 0o50, 0o00, 0o02, false, true, true, true, S::None, "TPZ", false),
    info(X, 0o50, 0o00, 0o03, false, true, true, true, S::None, "TP", false),
    info(X, 0o50, 0o00, 0o04, false, true, true, true, S::None, "TMZ", false),
    info(X, 0o50, 0o00, 0o05, false, true, true, true, S::None, "TMZG", false),
    info(X, 0o50, 0o00, 0o06, false, true, true, true, S::None, "TZ", false),
    info(X, 0o50, 0o00, 0o07, false, true, true, true, S::None, "TNLZ", false),
    info(X, 0o50, 0o00, 0o10, false, true, true, true, S::None, "TLZ", false),
    info(X, 0o50, 0o00, 0o11, false, true, true, true, S::None, "TNZ", false),
    info(X, 0o50, 0o00, 0o14, false, true, true, true, S::None, "TN", false),
    info(X, 0o50, 0o00, 0o17, false, true, true, true, S::None, "TSKP", false),
    info(B, 0o51, 0o00, 0o00, false, false, true, true, S::None, "TNZ", false),
    info(E, 0o52, 0o00, 0o00, false, false, true, true, S::A, "TE", false),
    info(E, 0o53, 0o00, 0o00, false, false, true, true, S::A, "TNE", false),
    info(E, 0o54, 0o00, 0o00, false, false, true, true, S::A, "TLE", false),
    info(E, 0o55, 0o00, 0o00, false, false, true, true, S::A, "TG", false),
    info(E, 0o56, 0o00, 0o00, false, false, true, true, S::A, "TW", false),
    info(E, 0o57, 0o00, 0o00, false, false, true, true, S::A, "TNW", false),
    info(B, 0o60, 0o00, 0o00, false, false, true, true, S::None, "TP", false),
    info(B, 0o61, 0o00, 0o00, false, false, true, true, S::None, "TN", false),
    info(E, 0o62, 0o00, 0o00, false, false, true, true, S::A, "SE", false),
    info(E, 0o63, 0o00, 0o00, false, false, true, true, S::A, "SNE", false),
    info(E, 0o64, 0o00, 0o00, false, false, true, true, S::A, "SLE", false),
    info(E, 0o65, 0o00, 0o00, false, false, true, true, S::A, "SG", false),
    info(E, 0o66, 0o00, 0o00, false, false, true, true, S::A, "SW", false),
    info(E, 0o67, 0o00, 0o00, false, false, true, true, S::A, "SNW", false),
    info(E, 0o71, 0o10, 0o00, true, false, true, false, S::A, "DA", false),
    info(E, 0o71, 0o12, 0o00, true, false, true, false, S::A, "DS", false),
    info(E, 0o71, 0o13, 0o00, true, false, true, false, S::A, "DL", false),
    info(E, 0o71, 0o16, 0o00, true, false, false, false, S::A, "DJZ", true),
    info(B, 0o72, 0o01, 0o00, true, false, false, false, S::None, "SLJ", false),
    info(E, 0o73, 0o00, 0o00, true, false, false, false, S::A, "SSC", true),
    info(E, 0o73, 0o02, 0o00, true, false, false, false, S::A, "SSL", true),
    info(E, 0o73, 0o03, 0o00, true, false, false, false, S::A, "DSL", true),
    info(E, 0o73, 0o11, 0o00, true, false, false, false, S::A, "LDSC", true),
    info(E, 0o73, 0o12, 0o00, true, false, false, false, S::A, "LSSL", true),
    info(X, 0o73, 0o14, 0o00, true, true, true, false, S::None, "NOP", false),
    info(E, 0o73, 0o15, 0o14, true, true, true, false, S::None, "LD", false),
    info(E, 0o73, 0o17, 0o00, true, true, false, false, S::None, "TS", false),
    info(E, 0o73, 0o17, 0o01, true, true, false, false, S::None, "TSS", false),
    info(X, 0o73, 0o17, 0o03, true, true, false, false, S::None, "RTN", false),
    info(E, 0o74, 0o00, 0o00, true, false, false, false, S::A, "JZ", true),
    info(E, 0o74, 0o01, 0o00, true, false, false, false, S::A, "JNZ", true),
    info(E, 0o74, 0o02, 0o00, true, false, false, false, S::A, "JP", true),
    info(E, 0o74, 0o03, 0o00, true, false, false, false, S::A, "JN", true),
    info(B, 0o74, 0o04, 0o00, true, true, false, false, S::None, "J", true),
    info(B, 0o74, 0o04, 0o00, true, false, false, false, S::None, "JK", true),
    info(B, 0o74, 0o06, 0o00, true, false, true, false, S::A, "NOP", false),
    info(E, 0o74, 0o10, 0o00, true, false, false, false, S::A, "JNB", true),
    info(E, 0o74, 0o11, 0o00, true, false, false, false, S::A, "JB", true),
    info(E, 0o74, 0o13, 0o00, true, false, false, false, S::X, "LMJ", true),
    info(E, 0o74, 0o14, 0o07, true, true, false, false, S::None, "PAIJ", true),
    info(X, 0o74, 0o14, 0o04, true, true, false, false, S::None, "JC", true),
    info(X, 0o74, 0o14, 0o05, true, true, false, false, S::None, "JNC", true),
    info(X, 0o74, 0o15, 0o04, true, true, false, false, S::None, "J", true),
    info(E, 0o74, 0o15, 0o05, true, true, false, false, S::None, "HLTJ", true),
    info(B, 0o74, 0o16, 0o00, true, false, false, false, S::None, "JC", true),
    info(B, 0o74, 0o17, 0o00, true, false, false, false, S::None, "JNC", true),
    info(E, 0o75, 0o00, 0o00, true, false, true, false, S::B, "LBU", false),
    info(E, 0o75, 0o02, 0o00, true, false, true, false, S::B, "SBU", false),
    info(E, 0o75, 0o03, 0o00, true, false, true, false, S::BExec, "LBE", false),
    info(E, 0o75, 0o04, 0o00, true, false, false, false, S::BExec, "SBED", false),
    info(E, 0o75, 0o06, 0o00, true, false, false, false, S::B, "SBUD", false),
    info(E, 0o75, 0o13, 0o00, true, false, true, false, S::X, "LXLM", false),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_mode() {
        let table = StandardMnemonicTable::new();
        let la = table.lookup("la", CodeMode::Basic).unwrap();
        assert_eq!(la.f_field, 0o10);
        assert_eq!(la.a_semantics, ASemantics::A);

        let j_basic = table.lookup("J", CodeMode::Basic).unwrap();
        assert_eq!((j_basic.f_field, j_basic.j_field, j_basic.a_field), (0o74, 0o04, 0));
        let j_ext = table.lookup("J", CodeMode::Extended).unwrap();
        assert_eq!((j_ext.f_field, j_ext.j_field, j_ext.a_field), (0o74, 0o15, 0o04));

        assert!(table.lookup("GOTO", CodeMode::Basic).is_none());
        assert!(table.lookup("GOTO", CodeMode::Extended).is_some());
        assert!(table.lookup("NOTANOP", CodeMode::Basic).is_none());
    }

    #[test]
    fn test_j_field_names() {
        assert_eq!(j_field_for("u"), Some(0o16));
        assert_eq!(j_field_for("XU"), Some(0o17));
        assert_eq!(j_field_for("Q2"), j_field_for("XH1"));
        assert_eq!(j_field_for("S7"), None);
    }

    #[test]
    fn test_layout_selection() {
        let table = StandardMnemonicTable::new();
        let la = table.lookup("LA", CodeMode::Extended).unwrap();
        assert_eq!(WordLayout::select(la, 0o16, CodeMode::Extended), WordLayout::Fjaxu);
        assert_eq!(WordLayout::select(la, 0, CodeMode::Basic), WordLayout::Fjaxhiu);
        assert_eq!(WordLayout::select(la, 0, CodeMode::Extended), WordLayout::Fjaxhibd);
        assert!(base_register_allowed(la, 0, CodeMode::Extended));
        assert!(!base_register_allowed(la, 0o16, CodeMode::Extended));

        let lmj = table.lookup("LMJ", CodeMode::Extended).unwrap();
        assert_eq!(WordLayout::select(lmj, lmj.j_field, CodeMode::Extended), WordLayout::Fjaxhiu);
        assert!(!base_register_allowed(lmj, lmj.j_field, CodeMode::Extended));
    }

    #[test]
    fn test_a_semantics() {
        assert_eq!(ASemantics::A.a_field(12 + 5), 5);
        assert_eq!(ASemantics::R.a_field(64 + 3), 3);
        assert_eq!(ASemantics::X.a_field(11), 11);
        assert_eq!(ASemantics::BExec.a_field(18), 2);
    }
}
