//! What the linker is told to build, and what it builds.
use crate::assembler::module::ModeFlags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use term_grid::{Cell, Direction, Filling, Grid, GridOptions};

const MAX_BANK_LEVEL: u32 = 7;
const MAX_BDI: u32 = 0o77777;
const MAX_BASE_REGISTER: u32 = 31;

/// Ring and domain of a bank's access lock.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct AccessInfo {
    pub ring: u8,
    pub domain: u16,
}

impl fmt::Display for AccessInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{:06o}", self.ring, self.domain)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct AccessPermissions {
    pub enter: bool,
    pub read: bool,
    pub write: bool,
}

impl AccessPermissions {
    pub fn new(enter: bool, read: bool, write: bool) -> Self {
        AccessPermissions { enter, read, write }
    }
}

impl fmt::Display for AccessPermissions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.enter { 'E' } else { '-' },
            if self.read { 'R' } else { '-' },
            if self.write { 'W' } else { '-' }
        )
    }
}

/// One location counter pool of one relocatable module, named by module.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct PoolSpecification {
    pub module: String,
    pub lc_index: u32,
}

impl PoolSpecification {
    pub fn new(module: &str, lc_index: u32) -> Self {
        PoolSpecification { module: module.to_string(), lc_index }
    }
}

impl fmt::Display for PoolSpecification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}$({})", self.module, self.lc_index)
    }
}

/// How one bank is to be laid out: its pools go end to end from
/// `starting_address` in the order given.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BankDeclaration {
    pub name: String,
    pub bdi: u32,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub access_info: AccessInfo,
    #[serde(default)]
    pub general_permissions: AccessPermissions,
    #[serde(default)]
    pub special_permissions: AccessPermissions,
    #[serde(default)]
    pub starting_address: u32,
    #[serde(default)]
    pub initial_base_register: Option<u32>,
    pub pools: Vec<PoolSpecification>,
    /// Forces extended mode even if no pool asks for it.
    #[serde(default)]
    pub needs_extended_mode: bool,
}

impl BankDeclaration {
    pub fn builder(name: &str) -> BankDeclarationBuilder {
        BankDeclarationBuilder::new(name)
    }

    /// Range checks for declarations which did not come through the builder.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Bank name not specified".to_string());
        }
        if self.level > MAX_BANK_LEVEL {
            return Err(format!("Bank {} level {} is out of range", self.name, self.level));
        }
        if self.bdi > MAX_BDI {
            return Err(format!("Bank {} BDI {:o} is out of range", self.name, self.bdi));
        }
        if let Some(register) = self.initial_base_register {
            if register > MAX_BASE_REGISTER {
                return Err(format!("Bank {} initial base register B{} is out of range", self.name, register));
            }
        }
        if self.pools.is_empty() {
            return Err(format!("Bank {} has no pools", self.name));
        }
        Ok(())
    }
}

pub struct BankDeclarationBuilder {
    declaration: BankDeclaration,
}

impl BankDeclarationBuilder {
    fn new(name: &str) -> Self {
        BankDeclarationBuilder {
            declaration: BankDeclaration {
                name: name.to_string(),
                bdi: 0,
                level: 0,
                access_info: AccessInfo::default(),
                general_permissions: AccessPermissions::default(),
                special_permissions: AccessPermissions::default(),
                starting_address: 0,
                initial_base_register: None,
                pools: Vec::new(),
                needs_extended_mode: false,
            },
        }
    }

    pub fn bdi(mut self, bdi: u32) -> Self {
        self.declaration.bdi = bdi;
        self
    }

    pub fn level(mut self, level: u32) -> Self {
        self.declaration.level = level;
        self
    }

    pub fn access_info(mut self, access_info: AccessInfo) -> Self {
        self.declaration.access_info = access_info;
        self
    }

    pub fn general_permissions(mut self, permissions: AccessPermissions) -> Self {
        self.declaration.general_permissions = permissions;
        self
    }

    pub fn special_permissions(mut self, permissions: AccessPermissions) -> Self {
        self.declaration.special_permissions = permissions;
        self
    }

    pub fn starting_address(mut self, address: u32) -> Self {
        self.declaration.starting_address = address;
        self
    }

    pub fn initial_base_register(mut self, register: u32) -> Self {
        self.declaration.initial_base_register = Some(register);
        self
    }

    pub fn pool(mut self, module: &str, lc_index: u32) -> Self {
        self.declaration.pools.push(PoolSpecification::new(module, lc_index));
        self
    }

    pub fn needs_extended_mode(mut self, needs: bool) -> Self {
        self.declaration.needs_extended_mode = needs;
        self
    }

    pub fn build(self) -> Result<BankDeclaration, String> {
        self.declaration.validate()?;
        Ok(self.declaration)
    }
}

/// A bank's final storage.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LoadableBank {
    pub name: String,
    pub bdi: u32,
    pub level: u32,
    pub access_info: AccessInfo,
    pub general_permissions: AccessPermissions,
    pub special_permissions: AccessPermissions,
    pub starting_address: u32,
    pub initial_base_register: Option<u32>,
    pub extended_mode: bool,
    pub content: Vec<u64>,
}

impl LoadableBank {
    /// The last address in the bank. An empty bank has a limit one below its
    /// start.
    pub fn limit(&self) -> i64 {
        self.starting_address as i64 + self.content.len() as i64 - 1
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.starting_address && (address as i64) <= self.limit()
    }

    /// The word at a virtual address within the bank.
    pub fn word_at(&self, address: u32) -> Option<u64> {
        if !self.contains(address) {
            return None;
        }
        self.content.get((address - self.starting_address) as usize).copied()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EntryPoint {
    pub bdi: u32,
    pub address: u32,
}

/// The linked program: banks keyed by BDI.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct AbsoluteModule {
    pub name: String,
    pub banks: BTreeMap<u32, LoadableBank>,
    pub entry_point: Option<EntryPoint>,
    pub modes: ModeFlags,
}

impl AbsoluteModule {
    pub fn new(
        name: &str,
        banks: Vec<LoadableBank>,
        entry_point: Option<EntryPoint>,
        modes: ModeFlags,
        allow_no_entry_point: bool,
    ) -> Result<Self, String> {
        if name.is_empty() {
            return Err("Name not specified".to_string());
        }
        if banks.is_empty() {
            return Err("No banks specified".to_string());
        }
        modes.validate()?;
        if entry_point.is_none() && !allow_no_entry_point {
            return Err("No entry point specified".to_string());
        }

        let mut by_bdi = BTreeMap::new();
        for bank in banks {
            if by_bdi.contains_key(&bank.bdi) {
                return Err(format!("BDI {:06o} specified more than once", bank.bdi));
            }
            by_bdi.insert(bank.bdi, bank);
        }
        if let Some(entry) = entry_point {
            match by_bdi.get(&entry.bdi) {
                Some(bank) if bank.contains(entry.address) => {}
                _ => {
                    return Err(format!(
                        "Entry point {:08o} is not within bank {:06o}",
                        entry.address, entry.bdi
                    ))
                }
            }
        }
        Ok(AbsoluteModule { name: name.to_string(), banks: by_bdi, entry_point, modes })
    }

    pub fn bank(&self, bdi: u32) -> Option<&LoadableBank> {
        self.banks.get(&bdi)
    }

    pub fn bank_named(&self, name: &str) -> Option<&LoadableBank> {
        self.banks.values().find(|b| b.name == name)
    }

    /// One row per bank, in octal.
    pub fn summary(&self) -> String {
        let mut grid = Grid::new(GridOptions {
            filling: Filling::Spaces(2),
            direction: Direction::LeftToRight,
        });
        for bank in self.banks.values() {
            grid.add(Cell::from(bank.name.clone()));
            grid.add(Cell::from(format!("BDI:{:06o}", bank.bdi)));
            grid.add(Cell::from(format!("L:{}", bank.level)));
            grid.add(Cell::from(format!("{:08o}-{:08o}", bank.starting_address, bank.limit().max(0))));
            grid.add(Cell::from(if bank.extended_mode { "Extended" } else { "Basic" }.to_string()));
            grid.add(Cell::from(match bank.initial_base_register {
                Some(register) => format!("B{}", register),
                None => "n/a".to_string(),
            }));
            grid.add(Cell::from(format!(
                "Lock:{} GAP:{} SAP:{}",
                bank.access_info, bank.general_permissions, bank.special_permissions
            )));
        }
        let entry = match self.entry_point {
            Some(entry) => format!("entry point bank {:06o} address {:08o}", entry.bdi, entry.address),
            None => "no entry point".to_string(),
        };
        format!(
            "Absolute module {}: {} bank(s), {}, modes {}\n{}",
            self.name,
            self.banks.len(),
            entry,
            self.modes,
            grid.fit_into_columns(7)
        )
    }

    /// Bank contents, eight words to a row.
    pub fn code_listing(&self) -> String {
        let mut grid = Grid::new(GridOptions {
            filling: Filling::Spaces(1),
            direction: Direction::LeftToRight,
        });
        for bank in self.banks.values() {
            for (row, chunk) in bank.content.chunks(8).enumerate() {
                let address = bank.starting_address as usize + row * 8;
                grid.add(Cell::from(format!("{:06o}:{:08o}:", bank.bdi, address)));
                let words: Vec<String> = chunk.iter().map(|w| format!("{:012o}", w)).collect();
                grid.add(Cell::from(words.join(" ")));
            }
        }
        grid.fit_into_columns(2).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank(name: &str, bdi: u32, start: u32, size: usize) -> LoadableBank {
        LoadableBank {
            name: name.to_string(),
            bdi,
            level: 0,
            access_info: AccessInfo::default(),
            general_permissions: AccessPermissions::default(),
            special_permissions: AccessPermissions::default(),
            starting_address: start,
            initial_base_register: None,
            extended_mode: false,
            content: vec![0; size],
        }
    }

    #[test]
    fn test_builder() {
        let decl = BankDeclaration::builder("MAIN")
            .bdi(0o100004)
            .build();
        assert!(decl.is_err());

        let decl = BankDeclaration::builder("MAIN")
            .bdi(0o4)
            .level(6)
            .starting_address(0o1000)
            .initial_base_register(12)
            .pool("A", 1)
            .pool("B", 1)
            .build()
            .unwrap();
        assert_eq!(decl.pools, vec![PoolSpecification::new("A", 1), PoolSpecification::new("B", 1)]);
        assert_eq!(decl.initial_base_register, Some(12));
        assert!(!decl.needs_extended_mode);

        assert!(BankDeclaration::builder("X").level(8).pool("A", 0).build().is_err());
        assert!(BankDeclaration::builder("X").initial_base_register(32).pool("A", 0).build().is_err());
        assert!(BankDeclaration::builder("X").build().is_err());
        assert!(BankDeclaration::builder("").pool("A", 0).build().is_err());
    }

    #[test]
    fn test_declaration_from_json() {
        let text = r#"{"name":"CODE","bdi":4,"starting_address":512,"pools":[{"module":"M","lc_index":1}]}"#;
        let decl: BankDeclaration = serde_json::from_str(text).unwrap();
        assert_eq!(decl.starting_address, 0o1000);
        assert_eq!(decl.level, 0);
        assert_eq!(decl.initial_base_register, None);
        assert!(decl.validate().is_ok());
    }

    #[test]
    fn test_bank_limits() {
        let b = bank("B", 4, 0o1000, 3);
        assert_eq!(b.limit(), 0o1002);
        assert!(b.contains(0o1000));
        assert!(b.contains(0o1002));
        assert!(!b.contains(0o1003));
        assert!(!b.contains(0o777));
        assert_eq!(b.word_at(0o1001), Some(0));
        assert_eq!(b.word_at(0o1003), None);
        assert!(!bank("E", 5, 0, 0).contains(0));
    }

    #[test]
    fn test_absolute_module_checks() {
        let modes = ModeFlags::default();
        assert!(AbsoluteModule::new("P", vec![], None, modes, true).is_err());
        assert!(AbsoluteModule::new("P", vec![bank("A", 4, 0, 1)], None, modes, false).is_err());
        assert!(AbsoluteModule::new("P", vec![bank("A", 4, 0, 1), bank("B", 4, 0o100, 1)], None, modes, true).is_err());

        let entry = EntryPoint { bdi: 4, address: 0o1001 };
        assert!(AbsoluteModule::new("P", vec![bank("A", 4, 0o1000, 1)], Some(entry), modes, false).is_err());

        let module = AbsoluteModule::new("P", vec![bank("A", 4, 0o1000, 2), bank("B", 5, 0, 1)], Some(entry), modes, false).unwrap();
        assert_eq!(module.banks.len(), 2);
        assert_eq!(module.bank_named("B").map(|b| b.bdi), Some(5));
        assert!(module.summary().contains("BDI:000004"));
    }

    #[test]
    fn test_permissions_display() {
        assert_eq!(AccessPermissions::new(false, true, true).to_string(), "-RW");
        assert_eq!(AccessPermissions::new(true, true, false).to_string(), "ER-");
        assert_eq!(AccessInfo { ring: 2, domain: 0o17 }.to_string(), "2:000017");
    }
}
