//! The relocatable module: what one assembly produces and the linker reads.
use super::value::IntegerValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use term_grid::{Cell, Direction, Filling, Grid, GridOptions};

/// One word of generated code, still carrying any references the assembler
/// could not resolve.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct GeneratedWord {
    /// Source line the word came from.
    pub line: usize,
    pub lc_index: u32,
    pub offset: u32,
    pub value: IntegerValue,
}

impl fmt::Display for GeneratedWord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "$({:02}) {:06o}: {}", self.lc_index, self.offset, self.value)
    }
}

/// The words of one location counter. Reserved but unwritten storage shows up
/// as `None`.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct LocationCounterPool {
    pub words: Vec<Option<GeneratedWord>>,
    pub extended_mode: bool,
}

impl LocationCounterPool {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Architecture modes a module (or a linked program) requires.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ModeFlags {
    pub quarter_word: bool,
    pub third_word: bool,
    pub af_compatibility: bool,
    pub af_non_interrupt: bool,
}

impl ModeFlags {
    /// Quarter and third word mode exclude each other, as do the two
    /// arithmetic fault modes.
    pub fn validate(&self) -> Result<(), String> {
        if self.quarter_word && self.third_word {
            return Err("Quarter word mode and third word mode are both set".to_string());
        }
        if self.af_compatibility && self.af_non_interrupt {
            return Err("Arithmetic fault compatibility and non-interrupt modes are both set".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for ModeFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names = Vec::new();
        if self.quarter_word {
            names.push("QUARTER");
        }
        if self.third_word {
            names.push("THIRD");
        }
        if self.af_compatibility {
            names.push("AFCM");
        }
        if self.af_non_interrupt {
            names.push("AFNI");
        }
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RelocatableModule {
    pub name: String,
    pub pools: BTreeMap<u32, LocationCounterPool>,
    pub exports: BTreeMap<String, IntegerValue>,
    pub modes: ModeFlags,
}

impl RelocatableModule {
    pub fn new(
        name: &str,
        pools: BTreeMap<u32, LocationCounterPool>,
        exports: BTreeMap<String, IntegerValue>,
        modes: ModeFlags,
    ) -> Result<Self, String> {
        modes.validate()?;
        Ok(RelocatableModule { name: name.to_string(), pools, exports, modes })
    }

    pub fn pool(&self, lc_index: u32) -> Option<&LocationCounterPool> {
        self.pools.get(&lc_index)
    }

    /// Word count of a pool; an absent pool is empty.
    pub fn pool_size(&self, lc_index: u32) -> usize {
        self.pool(lc_index).map(|p| p.len()).unwrap_or(0)
    }

    pub fn export(&self, label: &str) -> Option<&IntegerValue> {
        self.exports.get(&label.to_uppercase())
    }

    /// Pool sizes, export count and modes.
    pub fn summary(&self) -> String {
        let mut grid = Grid::new(GridOptions {
            filling: Filling::Spaces(2),
            direction: Direction::LeftToRight,
        });
        for (lc_index, pool) in self.pools.iter() {
            grid.add(Cell::from(format!("$({})", lc_index)));
            grid.add(Cell::from(format!("{:06o} words", pool.len())));
            grid.add(Cell::from(if pool.extended_mode { "EXTENDED".to_string() } else { String::new() }));
        }
        format!(
            "Module {}: {} pool(s), {} export(s), modes {}\n{}",
            self.name,
            self.pools.len(),
            self.exports.len(),
            self.modes,
            grid.fit_into_columns(3)
        )
    }

    /// Every generated word, one per row, in pool order.
    pub fn code_listing(&self) -> String {
        let mut grid = Grid::new(GridOptions {
            filling: Filling::Spaces(1),
            direction: Direction::LeftToRight,
        });
        for (lc_index, pool) in self.pools.iter() {
            for (offset, word) in pool.words.iter().enumerate() {
                grid.add(Cell::from(format!("$({:02})", lc_index)));
                grid.add(Cell::from(format!("{:06o}:", offset)));
                match word {
                    Some(w) => {
                        grid.add(Cell::from(format!("{:012o}", w.value.word())));
                        let refs: Vec<String> = w.value.references.iter().map(|r| r.to_string()).collect();
                        grid.add(Cell::from(format!("{:>5} {}", w.line, refs.join(" "))));
                    }
                    None => {
                        grid.add(Cell::from("------------".to_string()));
                        grid.add(Cell::from(String::new()));
                    }
                }
            }
        }
        grid.fit_into_columns(4).to_string()
    }

    /// Exported labels and their values.
    pub fn export_listing(&self) -> String {
        let mut grid = Grid::new(GridOptions {
            filling: Filling::Spaces(2),
            direction: Direction::LeftToRight,
        });
        for (label, value) in self.exports.iter() {
            grid.add(Cell::from(label.clone()));
            grid.add(Cell::from(value.to_string()));
        }
        grid.fit_into_columns(2).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::reference::UndefinedReference;
    use crate::word36::DoubleWord36;

    fn word(lc_index: u32, offset: u32, value: i64) -> GeneratedWord {
        GeneratedWord { line: 1, lc_index, offset, value: IntegerValue::from_i64(value) }
    }

    #[test]
    fn test_mode_conflicts() {
        assert!(ModeFlags::default().validate().is_ok());
        let both = ModeFlags { quarter_word: true, third_word: true, ..Default::default() };
        assert!(both.validate().is_err());
        let af = ModeFlags { af_compatibility: true, af_non_interrupt: true, ..Default::default() };
        assert!(RelocatableModule::new("M", BTreeMap::new(), BTreeMap::new(), af).is_err());
        let ok = ModeFlags { quarter_word: true, af_non_interrupt: true, ..Default::default() };
        assert_eq!(ok.to_string(), "QUARTER,AFNI");
    }

    #[test]
    fn test_pool_lookup() {
        let mut pools = BTreeMap::new();
        pools.insert(
            1,
            LocationCounterPool { words: vec![Some(word(1, 0, 5)), None, Some(word(1, 2, 7))], extended_mode: false },
        );
        let mut exports = BTreeMap::new();
        exports.insert(
            "START$".to_string(),
            IntegerValue::with_references(DoubleWord36::from_i64(0), vec![UndefinedReference::to_location_counter(1)]),
        );
        let module = RelocatableModule::new("MAIN", pools, exports, ModeFlags::default()).unwrap();
        assert_eq!(module.pool_size(1), 3);
        assert_eq!(module.pool_size(4), 0);
        assert!(module.export("start$").is_some());
        assert!(module.code_listing().contains("000000000005"));
        assert!(module.summary().starts_with("Module MAIN: 1 pool(s), 1 export(s)"));
    }

    #[test]
    fn test_json_round_trip() {
        let mut pools = BTreeMap::new();
        pools.insert(0, LocationCounterPool { words: vec![Some(word(0, 0, -1)), None], extended_mode: true });
        let module = RelocatableModule::new("RT", pools, BTreeMap::new(), ModeFlags::default()).unwrap();
        let text = serde_json::to_string(&module).unwrap();
        let back: RelocatableModule = serde_json::from_str(&text).unwrap();
        assert_eq!(back, module);
    }
}
