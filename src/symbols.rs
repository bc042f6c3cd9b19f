//! ELF symbol map.
//!
//! Adapter over the debug build artifact: a flat `{name -> (addr, size)}`
//! view of the object symbols, used to place the RTT control block and to
//! resolve sampled-variable names. Type information is somebody else's
//! problem.

use crate::error::Error;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// The control block symbol emitted by SEGGER's RTT sources.
pub const RTT_CB_SYMBOL: &str = "_SEGGER_RTT";

#[derive(Clone, Debug, Default)]
pub struct SymbolMap {
    symbols: BTreeMap<String, (u64, u64)>,
}

impl SymbolMap {
    /// Parses the symbol table of an ELF file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let buffer = fs::read(path)?;
        let elf = goblin::elf::Elf::parse(&buffer)?;
        let mut symbols = BTreeMap::new();
        for sym in &elf.syms {
            if let Some(name) = elf.strtab.get_at(sym.st_name) {
                if !name.is_empty() && sym.st_value != 0 {
                    symbols.insert(name.to_owned(), (sym.st_value, sym.st_size));
                }
            }
        }
        debug!(
            path = %path.display(),
            symbols = symbols.len(),
            "Loaded ELF symbol map"
        );
        Ok(Self { symbols })
    }

    pub fn get(&self, name: &str) -> Option<(u64, u64)> {
        self.symbols.get(name).copied()
    }

    pub fn address_of(&self, name: &str) -> Option<u32> {
        self.get(name).map(|(addr, _)| addr as u32)
    }

    /// Location of the RTT control block, when the firmware links it in.
    pub fn rtt_control_block(&self) -> Option<u32> {
        self.address_of(RTT_CB_SYMBOL)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
