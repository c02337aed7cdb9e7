//! Identifier table

use rustc_hash::FxHashMap;
use tether::RawId;

/// Static identifiers; never collected.
#[derive(Default)]
pub(crate) struct SymbolTable {
    names: Vec<String>,
    ids: FxHashMap<String, RawId>,
}

impl SymbolTable {
    pub fn intern(&mut self, name: &str) -> RawId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        self.names.push(name.to_string());
        // Ids start at 1.
        let id = RawId::new(self.names.len());
        self.ids.insert(name.to_string(), id);
        id
    }

    pub fn name(&self, id: RawId) -> Option<&str> {
        id.get()
            .checked_sub(1)
            .and_then(|index| self.names.get(index))
            .map(String::as_str)
    }
}
