//! Interned symbol text
//!
//! The third of the three text-like host kinds: short identifier-like
//! strings deduplicated into a process-wide interner and passed around as
//! a 32-bit id. Symbol id 0 is the empty string, so zero-initialized
//! instance storage reads back as the empty symbol.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

struct Interner {
    ids: FxHashMap<Box<str>, u32>,
    names: Vec<Box<str>>,
}

impl Interner {
    fn new() -> Self {
        let mut interner = Self {
            ids: FxHashMap::default(),
            names: Vec::new(),
        };
        interner.intern("");
        interner
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(s.into());
        self.ids.insert(s.into(), id);
        id
    }

    fn resolve(&self, id: u32) -> Option<String> {
        self.names.get(id as usize).map(|s| s.to_string())
    }
}

static INTERNER: Lazy<Mutex<Interner>> = Lazy::new(|| Mutex::new(Interner::new()));

/// Process-wide interned symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol(u32);

impl Symbol {
    /// The empty symbol (id 0).
    pub const NONE: Symbol = Symbol(0);

    /// Intern a string, returning its stable id.
    pub fn intern(s: &str) -> Self {
        Symbol(INTERNER.lock().intern(s))
    }

    /// Resolve back to text. Unknown ids (corrupt storage) resolve to the
    /// empty string rather than panic.
    pub fn resolve(self) -> String {
        INTERNER.lock().resolve(self.0).unwrap_or_default()
    }

    /// Raw id, as stored in instance memory.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild from a raw id read out of instance memory.
    pub fn from_raw(id: u32) -> Self {
        Symbol(id)
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.resolve())
    }
}
