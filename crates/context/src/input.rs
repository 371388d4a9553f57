//! Parsed request inputs: a name→value table with nested subform scoping
//!
//! The surrounding transport layer populates the table while the context is
//! initializing; request logic then reads values relative to a scope. A
//! scope is entered by name — either a single nested subform or one entry of
//! a repeated group — and every lookup resolves through the current scope.
//! Scope frames store names and entry indexes, not references, so the table
//! can be mutated between accesses without invalidating the scope.

use quay_core::{Abort, RequestResult};
use rustc_hash::FxHashMap;

/// An uploaded file value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInput {
    /// Client-supplied file name, when one was sent
    pub name: Option<String>,
    /// Declared MIME type, when one was sent
    pub mime: Option<String>,
    /// Raw file contents
    pub data: Vec<u8>,
}

/// One input value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A text field
    Text(String),
    /// An uploaded file
    File(FileInput),
    /// A singly-nested group of fields
    Subform(InputTable),
    /// A repeated group of fields, iterated with
    /// [`enter_entries`](Inputs::enter_entries) / [`next_entry`](Inputs::next_entry)
    Entries(Vec<InputTable>),
}

/// A flat name→value table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputTable {
    map: FxHashMap<String, Input>,
}

impl InputTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value
    pub fn set(&mut self, name: impl Into<String>, value: Input) {
        self.map.insert(name.into(), value);
    }

    /// Look up a value
    pub fn get(&self, name: &str) -> Option<&Input> {
        self.map.get(name)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table holds no entries
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// One level of scope: a named subform, or a named repeated group with the
/// current entry index (`None` before the first `next_entry`)
#[derive(Debug, Clone)]
struct Frame {
    name: String,
    entry: Option<usize>,
}

/// The context's input table plus its scope stack
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    root: InputTable,
    scope: Vec<Frame>,
}

impl Inputs {
    /// Create an empty input table
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value in the current scope (the root, while no subform is
    /// entered — the state the transport layer populates in).
    pub fn set(&mut self, name: impl Into<String>, value: Input) -> RequestResult<()> {
        let table = self
            .scoped_table_mut()
            .ok_or_else(|| Abort::Client("input scope no longer exists".to_string()))?;
        table.set(name, value);
        Ok(())
    }

    /// Look up a value in the current scope
    pub fn get(&self, name: &str) -> Option<&Input> {
        self.scoped_table().and_then(|t| t.get(name))
    }

    /// A required text field; missing or mistyped is a client error.
    pub fn text(&self, name: &str) -> RequestResult<&str> {
        match self.get(name) {
            Some(Input::Text(s)) => Ok(s),
            Some(_) => Err(Abort::Client(format!("input {} is not a text field", name))),
            None => Err(Abort::Client(format!("missing input {}", name))),
        }
    }

    /// An optional text field; present-but-mistyped is still a client error.
    pub fn optional_text(&self, name: &str) -> RequestResult<Option<&str>> {
        match self.get(name) {
            Some(Input::Text(s)) => Ok(Some(s)),
            Some(_) => Err(Abort::Client(format!("input {} is not a text field", name))),
            None => Ok(None),
        }
    }

    /// A required file field
    pub fn file(&self, name: &str) -> RequestResult<&FileInput> {
        match self.get(name) {
            Some(Input::File(f)) => Ok(f),
            Some(_) => Err(Abort::Client(format!("input {} is not a file", name))),
            None => Err(Abort::Client(format!("missing input {}", name))),
        }
    }

    /// Enter a singly-nested subform; subsequent lookups resolve inside it.
    pub fn enter_subform(&mut self, name: &str) -> RequestResult<()> {
        match self.get(name) {
            Some(Input::Subform(_)) => {
                self.scope.push(Frame {
                    name: name.to_string(),
                    entry: None,
                });
                Ok(())
            }
            Some(_) => Err(Abort::Client(format!("input {} is not a subform", name))),
            None => Err(Abort::Client(format!("missing subform {}", name))),
        }
    }

    /// Leave the innermost scope, subform or repeated group alike.
    pub fn leave_subform(&mut self) -> RequestResult<()> {
        match self.scope.pop() {
            Some(_) => Ok(()),
            None => Err(Abort::Fatal("leave_subform at top-level scope".to_string())),
        }
    }

    /// Enter a repeated group; returns the number of entries. The scope sits
    /// before the first entry until [`next_entry`](Self::next_entry) is
    /// called.
    pub fn enter_entries(&mut self, name: &str) -> RequestResult<usize> {
        match self.get(name) {
            Some(Input::Entries(entries)) => {
                let count = entries.len();
                self.scope.push(Frame {
                    name: name.to_string(),
                    entry: None,
                });
                Ok(count)
            }
            Some(_) => Err(Abort::Client(format!(
                "input {} is not a repeated group",
                name
            ))),
            None => Err(Abort::Client(format!("missing repeated group {}", name))),
        }
    }

    /// Advance to the next entry of the innermost repeated group. Returns
    /// false when the group is exhausted, leaving the scope popped.
    pub fn next_entry(&mut self) -> RequestResult<bool> {
        let frame = self
            .scope
            .last()
            .ok_or_else(|| Abort::Fatal("next_entry at top-level scope".to_string()))?;
        let next = frame.entry.map_or(0, |i| i + 1);

        // Count entries of the group the innermost frame names, resolved
        // through the outer scope.
        let outer = self.scope.len() - 1;
        let count = match self
            .table_at(&self.scope[..outer])
            .and_then(|t| t.get(&self.scope[outer].name))
        {
            Some(Input::Entries(entries)) => entries.len(),
            _ => {
                return Err(Abort::Fatal(
                    "next_entry outside a repeated group".to_string(),
                ))
            }
        };

        if next < count {
            self.scope[outer].entry = Some(next);
            Ok(true)
        } else {
            self.scope.pop();
            Ok(false)
        }
    }

    /// Drop every entry and every open scope
    pub fn clear(&mut self) {
        self.root = InputTable::new();
        self.scope.clear();
    }

    /// Whether the table holds no entries and no scope is open
    pub fn is_empty(&self) -> bool {
        self.root.is_empty() && self.scope.is_empty()
    }

    fn scoped_table(&self) -> Option<&InputTable> {
        self.table_at(&self.scope)
    }

    fn table_at(&self, frames: &[Frame]) -> Option<&InputTable> {
        let mut table = &self.root;
        for frame in frames {
            table = match table.get(&frame.name)? {
                Input::Subform(t) => t,
                Input::Entries(entries) => entries.get(frame.entry?)?,
                _ => return None,
            };
        }
        Some(table)
    }

    fn scoped_table_mut(&mut self) -> Option<&mut InputTable> {
        let mut table = &mut self.root;
        for frame in &self.scope {
            table = match table.map.get_mut(&frame.name)? {
                Input::Subform(t) => t,
                Input::Entries(entries) => entries.get_mut(frame.entry?)?,
                _ => return None,
            };
        }
        Some(table)
    }
}
