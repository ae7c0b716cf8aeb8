use alloc::vec::Vec;

use crate::StackArena;

/// A set of named arenas with one of them selected as the default. Callers
/// pick an arena by name, or get the default when they pass `None`.
#[derive(Debug)]
pub struct ArenaSet<S> {
    arenas: Vec<(&'static str, StackArena<S>)>,
    default: usize,
}

impl<S> ArenaSet<S> {
    pub fn new() -> Self {
        Self {
            arenas: Vec::new(),
            default: 0,
        }
    }

    /// Registers `arena` under `name`. The first arena registered becomes the
    /// default. Returns `false` (and drops nothing) if the name is taken.
    pub fn add(&mut self, name: &'static str, arena: StackArena<S>) -> bool {
        if self.position(name).is_some() {
            return false;
        }
        self.arenas.push((name, arena));
        true
    }

    /// Selects the default arena. Returns `false` if no arena has that name.
    pub fn set_default(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(index) => {
                self.default = index;
                true
            }
            None => false,
        }
    }

    pub fn default_name(&self) -> Option<&'static str> {
        self.arenas.get(self.default).map(|(name, _)| *name)
    }

    /// Looks up an arena by name, or the default arena for `None`.
    pub fn get(&self, name: Option<&str>) -> Option<&StackArena<S>> {
        let index = match name {
            Some(name) => self.position(name)?,
            None => self.default,
        };
        self.arenas.get(index).map(|(_, arena)| arena)
    }

    pub fn len(&self) -> usize {
        self.arenas.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.arenas.iter().map(|(name, _)| *name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.arenas.iter().position(|(n, _)| *n == name)
    }
}
