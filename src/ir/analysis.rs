//! This module contains the pre-analysis annotations the engine consumes:
//! which call sites to skip, which load and store sites may interact with
//! skipped side effects, and the mod/ref tables that drive slice selection.
//!
//! The analyses that produce these tables run ahead of time over the
//! original module; the engine treats the tables as ground truth.

use rustc_hash::{FxHashMap, FxHashSet};

/// The allocation site of a memory object, used as the key of the mod/ref
/// tables.
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum AllocSite {
    /// The object is a global variable.
    Global(String),

    /// The object was allocated by the instruction with this identifier.
    Instruction(u64),
}

/// A function selected for skipping, with an optional restriction to
/// specific call-site source lines.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SkippedFunction {
    /// The name of the function to skip.
    pub name: String,

    /// The call-site lines at which to skip it. Empty means every call
    /// site.
    pub lines: Vec<u32>,
}

/// One modifier of an allocation site: a skipped function together with the
/// byte offset it writes at.
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ModInfo {
    /// The modifying function.
    pub function: String,

    /// The byte offset within the object that the modifier writes.
    pub offset: u64,
}

/// The full set of pre-analysis annotations.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct Analysis {
    skipped_functions:     Vec<SkippedFunction>,
    may_block_loads:       FxHashSet<u64>,
    may_override_stores:   FxHashSet<u64>,
    side_effect_functions: FxHashSet<String>,
    mod_infos:             FxHashMap<AllocSite, Vec<ModInfo>>,
    slice_ids:             FxHashMap<(String, u64), u32>,
    slices:                FxHashMap<(String, u32), String>,
}

impl Analysis {
    /// Constructs an empty annotation set, under which no call is skipped
    /// and no load blocks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` as a function to skip, optionally restricted to
    /// call sites at the given source `lines`.
    pub fn skip_function(&mut self, name: impl Into<String>, lines: Vec<u32>) {
        self.skipped_functions.push(SkippedFunction {
            name: name.into(),
            lines,
        });
    }

    /// Checks whether a call to `name` at source line `line` should be
    /// skipped.
    #[must_use]
    pub fn is_skipped(&self, name: &str, line: u32) -> bool {
        self.skipped_functions
            .iter()
            .any(|s| s.name == name && (s.lines.is_empty() || s.lines.contains(&line)))
    }

    /// Gets the functions selected for skipping.
    #[must_use]
    pub fn skipped_functions(&self) -> &[SkippedFunction] {
        &self.skipped_functions
    }

    /// Marks the load with `instruction_id` as possibly blocked by a
    /// skipped side effect.
    pub fn mark_may_block(&mut self, instruction_id: u64) {
        self.may_block_loads.insert(instruction_id);
    }

    /// Checks whether the load with `instruction_id` may be blocked by a
    /// skipped side effect.
    #[must_use]
    pub fn may_block(&self, instruction_id: u64) -> bool {
        self.may_block_loads.contains(&instruction_id)
    }

    /// Marks the store with `instruction_id` as possibly overriding a
    /// skipped side effect.
    pub fn mark_may_override(&mut self, instruction_id: u64) {
        self.may_override_stores.insert(instruction_id);
    }

    /// Checks whether the store with `instruction_id` may override a
    /// skipped side effect.
    #[must_use]
    pub fn may_override(&self, instruction_id: u64) -> bool {
        self.may_override_stores.contains(&instruction_id)
    }

    /// Records that `name` has side effects according to mod/ref analysis.
    pub fn mark_side_effects(&mut self, name: impl Into<String>) {
        self.side_effect_functions.insert(name.into());
    }

    /// Checks whether `name` has side effects according to mod/ref
    /// analysis. Side-effect-free skipped functions are dropped silently,
    /// without a snapshot.
    #[must_use]
    pub fn has_side_effects(&self, name: &str) -> bool {
        self.side_effect_functions.contains(name)
    }

    /// Registers `modifier` as writing to objects allocated at `site`, and
    /// assigns it the given slice.
    ///
    /// The `slice_function` is the sliced specialisation of the modifier
    /// focused on this single mod-info; it must be registered in the
    /// program before a recovery state calls through it.
    pub fn add_modifier(
        &mut self,
        site: AllocSite,
        modifier: ModInfo,
        slice_id: u32,
        slice_function: impl Into<String>,
    ) {
        self.slice_ids
            .insert((modifier.function.clone(), modifier.offset), slice_id);
        self.slices
            .insert((modifier.function.clone(), slice_id), slice_function.into());
        self.mod_infos.entry(site).or_default().push(modifier);
    }

    /// Gets the approximate modifiers of objects allocated at `site`.
    #[must_use]
    pub fn approximate_mod_infos(&self, site: &AllocSite) -> &[ModInfo] {
        self.mod_infos.get(site).map_or(&[], Vec::as_slice)
    }

    /// Resolves the slice identifier of `modifier`.
    #[must_use]
    pub fn slice_id(&self, modifier: &ModInfo) -> Option<u32> {
        self.slice_ids
            .get(&(modifier.function.clone(), modifier.offset))
            .copied()
    }

    /// Resolves the sliced specialisation of `function` for `slice_id`.
    ///
    /// Returns the original function name when no slice was generated,
    /// mirroring the behaviour of running with slicing disabled.
    #[must_use]
    pub fn slice_function<'a>(&'a self, function: &'a str, slice_id: u32) -> &'a str {
        self.slices
            .get(&(function.to_owned(), slice_id))
            .map_or(function, String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn skip_respects_line_filters() {
        let mut analysis = Analysis::new();
        analysis.skip_function("expensive", vec![10, 20]);
        assert!(analysis.is_skipped("expensive", 10));
        assert!(!analysis.is_skipped("expensive", 11));
        assert!(!analysis.is_skipped("other", 10));
    }

    #[test]
    fn empty_line_filter_skips_every_call_site() {
        let mut analysis = Analysis::new();
        analysis.skip_function("expensive", vec![]);
        assert!(analysis.is_skipped("expensive", 1));
        assert!(analysis.is_skipped("expensive", 999));
    }

    #[test]
    fn modifier_tables_round_trip() {
        let mut analysis = Analysis::new();
        let site = AllocSite::Global("g".into());
        let modifier = ModInfo {
            function: "writer".into(),
            offset:   0,
        };
        analysis.add_modifier(site.clone(), modifier.clone(), 7, "writer_slice_7");

        assert_eq!(analysis.approximate_mod_infos(&site), &[modifier.clone()]);
        assert_eq!(analysis.slice_id(&modifier), Some(7));
        assert_eq!(analysis.slice_function("writer", 7), "writer_slice_7");
        assert_eq!(analysis.slice_function("writer", 8), "writer");
    }
}
