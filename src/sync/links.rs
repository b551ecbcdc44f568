use std::collections::{HashMap, HashSet};

/// Back-references between trees, keyed by link location (`key@domain`).
///
/// The iterator registers its start trees as links from the empty location. A tree
/// stays in the walk while anything still links to it.
#[derive(Debug, Default)]
pub(crate) struct LinkCache {
    backrefs: HashMap<String, HashSet<String>>,
    changed: bool,
}

impl LinkCache {
    pub(crate) fn is_referenced(&self, location: &str) -> bool {
        self.backrefs.get(location).is_some_and(|refs| !refs.is_empty())
    }

    pub(crate) fn add_link(&mut self, from: &str, to: &str) {
        let refs = self.backrefs.entry(to.to_owned()).or_default();
        if refs.insert(from.to_owned()) {
            self.changed = true;
        }
    }

    /// Drop every link of `from` except those in `keep`.
    ///
    /// Trees left without references lose their own links in turn.
    pub(crate) fn reset_links(&mut self, from: &str, keep: &HashSet<String>) {
        let mut stack = vec![from.to_owned()];
        while let Some(item) = stack.pop() {
            let mut orphaned = Vec::new();
            for (location, refs) in &mut self.backrefs {
                if keep.contains(location) || !refs.remove(&item) {
                    continue;
                }
                self.changed = true;
                if refs.is_empty() {
                    orphaned.push(location.clone());
                }
            }
            for location in orphaned {
                self.backrefs.remove(&location);
                stack.push(location);
            }
        }
    }

    /// Every referenced location.
    pub(crate) fn locations(&self) -> impl Iterator<Item = &String> {
        self.backrefs.keys()
    }

    /// Whether links changed since the last call.
    pub(crate) fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}
