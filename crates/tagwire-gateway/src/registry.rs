//! Per-connection element and tag bookkeeping. Guarded by the connection's
//! registry lock; nothing here locks on its own.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tagwire_core::Jid;

use crate::element::Element;
use crate::tag::Tag;

#[derive(Default)]
pub(crate) struct Registry {
    /// Live elements in ascending Jid order.
    elems: Vec<Arc<Element>>,
    tags: HashMap<Tag, Vec<Arc<Element>>>,
    dirt: Vec<Tag>,
}

impl Registry {
    pub fn insert(&mut self, elem: Arc<Element>) {
        debug_assert!(self.elems.last().is_none_or(|last| last.jid() < elem.jid()));
        self.elems.push(elem);
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn get(&self, jid: Jid) -> Option<&Arc<Element>> {
        self.elems
            .binary_search_by_key(&jid, |e| e.jid())
            .ok()
            .map(|i| &self.elems[i])
    }

    pub fn contains(&self, elem: &Element) -> bool {
        self.get(elem.jid())
            .is_some_and(|e| std::ptr::eq(e.as_ref(), elem))
    }

    pub fn has_tag(&self, elem: &Element, tag: &Tag) -> bool {
        self.contains(elem)
            && self
                .tags
                .get(tag)
                .is_some_and(|elems| elems.iter().any(|e| e.jid() == elem.jid()))
    }

    pub fn add_tags(&mut self, elem: &Arc<Element>, tags: &[Tag]) {
        if !self.contains(elem) {
            return;
        }
        for tag in tags {
            let elems = self.tags.entry(tag.clone()).or_default();
            if !elems.iter().any(|e| e.jid() == elem.jid()) {
                elems.push(elem.clone());
            }
        }
    }

    /// Tags of `elem`, empty unless it belongs to this registry.
    pub fn tags_of(&self, elem: &Element) -> Vec<Tag> {
        if !self.contains(elem) {
            return Vec::new();
        }
        self.tags
            .iter()
            .filter(|(_, elems)| elems.iter().any(|e| e.jid() == elem.jid()))
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Elements carrying any of `tags`, each once, in first-seen order.
    pub fn elements_for(&self, tags: &[Tag]) -> Vec<Arc<Element>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for tag in tags {
            for elem in self.tags.get(tag).into_iter().flatten() {
                if seen.insert(elem.jid()) {
                    out.push(elem.clone());
                }
            }
        }
        out
    }

    pub fn wants_any(&self, tags: &[Tag]) -> bool {
        tags.iter().any(|tag| self.tags.contains_key(tag))
    }

    /// Drop `elem` from the element list and every tag mapping.
    pub fn remove(&mut self, elem: &Element) {
        if !self.contains(elem) {
            return;
        }
        elem.mark_deleted();
        self.elems.retain(|e| e.jid() != elem.jid());
        self.tags.retain(|_, elems| {
            elems.retain(|e| e.jid() != elem.jid());
            !elems.is_empty()
        });
    }

    pub fn push_dirt(&mut self, tags: &[Tag]) {
        self.dirt.extend_from_slice(tags);
    }

    /// Consume the dirty tags, returning the affected elements by ascending Jid.
    pub fn take_update_list(&mut self) -> Vec<Arc<Element>> {
        let dirt = std::mem::take(&mut self.dirt);
        let mut todo = self.elements_for(&dirt);
        todo.sort_by_key(|e| e.jid());
        todo
    }

    pub fn live_jids(&self) -> HashSet<Jid> {
        self.elems
            .iter()
            .filter(|e| !e.is_deleted())
            .map(|e| e.jid())
            .collect()
    }

    /// Forget everything, marking all elements deleted.
    pub fn clear(&mut self) {
        for elem in self.elems.drain(..) {
            elem.mark_deleted();
        }
        self.tags.clear();
        self.dirt.clear();
    }
}
