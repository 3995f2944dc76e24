//! A counted collection with "first added" and "last removed" transitions
//!
//! Items are grouped by a caller-supplied key equality, while removal matches
//! an item by full equality. Several subscribers asking for the same topic with
//! different requesters then share a single upstream subscription.

/// Multiset over `T`, grouped by `key_eq`
pub struct Multiset<T> {
    items: Vec<T>,
    key_eq: fn(&T, &T) -> bool,
}

impl<T: PartialEq + Clone> Multiset<T> {
    pub fn new(key_eq: fn(&T, &T) -> bool) -> Self {
        Self {
            items: Vec::new(),
            key_eq,
        }
    }

    /// Add `item`; true if no key-equal item was present
    pub fn add(&mut self, item: T) -> bool {
        let is_new = !self.items.iter().any(|existing| (self.key_eq)(existing, &item));
        self.items.push(item);
        is_new
    }

    /// Remove one item equal to `item`; true if that was the last key-equal item
    pub fn remove(&mut self, item: &T) -> bool {
        let Some(index) = self.items.iter().position(|existing| existing == item) else {
            return false;
        };
        self.items.remove(index);
        !self.items.iter().any(|existing| (self.key_eq)(existing, item))
    }

    /// Every item, including key-equal duplicates
    pub fn all_items(&self) -> &[T] {
        &self.items
    }

    /// The first item of every key group
    pub fn unique_items(&self) -> Vec<T> {
        let mut unique: Vec<T> = Vec::new();
        for item in &self.items {
            if !unique.iter().any(|seen| (self.key_eq)(seen, item)) {
                unique.push(item.clone());
            }
        }
        unique
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> std::fmt::Debug for Multiset<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.items).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        name: &'static str,
        extra: Vec<i32>,
    }

    fn item(name: &'static str, extra: &[i32]) -> Item {
        Item {
            name,
            extra: extra.to_vec(),
        }
    }

    fn names_equal(a: &Item, b: &Item) -> bool {
        a.name == b.name
    }

    #[test]
    fn add_reports_first_occurrence_by_key() {
        let mut set = Multiset::new(names_equal);
        assert!(set.unique_items().is_empty());

        assert!(set.add(item("foo", &[1])));
        assert!(!set.add(item("foo", &[1])));
        assert!(!set.add(item("foo", &[2])));
        assert!(set.add(item("bar", &[3])));

        assert_eq!(set.unique_items(), vec![item("foo", &[1]), item("bar", &[3])]);
        assert_eq!(set.all_items().len(), 4);
    }

    #[test]
    fn remove_reports_last_occurrence_by_key() {
        let mut set = Multiset::new(names_equal);
        let foo = item("foo", &[1]);
        assert!(!set.remove(&foo));

        set.add(foo.clone());
        set.add(foo.clone());
        assert!(!set.remove(&foo));
        assert_eq!(set.unique_items().len(), 1);
        assert!(set.remove(&foo));
        assert!(set.is_empty());
    }

    #[test]
    fn removal_uses_full_equality() {
        let mut set = Multiset::new(names_equal);
        set.add(item("foo", &[1, 2]));
        set.add(item("foo", &[9]));

        // Key-equal but not equal: nothing removed
        assert!(!set.remove(&item("foo", &[3, 4])));
        assert_eq!(set.all_items().len(), 2);

        assert!(!set.remove(&item("foo", &[1, 2])));
        assert_eq!(set.all_items(), &[item("foo", &[9])]);
        assert!(!set.remove(&item("foo", &[1, 2])));

        assert!(set.remove(&item("foo", &[9])));
        assert!(set.is_empty());
    }
}
